//! FLUX.1 rectified-flow transformer with attention capture.
//!
//! Weight names follow the BFL checkpoints (`double_blocks.N.img_attn.qkv`,
//! `single_blocks.N.linear1`, ...).

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{linear, linear_b, LayerNorm, Linear, VarBuilder};

use super::embeddings::{
    apply_rope, layer_norm, timestep_embedding, EmbedNd, MlpEmbedder, Modulation, ModulationOut,
    QkNorm,
};
use super::ip_adapter::{ImageProjection, IpAttention};
use super::{DenoiserForward, DenoiserInputs};
use crate::attention::{AttentionHook, BlockFamily};
use crate::config::TransformerConfig;

const TIME_EMBED_DIM: usize = 256;

// ─── Attention ───────────────────────────────────────────────────────────────

/// Where a block reports its attention weights.
#[derive(Clone, Copy)]
struct Capture<'a> {
    hook: &'a dyn AttentionHook,
    family: BlockFamily,
    block_index: usize,
}

impl<'a> Capture<'a> {
    fn for_block(
        hook: Option<&'a dyn AttentionHook>,
        family: BlockFamily,
        block_index: usize,
    ) -> Option<Self> {
        hook.filter(|h| h.capture_enabled(family)).map(|hook| Self {
            hook,
            family,
            block_index,
        })
    }
}

fn attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    pe: &Tensor,
    capture: Option<Capture<'_>>,
) -> Result<Tensor> {
    let q = apply_rope(q, pe)?.contiguous()?;
    let k = apply_rope(k, pe)?.contiguous()?;
    let v = v.contiguous()?;
    let scale = 1.0 / (q.dim(D::Minus1)? as f64).sqrt();
    let weights = (q.matmul(&k.t()?)? * scale)?;
    let weights = candle_nn::ops::softmax_last_dim(&weights)?;
    if let Some(c) = capture {
        c.hook.on_attention(c.family, c.block_index, &weights)?;
    }
    weights.matmul(&v)?.transpose(1, 2)?.flatten_from(2)
}

#[derive(Debug, Clone)]
struct SelfAttention {
    qkv: Linear,
    norm: QkNorm,
    proj: Linear,
    num_heads: usize,
}

impl SelfAttention {
    fn new(dim: usize, num_heads: usize, qkv_bias: bool, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / num_heads;
        let qkv = linear_b(dim, dim * 3, qkv_bias, vb.pp("qkv"))?;
        let norm = QkNorm::new(head_dim, vb.pp("norm"))?;
        let proj = linear(dim, dim, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            norm,
            proj,
            num_heads,
        })
    }

    /// Projects to normalized `(B, H, L, D)` query, key and value.
    fn qkv(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let qkv = xs.apply(&self.qkv)?;
        split_qkv(&qkv, self.num_heads, &self.norm)
    }
}

fn split_qkv(qkv: &Tensor, num_heads: usize, norm: &QkNorm) -> Result<(Tensor, Tensor, Tensor)> {
    let (b, l, _) = qkv.dims3()?;
    let qkv = qkv.reshape((b, l, 3, num_heads, ()))?;
    let q = qkv.i((.., .., 0))?.transpose(1, 2)?.contiguous()?;
    let k = qkv.i((.., .., 1))?.transpose(1, 2)?.contiguous()?;
    let v = qkv.i((.., .., 2))?.transpose(1, 2)?;
    let q = q.apply(&norm.query_norm)?;
    let k = k.apply(&norm.key_norm)?;
    Ok((q, k, v))
}

#[derive(Debug, Clone)]
struct Mlp {
    lin1: Linear,
    lin2: Linear,
}

impl Mlp {
    fn new(in_sz: usize, mlp_sz: usize, vb: VarBuilder) -> Result<Self> {
        let lin1 = linear(in_sz, mlp_sz, vb.pp("0"))?;
        let lin2 = linear(mlp_sz, in_sz, vb.pp("2"))?;
        Ok(Self { lin1, lin2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.lin1)?.gelu()?.apply(&self.lin2)
    }
}

// ─── Blocks ──────────────────────────────────────────────────────────────────

/// One stream (image or text) of a double-stream block.
#[derive(Debug, Clone)]
struct StreamHalf {
    modulation: Modulation,
    norm1: LayerNorm,
    attn: SelfAttention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl StreamHalf {
    fn new(cfg: &TransformerConfig, prefix: &str, vb: &VarBuilder) -> Result<Self> {
        let h_sz = cfg.hidden_size();
        let mlp_sz = (h_sz as f64 * cfg.mlp_ratio) as usize;
        Ok(Self {
            modulation: Modulation::new(h_sz, 2, vb.pp(format!("{prefix}_mod")))?,
            norm1: layer_norm(h_sz, vb.device(), vb.dtype())?,
            attn: SelfAttention::new(
                h_sz,
                cfg.num_heads,
                cfg.qkv_bias,
                vb.pp(format!("{prefix}_attn")),
            )?,
            norm2: layer_norm(h_sz, vb.device(), vb.dtype())?,
            mlp: Mlp::new(h_sz, mlp_sz, vb.pp(format!("{prefix}_mlp")))?,
        })
    }

    fn modulate(&self, vec_: &Tensor) -> Result<(ModulationOut, ModulationOut)> {
        let mut mods = self.modulation.forward(vec_)?.into_iter();
        match (mods.next(), mods.next()) {
            (Some(m1), Some(m2)) => Ok((m1, m2)),
            _ => candle_core::bail!("double-stream modulation produced too few chunks"),
        }
    }

    fn residual(
        &self,
        xs: &Tensor,
        attn: &Tensor,
        mod1: &ModulationOut,
        mod2: &ModulationOut,
    ) -> Result<Tensor> {
        let xs = (xs + mod1.gate(&attn.apply(&self.attn.proj)?)?)?;
        let mlp = mod2
            .scale_shift(&xs.apply(&self.norm2)?)?
            .apply(&self.mlp)?;
        &xs + mod2.gate(&mlp)?
    }
}

#[derive(Debug, Clone)]
struct DoubleStreamBlock {
    img: StreamHalf,
    txt: StreamHalf,
    ip: Option<IpAttention>,
}

impl DoubleStreamBlock {
    fn new(cfg: &TransformerConfig, vb: VarBuilder, ip: Option<IpAttention>) -> Result<Self> {
        Ok(Self {
            img: StreamHalf::new(cfg, "img", &vb)?,
            txt: StreamHalf::new(cfg, "txt", &vb)?,
            ip,
        })
    }

    fn forward(
        &self,
        img: &Tensor,
        txt: &Tensor,
        vec_: &Tensor,
        pe: &Tensor,
        ip_tokens: Option<&Tensor>,
        capture: Option<Capture<'_>>,
    ) -> Result<(Tensor, Tensor)> {
        let (img_mod1, img_mod2) = self.img.modulate(vec_)?;
        let (txt_mod1, txt_mod2) = self.txt.modulate(vec_)?;

        let img_modulated = img_mod1.scale_shift(&img.apply(&self.img.norm1)?)?;
        let (img_q, img_k, img_v) = self.img.attn.qkv(&img_modulated)?;
        let txt_modulated = txt_mod1.scale_shift(&txt.apply(&self.txt.norm1)?)?;
        let (txt_q, txt_k, txt_v) = self.txt.attn.qkv(&txt_modulated)?;

        let q = Tensor::cat(&[&txt_q, &img_q], 2)?;
        let k = Tensor::cat(&[&txt_k, &img_k], 2)?;
        let v = Tensor::cat(&[&txt_v, &img_v], 2)?;
        let attn = attention(&q, &k, &v, pe, capture)?;

        let txt_len = txt.dim(1)?;
        let img_len = img.dim(1)?;
        let txt_attn = attn.narrow(1, 0, txt_len)?;
        let img_attn = attn.narrow(1, txt_len, img_len)?;

        let mut img = self.img.residual(img, &img_attn, &img_mod1, &img_mod2)?;
        if let (Some(ip), Some(tokens)) = (&self.ip, ip_tokens) {
            img = (img + ip.forward(&img_q, tokens)?)?;
        }
        let txt = self.txt.residual(txt, &txt_attn, &txt_mod1, &txt_mod2)?;
        Ok((img, txt))
    }
}

#[derive(Debug, Clone)]
struct SingleStreamBlock {
    linear1: Linear,
    linear2: Linear,
    norm: QkNorm,
    pre_norm: LayerNorm,
    modulation: Modulation,
    h_sz: usize,
    mlp_sz: usize,
    num_heads: usize,
}

impl SingleStreamBlock {
    fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let h_sz = cfg.hidden_size();
        let mlp_sz = (h_sz as f64 * cfg.mlp_ratio) as usize;
        let head_dim = h_sz / cfg.num_heads;
        Ok(Self {
            linear1: linear(h_sz, h_sz * 3 + mlp_sz, vb.pp("linear1"))?,
            linear2: linear(h_sz + mlp_sz, h_sz, vb.pp("linear2"))?,
            norm: QkNorm::new(head_dim, vb.pp("norm"))?,
            pre_norm: layer_norm(h_sz, vb.device(), vb.dtype())?,
            modulation: Modulation::new(h_sz, 1, vb.pp("modulation"))?,
            h_sz,
            mlp_sz,
            num_heads: cfg.num_heads,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        vec_: &Tensor,
        pe: &Tensor,
        capture: Option<Capture<'_>>,
    ) -> Result<Tensor> {
        let mod_ = match self.modulation.forward(vec_)?.into_iter().next() {
            Some(m) => m,
            None => candle_core::bail!("single-stream modulation produced no chunks"),
        };
        let x_mod = mod_.scale_shift(&xs.apply(&self.pre_norm)?)?;
        let x_mod = x_mod.apply(&self.linear1)?;
        let qkv = x_mod.narrow(D::Minus1, 0, 3 * self.h_sz)?;
        let (q, k, v) = split_qkv(&qkv, self.num_heads, &self.norm)?;
        let mlp = x_mod.narrow(D::Minus1, 3 * self.h_sz, self.mlp_sz)?;
        let attn = attention(&q, &k, &v, pe, capture)?;
        let output = Tensor::cat(&[attn, mlp.gelu()?], 2)?.apply(&self.linear2)?;
        xs + mod_.gate(&output)?
    }
}

#[derive(Debug, Clone)]
struct LastLayer {
    norm_final: LayerNorm,
    linear: Linear,
    ada_ln_modulation: Linear,
}

impl LastLayer {
    fn new(h_sz: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm_final: layer_norm(h_sz, vb.device(), vb.dtype())?,
            linear: linear(h_sz, out_c, vb.pp("linear"))?,
            ada_ln_modulation: linear(h_sz, 2 * h_sz, vb.pp("adaLN_modulation.1"))?,
        })
    }

    fn forward(&self, xs: &Tensor, vec_: &Tensor) -> Result<Tensor> {
        let chunks = vec_.silu()?.apply(&self.ada_ln_modulation)?.chunk(2, 1)?;
        let (shift, scale) = (&chunks[0], &chunks[1]);
        let xs = xs
            .apply(&self.norm_final)?
            .broadcast_mul(&(scale.unsqueeze(1)? + 1.0)?)?
            .broadcast_add(&shift.unsqueeze(1)?)?;
        xs.apply(&self.linear)
    }
}

// ─── Model ───────────────────────────────────────────────────────────────────

pub struct FluxTransformer {
    img_in: Linear,
    txt_in: Linear,
    time_in: MlpEmbedder,
    vector_in: MlpEmbedder,
    guidance_in: Option<MlpEmbedder>,
    pe_embedder: EmbedNd,
    double_blocks: Vec<DoubleStreamBlock>,
    single_blocks: Vec<SingleStreamBlock>,
    final_layer: LastLayer,
    image_proj: Option<ImageProjection>,
    config: TransformerConfig,
    device: Device,
    dtype: DType,
}

impl FluxTransformer {
    /// Builds the transformer; `ip_vb` points at image-adapter weights when
    /// the config declares an adapter.
    pub fn new(cfg: &TransformerConfig, vb: VarBuilder, ip_vb: Option<VarBuilder>) -> Result<Self> {
        let h_sz = cfg.hidden_size();
        let img_in = linear(cfg.in_channels, h_sz, vb.pp("img_in"))?;
        let txt_in = linear(cfg.context_in_dim, h_sz, vb.pp("txt_in"))?;
        let time_in = MlpEmbedder::new(TIME_EMBED_DIM, h_sz, vb.pp("time_in"))?;
        let vector_in = MlpEmbedder::new(cfg.vec_in_dim, h_sz, vb.pp("vector_in"))?;
        let guidance_in = if cfg.guidance_embed {
            Some(MlpEmbedder::new(TIME_EMBED_DIM, h_sz, vb.pp("guidance_in"))?)
        } else {
            None
        };

        let (image_proj, ip_vb) = match (&cfg.ip_adapter, ip_vb) {
            (Some(ip_cfg), Some(ip_vb)) => (
                Some(ImageProjection::new(
                    ip_cfg,
                    cfg.context_in_dim,
                    ip_vb.pp("image_proj"),
                )?),
                Some((ip_cfg, ip_vb)),
            ),
            _ => (None, None),
        };

        let mut double_blocks = Vec::with_capacity(cfg.depth);
        let vb_d = vb.pp("double_blocks");
        for idx in 0..cfg.depth {
            let ip = match &ip_vb {
                Some((ip_cfg, ip_vb)) => Some(IpAttention::new(
                    h_sz,
                    cfg.context_in_dim,
                    cfg.num_heads,
                    ip_cfg.scale,
                    ip_vb.pp("double_blocks").pp(idx),
                )?),
                None => None,
            };
            double_blocks.push(DoubleStreamBlock::new(cfg, vb_d.pp(idx), ip)?);
        }
        let mut single_blocks = Vec::with_capacity(cfg.depth_single_blocks);
        let vb_s = vb.pp("single_blocks");
        for idx in 0..cfg.depth_single_blocks {
            single_blocks.push(SingleStreamBlock::new(cfg, vb_s.pp(idx))?);
        }
        let final_layer = LastLayer::new(h_sz, cfg.in_channels, vb.pp("final_layer"))?;

        Ok(Self {
            img_in,
            txt_in,
            time_in,
            vector_in,
            guidance_in,
            pe_embedder: EmbedNd::new(cfg.theta, cfg.axes_dim.clone()),
            double_blocks,
            single_blocks,
            final_layer,
            image_proj,
            config: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    pub fn has_image_adapter(&self) -> bool {
        self.image_proj.is_some()
    }
}

/// Position ids as `(B, L, 3)`.
fn batched_ids(ids: &Tensor, batch: usize) -> Result<Tensor> {
    match ids.rank() {
        2 => {
            let (l, n) = ids.dims2()?;
            ids.unsqueeze(0)?.broadcast_as((batch, l, n))?.contiguous()
        }
        3 => Ok(ids.clone()),
        r => candle_core::bail!("position ids must be rank 2 or 3, got {r}"),
    }
}

impl DenoiserForward for FluxTransformer {
    fn forward(
        &self,
        inputs: &DenoiserInputs<'_>,
        hook: Option<&dyn AttentionHook>,
    ) -> Result<Tensor> {
        let latents = inputs.latents.to_dtype(self.dtype)?;
        let batch = latents.dim(0)?;
        if inputs.txt.rank() != 3 || latents.rank() != 3 {
            candle_core::bail!(
                "expected rank-3 latents and text, got {:?} and {:?}",
                latents.dims(),
                inputs.txt.dims()
            )
        }

        let pe = {
            let txt_ids = batched_ids(inputs.txt_ids, batch)?.to_dtype(DType::F32)?;
            let img_ids = batched_ids(inputs.img_ids, batch)?.to_dtype(DType::F32)?;
            let ids = Tensor::cat(&[&txt_ids, &img_ids], 1)?;
            ids.apply(&self.pe_embedder)?.to_dtype(self.dtype)?
        };

        let mut txt = inputs.txt.to_dtype(self.dtype)?.apply(&self.txt_in)?;
        let mut img = latents.apply(&self.img_in)?;

        let mut vec_ = timestep_embedding(inputs.timesteps, TIME_EMBED_DIM, self.dtype)?
            .apply(&self.time_in)?;
        if let Some(guidance_in) = &self.guidance_in {
            let Some(guidance) = inputs.guidance else {
                candle_core::bail!("model embeds guidance but no guidance tensor was given")
            };
            vec_ = (vec_
                + timestep_embedding(guidance, TIME_EMBED_DIM, self.dtype)?.apply(guidance_in)?)?;
        }
        vec_ = (vec_ + inputs.pooled.to_dtype(self.dtype)?.apply(&self.vector_in)?)?;

        let ip_tokens = match (&self.image_proj, inputs.adapter_embeds) {
            (Some(proj), Some(embeds)) => Some(proj.forward(&embeds.to_dtype(self.dtype)?)?),
            (None, Some(_)) => {
                candle_core::bail!("adapter embeddings given but no image adapter is loaded")
            }
            _ => None,
        };

        for (idx, block) in self.double_blocks.iter().enumerate() {
            let capture = Capture::for_block(hook, BlockFamily::DoubleStream, idx);
            (img, txt) = block.forward(&img, &txt, &vec_, &pe, ip_tokens.as_ref(), capture)?;
        }

        let txt_len = txt.dim(1)?;
        let mut joint = Tensor::cat(&[&txt, &img], 1)?;
        for (idx, block) in self.single_blocks.iter().enumerate() {
            let capture = Capture::for_block(hook, BlockFamily::SingleStream, idx);
            joint = block.forward(&joint, &vec_, &pe, capture)?;
        }
        let img = joint.i((.., txt_len..))?;
        self.final_layer.forward(&img, &vec_)
    }

    fn config(&self) -> &TransformerConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::{AttentionRecorder, RecorderConfig};
    use candle_nn::VarMap;

    fn tiny_config() -> TransformerConfig {
        TransformerConfig {
            in_channels: 16,
            vec_in_dim: 8,
            context_in_dim: 12,
            num_heads: 2,
            head_dim: 8,
            mlp_ratio: 2.0,
            depth: 2,
            depth_single_blocks: 3,
            axes_dim: vec![2, 2, 4],
            theta: 10_000,
            qkv_bias: true,
            guidance_embed: true,
            ip_adapter: None,
        }
    }

    struct Inputs {
        latents: Tensor,
        img_ids: Tensor,
        txt: Tensor,
        txt_ids: Tensor,
        timesteps: Tensor,
        pooled: Tensor,
        guidance: Tensor,
    }

    fn inputs(cfg: &TransformerConfig, batch: usize, side: usize, txt_len: usize) -> Inputs {
        let dev = Device::Cpu;
        let img_len = side * side;
        let mut ids = Vec::with_capacity(img_len * 3);
        for r in 0..side {
            for c in 0..side {
                ids.extend_from_slice(&[0f32, r as f32, c as f32]);
            }
        }
        Inputs {
            latents: Tensor::randn(0f32, 1.0, (batch, img_len, cfg.in_channels), &dev).unwrap(),
            img_ids: Tensor::from_vec(ids, (img_len, 3), &dev).unwrap(),
            txt: Tensor::randn(0f32, 1.0, (batch, txt_len, cfg.context_in_dim), &dev).unwrap(),
            txt_ids: Tensor::zeros((txt_len, 3), DType::F32, &dev).unwrap(),
            timesteps: Tensor::full(0.5f32, batch, &dev).unwrap(),
            pooled: Tensor::randn(0f32, 1.0, (batch, cfg.vec_in_dim), &dev).unwrap(),
            guidance: Tensor::full(3.5f32, batch, &dev).unwrap(),
        }
    }

    impl Inputs {
        fn view(&self) -> DenoiserInputs<'_> {
            DenoiserInputs {
                latents: &self.latents,
                img_ids: &self.img_ids,
                txt: &self.txt,
                txt_ids: &self.txt_ids,
                timesteps: &self.timesteps,
                pooled: &self.pooled,
                guidance: Some(&self.guidance),
                adapter_embeds: None,
            }
        }
    }

    #[test]
    fn forward_preserves_latent_shape() {
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = FluxTransformer::new(&cfg, vb, None).unwrap();
        let x = inputs(&cfg, 2, 3, 5);
        let out = model.forward(&x.view(), None).unwrap();
        assert_eq!(out.dims(), &[2, 9, 16]);
    }

    #[test]
    fn missing_guidance_is_an_error_for_guided_models() {
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = FluxTransformer::new(&cfg, vb, None).unwrap();
        let x = inputs(&cfg, 1, 2, 3);
        let mut view = x.view();
        view.guidance = None;
        assert!(model.forward(&view, None).is_err());
    }

    #[test]
    fn hook_sees_every_block_once_per_pass() {
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = FluxTransformer::new(&cfg, vb, None).unwrap();
        let recorder = AttentionRecorder::new(RecorderConfig {
            capacity_double: 8,
            capacity_single: 8,
            average_heads: false,
        });
        let x = inputs(&cfg, 1, 2, 3);
        model.forward(&x.view(), Some(&recorder)).unwrap();

        assert_eq!(recorder.len(BlockFamily::DoubleStream), cfg.depth);
        assert_eq!(recorder.len(BlockFamily::SingleStream), cfg.depth_single_blocks);

        let pass = recorder.drain_latest(cfg.depth, cfg.depth_single_blocks).unwrap().unwrap();
        // text (3) + image (4) tokens, rows are probability distributions
        assert_eq!(pass.double[0].dims(), &[2, 7, 7]);
        let row_sums: Vec<f32> = pass.single[0]
            .sum(2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(row_sums.iter().all(|s| (s - 1.0).abs() < 1e-4));
    }

    #[test]
    fn hook_is_skipped_for_disabled_family() {
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = FluxTransformer::new(&cfg, vb, None).unwrap();
        let recorder = AttentionRecorder::new(RecorderConfig {
            capacity_double: 0,
            capacity_single: 3,
            average_heads: true,
        });
        let x = inputs(&cfg, 1, 2, 3);
        model.forward(&x.view(), Some(&recorder)).unwrap();
        assert_eq!(recorder.len(BlockFamily::DoubleStream), 0);
        assert_eq!(recorder.len(BlockFamily::SingleStream), 3);
    }

    #[test]
    fn adapter_embeddings_flow_through_ip_layers() {
        let mut cfg = tiny_config();
        cfg.ip_adapter = Some(crate::config::IpAdapterConfig {
            image_embed_dim: 6,
            num_tokens: 2,
            scale: 1.0,
        });
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = FluxTransformer::new(&cfg, vb.pp("model"), Some(vb.pp("ip_adapter"))).unwrap();
        assert!(model.has_image_adapter());

        let x = inputs(&cfg, 1, 2, 3);
        let embeds = Tensor::randn(0f32, 1.0, (1, 6), &Device::Cpu).unwrap();
        let mut view = x.view();
        view.adapter_embeds = Some(&embeds);
        let with_adapter = model.forward(&view, None).unwrap();
        let without = model.forward(&x.view(), None);
        assert_eq!(with_adapter.dims(), &[1, 4, 16]);
        assert!(without.is_ok());
    }

    #[test]
    fn adapter_embeddings_without_adapter_are_rejected() {
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = FluxTransformer::new(&cfg, vb, None).unwrap();
        let x = inputs(&cfg, 1, 2, 3);
        let embeds = Tensor::zeros((1, 6), DType::F32, &Device::Cpu).unwrap();
        let mut view = x.view();
        view.adapter_embeds = Some(&embeds);
        assert!(model.forward(&view, None).is_err());
    }
}
