//! CLIP text and vision towers.
//!
//! - Text: token + position embedding → causal pre-norm encoder →
//!   final_layer_norm; the pooled output is the end-of-text hidden state
//! - Vision: class + patch (no bias) + position embedding → pre_layrnorm
//!   (typo preserved from the checkpoints) → encoder → post_layernorm on the
//!   class token → visual_projection
//!
//! Weight paths follow `CLIPTextModel` (`text_model.*`) and
//! `CLIPVisionModelWithProjection` (`vision_model.*`, `visual_projection`).

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{
    conv2d_no_bias, embedding, layer_norm, linear, linear_no_bias, ops::softmax_last_dim,
    Conv2dConfig, Embedding, LayerNorm, Linear, VarBuilder,
};
use serde::Deserialize;

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipActivation {
    QuickGelu,
    Gelu,
}

fn default_activation() -> ClipActivation {
    ClipActivation::QuickGelu
}
fn default_ln_eps() -> f64 {
    1e-5
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClipTextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_ln_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_activation")]
    pub hidden_act: ClipActivation,
}

impl ClipTextConfig {
    /// openai/clip-vit-large-patch14 text tower.
    pub fn vit_large_patch14() -> Self {
        Self {
            vocab_size: 49408,
            hidden_size: 768,
            num_attention_heads: 12,
            num_hidden_layers: 12,
            intermediate_size: 3072,
            max_position_embeddings: 77,
            layer_norm_eps: 1e-5,
            hidden_act: ClipActivation::QuickGelu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClipVisionConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub image_size: usize,
    pub patch_size: usize,
    #[serde(default = "default_channels")]
    pub num_channels: usize,
    #[serde(default = "default_projection_dim")]
    pub projection_dim: usize,
    #[serde(default = "default_ln_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_activation")]
    pub hidden_act: ClipActivation,
}

fn default_channels() -> usize {
    3
}
fn default_projection_dim() -> usize {
    768
}

impl ClipVisionConfig {
    /// openai/clip-vit-large-patch14 vision tower.
    pub fn vit_large_patch14() -> Self {
        Self {
            hidden_size: 1024,
            num_attention_heads: 16,
            num_hidden_layers: 24,
            intermediate_size: 4096,
            image_size: 224,
            patch_size: 14,
            num_channels: 3,
            projection_dim: 768,
            layer_norm_eps: 1e-5,
            hidden_act: ClipActivation::QuickGelu,
        }
    }

    fn num_positions(&self) -> usize {
        let grid = self.image_size / self.patch_size;
        grid * grid + 1
    }
}

// ─── Shared pre-norm encoder ─────────────────────────────────────────────────

struct ClipAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl ClipAttention {
    fn new(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = hidden_size / num_heads;
        Ok(Self {
            q_proj: linear(hidden_size, hidden_size, vb.pp("q_proj"))?,
            k_proj: linear(hidden_size, hidden_size, vb.pp("k_proj"))?,
            v_proj: linear(hidden_size, hidden_size, vb.pp("v_proj"))?,
            out_proj: linear(hidden_size, hidden_size, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn heads(&self, xs: Tensor, b: usize, s: usize) -> Result<Tensor> {
        xs.reshape((b, s, self.num_heads, self.head_dim))?
            .permute((0, 2, 1, 3))?
            .contiguous()
    }

    /// `x`: `[B, S, D]` → `[B, S, D]`; `mask` is additive `[S, S]`.
    fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, s, _d) = x.dims3()?;
        let q = self.heads(self.q_proj.forward(x)?, b, s)?;
        let k = self.heads(self.k_proj.forward(x)?, b, s)?;
        let v = self.heads(self.v_proj.forward(x)?, b, s)?;

        let mut attn = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        if let Some(mask) = mask {
            attn = attn.broadcast_add(mask)?;
        }
        let attn = softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((b, s, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&out)
    }
}

struct ClipMlp {
    fc1: Linear,
    fc2: Linear,
    activation: ClipActivation,
}

impl ClipMlp {
    fn new(
        hidden_size: usize,
        intermediate_size: usize,
        activation: ClipActivation,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            fc1: linear(hidden_size, intermediate_size, vb.pp("fc1"))?,
            fc2: linear(intermediate_size, hidden_size, vb.pp("fc2"))?,
            activation,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(x)?;
        let h = match self.activation {
            ClipActivation::QuickGelu => (&h * candle_nn::ops::sigmoid(&(&h * 1.702)?)?)?,
            ClipActivation::Gelu => h.gelu_erf()?,
        };
        self.fc2.forward(&h)
    }
}

struct ClipEncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: ClipAttention,
    layer_norm2: LayerNorm,
    mlp: ClipMlp,
}

struct EncoderShape {
    hidden_size: usize,
    num_heads: usize,
    intermediate_size: usize,
    ln_eps: f64,
    activation: ClipActivation,
}

impl ClipEncoderLayer {
    fn new(shape: &EncoderShape, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            layer_norm1: layer_norm(shape.hidden_size, shape.ln_eps, vb.pp("layer_norm1"))?,
            self_attn: ClipAttention::new(shape.hidden_size, shape.num_heads, vb.pp("self_attn"))?,
            layer_norm2: layer_norm(shape.hidden_size, shape.ln_eps, vb.pp("layer_norm2"))?,
            mlp: ClipMlp::new(
                shape.hidden_size,
                shape.intermediate_size,
                shape.activation,
                vb.pp("mlp"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let residual = x;
        let x = self.self_attn.forward(&self.layer_norm1.forward(x)?, mask)?;
        let x = (residual + x)?;
        let residual = &x;
        let x = self.mlp.forward(&self.layer_norm2.forward(&x)?)?;
        residual + x
    }
}

struct ClipEncoder {
    layers: Vec<ClipEncoderLayer>,
}

impl ClipEncoder {
    fn new(num_layers: usize, shape: &EncoderShape, vb: VarBuilder) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|i| ClipEncoderLayer::new(shape, vb.pp("layers").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x, mask)?;
        }
        Ok(x)
    }
}

fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)?.to_dtype(dtype)
}

// ─── Text tower ──────────────────────────────────────────────────────────────

struct ClipTextEmbeddings {
    token_embedding: Embedding,
    position_embedding: Embedding,
}

impl ClipTextEmbeddings {
    fn new(cfg: &ClipTextConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            token_embedding: embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("token_embedding"))?,
            position_embedding: embedding(
                cfg.max_position_embeddings,
                cfg.hidden_size,
                vb.pp("position_embedding"),
            )?,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let pos_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let tok = self.token_embedding.forward(input_ids)?;
        let pos = self.position_embedding.forward(&pos_ids)?;
        tok.broadcast_add(&pos)
    }
}

/// Text tower producing the pooled prompt embedding.
pub struct ClipTextModel {
    embeddings: ClipTextEmbeddings,
    encoder: ClipEncoder,
    final_layer_norm: LayerNorm,
    max_position_embeddings: usize,
}

impl ClipTextModel {
    pub fn new(cfg: &ClipTextConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("text_model");
        let shape = EncoderShape {
            hidden_size: cfg.hidden_size,
            num_heads: cfg.num_attention_heads,
            intermediate_size: cfg.intermediate_size,
            ln_eps: cfg.layer_norm_eps,
            activation: cfg.hidden_act,
        };
        Ok(Self {
            embeddings: ClipTextEmbeddings::new(cfg, vb.pp("embeddings"))?,
            encoder: ClipEncoder::new(cfg.num_hidden_layers, &shape, vb.pp("encoder"))?,
            final_layer_norm: layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("final_layer_norm"),
            )?,
            max_position_embeddings: cfg.max_position_embeddings,
        })
    }

    pub fn max_position_embeddings(&self) -> usize {
        self.max_position_embeddings
    }

    /// `[B, S]` ids ending in the end-of-text token → `[B, H]` pooled output.
    pub fn pooled(&self, input_ids: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        if seq_len == 0 || seq_len > self.max_position_embeddings {
            candle_core::bail!(
                "clip input of {seq_len} tokens outside 1..={}",
                self.max_position_embeddings
            )
        }
        let x = self.embeddings.forward(input_ids)?;
        let mask = causal_mask(seq_len, x.dtype(), x.device())?;
        let x = self.encoder.forward(&x, Some(&mask))?;
        let x = self.final_layer_norm.forward(&x)?;
        x.narrow(1, seq_len - 1, 1)?.squeeze(1)
    }
}

// ─── Vision tower ────────────────────────────────────────────────────────────

struct ClipVisionEmbeddings {
    class_embedding: Tensor,
    patch_embedding: candle_nn::Conv2d,
    position_embedding: Embedding,
}

impl ClipVisionEmbeddings {
    fn new(cfg: &ClipVisionConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        Ok(Self {
            class_embedding: vb.get(cfg.hidden_size, "class_embedding")?,
            patch_embedding: conv2d_no_bias(
                cfg.num_channels,
                cfg.hidden_size,
                cfg.patch_size,
                conv_cfg,
                vb.pp("patch_embedding"),
            )?,
            position_embedding: embedding(
                cfg.num_positions(),
                cfg.hidden_size,
                vb.pp("position_embedding"),
            )?,
        })
    }

    /// `[B, C, H, W]` → `[B, N+1, H_v]`.
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let b = pixel_values.dim(0)?;
        let h_v = self.class_embedding.dim(0)?;
        let patches = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten(2, 3)?
            .permute((0, 2, 1))?
            .contiguous()?;
        let cls = self
            .class_embedding
            .reshape((1, 1, h_v))?
            .broadcast_as((b, 1, h_v))?
            .contiguous()?;
        let embeddings = Tensor::cat(&[&cls, &patches], 1)?;
        let seq = embeddings.dim(1)?;
        let pos_ids = Tensor::arange(0u32, seq as u32, pixel_values.device())?;
        embeddings.broadcast_add(&self.position_embedding.forward(&pos_ids)?)
    }
}

/// Vision tower with projection; yields one embedding per image.
pub struct ClipVisionModel {
    embeddings: ClipVisionEmbeddings,
    pre_layrnorm: LayerNorm,
    encoder: ClipEncoder,
    post_layernorm: LayerNorm,
    visual_projection: Linear,
    image_size: usize,
}

impl ClipVisionModel {
    pub fn new(cfg: &ClipVisionConfig, vb: VarBuilder) -> Result<Self> {
        let vm = vb.pp("vision_model");
        let shape = EncoderShape {
            hidden_size: cfg.hidden_size,
            num_heads: cfg.num_attention_heads,
            intermediate_size: cfg.intermediate_size,
            ln_eps: cfg.layer_norm_eps,
            activation: cfg.hidden_act,
        };
        Ok(Self {
            embeddings: ClipVisionEmbeddings::new(cfg, vm.pp("embeddings"))?,
            pre_layrnorm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vm.pp("pre_layrnorm"))?,
            encoder: ClipEncoder::new(cfg.num_hidden_layers, &shape, vm.pp("encoder"))?,
            post_layernorm: layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vm.pp("post_layernorm"),
            )?,
            visual_projection: linear_no_bias(
                cfg.hidden_size,
                cfg.projection_dim,
                vb.pp("visual_projection"),
            )?,
            image_size: cfg.image_size,
        })
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// `[B, 3, S, S]` normalized pixels → `[B, projection_dim]`.
    pub fn image_embeds(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let x = self.embeddings.forward(pixel_values)?;
        let x = self.pre_layrnorm.forward(&x)?;
        let x = self.encoder.forward(&x, None)?;
        let cls = x.narrow(1, 0, 1)?.squeeze(1)?;
        self.visual_projection
            .forward(&self.post_layernorm.forward(&cls)?)
    }
}
