//! T5 v1.1 encoder stack producing the sequence embeddings.
//!
//! - Relative position bias computed by the first block, shared by the rest
//! - Pre-norm (RMS LayerNorm before attention and FFN)
//! - Gated-GELU FFN for v1.1 checkpoints, ReLU FFN for the original T5
//! - No 1/sqrt(d_k) attention scaling, no bias in any projection

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use serde::Deserialize;

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct T5Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_kv: usize,
    pub d_ff: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    #[serde(default = "default_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: usize,
    #[serde(default = "default_eps")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_ff_proj")]
    pub feed_forward_proj: String,
}

fn default_num_buckets() -> usize {
    32
}
fn default_max_distance() -> usize {
    128
}
fn default_eps() -> f64 {
    1e-6
}
fn default_ff_proj() -> String {
    "relu".to_string()
}

impl T5Config {
    /// google/t5-v1_1-xxl encoder, as shipped with FLUX.1.
    pub fn v1_1_xxl() -> Self {
        Self {
            vocab_size: 32128,
            d_model: 4096,
            d_kv: 64,
            d_ff: 10240,
            num_layers: 24,
            num_heads: 64,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
            layer_norm_epsilon: 1e-6,
            feed_forward_proj: "gated-gelu".to_string(),
        }
    }

    fn is_gated(&self) -> bool {
        self.feed_forward_proj.starts_with("gated-")
    }
}

// ─── T5 RMS LayerNorm ────────────────────────────────────────────────────────

/// Scale-only RMS norm, computed in f32.
struct T5LayerNorm {
    weight: Tensor,
    eps: f64,
}

impl T5LayerNorm {
    fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(hidden_size, "weight")?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs_f32 = xs.to_dtype(DType::F32)?;
        let variance = xs_f32.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let xs_normed = xs_f32.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let weight = self.weight.to_dtype(DType::F32)?;
        (xs_normed.broadcast_mul(&weight))?.to_dtype(dtype)
    }
}

// ─── Relative Position Bias ──────────────────────────────────────────────────

/// Learned bidirectional relative position bias with log-spaced buckets.
struct RelativePositionBias {
    embeddings: Embedding,
    num_buckets: usize,
    max_distance: usize,
}

impl RelativePositionBias {
    fn new(cfg: &T5Config, vb: VarBuilder) -> Result<Self> {
        let embeddings = embedding(
            cfg.relative_attention_num_buckets,
            cfg.num_heads,
            vb.pp("relative_attention_bias"),
        )?;
        Ok(Self {
            embeddings,
            num_buckets: cfg.relative_attention_num_buckets,
            max_distance: cfg.relative_attention_max_distance,
        })
    }

    fn bucket(&self, relative_position: i64) -> usize {
        let half = self.num_buckets / 2;
        let mut bucket = if relative_position > 0 { half } else { 0 };
        let rel_pos = relative_position.unsigned_abs() as usize;

        let max_exact = half / 2;
        if rel_pos < max_exact {
            return bucket + rel_pos;
        }
        let val = ((rel_pos as f64 / max_exact as f64).ln()
            / (self.max_distance as f64 / max_exact as f64).ln()
            * (half - max_exact) as f64) as usize;
        bucket += max_exact + val.min(half - max_exact - 1);
        bucket
    }

    /// `[1, num_heads, len, len]`.
    fn compute_bias(&self, len: usize, device: &Device) -> Result<Tensor> {
        let mut indices = vec![0u32; len * len];
        for qi in 0..len {
            for ki in 0..len {
                indices[qi * len + ki] = self.bucket(ki as i64 - qi as i64) as u32;
            }
        }
        let indices = Tensor::from_vec(indices, (len, len), device)?;
        self.embeddings
            .forward(&indices)?
            .permute((2, 0, 1))?
            .unsqueeze(0)
    }
}

// ─── Self-Attention ──────────────────────────────────────────────────────────

struct T5SelfAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    num_heads: usize,
    head_dim: usize,
    relative_bias: Option<RelativePositionBias>,
}

impl T5SelfAttention {
    fn new(cfg: &T5Config, has_relative_bias: bool, vb: VarBuilder) -> Result<Self> {
        let inner_dim = cfg.num_heads * cfg.d_kv;
        let relative_bias = if has_relative_bias {
            Some(RelativePositionBias::new(cfg, vb.clone())?)
        } else {
            None
        };
        Ok(Self {
            q: linear_no_bias(cfg.d_model, inner_dim, vb.pp("q"))?,
            k: linear_no_bias(cfg.d_model, inner_dim, vb.pp("k"))?,
            v: linear_no_bias(cfg.d_model, inner_dim, vb.pp("v"))?,
            o: linear_no_bias(inner_dim, cfg.d_model, vb.pp("o"))?,
            num_heads: cfg.num_heads,
            head_dim: cfg.d_kv,
            relative_bias,
        })
    }

    fn heads(&self, xs: Tensor, b_sz: usize, seq_len: usize) -> Result<Tensor> {
        xs.reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Returns the output and the position bias it used.
    fn forward(&self, xs: &Tensor, position_bias: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (b_sz, seq_len, _) = xs.dims3()?;
        let q = self.heads(self.q.forward(xs)?, b_sz, seq_len)?;
        let k = self.heads(self.k.forward(xs)?, b_sz, seq_len)?;
        let v = self.heads(self.v.forward(xs)?, b_sz, seq_len)?;

        let scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        let bias = match (position_bias, &self.relative_bias) {
            (Some(bias), _) => bias.clone(),
            (None, Some(rel)) => rel
                .compute_bias(seq_len, xs.device())?
                .to_dtype(scores.dtype())?,
            (None, None) => candle_core::bail!("t5 block without a position bias source"),
        };
        let scores = scores.broadcast_add(&bias)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;

        let out = weights.matmul(&v)?.transpose(1, 2)?.contiguous()?.reshape((
            b_sz,
            seq_len,
            self.num_heads * self.head_dim,
        ))?;
        Ok((self.o.forward(&out)?, bias))
    }
}

// ─── FFN ─────────────────────────────────────────────────────────────────────

enum T5Ffn {
    Relu { wi: Linear, wo: Linear },
    GatedGelu { wi_0: Linear, wi_1: Linear, wo: Linear },
}

impl T5Ffn {
    fn new(cfg: &T5Config, vb: VarBuilder) -> Result<Self> {
        let wo = linear_no_bias(cfg.d_ff, cfg.d_model, vb.pp("wo"))?;
        Ok(if cfg.is_gated() {
            Self::GatedGelu {
                wi_0: linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi_0"))?,
                wi_1: linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi_1"))?,
                wo,
            }
        } else {
            Self::Relu {
                wi: linear_no_bias(cfg.d_model, cfg.d_ff, vb.pp("wi"))?,
                wo,
            }
        })
    }
}

impl Module for T5Ffn {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu { wi, wo } => wo.forward(&wi.forward(xs)?.relu()?),
            Self::GatedGelu { wi_0, wi_1, wo } => {
                let gate = wi_0.forward(xs)?.gelu()?;
                let up = wi_1.forward(xs)?;
                wo.forward(&(gate * up)?)
            }
        }
    }
}

// ─── Encoder ─────────────────────────────────────────────────────────────────

struct T5Block {
    self_attention: T5SelfAttention,
    norm1: T5LayerNorm,
    ffn: T5Ffn,
    norm2: T5LayerNorm,
}

impl T5Block {
    fn new(cfg: &T5Config, has_relative_bias: bool, vb: VarBuilder) -> Result<Self> {
        let eps = cfg.layer_norm_epsilon;
        let attn_vb = vb.pp("layer").pp("0");
        let ffn_vb = vb.pp("layer").pp("1");
        Ok(Self {
            self_attention: T5SelfAttention::new(
                cfg,
                has_relative_bias,
                attn_vb.pp("SelfAttention"),
            )?,
            norm1: T5LayerNorm::new(cfg.d_model, eps, attn_vb.pp("layer_norm"))?,
            ffn: T5Ffn::new(cfg, ffn_vb.pp("DenseReluDense"))?,
            norm2: T5LayerNorm::new(cfg.d_model, eps, ffn_vb.pp("layer_norm"))?,
        })
    }

    fn forward(&self, xs: &Tensor, position_bias: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (attn, bias) = self
            .self_attention
            .forward(&self.norm1.forward(xs)?, position_bias)?;
        let xs = (xs + attn)?;
        let ffn = self.ffn.forward(&self.norm2.forward(&xs)?)?;
        Ok(((xs + ffn)?, bias))
    }
}

/// Encoder half of a T5 checkpoint (`T5EncoderModel` weight layout).
pub struct T5Encoder {
    shared: Embedding,
    blocks: Vec<T5Block>,
    final_norm: T5LayerNorm,
    device: Device,
}

impl T5Encoder {
    pub fn new(cfg: &T5Config, vb: VarBuilder) -> Result<Self> {
        let shared = embedding(cfg.vocab_size, cfg.d_model, vb.pp("shared"))?;
        let enc = vb.pp("encoder");
        let blocks = (0..cfg.num_layers)
            .map(|i| T5Block::new(cfg, i == 0, enc.pp("block").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let final_norm =
            T5LayerNorm::new(cfg.d_model, cfg.layer_norm_epsilon, enc.pp("final_layer_norm"))?;
        Ok(Self {
            shared,
            blocks,
            final_norm,
            device: vb.device().clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// `[B, S]` token ids to `[B, S, d_model]` hidden states.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let mut hidden = self.shared.forward(input_ids)?;
        let mut position_bias: Option<Tensor> = None;
        for block in &self.blocks {
            let (h, bias) = block.forward(&hidden, position_bias.as_ref())?;
            hidden = h;
            position_bias.get_or_insert(bias);
        }
        self.final_norm.forward(&hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config(ff: &str) -> T5Config {
        T5Config {
            vocab_size: 64,
            d_model: 32,
            d_kv: 8,
            d_ff: 48,
            num_layers: 2,
            num_heads: 4,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
            layer_norm_epsilon: 1e-6,
            feed_forward_proj: ff.to_string(),
        }
    }

    #[test]
    fn encode_shape() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        for ff in ["gated-gelu", "relu"] {
            let enc = T5Encoder::new(&tiny_config(ff), vb.clone()).unwrap();
            let ids = Tensor::new(&[[1u32, 5, 9, 1]], &Device::Cpu).unwrap();
            assert_eq!(enc.forward(&ids).unwrap().dims(), &[1, 4, 32]);
        }
    }

    #[test]
    fn parses_hf_config() {
        let raw = r#"{
            "d_ff": 10240, "d_kv": 64, "d_model": 4096,
            "feed_forward_proj": "gated-gelu", "num_heads": 64,
            "num_layers": 24, "vocab_size": 32128,
            "relative_attention_num_buckets": 32,
            "relative_attention_max_distance": 128,
            "layer_norm_epsilon": 1e-06, "is_gated_act": true
        }"#;
        let cfg: T5Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg, T5Config::v1_1_xxl());
        assert!(cfg.is_gated());
    }

    #[test]
    fn relative_buckets_are_bidirectional() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let bias = RelativePositionBias::new(&tiny_config("relu"), vb).unwrap();
        assert_eq!(bias.bucket(0), 0);
        assert_eq!(bias.bucket(-3), 3);
        assert_eq!(bias.bucket(3), 16 + 3);
        assert!(bias.bucket(1000) < 32);
        assert!(bias.bucket(-1000) < 16);
    }

    #[test]
    fn bias_shape() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let bias = RelativePositionBias::new(&tiny_config("relu"), vb).unwrap();
        let t = bias.compute_bias(5, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 4, 5, 5]);
    }
}
