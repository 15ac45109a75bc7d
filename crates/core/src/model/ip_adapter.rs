use candle_core::{Module, Result, Tensor, D};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};

use crate::config::IpAdapterConfig;

/// Maps a pooled image embedding to `num_tokens` context tokens.
#[derive(Debug, Clone)]
pub struct ImageProjection {
    proj: Linear,
    norm: LayerNorm,
    num_tokens: usize,
    cross_dim: usize,
}

impl ImageProjection {
    pub fn new(cfg: &IpAdapterConfig, cross_dim: usize, vb: VarBuilder) -> Result<Self> {
        let proj = linear(cfg.image_embed_dim, cfg.num_tokens * cross_dim, vb.pp("proj"))?;
        let norm = layer_norm(cross_dim, 1e-5, vb.pp("norm"))?;
        Ok(Self {
            proj,
            norm,
            num_tokens: cfg.num_tokens,
            cross_dim,
        })
    }
}

impl Module for ImageProjection {
    fn forward(&self, embeds: &Tensor) -> Result<Tensor> {
        let b = embeds.dim(0)?;
        embeds
            .apply(&self.proj)?
            .reshape((b, self.num_tokens, self.cross_dim))?
            .apply(&self.norm)
    }
}

/// Extra attention of the image queries over the adapter tokens, added to
/// the image stream of a double-stream block.
#[derive(Debug, Clone)]
pub(crate) struct IpAttention {
    to_k_ip: Linear,
    to_v_ip: Linear,
    num_heads: usize,
    scale: f64,
}

impl IpAttention {
    pub(crate) fn new(
        hidden: usize,
        cross_dim: usize,
        num_heads: usize,
        scale: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            to_k_ip: linear(cross_dim, hidden, vb.pp("to_k_ip"))?,
            to_v_ip: linear(cross_dim, hidden, vb.pp("to_v_ip"))?,
            num_heads,
            scale,
        })
    }

    /// `img_q` is the normalized, un-rotated image query `(B, H, L, D)`.
    pub(crate) fn forward(&self, img_q: &Tensor, tokens: &Tensor) -> Result<Tensor> {
        let (b, n, _) = tokens.dims3()?;
        let heads = |t: Tensor| -> Result<Tensor> {
            t.reshape((b, n, self.num_heads, ()))?
                .transpose(1, 2)?
                .contiguous()
        };
        let k = heads(tokens.apply(&self.to_k_ip)?)?;
        let v = heads(tokens.apply(&self.to_v_ip)?)?;
        let q = img_q.contiguous()?;
        let scale = 1.0 / (q.dim(D::Minus1)? as f64).sqrt();
        let weights = candle_nn::ops::softmax_last_dim(&(q.matmul(&k.t()?)? * scale)?)?;
        let out = weights.matmul(&v)?.transpose(1, 2)?.flatten_from(2)?;
        out * self.scale
    }
}
