use candle_core::Tensor;

/// True classifier-free guidance: `neg + scale * (pos - neg)`.
///
/// A scale of 1 returns the positive prediction unchanged.
pub fn apply_true_cfg(positive: &Tensor, negative: &Tensor, scale: f64) -> candle_core::Result<Tensor> {
    if scale == 1.0 {
        return Ok(positive.clone());
    }
    negative + ((positive - negative)? * scale)?
}
