use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{linear, LayerNorm, Linear, RmsNorm, VarBuilder};

const TIME_FACTOR: f64 = 1000.0;
const MAX_PERIOD: f64 = 10000.0;

/// Sinusoidal embedding of `t` (scaled by 1000) into `dim` features.
pub fn timestep_embedding(t: &Tensor, dim: usize, dtype: DType) -> Result<Tensor> {
    if dim % 2 == 1 {
        candle_core::bail!("timestep embedding dim {dim} must be even")
    }
    let half = dim / 2;
    let t = (t.to_dtype(DType::F32)? * TIME_FACTOR)?;
    let arange = Tensor::arange(0, half as u32, t.device())?.to_dtype(DType::F32)?;
    let freqs = (arange * (-MAX_PERIOD.ln() / half as f64))?.exp()?;
    let args = t.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;
    Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)?.to_dtype(dtype)
}

/// Rotation matrices `[[cos, -sin], [sin, cos]]` for one position axis.
fn rope(pos: &Tensor, dim: usize, theta: usize) -> Result<Tensor> {
    if dim % 2 == 1 {
        candle_core::bail!("rope axis dim {dim} must be even")
    }
    let theta = theta as f64;
    let inv_freq: Vec<f32> = (0..dim)
        .step_by(2)
        .map(|i| 1.0 / theta.powf(i as f64 / dim as f64) as f32)
        .collect();
    let inv_freq_len = inv_freq.len();
    let inv_freq = Tensor::from_vec(inv_freq, (1, 1, inv_freq_len), pos.device())?;
    let freqs = pos.unsqueeze(2)?.broadcast_mul(&inv_freq)?;
    let cos = freqs.cos()?;
    let sin = freqs.sin()?;
    let out = Tensor::stack(&[&cos, &sin.neg()?, &sin, &cos], 3)?;
    let (b, n, d, _) = out.dims4()?;
    out.reshape((b, n, d, 2, 2))
}

/// Rotates pairs of `x` `(B, H, L, D)` by `freq_cis` `(B|1, 1, L, D/2, 2, 2)`.
pub(crate) fn apply_rope(x: &Tensor, freq_cis: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let (b_sz, n_head, seq_len, n_embd) = x.dims4()?;
    let x = x.reshape((b_sz, n_head, seq_len, n_embd / 2, 2))?;
    let x0 = x.narrow(D::Minus1, 0, 1)?;
    let x1 = x.narrow(D::Minus1, 1, 1)?;
    let fr0 = freq_cis.get_on_dim(D::Minus1, 0)?;
    let fr1 = freq_cis.get_on_dim(D::Minus1, 1)?;
    (fr0.broadcast_mul(&x0)? + fr1.broadcast_mul(&x1)?)?.reshape(dims.to_vec())
}

/// Multi-axis rotary embedding over `[index, row, col]` position ids.
#[derive(Debug, Clone)]
pub struct EmbedNd {
    theta: usize,
    axes_dim: Vec<usize>,
}

impl EmbedNd {
    pub fn new(theta: usize, axes_dim: Vec<usize>) -> Self {
        Self { theta, axes_dim }
    }
}

impl Module for EmbedNd {
    /// `ids` `(B, L, n_axes)` to `(B, 1, L, sum(axes)/2, 2, 2)` in f32.
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let ids = ids.to_dtype(DType::F32)?;
        let n_axes = ids.dim(D::Minus1)?;
        if n_axes != self.axes_dim.len() {
            candle_core::bail!(
                "position ids carry {n_axes} axes, rope expects {}",
                self.axes_dim.len()
            )
        }
        let mut emb = Vec::with_capacity(n_axes);
        for (idx, &dim) in self.axes_dim.iter().enumerate() {
            emb.push(rope(&ids.get_on_dim(D::Minus1, idx)?, dim, self.theta)?);
        }
        Tensor::cat(&emb, 2)?.unsqueeze(1)
    }
}

/// Two-layer SiLU MLP used for the time, guidance and pooled-text vectors.
#[derive(Debug, Clone)]
pub(crate) struct MlpEmbedder {
    in_layer: Linear,
    out_layer: Linear,
}

impl MlpEmbedder {
    pub(crate) fn new(in_sz: usize, h_sz: usize, vb: VarBuilder) -> Result<Self> {
        let in_layer = linear(in_sz, h_sz, vb.pp("in_layer"))?;
        let out_layer = linear(h_sz, h_sz, vb.pp("out_layer"))?;
        Ok(Self {
            in_layer,
            out_layer,
        })
    }
}

impl Module for MlpEmbedder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.in_layer)?.silu()?.apply(&self.out_layer)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct QkNorm {
    pub(crate) query_norm: RmsNorm,
    pub(crate) key_norm: RmsNorm,
}

impl QkNorm {
    pub(crate) fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let query_norm = vb.get(dim, "query_norm.scale")?;
        let key_norm = vb.get(dim, "key_norm.scale")?;
        Ok(Self {
            query_norm: RmsNorm::new(query_norm, 1e-6),
            key_norm: RmsNorm::new(key_norm, 1e-6),
        })
    }
}

/// Affine-free layer norm used before every modulation.
pub(crate) fn layer_norm(dim: usize, device: &Device, dtype: DType) -> Result<LayerNorm> {
    let ws = Tensor::ones(dim, dtype, device)?;
    Ok(LayerNorm::new_no_bias(ws, 1e-6))
}

#[derive(Debug, Clone)]
pub(crate) struct ModulationOut {
    shift: Tensor,
    scale: Tensor,
    gate: Tensor,
}

impl ModulationOut {
    pub(crate) fn scale_shift(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_mul(&(&self.scale + 1.0)?)?
            .broadcast_add(&self.shift)
    }

    pub(crate) fn gate(&self, xs: &Tensor) -> Result<Tensor> {
        self.gate.broadcast_mul(xs)
    }
}

/// Produces `chunks / 3` shift-scale-gate triples from the conditioning vector.
#[derive(Debug, Clone)]
pub(crate) struct Modulation {
    lin: Linear,
    chunks: usize,
}

impl Modulation {
    pub(crate) fn new(dim: usize, triples: usize, vb: VarBuilder) -> Result<Self> {
        let chunks = 3 * triples;
        let lin = linear(dim, chunks * dim, vb.pp("lin"))?;
        Ok(Self { lin, chunks })
    }

    pub(crate) fn forward(&self, vec_: &Tensor) -> Result<Vec<ModulationOut>> {
        let ys = vec_
            .silu()?
            .apply(&self.lin)?
            .unsqueeze(1)?
            .chunk(self.chunks, D::Minus1)?;
        Ok(ys
            .chunks_exact(3)
            .map(|c| ModulationOut {
                shift: c[0].clone(),
                scale: c[1].clone(),
                gate: c[2].clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestep_embedding_shape_and_zero() {
        let t = Tensor::new(&[0f32, 0.5], &Device::Cpu).unwrap();
        let emb = timestep_embedding(&t, 256, DType::F32).unwrap();
        assert_eq!(emb.dims(), &[2, 256]);
        // t = 0: cos half is 1, sin half is 0
        let row: Vec<f32> = emb.get(0).unwrap().to_vec1().unwrap();
        assert!(row[..128].iter().all(|v| (v - 1.0).abs() < 1e-6));
        assert!(row[128..].iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn odd_embedding_dim_is_rejected() {
        let t = Tensor::new(&[0f32], &Device::Cpu).unwrap();
        assert!(timestep_embedding(&t, 7, DType::F32).is_err());
    }

    #[test]
    fn embed_nd_shape() {
        let ids = Tensor::zeros((1, 10, 3), DType::F32, &Device::Cpu).unwrap();
        let pe = EmbedNd::new(10_000, vec![4, 6, 6]).forward(&ids).unwrap();
        assert_eq!(pe.dims(), &[1, 1, 10, 8, 2, 2]);
    }

    #[test]
    fn rope_at_origin_is_identity() {
        let ids = Tensor::zeros((1, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let pe = EmbedNd::new(10_000, vec![2, 2, 4]).forward(&ids).unwrap();
        let x = Tensor::arange(0f32, 24.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 3, 8))
            .unwrap();
        let y = apply_rope(&x, &pe).unwrap();
        let diff = (x - y).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn rope_preserves_pair_norms() {
        let ids = Tensor::new(&[[[0f32, 3.0, 5.0], [0.0, 1.0, 2.0]]], &Device::Cpu).unwrap();
        let pe = EmbedNd::new(10_000, vec![2, 2, 2]).forward(&ids).unwrap();
        let x = Tensor::ones((1, 2, 2, 6), DType::F32, &Device::Cpu).unwrap();
        let y = apply_rope(&x, &pe).unwrap();
        let norm_x = x.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        let norm_y = y.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((norm_x - norm_y).abs() < 1e-4);
    }
}
