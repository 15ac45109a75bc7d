use candle_core::{DType, Tensor};
use image::GrayImage;

use crate::error::{PipelineError, Result};

const FLAT_RANGE: f32 = 1e-12;

/// Normalized heat map of how strongly image tokens attend to one prompt
/// token. Row-major, `side * side` values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossAttentionMap {
    pub token_index: usize,
    pub side: usize,
    pub values: Vec<f32>,
}

impl CrossAttentionMap {
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row >= self.side || col >= self.side {
            return None;
        }
        self.values.get(row * self.side + col).copied()
    }

    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }

    /// Renders the map as an 8-bit grayscale image, one pixel per token.
    /// Cells missing from a short `values` render black.
    pub fn to_luma8(&self) -> GrayImage {
        let side = self.side as u32;
        GrayImage::from_fn(side, side, |x, y| {
            let v = self.get(y as usize, x as usize).unwrap_or(0.0);
            image::Luma([(v.clamp(0.0, 1.0) * 255.0).round() as u8])
        })
    }
}

/// Side length of a square grid holding `n` tokens.
pub fn square_side(n: usize) -> Option<usize> {
    let side = (n as f64).sqrt().round() as usize;
    (side * side == n).then_some(side)
}

/// Rescales to `[0, 1]`; a flat input maps to zeros.
pub fn normalize_min_max(values: &[f32]) -> Vec<f32> {
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !range.is_finite() || range <= FLAT_RANGE {
        return vec![0.0; values.len()];
    }
    values
        .iter()
        .map(|&v| ((v - min) / range).clamp(0.0, 1.0))
        .collect()
}

/// Slices the image-queries-over-text-keys block out of a full
/// `(heads, seq, seq)` attention map laid out text-first.
pub fn cross_attention_region(full: &Tensor, text_len: usize) -> Result<Tensor> {
    let (_heads, rows, cols) = full.dims3()?;
    if rows != cols || rows <= text_len {
        return Err(PipelineError::shape(format!(
            "attention map {rows}x{cols} has no image region after {text_len} text tokens"
        )));
    }
    Ok(full
        .narrow(1, text_len, rows - text_len)?
        .narrow(2, 0, text_len)?)
}

/// Reduces one pass of captured attention to a map per prompt token.
///
/// All entries are averaged over blocks of both families, the image-to-text
/// region is cut out and averaged over heads, then each of the first
/// `num_tokens` text columns is min-max normalized and laid out as a square.
pub fn aggregate(
    double: &[Tensor],
    single: &[Tensor],
    text_len: usize,
    num_tokens: usize,
) -> Result<Vec<CrossAttentionMap>> {
    let mut entries = double.iter().chain(single.iter());
    let first = entries
        .next()
        .ok_or_else(|| PipelineError::shape("no attention entries captured"))?;

    let mut sum = first.to_dtype(DType::F32)?;
    let mut count = 1usize;
    for entry in entries {
        if entry.dims() != sum.dims() {
            return Err(PipelineError::shape(format!(
                "attention entries disagree: {:?} vs {:?}",
                entry.dims(),
                sum.dims()
            )));
        }
        sum = (sum + entry.to_dtype(DType::F32)?)?;
        count += 1;
    }
    let mean = (sum / count as f64)?;

    let cross = cross_attention_region(&mean, text_len)?.mean(0)?;
    let image_tokens = cross.dim(0)?;
    let side = square_side(image_tokens).ok_or_else(|| {
        PipelineError::shape(format!("{image_tokens} image tokens do not form a square"))
    })?;

    let num_tokens = num_tokens.min(text_len);
    if num_tokens == 0 {
        return Ok(Vec::new());
    }
    let columns: Vec<Vec<f32>> = cross
        .narrow(1, 0, num_tokens)?
        .t()?
        .contiguous()?
        .to_vec2()?;

    Ok(columns
        .into_iter()
        .enumerate()
        .map(|(token_index, column)| CrossAttentionMap {
            token_index,
            side,
            values: normalize_min_max(&column),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn square_side_detects_perfect_squares() {
        assert_eq!(square_side(0), Some(0));
        assert_eq!(square_side(1), Some(1));
        assert_eq!(square_side(2304), Some(48));
        assert_eq!(square_side(15), None);
        assert_eq!(square_side(4097), None);
    }

    #[test]
    fn short_map_renders_missing_cells_black() {
        let map = CrossAttentionMap {
            token_index: 0,
            side: 2,
            values: vec![1.0, 0.5],
        };
        let img = map.to_luma8();
        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(img.get_pixel(0, 0).0, [255]);
        assert_eq!(img.get_pixel(1, 0).0, [128]);
        assert_eq!(img.get_pixel(0, 1).0, [0]);
        assert_eq!(img.get_pixel(1, 1).0, [0]);
    }

    #[test]
    fn normalize_spans_unit_interval() {
        let out = normalize_min_max(&[2.0, 4.0, 3.0, 6.0]);
        assert_eq!(out, vec![0.0, 0.5, 0.25, 1.0]);
    }

    #[test]
    fn flat_input_normalizes_to_zeros() {
        let out = normalize_min_max(&[0.3; 9]);
        assert!(out.iter().all(|v| *v == 0.0));
        assert!(normalize_min_max(&[]).is_empty());
    }

    /// Builds a (1, seq, seq) map where image row r attends to text token t
    /// with weight `f(r, t)`; everything else is zero.
    fn synthetic(text_len: usize, image_len: usize, f: impl Fn(usize, usize) -> f32) -> Tensor {
        let seq = text_len + image_len;
        let mut data = vec![0f32; seq * seq];
        for r in 0..image_len {
            for t in 0..text_len {
                data[(text_len + r) * seq + t] = f(r, t);
            }
        }
        Tensor::from_vec(data, (1, seq, seq), &Device::Cpu).unwrap()
    }

    #[test]
    fn aggregate_emits_normalized_square_maps() {
        let text_len = 3;
        let entry = synthetic(text_len, 4, |r, t| (r * (t + 1)) as f32);
        let maps = aggregate(&[entry.clone()], &[entry], text_len, 2).unwrap();
        assert_eq!(maps.len(), 2);
        for map in &maps {
            assert_eq!(map.side, 2);
            assert_eq!(map.values.len(), 4);
            assert!(map.values.iter().all(|v| (0.0..=1.0).contains(v)));
            assert_eq!(map.max(), 1.0);
        }
        assert_eq!(maps[0].get(0, 0), Some(0.0));
        assert_eq!(maps[0].get(1, 1), Some(1.0));
        assert_eq!(maps[1].token_index, 1);
    }

    #[test]
    fn aggregate_averages_across_families() {
        let text_len = 1;
        let double = synthetic(text_len, 4, |r, _| if r == 0 { 1.0 } else { 0.0 });
        let single = synthetic(text_len, 4, |r, _| if r == 3 { 3.0 } else { 0.0 });
        let maps = aggregate(&[double], &[single], text_len, 1).unwrap();
        // mean: row0 = 0.5, row3 = 1.5
        let values = &maps[0].values;
        assert!((values[0] - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(values[3], 1.0);
        assert_eq!(values[1], 0.0);
    }

    #[test]
    fn uniform_column_yields_zero_map() {
        let entry = synthetic(2, 9, |_, t| if t == 0 { 0.25 } else { 0.0 });
        let maps = aggregate(&[entry], &[], 2, 2).unwrap();
        assert!(maps.iter().all(|m| m.values.iter().all(|v| *v == 0.0)));
    }

    #[test]
    fn non_square_image_region_is_shape_error() {
        let entry = synthetic(2, 5, |_, _| 1.0);
        let err = aggregate(&[entry], &[], 2, 1).unwrap_err();
        assert!(matches!(err, PipelineError::Shape(_)));
    }

    #[test]
    fn empty_capture_is_shape_error() {
        assert!(matches!(
            aggregate(&[], &[], 4, 1),
            Err(PipelineError::Shape(_))
        ));
    }

    #[test]
    fn token_count_is_capped_at_text_len() {
        let entry = synthetic(2, 4, |r, t| (r + t) as f32);
        let maps = aggregate(&[entry], &[], 2, 10).unwrap();
        assert_eq!(maps.len(), 2);
    }

    #[test]
    fn head_axis_is_averaged() {
        let a = synthetic(1, 4, |r, _| r as f32);
        let b = synthetic(1, 4, |r, _| (3 - r) as f32 * 0.5);
        let stacked = Tensor::cat(&[&a, &b], 0).unwrap();
        let maps = aggregate(&[stacked], &[], 1, 1).unwrap();
        // per-row means: 0.75, 1.0, 1.25, 1.5
        let values = &maps[0].values;
        assert!((values[1] - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(values[3], 1.0);
    }

    #[test]
    fn luma_rendering_scales_to_255() {
        let map = CrossAttentionMap {
            token_index: 0,
            side: 2,
            values: vec![0.0, 1.0, 0.5, 0.25],
        };
        let img = map.to_luma8();
        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(img.get_pixel(1, 0).0[0], 255);
        assert_eq!(img.get_pixel(0, 1).0[0], 128);
        assert_eq!(img.get_pixel(0, 0).0[0], 0);
    }
}
