//! Pixel-space conversions around the models: CLIP input preparation and
//! VAE output post-processing.

use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::error::{PipelineError, Result};

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Resize the short side to `size`, center-crop to `size x size`.
fn resize_and_crop(image: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let scale = size as f32 / w.min(h).max(1) as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(size);
    let new_h = ((h as f32 * scale).round() as u32).max(size);
    let resized = imageops::resize(image, new_w, new_h, FilterType::CatmullRom);
    let x = (new_w - size) / 2;
    let y = (new_h - size) / 2;
    imageops::crop_imm(&resized, x, y, size, size).to_image()
}

/// `(N, 3, size, size)` f32 pixel values normalized with the CLIP statistics.
pub fn clip_pixel_values(images: &[RgbImage], size: usize, device: &Device) -> Result<Tensor> {
    let side = size as u32;
    let plane = size * size;
    let mut data = Vec::with_capacity(images.len() * 3 * plane);
    for image in images {
        let image = resize_and_crop(image, side);
        let mut chw = vec![0f32; 3 * plane];
        for (i, pixel) in image.pixels().enumerate() {
            for c in 0..3 {
                let v = pixel.0[c] as f32 / 255.0;
                chw[c * plane + i] = (v - CLIP_MEAN[c]) / CLIP_STD[c];
            }
        }
        data.extend(chw);
    }
    Ok(Tensor::from_vec(data, (images.len(), 3, size, size), device)?)
}

/// Maps decoder output from `[-1, 1]` to `[0, 1]` in f32.
pub fn denormalize(decoded: &Tensor) -> Result<Tensor> {
    Ok(((decoded.to_dtype(DType::F32)? / 2.0)? + 0.5)?.clamp(0f32, 1f32)?)
}

/// Converts `(B, 3, H, W)` values in `[0, 1]` to 8-bit RGB images.
pub fn to_rgb8(images: &Tensor) -> Result<Vec<RgbImage>> {
    let (batch, channels, height, width) = images.dims4()?;
    if channels != 3 {
        return Err(PipelineError::shape(format!(
            "expected 3 channels for RGB output, got {channels}"
        )));
    }
    let pixels = (images.to_dtype(DType::F32)? * 255.0)?
        .round()?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .permute((0, 2, 3, 1))?
        .contiguous()?;
    (0..batch)
        .map(|i| {
            let raw = pixels.get(i)?.flatten_all()?.to_vec1::<u8>()?;
            RgbImage::from_raw(width as u32, height as u32, raw).ok_or_else(|| {
                PipelineError::shape(format!("pixel buffer does not fit {width}x{height}"))
            })
        })
        .collect()
}
