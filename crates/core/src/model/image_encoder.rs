use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use super::clip::{ClipVisionConfig, ClipVisionModel};
use super::{AdapterImage, ImageEncoder};
use crate::error::{PipelineError, Result};
use crate::image_processor::clip_pixel_values;

/// CLIP vision tower used to embed adapter images.
pub struct ClipImageEncoder {
    model: ClipVisionModel,
    device: Device,
    dtype: DType,
}

impl ClipImageEncoder {
    pub fn new(config: &ClipVisionConfig, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let dtype = vb.dtype();
        Ok(Self {
            model: ClipVisionModel::new(config, vb)?,
            device,
            dtype,
        })
    }
}

impl ImageEncoder for ClipImageEncoder {
    fn encode(&self, images: &[AdapterImage]) -> Result<candle_core::Tensor> {
        if images.is_empty() {
            return Err(PipelineError::validation("no adapter images to encode"));
        }
        let pixels = clip_pixel_values(images, self.model.image_size(), &self.device)?
            .to_dtype(self.dtype)?;
        Ok(self.model.image_embeds(&pixels)?)
    }
}
