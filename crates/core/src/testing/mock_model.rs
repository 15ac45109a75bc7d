use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor, D};

use crate::attention::{AttentionHook, BlockFamily};
use crate::config::{TransformerConfig, VaeConfig};
use crate::error::{PipelineError, Result};
use crate::model::{
    AdapterImage, DenoiserForward, DenoiserInputs, EncodedPrompt, FluxComponents, ImageEncoder,
    LatentDecoder, PromptEncoder,
};

use super::tiny_config::{
    tiny_ip_adapter_config, tiny_scheduler_config, tiny_transformer_config, tiny_vae_config,
};

/// What one mock forward pass was given.
#[derive(Debug, Clone)]
pub struct ForwardCall {
    pub timestep: f32,
    pub text_fill: f32,
    pub adapter_fill: Option<f32>,
    pub hooked: bool,
}

/// A denoiser that needs no weights. The velocity for each batch row is
/// the mean of that row's text embeddings, so different conditioning gives
/// different predictions. With a hook it reports synthetic attention for
/// every block.
pub struct MockDenoiser {
    config: TransformerConfig,
    device: Device,
    calls: Mutex<Vec<ForwardCall>>,
}

impl MockDenoiser {
    pub fn new(config: TransformerConfig) -> Self {
        Self {
            config,
            device: Device::Cpu,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn tiny() -> Self {
        Self::new(tiny_transformer_config())
    }

    pub fn calls(&self) -> Vec<ForwardCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// `(B, heads, L, L)` weights where image rows favour text columns in
    /// proportion to their position.
    fn synthetic_attention(batch: usize, heads: usize, len: usize) -> candle_core::Result<Tensor> {
        let total = (len * len) as f32;
        let weights = Tensor::arange(0f32, total, &Device::Cpu)?.reshape((1, 1, len, len))?;
        (weights / total as f64)?.broadcast_as((batch, heads, len, len))?.contiguous()
    }
}

fn mean_of(t: &Tensor) -> candle_core::Result<f32> {
    t.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()
}

impl DenoiserForward for MockDenoiser {
    fn forward(
        &self,
        inputs: &DenoiserInputs<'_>,
        hook: Option<&dyn AttentionHook>,
    ) -> candle_core::Result<Tensor> {
        let (batch, img_len, _) = inputs.latents.dims3()?;
        let txt_len = inputs.txt.dim(1)?;
        if self.config.guidance_embed && inputs.guidance.is_none() {
            candle_core::bail!("model embeds guidance but no guidance tensor was given");
        }

        if let Some(hook) = hook {
            let weights =
                Self::synthetic_attention(batch, self.config.num_heads, txt_len + img_len)?;
            for (family, blocks) in [
                (BlockFamily::DoubleStream, self.config.depth),
                (BlockFamily::SingleStream, self.config.depth_single_blocks),
            ] {
                if hook.capture_enabled(family) {
                    for block_index in 0..blocks {
                        hook.on_attention(family, block_index, &weights)?;
                    }
                }
            }
        }

        let call = ForwardCall {
            timestep: mean_of(inputs.timesteps)?,
            text_fill: mean_of(inputs.txt)?,
            adapter_fill: inputs.adapter_embeds.map(mean_of).transpose()?,
            hooked: hook.is_some(),
        };
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }

        let per_row = inputs
            .txt
            .to_dtype(DType::F32)?
            .mean_keepdim(D::Minus1)?
            .mean_keepdim(1)?;
        per_row
            .broadcast_as(inputs.latents.shape())?
            .to_dtype(inputs.latents.dtype())
    }

    fn config(&self) -> &TransformerConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        DType::F32
    }
}

/// Encodes every prompt as a constant embedding of `len(prompt) / 100`.
/// Token counts are whitespace-separated words.
pub struct MockPromptEncoder {
    seq_len: usize,
    context_dim: usize,
    pooled_dim: usize,
    calls: Mutex<Vec<(Vec<String>, Vec<String>)>>,
}

impl MockPromptEncoder {
    pub fn new(seq_len: usize, context_dim: usize, pooled_dim: usize) -> Self {
        Self {
            seq_len,
            context_dim,
            pooled_dim,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn for_model(config: &TransformerConfig, seq_len: usize) -> Self {
        Self::new(seq_len, config.context_in_dim, config.vec_in_dim)
    }

    pub fn calls(&self) -> Vec<(Vec<String>, Vec<String>)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn fill_for(prompt: &str) -> f32 {
        prompt.len() as f32 / 100.0
    }
}

impl PromptEncoder for MockPromptEncoder {
    fn encode(
        &self,
        prompts: &[String],
        prompts_2: &[String],
        max_sequence_length: usize,
    ) -> Result<EncodedPrompt> {
        if prompts.len() != prompts_2.len() {
            return Err(PipelineError::validation("prompt lists differ in length"));
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((prompts.to_vec(), prompts_2.to_vec()));
        }
        let seq_len = self.seq_len.min(max_sequence_length);
        let dev = Device::Cpu;
        let mut rows = Vec::with_capacity(prompts.len());
        let mut pooled = Vec::with_capacity(prompts.len());
        for (prompt, prompt_2) in prompts.iter().zip(prompts_2) {
            rows.push(Tensor::full(
                Self::fill_for(prompt_2),
                (1, seq_len, self.context_dim),
                &dev,
            )?);
            pooled.push(Tensor::full(Self::fill_for(prompt), (1, self.pooled_dim), &dev)?);
        }
        Ok(EncodedPrompt {
            prompt_embeds: Tensor::cat(&rows, 0)?,
            pooled_prompt_embeds: Tensor::cat(&pooled, 0)?,
            token_counts: prompts_2
                .iter()
                .map(|p| p.split_whitespace().count().min(seq_len))
                .collect(),
        })
    }
}

/// Upsamples the latent channel mean to RGB; counts decodes.
pub struct MockDecoder {
    config: VaeConfig,
    decodes: Mutex<usize>,
}

impl MockDecoder {
    pub fn new(config: VaeConfig) -> Self {
        Self {
            config,
            decodes: Mutex::new(0),
        }
    }

    pub fn decodes(&self) -> usize {
        self.decodes.lock().map(|d| *d).unwrap_or(0)
    }
}

impl LatentDecoder for MockDecoder {
    fn config(&self) -> &VaeConfig {
        &self.config
    }

    fn decode(&self, latents: &Tensor) -> candle_core::Result<Tensor> {
        if let Ok(mut decodes) = self.decodes.lock() {
            *decodes += 1;
        }
        let (b, _, h, w) = latents.dims4()?;
        let factor = self.config.vae_scale_factor();
        latents
            .mean_keepdim(1)?
            .upsample_nearest2d(h * factor, w * factor)?
            .broadcast_as((b, 3, h * factor, w * factor))?
            .contiguous()
    }
}

/// Embeds each image as its mean pixel value in `[0, 1]`; remembers the
/// sizes it was given.
pub struct MockImageEncoder {
    embed_dim: usize,
    seen: Mutex<Vec<(u32, u32)>>,
}

impl MockImageEncoder {
    pub fn new(embed_dim: usize) -> Self {
        Self {
            embed_dim,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen_sizes(&self) -> Vec<(u32, u32)> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl ImageEncoder for MockImageEncoder {
    fn encode(&self, images: &[AdapterImage]) -> Result<Tensor> {
        if images.is_empty() {
            return Err(PipelineError::validation("no adapter images to encode"));
        }
        let mut rows = Vec::with_capacity(images.len());
        for image in images {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(image.dimensions());
            }
            let raw = image.as_raw();
            let mean = raw.iter().map(|&p| p as f32).sum::<f32>() / raw.len().max(1) as f32 / 255.0;
            rows.push(Tensor::full(mean, (1, self.embed_dim), &Device::Cpu)?);
        }
        Ok(Tensor::cat(&rows, 0)?)
    }
}

/// Mock collaborators wired into [`FluxComponents`], with handles kept for
/// inspecting what the pipeline did.
pub struct MockComponents {
    pub transformer: Arc<MockDenoiser>,
    pub text_encoder: Arc<MockPromptEncoder>,
    pub vae: Arc<MockDecoder>,
    pub image_encoder: Arc<MockImageEncoder>,
    pub components: FluxComponents,
}

impl MockComponents {
    /// Tiny guided model without an image adapter; 6 text tokens.
    pub fn tiny() -> Self {
        Self::build(tiny_transformer_config())
    }

    /// Tiny model with an image adapter and image encoder attached.
    pub fn tiny_with_adapter() -> Self {
        let mut config = tiny_transformer_config();
        config.ip_adapter = Some(tiny_ip_adapter_config());
        Self::build(config)
    }

    pub fn build(config: TransformerConfig) -> Self {
        let text_encoder = Arc::new(MockPromptEncoder::for_model(&config, 6));
        let image_dim = config
            .ip_adapter
            .as_ref()
            .map_or(tiny_ip_adapter_config().image_embed_dim, |ip| ip.image_embed_dim);
        let image_encoder = Arc::new(MockImageEncoder::new(image_dim));
        let with_adapter = config.ip_adapter.is_some();
        let transformer = Arc::new(MockDenoiser::new(config));
        let vae = Arc::new(MockDecoder::new(tiny_vae_config()));
        let components = FluxComponents {
            transformer: transformer.clone(),
            text_encoder: text_encoder.clone(),
            vae: vae.clone(),
            image_encoder: with_adapter.then(|| image_encoder.clone() as Arc<dyn ImageEncoder>),
            scheduler: tiny_scheduler_config(),
        };
        Self {
            transformer,
            text_encoder,
            vae,
            image_encoder,
            components,
        }
    }
}
