//! Model collaborators of the pipeline.
//!
//! The driver only talks to the traits below; the candle implementations
//! live in the submodules and the `testing` module provides mocks.

mod clip;
mod embeddings;
mod flux;
mod image_encoder;
mod ip_adapter;
mod t5;
mod text;
mod vae;

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use image::RgbImage;

use crate::attention::AttentionHook;
use crate::config::{SchedulerConfig, TransformerConfig, VaeConfig};
use crate::error::Result;

pub use clip::{ClipActivation, ClipTextConfig, ClipTextModel, ClipVisionConfig, ClipVisionModel};
pub use embeddings::{timestep_embedding, EmbedNd};
pub use flux::FluxTransformer;
pub use image_encoder::ClipImageEncoder;
pub use ip_adapter::ImageProjection;
pub use t5::{T5Config, T5Encoder};
pub use text::{FluxTextEncoder, TextEncoderFiles, CLIP_MAX_LENGTH};
pub use vae::FluxVaeDecoder;

/// Conditioning image for the image-prompt adapter.
pub type AdapterImage = RgbImage;

/// Everything one transformer forward pass consumes.
pub struct DenoiserInputs<'a> {
    /// Packed latents `(B, L_img, in_channels)`.
    pub latents: &'a Tensor,
    /// Positional ids of the image tokens, `(L_img, 3)` or `(B, L_img, 3)`.
    pub img_ids: &'a Tensor,
    /// T5 sequence embeddings `(B, L_txt, context_in_dim)`.
    pub txt: &'a Tensor,
    pub txt_ids: &'a Tensor,
    /// Timesteps in `[0, 1]`, shape `(B,)`.
    pub timesteps: &'a Tensor,
    /// Pooled CLIP embeddings `(B, vec_in_dim)`.
    pub pooled: &'a Tensor,
    pub guidance: Option<&'a Tensor>,
    /// Image embeddings for the adapter, `(B, image_embed_dim)`.
    pub adapter_embeds: Option<&'a Tensor>,
}

/// Velocity prediction of the rectified-flow transformer.
pub trait DenoiserForward: Send + Sync {
    /// Runs one pass and returns a tensor shaped like `inputs.latents`.
    ///
    /// When `hook` is set, post-softmax attention of every block whose
    /// family the hook enables is reported to it in call order.
    fn forward(
        &self,
        inputs: &DenoiserInputs<'_>,
        hook: Option<&dyn AttentionHook>,
    ) -> candle_core::Result<Tensor>;

    fn config(&self) -> &TransformerConfig;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;
}

/// Output of [`PromptEncoder::encode`], one row per prompt.
#[derive(Debug, Clone)]
pub struct EncodedPrompt {
    pub prompt_embeds: Tensor,
    pub pooled_prompt_embeds: Tensor,
    /// Content tokens per prompt, without padding or end-of-sequence.
    pub token_counts: Vec<usize>,
}

/// Encodes prompts into the sequence (T5) and pooled (CLIP) embeddings.
///
/// `prompts` feed the pooled encoder and `prompts_2` the sequence encoder;
/// both slices have the same length.
pub trait PromptEncoder: Send + Sync {
    fn encode(
        &self,
        prompts: &[String],
        prompts_2: &[String],
        max_sequence_length: usize,
    ) -> Result<EncodedPrompt>;
}

/// VAE decoder for de-normalized latents.
pub trait LatentDecoder: Send + Sync {
    fn config(&self) -> &VaeConfig;

    /// `(B, C, h, w)` latents to `(B, 3, H, W)` pixels in roughly `[-1, 1]`.
    fn decode(&self, latents: &Tensor) -> candle_core::Result<Tensor>;
}

/// Encodes adapter images into `(N, image_embed_dim)` embeddings.
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, images: &[AdapterImage]) -> Result<Tensor>;
}

/// Loaded model components, shared read-only across sessions.
#[derive(Clone)]
pub struct FluxComponents {
    pub transformer: Arc<dyn DenoiserForward>,
    pub text_encoder: Arc<dyn PromptEncoder>,
    pub vae: Arc<dyn LatentDecoder>,
    pub image_encoder: Option<Arc<dyn ImageEncoder>>,
    pub scheduler: SchedulerConfig,
}

impl std::fmt::Debug for FluxComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluxComponents")
            .field("transformer", self.transformer.config())
            .field("vae", self.vae.config())
            .field("image_encoder", &self.image_encoder.is_some())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
