use candle_core::Tensor;

use super::request::{CallbackTensor, OutputType};
use crate::scheduler::TimestepSchedule;

/// Negative-side conditioning, present only while true CFG is active.
#[derive(Debug, Clone)]
pub struct NegativeConditioning {
    pub prompt_embeds: Tensor,
    pub pooled_prompt_embeds: Tensor,
    pub image_embeds: Option<Tensor>,
    pub true_cfg_scale: f64,
}

/// Step-invariant state built by `prepare`, plus the evolving latents.
///
/// The latent shape is fixed for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct GenerationSession {
    pub(crate) prompt_embeds: Tensor,
    pub(crate) pooled_prompt_embeds: Tensor,
    pub(crate) negative: Option<NegativeConditioning>,
    pub(crate) text_ids: Tensor,
    pub(crate) latent_image_ids: Tensor,
    pub(crate) latents: Tensor,
    pub(crate) schedule: TimestepSchedule,
    pub(crate) guidance: Option<Tensor>,
    pub(crate) image_embeds: Option<Tensor>,
    pub(crate) height: usize,
    pub(crate) width: usize,
    pub(crate) output_type: OutputType,
    pub(crate) callback_tensors: Vec<CallbackTensor>,
    pub(crate) token_counts: Vec<usize>,
    pub(crate) last_step: Option<usize>,
    pub(crate) current_timestep: Option<f64>,
}

impl GenerationSession {
    pub fn num_steps(&self) -> usize {
        self.schedule.len()
    }

    pub fn schedule(&self) -> &TimestepSchedule {
        &self.schedule
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.schedule.sigmas
    }

    pub fn timesteps(&self) -> &[f64] {
        &self.schedule.timesteps
    }

    pub fn latents(&self) -> &Tensor {
        &self.latents
    }

    pub fn prompt_embeds(&self) -> &Tensor {
        &self.prompt_embeds
    }

    pub fn pooled_prompt_embeds(&self) -> &Tensor {
        &self.pooled_prompt_embeds
    }

    pub fn negative(&self) -> Option<&NegativeConditioning> {
        self.negative.as_ref()
    }

    pub fn do_true_cfg(&self) -> bool {
        self.negative.is_some()
    }

    pub fn guidance(&self) -> Option<&Tensor> {
        self.guidance.as_ref()
    }

    pub fn image_embeds(&self) -> Option<&Tensor> {
        self.image_embeds.as_ref()
    }

    pub fn latent_image_ids(&self) -> &Tensor {
        &self.latent_image_ids
    }

    pub fn text_ids(&self) -> &Tensor {
        &self.text_ids
    }

    /// Text sequence length seen by the transformer.
    pub fn text_len(&self) -> usize {
        self.text_ids.dims().first().copied().unwrap_or(0)
    }

    /// Content tokens of the first prompt, capped at the text length.
    pub fn prompt_token_count(&self) -> usize {
        self.token_counts
            .first()
            .copied()
            .unwrap_or(0)
            .min(self.text_len())
    }

    pub fn token_counts(&self) -> &[usize] {
        &self.token_counts
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn output_type(&self) -> OutputType {
        self.output_type
    }

    pub fn batch_size(&self) -> usize {
        self.latents.dims().first().copied().unwrap_or(0)
    }

    /// Last step that ran, if any.
    pub fn last_step(&self) -> Option<usize> {
        self.last_step
    }
}
