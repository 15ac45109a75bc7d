//! Step-wise generation: request validation, session state and the
//! single-step driver.

mod callback;
mod driver;
mod guidance;
mod latents;
mod request;
mod session;

pub use callback::{CallbackTensors, StepEndCallback};
pub use driver::{SingleStepPipeline, StepImages, StepOutput};
pub use guidance::apply_true_cfg;
pub use latents::{
    latent_dim, pack_latents, prepare_latent_image_ids, prepare_text_ids, repeat_per_prompt,
    round_down, seeded_noise, unpack_latents,
};
pub use request::{
    AdapterInput, CallbackTensor, GenerationRequest, OutputType, PromptInput, MAX_INFERENCE_STEPS,
    MAX_SEQUENCE_LENGTH,
};
pub use session::{GenerationSession, NegativeConditioning};
