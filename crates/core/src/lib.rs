pub mod attention;
pub mod config;
pub mod error;
pub mod image_processor;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod scheduler;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{PipelineError, Result};
pub use model::FluxComponents;
pub use pipeline::{GenerationRequest, SingleStepPipeline, StepImages, StepOutput};
