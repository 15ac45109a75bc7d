//! Shared test utilities for fluxstep-core.
//!
//! Mock collaborators that run the pipeline without weights, plus tiny
//! model configurations for tests that build real layers.

mod mock_model;
mod tiny_config;

pub use mock_model::{
    ForwardCall, MockComponents, MockDecoder, MockDenoiser, MockImageEncoder, MockPromptEncoder,
};
pub use tiny_config::{
    tiny_ip_adapter_config, tiny_scheduler_config, tiny_transformer_config, tiny_vae_config,
};
