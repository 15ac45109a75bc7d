//! Attention capture during the transformer forward pass and the per-step
//! reduction of captured weights into per-token heat maps.

mod aggregate;
mod hook;
mod recorder;

pub use aggregate::{aggregate, cross_attention_region, normalize_min_max, square_side, CrossAttentionMap};
pub use hook::{AttentionHook, BlockFamily};
pub use recorder::{AttentionRecorder, CapturedPass, RecorderConfig};
