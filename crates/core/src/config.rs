//! Model-side configuration read from the model directory.
//!
//! Field names follow the BFL checkpoint conventions; the diffusers names
//! are accepted as aliases so a `transformer/config.json` from a diffusers
//! export parses as well.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

// ─── Transformer ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(alias = "pooled_projection_dim")]
    pub vec_in_dim: usize,
    #[serde(alias = "joint_attention_dim")]
    pub context_in_dim: usize,
    #[serde(alias = "num_attention_heads")]
    pub num_heads: usize,
    #[serde(alias = "attention_head_dim", default = "default_head_dim")]
    pub head_dim: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,
    #[serde(alias = "num_layers")]
    pub depth: usize,
    #[serde(alias = "num_single_layers")]
    pub depth_single_blocks: usize,
    #[serde(alias = "axes_dims_rope", default = "default_axes_dim")]
    pub axes_dim: Vec<usize>,
    #[serde(default = "default_theta")]
    pub theta: usize,
    #[serde(default = "default_true")]
    pub qkv_bias: bool,
    #[serde(alias = "guidance_embeds", default)]
    pub guidance_embed: bool,
    #[serde(default)]
    pub ip_adapter: Option<IpAdapterConfig>,
}

fn default_in_channels() -> usize {
    64
}
fn default_head_dim() -> usize {
    128
}
fn default_mlp_ratio() -> f64 {
    4.0
}
fn default_axes_dim() -> Vec<usize> {
    vec![16, 56, 56]
}
fn default_theta() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}

impl TransformerConfig {
    /// FLUX.1 [dev]: guidance-distilled, embeds the guidance scale.
    pub fn dev() -> Self {
        Self {
            in_channels: 64,
            vec_in_dim: 768,
            context_in_dim: 4096,
            num_heads: 24,
            head_dim: 128,
            mlp_ratio: 4.0,
            depth: 19,
            depth_single_blocks: 38,
            axes_dim: default_axes_dim(),
            theta: 10_000,
            qkv_bias: true,
            guidance_embed: true,
            ip_adapter: None,
        }
    }

    /// FLUX.1 [schnell]: same topology without the guidance embedder.
    pub fn schnell() -> Self {
        Self {
            guidance_embed: false,
            ..Self::dev()
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Channels of the unpacked latent; the packed width is four times this.
    pub fn latent_channels(&self) -> usize {
        self.in_channels / 4
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 || self.in_channels % 4 != 0 {
            return Err(PipelineError::config(format!(
                "in_channels must be a positive multiple of 4, got {}",
                self.in_channels
            )));
        }
        let rope_dim: usize = self.axes_dim.iter().sum();
        if rope_dim != self.head_dim {
            return Err(PipelineError::config(format!(
                "rope axes {:?} sum to {rope_dim}, head_dim is {}",
                self.axes_dim, self.head_dim
            )));
        }
        if self.axes_dim.iter().any(|d| d % 2 != 0) {
            return Err(PipelineError::config("rope axes must be even"));
        }
        Ok(())
    }
}

/// Image-prompt adapter attached to the double-stream blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpAdapterConfig {
    /// Width of the CLIP image embedding fed to the projection.
    #[serde(default = "default_image_embed_dim")]
    pub image_embed_dim: usize,
    #[serde(default = "default_num_tokens")]
    pub num_tokens: usize,
    #[serde(default = "default_ip_scale")]
    pub scale: f64,
}

fn default_image_embed_dim() -> usize {
    768
}
fn default_num_tokens() -> usize {
    4
}
fn default_ip_scale() -> f64 {
    1.0
}

impl Default for IpAdapterConfig {
    fn default() -> Self {
        Self {
            image_embed_dim: default_image_embed_dim(),
            num_tokens: default_num_tokens(),
            scale: default_ip_scale(),
        }
    }
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

/// How `mu` is interpolated between the base and max shift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftInterpolation {
    /// `mu` moves linearly with the image sequence length.
    #[default]
    Linear,
    /// Interpolates in log-shift space; the scheduler exponentiates it.
    LogLinear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    /// Static shift, applied when dynamic shifting is off.
    #[serde(default = "default_shift")]
    pub shift: f64,
    #[serde(default)]
    pub use_dynamic_shifting: bool,
    #[serde(default)]
    pub base_image_seq_len: Option<usize>,
    #[serde(default)]
    pub max_image_seq_len: Option<usize>,
    #[serde(default)]
    pub base_shift: Option<f64>,
    #[serde(default)]
    pub max_shift: Option<f64>,
    #[serde(default)]
    pub shift_interpolation: ShiftInterpolation,
}

fn default_num_train_timesteps() -> usize {
    1000
}
fn default_shift() -> f64 {
    1.0
}

/// The four values `mu` is computed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShiftBounds {
    pub base_image_seq_len: usize,
    pub max_image_seq_len: usize,
    pub base_shift: f64,
    pub max_shift: f64,
}

impl SchedulerConfig {
    pub fn dev() -> Self {
        Self {
            num_train_timesteps: 1000,
            shift: 3.0,
            use_dynamic_shifting: true,
            base_image_seq_len: Some(256),
            max_image_seq_len: Some(4096),
            base_shift: Some(0.5),
            max_shift: Some(1.15),
            shift_interpolation: ShiftInterpolation::Linear,
        }
    }

    pub fn schnell() -> Self {
        Self {
            shift: 1.0,
            use_dynamic_shifting: false,
            ..Self::dev()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| PipelineError::config(format!("{}: {e}", path.display())))
    }

    pub fn shift_bounds(&self) -> Result<ShiftBounds> {
        let mut missing = Vec::new();
        if self.base_image_seq_len.is_none() {
            missing.push("base_image_seq_len");
        }
        if self.max_image_seq_len.is_none() {
            missing.push("max_image_seq_len");
        }
        if self.base_shift.is_none() {
            missing.push("base_shift");
        }
        if self.max_shift.is_none() {
            missing.push("max_shift");
        }
        match (
            self.base_image_seq_len,
            self.max_image_seq_len,
            self.base_shift,
            self.max_shift,
        ) {
            (Some(base_len), Some(max_len), Some(base_shift), Some(max_shift)) => {
                if max_len <= base_len {
                    return Err(PipelineError::config(format!(
                        "max_image_seq_len ({max_len}) must exceed base_image_seq_len ({base_len})"
                    )));
                }
                Ok(ShiftBounds {
                    base_image_seq_len: base_len,
                    max_image_seq_len: max_len,
                    base_shift,
                    max_shift,
                })
            }
            _ => Err(PipelineError::config(format!(
                "scheduler config is missing {}",
                missing.join(", ")
            ))),
        }
    }
}

// ─── VAE ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaeConfig {
    #[serde(default = "default_vae_scaling")]
    pub scaling_factor: f64,
    #[serde(default = "default_vae_shift")]
    pub shift_factor: f64,
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,
    #[serde(default = "default_block_out_channels")]
    pub block_out_channels: Vec<usize>,
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,
    #[serde(default = "default_rgb")]
    pub in_channels: usize,
    #[serde(default = "default_rgb")]
    pub out_channels: usize,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

fn default_vae_scaling() -> f64 {
    0.3611
}
fn default_vae_shift() -> f64 {
    0.1159
}
fn default_latent_channels() -> usize {
    16
}
fn default_block_out_channels() -> Vec<usize> {
    vec![128, 256, 512, 512]
}
fn default_layers_per_block() -> usize {
    2
}
fn default_rgb() -> usize {
    3
}
fn default_sample_size() -> usize {
    1024
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            scaling_factor: default_vae_scaling(),
            shift_factor: default_vae_shift(),
            latent_channels: default_latent_channels(),
            block_out_channels: default_block_out_channels(),
            layers_per_block: default_layers_per_block(),
            in_channels: default_rgb(),
            out_channels: default_rgb(),
            sample_size: default_sample_size(),
        }
    }
}

impl VaeConfig {
    /// Pixel-to-latent downsampling factor.
    pub fn vae_scale_factor(&self) -> usize {
        1 << self.block_out_channels.len().saturating_sub(1)
    }

    /// Default output resolution when a request leaves height/width unset.
    pub fn default_resolution(&self) -> usize {
        self.sample_size
    }

    pub fn to_autoencoder_config(&self) -> Result<candle_transformers::models::flux::autoencoder::Config> {
        let ch = *self
            .block_out_channels
            .first()
            .ok_or_else(|| PipelineError::config("block_out_channels is empty"))?;
        if ch == 0 || self.block_out_channels.iter().any(|c| c % ch != 0) {
            return Err(PipelineError::config(format!(
                "block_out_channels {:?} are not multiples of the first entry",
                self.block_out_channels
            )));
        }
        Ok(candle_transformers::models::flux::autoencoder::Config {
            resolution: 256,
            in_channels: self.in_channels,
            ch,
            out_ch: self.out_channels,
            ch_mult: self.block_out_channels.iter().map(|c| c / ch).collect(),
            num_res_blocks: self.layers_per_block,
            z_channels: self.latent_channels,
            scale_factor: self.scaling_factor,
            shift_factor: self.shift_factor,
        })
    }
}

/// Reads a JSON config file, falling back to `default` when it is absent.
pub fn load_json_or<T>(path: &Path, default: T) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if !path.exists() {
        return Ok(default);
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| PipelineError::config(format!("{}: {e}", path.display())))
}
