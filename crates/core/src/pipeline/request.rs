use candle_core::Tensor;

use crate::error::{PipelineError, Result};
use crate::model::AdapterImage;

/// Longest T5 sequence the FLUX transformer was trained with.
pub const MAX_SEQUENCE_LENGTH: usize = 512;

/// Upper bound on schedule length, whether from a step count or explicit
/// sigmas.
pub const MAX_INFERENCE_STEPS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    Single(String),
    List(Vec<String>),
}

impl PromptInput {
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::List(prompts) => prompts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Single(prompt) => vec![prompt.clone()],
            Self::List(prompts) => prompts.clone(),
        }
    }
}

impl From<&str> for PromptInput {
    fn from(prompt: &str) -> Self {
        Self::Single(prompt.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(prompt: String) -> Self {
        Self::Single(prompt)
    }
}

impl From<Vec<String>> for PromptInput {
    fn from(prompts: Vec<String>) -> Self {
        Self::List(prompts)
    }
}

/// What each step hands back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputType {
    /// Packed latents, no decoding.
    Latent,
    /// Decoded `(B, 3, H, W)` f32 tensor in `[0, 1]`.
    Tensor,
    /// Decoded 8-bit RGB images.
    #[default]
    Rgb,
}

impl std::str::FromStr for OutputType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "latent" => Ok(Self::Latent),
            "tensor" | "pt" => Ok(Self::Tensor),
            "rgb" | "pil" => Ok(Self::Rgb),
            other => Err(PipelineError::validation(format!(
                "unknown output type '{other}'"
            ))),
        }
    }
}

/// Session tensors a step-end callback may read and replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackTensor {
    Latents,
    PromptEmbeds,
}

impl CallbackTensor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latents => "latents",
            Self::PromptEmbeds => "prompt_embeds",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "latents" => Some(Self::Latents),
            "prompt_embeds" => Some(Self::PromptEmbeds),
            _ => None,
        }
    }
}

/// Conditioning for one side of the image-prompt adapter.
#[derive(Debug, Clone)]
pub enum AdapterInput {
    Images(Vec<AdapterImage>),
    /// Pre-computed `(N, image_embed_dim)` embeddings.
    Embeds(Tensor),
}

impl AdapterInput {
    /// Size of the zero image standing in for the missing side.
    pub(crate) fn placeholder_size(&self) -> Option<(u32, u32)> {
        match self {
            Self::Images(images) => images.first().map(|img| img.dimensions()),
            Self::Embeds(_) => None,
        }
    }
}

/// Everything `prepare` needs for one generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: Option<PromptInput>,
    /// Prompt for the T5 encoder; defaults to `prompt`.
    pub prompt_2: Option<PromptInput>,
    pub negative_prompt: Option<PromptInput>,
    pub negative_prompt_2: Option<PromptInput>,
    pub prompt_embeds: Option<Tensor>,
    pub pooled_prompt_embeds: Option<Tensor>,
    pub negative_prompt_embeds: Option<Tensor>,
    pub negative_pooled_prompt_embeds: Option<Tensor>,
    pub guidance_scale: f64,
    pub true_cfg_scale: f64,
    /// Defaults to the VAE's native resolution.
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub num_inference_steps: usize,
    pub sigmas: Option<Vec<f64>>,
    pub num_images_per_prompt: usize,
    pub seed: Option<u64>,
    /// Packed `(B, L_img, in_channels)` latents used instead of noise.
    pub latents: Option<Tensor>,
    pub max_sequence_length: usize,
    pub output_type: OutputType,
    pub callback_tensor_inputs: Vec<String>,
    pub ip_adapter: Option<AdapterInput>,
    pub negative_ip_adapter: Option<AdapterInput>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: None,
            prompt_2: None,
            negative_prompt: None,
            negative_prompt_2: None,
            prompt_embeds: None,
            pooled_prompt_embeds: None,
            negative_prompt_embeds: None,
            negative_pooled_prompt_embeds: None,
            guidance_scale: 3.5,
            true_cfg_scale: 1.0,
            height: None,
            width: None,
            num_inference_steps: 28,
            sigmas: None,
            num_images_per_prompt: 1,
            seed: None,
            latents: None,
            max_sequence_length: MAX_SEQUENCE_LENGTH,
            output_type: OutputType::default(),
            callback_tensor_inputs: vec![CallbackTensor::Latents.as_str().to_string()],
            ip_adapter: None,
            negative_ip_adapter: None,
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<PromptInput>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.num_inference_steps = steps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_size(mut self, height: usize, width: usize) -> Self {
        self.height = Some(height);
        self.width = Some(width);
        self
    }

    /// True CFG runs a second, negative pass per step.
    pub fn wants_true_cfg(&self) -> bool {
        let has_negative = self.negative_prompt.is_some()
            || (self.negative_prompt_embeds.is_some()
                && self.negative_pooled_prompt_embeds.is_some());
        self.true_cfg_scale > 1.0 && has_negative
    }

    /// Rows the prompts produce before `num_images_per_prompt`.
    pub fn prompt_batch_size(&self) -> Result<usize> {
        match (&self.prompt, &self.prompt_embeds) {
            (Some(prompt), _) => Ok(prompt.len()),
            (None, Some(embeds)) => Ok(embeds.dim(0)?),
            (None, None) => Err(PipelineError::validation(
                "provide either `prompt` or `prompt_embeds`",
            )),
        }
    }

    pub fn callback_tensors(&self) -> Result<Vec<CallbackTensor>> {
        if self.callback_tensor_inputs.is_empty() {
            return Err(PipelineError::validation(
                "callback tensor inputs must not be empty",
            ));
        }
        self.callback_tensor_inputs
            .iter()
            .map(|name| {
                CallbackTensor::parse(name).ok_or_else(|| {
                    PipelineError::validation(format!(
                        "callback tensor '{name}' is not one of: latents, prompt_embeds"
                    ))
                })
            })
            .collect()
    }

    /// Checks the request on its own; model-dependent checks happen in
    /// `prepare`.
    pub fn validate(&self) -> Result<()> {
        match (&self.prompt, &self.prompt_embeds) {
            (Some(_), Some(_)) => {
                return Err(PipelineError::validation(
                    "cannot forward both `prompt` and `prompt_embeds`",
                ))
            }
            (None, None) => {
                return Err(PipelineError::validation(
                    "provide either `prompt` or `prompt_embeds`",
                ))
            }
            _ => {}
        }
        if self.prompt_2.is_some() && self.prompt_embeds.is_some() {
            return Err(PipelineError::validation(
                "cannot forward both `prompt_2` and `prompt_embeds`",
            ));
        }
        if self.prompt_embeds.is_some() && self.pooled_prompt_embeds.is_none() {
            return Err(PipelineError::validation(
                "`prompt_embeds` requires `pooled_prompt_embeds`",
            ));
        }
        if self.negative_prompt.is_some() && self.negative_prompt_embeds.is_some() {
            return Err(PipelineError::validation(
                "cannot forward both `negative_prompt` and `negative_prompt_embeds`",
            ));
        }
        if self.negative_prompt_2.is_some() && self.negative_prompt_embeds.is_some() {
            return Err(PipelineError::validation(
                "cannot forward both `negative_prompt_2` and `negative_prompt_embeds`",
            ));
        }
        if self.negative_prompt_embeds.is_some() && self.negative_pooled_prompt_embeds.is_none() {
            return Err(PipelineError::validation(
                "`negative_prompt_embeds` requires `negative_pooled_prompt_embeds`",
            ));
        }

        for (name, embeds) in [
            ("prompt_embeds", &self.prompt_embeds),
            ("pooled_prompt_embeds", &self.pooled_prompt_embeds),
            ("negative_prompt_embeds", &self.negative_prompt_embeds),
            ("negative_pooled_prompt_embeds", &self.negative_pooled_prompt_embeds),
        ] {
            if let Some(embeds) = embeds {
                if embeds.dim(0)? == 0 {
                    return Err(PipelineError::validation(format!(
                        "`{name}` has no rows"
                    )));
                }
            }
        }

        for (name, input) in [
            ("prompt", &self.prompt),
            ("prompt_2", &self.prompt_2),
            ("negative_prompt", &self.negative_prompt),
            ("negative_prompt_2", &self.negative_prompt_2),
        ] {
            if matches!(input, Some(p) if p.is_empty()) {
                return Err(PipelineError::validation(format!("`{name}` list is empty")));
            }
        }
        if let (Some(prompt), Some(prompt_2)) = (&self.prompt, &self.prompt_2) {
            if prompt.len() != prompt_2.len() {
                return Err(PipelineError::validation(format!(
                    "`prompt_2` has {} entries but `prompt` has {}",
                    prompt_2.len(),
                    prompt.len()
                )));
            }
        }

        if self.max_sequence_length == 0 || self.max_sequence_length > MAX_SEQUENCE_LENGTH {
            return Err(PipelineError::validation(format!(
                "`max_sequence_length` must be in 1..={MAX_SEQUENCE_LENGTH}, got {}",
                self.max_sequence_length
            )));
        }
        if self.height == Some(0) || self.width == Some(0) {
            return Err(PipelineError::validation("height and width must be non-zero"));
        }
        match &self.sigmas {
            Some(sigmas) if sigmas.is_empty() => {
                return Err(PipelineError::validation("`sigmas` must not be empty"))
            }
            Some(sigmas) if sigmas.len() > MAX_INFERENCE_STEPS => {
                return Err(PipelineError::validation(format!(
                    "`sigmas` has {} entries, at most {MAX_INFERENCE_STEPS} are allowed",
                    sigmas.len()
                )))
            }
            Some(_) => {}
            None if self.num_inference_steps == 0 => {
                return Err(PipelineError::validation(
                    "`num_inference_steps` must be at least 1",
                ))
            }
            None if self.num_inference_steps > MAX_INFERENCE_STEPS => {
                return Err(PipelineError::validation(format!(
                    "`num_inference_steps` must be at most {MAX_INFERENCE_STEPS}, got {}",
                    self.num_inference_steps
                )))
            }
            None => {}
        }
        if self.num_images_per_prompt == 0 {
            return Err(PipelineError::validation(
                "`num_images_per_prompt` must be at least 1",
            ));
        }
        if let Some(AdapterInput::Images(images)) = &self.ip_adapter {
            if images.is_empty() {
                return Err(PipelineError::validation("`ip_adapter` image list is empty"));
            }
        }
        if let Some(AdapterInput::Images(images)) = &self.negative_ip_adapter {
            if images.is_empty() {
                return Err(PipelineError::validation(
                    "`negative_ip_adapter` image list is empty",
                ));
            }
        }
        self.callback_tensors()?;
        Ok(())
    }
}
