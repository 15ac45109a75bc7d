use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use super::clip::{ClipTextConfig, ClipTextModel};
use super::t5::{T5Config, T5Encoder};
use super::{EncodedPrompt, PromptEncoder};
use crate::error::{PipelineError, Result};

/// Context length of the CLIP text tower.
pub const CLIP_MAX_LENGTH: usize = 77;
const T5_PAD_ID: u32 = 0;

/// On-disk files for both text encoders.
#[derive(Debug, Clone)]
pub struct TextEncoderFiles {
    pub clip_weights: Vec<PathBuf>,
    pub clip_config: Option<PathBuf>,
    pub clip_tokenizer: PathBuf,
    pub t5_weights: Vec<PathBuf>,
    pub t5_config: Option<PathBuf>,
    pub t5_tokenizer: PathBuf,
}

/// T5 sequence encoder plus CLIP pooled encoder.
pub struct FluxTextEncoder {
    t5: T5Encoder,
    t5_tokenizer: Tokenizer,
    clip: ClipTextModel,
    clip_tokenizer: Tokenizer,
    clip_eos_id: u32,
    device: Device,
    dtype: DType,
}

fn load_tokenizer(path: &PathBuf) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(|e| PipelineError::Tokenizer(format!("{}: {e}", path.display())))
}

impl FluxTextEncoder {
    pub fn new(
        t5: T5Encoder,
        t5_tokenizer: Tokenizer,
        clip: ClipTextModel,
        clip_tokenizer: Tokenizer,
        dtype: DType,
    ) -> Self {
        let clip_eos_id = clip_tokenizer
            .token_to_id("<|endoftext|>")
            .unwrap_or(49407);
        Self {
            device: t5.device().clone(),
            t5,
            t5_tokenizer,
            clip,
            clip_tokenizer,
            clip_eos_id,
            dtype,
        }
    }

    /// Loads both encoders; weights are memory-mapped in `dtype`.
    pub fn load(files: &TextEncoderFiles, dtype: DType, device: &Device) -> Result<Self> {
        let t5_cfg = match &files.t5_config {
            Some(path) => crate::config::load_json_or(path, T5Config::v1_1_xxl())?,
            None => T5Config::v1_1_xxl(),
        };
        let clip_cfg = match &files.clip_config {
            Some(path) => crate::config::load_json_or(path, ClipTextConfig::vit_large_patch14())?,
            None => ClipTextConfig::vit_large_patch14(),
        };
        // T5 overflows in f16.
        let t5_dtype = if dtype == DType::F16 { DType::F32 } else { dtype };
        let t5_vb = crate::loader::load_weights(&files.t5_weights, t5_dtype, device)?;
        let clip_vb = crate::loader::load_weights(&files.clip_weights, dtype, device)?;
        debug!(t5_layers = t5_cfg.num_layers, clip_layers = clip_cfg.num_hidden_layers, "loading text encoders");
        Ok(Self::new(
            T5Encoder::new(&t5_cfg, t5_vb)?,
            load_tokenizer(&files.t5_tokenizer)?,
            ClipTextModel::new(&clip_cfg, clip_vb)?,
            load_tokenizer(&files.clip_tokenizer)?,
            dtype,
        ))
    }

    /// Builds an encoder over arbitrary var builders, used with tiny configs.
    pub fn from_var_builders(
        t5_cfg: &T5Config,
        t5_vb: VarBuilder,
        t5_tokenizer: Tokenizer,
        clip_cfg: &ClipTextConfig,
        clip_vb: VarBuilder,
        clip_tokenizer: Tokenizer,
    ) -> Result<Self> {
        let dtype = clip_vb.dtype();
        Ok(Self::new(
            T5Encoder::new(t5_cfg, t5_vb)?,
            t5_tokenizer,
            ClipTextModel::new(clip_cfg, clip_vb)?,
            clip_tokenizer,
            dtype,
        ))
    }

    /// T5 ids padded to `max_len` and the number of content tokens.
    fn t5_ids(&self, prompt: &str, max_len: usize) -> Result<(Vec<u32>, usize)> {
        let encoding = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;
        let mut ids = encoding.get_ids().to_vec();
        let content = encoding
            .get_special_tokens_mask()
            .iter()
            .filter(|&&m| m == 0)
            .count();
        if ids.len() > max_len {
            warn!(
                tokens = ids.len(),
                max_len, "prompt truncated for the sequence encoder"
            );
            ids.truncate(max_len);
        }
        let token_count = content.min(max_len);
        ids.resize(max_len, T5_PAD_ID);
        Ok((ids, token_count))
    }

    fn clip_ids(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(|e| PipelineError::Tokenizer(e.to_string()))?;
        let mut ids = encoding.get_ids().to_vec();
        let limit = self.clip.max_position_embeddings().min(CLIP_MAX_LENGTH);
        if ids.len() > limit {
            ids.truncate(limit);
            if let Some(last) = ids.last_mut() {
                *last = self.clip_eos_id;
            }
        }
        if ids.last() != Some(&self.clip_eos_id) {
            ids.push(self.clip_eos_id);
        }
        Ok(ids)
    }
}

impl PromptEncoder for FluxTextEncoder {
    fn encode(
        &self,
        prompts: &[String],
        prompts_2: &[String],
        max_sequence_length: usize,
    ) -> Result<EncodedPrompt> {
        if prompts.len() != prompts_2.len() {
            return Err(PipelineError::validation(format!(
                "prompt has {} entries, prompt_2 has {}",
                prompts.len(),
                prompts_2.len()
            )));
        }

        let mut sequences = Vec::with_capacity(prompts_2.len());
        let mut token_counts = Vec::with_capacity(prompts_2.len());
        for prompt in prompts_2 {
            let (ids, count) = self.t5_ids(prompt, max_sequence_length)?;
            let ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
            sequences.push(self.t5.forward(&ids)?.to_dtype(self.dtype)?);
            token_counts.push(count);
        }

        let mut pooled = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let ids = self.clip_ids(prompt)?;
            let ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
            pooled.push(self.clip.pooled(&ids)?.to_dtype(self.dtype)?);
        }

        Ok(EncodedPrompt {
            prompt_embeds: Tensor::cat(&sequences, 0)?,
            pooled_prompt_embeds: Tensor::cat(&pooled, 0)?,
            token_counts,
        })
    }
}
