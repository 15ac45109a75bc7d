//! Resolving and loading the FLUX.1 component files.
//!
//! The layout matches the `black-forest-labs/FLUX.1-*` hub repos: BFL
//! transformer and autoencoder checkpoints at the root, diffusers-style
//! folders for the text encoders, tokenizers and scheduler. A local
//! directory with the same layout works the same way.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, api::sync::ApiRepo, Repo, RepoType};
use tracing::{debug, info};

use crate::config::{load_json_or, SchedulerConfig, TransformerConfig, VaeConfig};
use crate::error::PipelineError;
use crate::model::{
    ClipImageEncoder, ClipVisionConfig, FluxComponents, FluxTextEncoder, FluxTransformer,
    FluxVaeDecoder, ImageEncoder, TextEncoderFiles,
};

const TRANSFORMER_CANDIDATES: &[&str] = &[
    "flux1-dev.safetensors",
    "flux1-schnell.safetensors",
    "transformer.safetensors",
];

/// Which built-in defaults apply when a config file is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Dev,
    Schnell,
}

impl FluxVariant {
    fn from_weights(path: &Path) -> Self {
        let name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or_default();
        if name.contains("schnell") {
            Self::Schnell
        } else {
            Self::Dev
        }
    }

    pub fn transformer_config(&self) -> TransformerConfig {
        match self {
            Self::Dev => TransformerConfig::dev(),
            Self::Schnell => TransformerConfig::schnell(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        match self {
            Self::Dev => SchedulerConfig::dev(),
            Self::Schnell => SchedulerConfig::schnell(),
        }
    }
}

pub struct ModelFiles {
    pub variant: FluxVariant,
    pub transformer_weights: Vec<PathBuf>,
    pub transformer_config: Option<PathBuf>,
    pub vae_weights: Vec<PathBuf>,
    pub vae_config: Option<PathBuf>,
    pub text: TextEncoderFiles,
    pub scheduler_config: Option<PathBuf>,
    pub ip_adapter_weights: Option<PathBuf>,
    pub image_encoder_weights: Option<Vec<PathBuf>>,
    pub image_encoder_config: Option<PathBuf>,
}

/// Somewhere component files can be fetched from.
trait FileSource {
    fn get(&self, rel: &str) -> anyhow::Result<PathBuf>;

    fn try_get(&self, rel: &str) -> Option<PathBuf> {
        self.get(rel).ok()
    }
}

struct LocalDir(PathBuf);

impl FileSource for LocalDir {
    fn get(&self, rel: &str) -> anyhow::Result<PathBuf> {
        let path = self.0.join(rel);
        if path.exists() {
            Ok(path)
        } else {
            anyhow::bail!("{} not found", path.display())
        }
    }
}

struct HubRepo(ApiRepo);

impl FileSource for HubRepo {
    fn get(&self, rel: &str) -> anyhow::Result<PathBuf> {
        Ok(self.0.get(rel)?)
    }
}

/// Resolves component files from a local directory or a hub repo id
/// (downloading into the hub cache when needed).
pub fn fetch_model(model: &str) -> anyhow::Result<ModelFiles> {
    let local = Path::new(model);
    if local.is_dir() {
        info!(path = %local.display(), "resolving model from local directory");
        resolve(&LocalDir(local.to_path_buf()))
    } else {
        info!(repo = model, "resolving model from hub");
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model.to_string(), RepoType::Model));
        resolve(&HubRepo(repo))
    }
}

fn resolve(source: &dyn FileSource) -> anyhow::Result<ModelFiles> {
    let transformer = TRANSFORMER_CANDIDATES
        .iter()
        .find_map(|name| source.try_get(name))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "no transformer checkpoint found (tried {})",
                TRANSFORMER_CANDIDATES.join(", ")
            )
        })?;
    let variant = FluxVariant::from_weights(&transformer);
    debug!(?variant, path = %transformer.display(), "transformer checkpoint");

    let image_encoder_weights = load_safetensor_paths(source, "image_encoder").ok();

    Ok(ModelFiles {
        variant,
        transformer_weights: vec![transformer],
        transformer_config: source.try_get("transformer/config.json"),
        vae_weights: vec![source.get("ae.safetensors")?],
        vae_config: source.try_get("vae/config.json"),
        text: TextEncoderFiles {
            clip_weights: load_safetensor_paths(source, "text_encoder")?,
            clip_config: source.try_get("text_encoder/config.json"),
            clip_tokenizer: source.get("tokenizer/tokenizer.json")?,
            t5_weights: load_safetensor_paths(source, "text_encoder_2")?,
            t5_config: source.try_get("text_encoder_2/config.json"),
            t5_tokenizer: source.get("tokenizer_2/tokenizer.json")?,
        },
        scheduler_config: source.try_get("scheduler/scheduler_config.json"),
        ip_adapter_weights: source.try_get("ip_adapter/ip_adapter.safetensors"),
        image_encoder_config: image_encoder_weights
            .as_ref()
            .and_then(|_| source.try_get("image_encoder/config.json")),
        image_encoder_weights,
    })
}

/// Creates a VarBuilder from safetensor weight files.
pub fn load_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> candle_core::Result<VarBuilder<'static>> {
    // Safety: the files are memory-mapped read-only and must not be
    // modified while the model is alive.
    unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device) }
}

/// Parses a precision name as accepted on the command line.
pub fn parse_dtype(name: &str) -> Result<DType, PipelineError> {
    match name {
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "fp16" | "f16" | "float16" | "half" => Ok(DType::F16),
        "fp32" | "f32" | "float32" | "float" => Ok(DType::F32),
        other => Err(PipelineError::config(format!(
            "unknown dtype '{other}', supported: bf16, fp16, fp32"
        ))),
    }
}

/// Picks the requested accelerator, falling back to the CPU when none is
/// compiled in.
pub fn select_device(cpu: bool, ordinal: usize) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Device::new_cuda(ordinal)
    } else if candle_core::utils::metal_is_available() {
        Device::new_metal(ordinal)
    } else {
        Ok(Device::Cpu)
    }
}

/// Builds every pipeline component from resolved files.
pub fn load_components(
    files: &ModelFiles,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<FluxComponents> {
    let mut transformer_cfg = match &files.transformer_config {
        Some(path) => load_json_or(path, files.variant.transformer_config())?,
        None => files.variant.transformer_config(),
    };
    if files.ip_adapter_weights.is_some() && transformer_cfg.ip_adapter.is_none() {
        transformer_cfg.ip_adapter = Some(Default::default());
    }
    transformer_cfg.validate()?;

    let vb = load_weights(&files.transformer_weights, dtype, device)?;
    let ip_vb = match &files.ip_adapter_weights {
        Some(path) => Some(load_weights(std::slice::from_ref(path), dtype, device)?),
        None => None,
    };
    let transformer = FluxTransformer::new(&transformer_cfg, vb, ip_vb)?;
    info!(
        double_blocks = transformer_cfg.depth,
        single_blocks = transformer_cfg.depth_single_blocks,
        guidance_embed = transformer_cfg.guidance_embed,
        ip_adapter = transformer.has_image_adapter(),
        "transformer loaded"
    );

    let text_encoder = FluxTextEncoder::load(&files.text, dtype, device)?;

    let vae_cfg = match &files.vae_config {
        Some(path) => load_json_or(path, VaeConfig::default())?,
        None => VaeConfig::default(),
    };
    let vae = FluxVaeDecoder::new(vae_cfg, load_weights(&files.vae_weights, dtype, device)?)?;

    let image_encoder: Option<Arc<dyn ImageEncoder>> =
        match (&transformer_cfg.ip_adapter, &files.image_encoder_weights) {
            (Some(_), Some(weights)) => {
                let cfg = match &files.image_encoder_config {
                    Some(path) => load_json_or(path, ClipVisionConfig::vit_large_patch14())?,
                    None => ClipVisionConfig::vit_large_patch14(),
                };
                let vb = load_weights(weights, dtype, device)?;
                Some(Arc::new(ClipImageEncoder::new(&cfg, vb)?))
            }
            (Some(_), None) => anyhow::bail!("image adapter weights found without an image_encoder"),
            (None, _) => None,
        };

    let scheduler = match &files.scheduler_config {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => files.variant.scheduler_config(),
    };

    Ok(FluxComponents {
        transformer: Arc::new(transformer),
        text_encoder: Arc::new(text_encoder),
        vae: Arc::new(vae),
        image_encoder,
        scheduler,
    })
}

/// Natural sort key: splits a filename into alternating text/numeric segments
/// so that "model-2-of-10" sorts before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut chars = basename.chars().peekable();
    while let Some(&first) = chars.peek() {
        let digit = first.is_ascii_digit();
        let mut segment = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit() == digit) {
            segment.push(c);
        }
        if digit {
            parts.push(Ok(segment.parse::<u64>().unwrap_or(0)));
        } else {
            parts.push(Err(segment));
        }
    }
    parts
}

/// Single `model.safetensors` or the shards listed by the index.
fn load_safetensor_paths(source: &dyn FileSource, dir: &str) -> anyhow::Result<Vec<PathBuf>> {
    if let Some(path) = source.try_get(&format!("{dir}/model.safetensors")) {
        return Ok(vec![path]);
    }

    let index_path = source.get(&format!("{dir}/model.safetensors.index.json"))?;
    let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("missing weight_map in {}", index_path.display()))?;

    let mut filenames: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    filenames.sort_by_key(|a| natural_sort_key(a));
    filenames.dedup();

    filenames
        .iter()
        .map(|name| source.get(&format!("{dir}/{name}")))
        .collect()
}
