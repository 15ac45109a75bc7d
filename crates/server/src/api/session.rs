//! Session Coordinator: one active generation per process.
//!
//! `prepare` replaces the active session wholesale (driver and attention
//! recorder together); `advance` runs the next step and renders it for the
//! wire. Heavy work runs on the blocking pool while the session lock is
//! held, so steps never interleave.

use std::sync::Arc;

use fluxstep_core::attention::{aggregate, AttentionRecorder};
use fluxstep_core::pipeline::{
    GenerationRequest, OutputType, SingleStepPipeline, StepImages, MAX_INFERENCE_STEPS,
};
use fluxstep_core::{FluxComponents, PipelineError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::encode::{luma_png_base64, rgb_png_base64};
use super::error::SessionError;
use super::protocol::{PrepareParams, SampleData};

/// Generation settings not carried by client messages.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDefaults {
    pub steps: usize,
    pub guidance_scale: f64,
    pub height: usize,
    pub width: usize,
    pub seed: u64,
    pub capture_attention: bool,
    /// Largest step count a client may ask for.
    pub max_steps: usize,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            steps: 40,
            guidance_scale: 3.5,
            height: 768,
            width: 768,
            seed: 42,
            capture_attention: true,
            max_steps: MAX_INFERENCE_STEPS,
        }
    }
}

struct ActiveSession {
    pipeline: SingleStepPipeline,
    recorder: Option<Arc<AttentionRecorder>>,
    cursor: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepReply {
    Sample(SampleData),
    Done,
}

pub struct SessionCoordinator {
    components: FluxComponents,
    defaults: SessionDefaults,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionCoordinator {
    pub fn new(components: FluxComponents, defaults: SessionDefaults) -> Self {
        Self {
            components,
            defaults,
            active: Mutex::new(None),
        }
    }

    pub fn defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    /// True while a session exists or a step is running.
    pub fn is_active(&self) -> bool {
        match self.active.try_lock() {
            Ok(guard) => guard.is_some(),
            Err(_) => true,
        }
    }

    fn request_for(&self, params: &PrepareParams) -> GenerationRequest {
        GenerationRequest {
            guidance_scale: self.defaults.guidance_scale,
            output_type: OutputType::Rgb,
            ..GenerationRequest::new(params.prompt.as_str())
                .with_steps(params.steps.unwrap_or(self.defaults.steps))
                .with_size(self.defaults.height, self.defaults.width)
                .with_seed(self.defaults.seed)
        }
    }

    /// Builds a fresh driver and recorder and prepares them for `params`.
    /// On failure the previous session stays active.
    pub async fn prepare(&self, params: PrepareParams) -> Result<(), SessionError> {
        let steps = params.steps.unwrap_or(self.defaults.steps);
        if steps > self.defaults.max_steps {
            return Err(PipelineError::validation(format!(
                "`steps` must be at most {}, got {steps}",
                self.defaults.max_steps
            ))
            .into());
        }
        let request = self.request_for(&params);
        let recorder = self.defaults.capture_attention.then(|| {
            Arc::new(AttentionRecorder::for_model(
                self.components.transformer.config(),
            ))
        });
        let mut pipeline = SingleStepPipeline::new(self.components.clone());
        if let Some(recorder) = &recorder {
            pipeline = pipeline.with_attention_hook(recorder.clone());
        }

        let mut active = self.active.lock().await;
        let pipeline = tokio::task::spawn_blocking(move || {
            pipeline.prepare(request)?;
            Ok::<_, PipelineError>(pipeline)
        })
        .await??;

        info!(
            prompt = %params.prompt,
            steps = pipeline.num_steps(),
            replaced = active.is_some(),
            "session ready"
        );
        *active = Some(ActiveSession {
            pipeline,
            recorder,
            cursor: 0,
        });
        Ok(())
    }

    /// Runs the next step. A failed step ends the session.
    pub async fn advance(&self) -> Result<StepReply, SessionError> {
        let mut active = self.active.lock().await;
        let mut session = active.take().ok_or(SessionError::NoSession)?;
        if session.cursor >= session.pipeline.num_steps() {
            debug!(cursor = session.cursor, "session exhausted");
            *active = Some(session);
            return Ok(StepReply::Done);
        }

        let (session, reply) = tokio::task::spawn_blocking(move || {
            let reply = run_step(&mut session);
            (session, reply)
        })
        .await?;

        match reply {
            Ok(reply) => {
                *active = Some(session);
                Ok(reply)
            }
            Err(e) => {
                warn!(error = %e, "step failed, dropping session");
                Err(e)
            }
        }
    }
}

fn run_step(session: &mut ActiveSession) -> Result<StepReply, SessionError> {
    let Some(output) = session.pipeline.take_single_step(session.cursor)? else {
        return Ok(StepReply::Done);
    };
    session.cursor += 1;

    let images = match &output.images {
        StepImages::Rgb(images) => images
            .iter()
            .map(rgb_png_base64)
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            warn!("non-rgb step output is not sent over the socket");
            Vec::new()
        }
    };
    let attn_maps = match &session.recorder {
        Some(recorder) => attention_maps(&session.pipeline, recorder)?,
        None => Vec::new(),
    };
    Ok(StepReply::Sample(SampleData { images, attn_maps }))
}

/// Per-token maps for the pass just run; empty when the captured shapes do
/// not form a square image.
fn attention_maps(
    pipeline: &SingleStepPipeline,
    recorder: &AttentionRecorder,
) -> Result<Vec<String>, SessionError> {
    let Some(session) = pipeline.session() else {
        return Ok(Vec::new());
    };
    let Some(pass) = recorder.drain_pass().map_err(PipelineError::from)? else {
        warn!("no complete attention pass captured");
        return Ok(Vec::new());
    };
    let maps = match aggregate(
        &pass.double,
        &pass.single,
        session.text_len(),
        session.prompt_token_count(),
    ) {
        Ok(maps) => maps,
        Err(PipelineError::Shape(reason)) => {
            warn!(%reason, "skipping attention maps");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    Ok(maps
        .iter()
        .map(|map| luma_png_base64(&map.to_luma8()))
        .collect::<Result<Vec<_>, _>>()?)
}
