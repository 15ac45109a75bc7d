//! The step-wise FLUX driver.
//!
//! `prepare` does all per-generation setup once; `take_single_step` runs
//! exactly one denoising iteration and hands the decoded result back, so
//! the caller controls pacing and can inspect attention between steps.

use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use tracing::{debug, info, info_span, warn};

use super::callback::{CallbackTensors, StepEndCallback};
use super::guidance::apply_true_cfg;
use super::latents::{
    latent_dim, pack_latents, prepare_latent_image_ids, prepare_text_ids, repeat_per_prompt,
    round_down, seeded_noise, unpack_latents,
};
use super::request::{AdapterInput, CallbackTensor, GenerationRequest, OutputType, PromptInput};
use super::session::{GenerationSession, NegativeConditioning};
use crate::attention::AttentionHook;
use crate::error::{PipelineError, Result};
use crate::image_processor;
use crate::model::{AdapterImage, DenoiserInputs, EncodedPrompt, FluxComponents, LatentDecoder};
use crate::scheduler::{linear_sigmas, FlowMatchEulerScheduler};

/// Decoded (or raw) output of one step.
#[derive(Debug, Clone)]
pub enum StepImages {
    /// Packed latents `(B, L_img, C*4)`.
    Latent(Tensor),
    /// `(B, 3, H, W)` f32 in `[0, 1]`.
    Tensor(Tensor),
    Rgb(Vec<RgbImage>),
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    pub step_index: usize,
    pub timestep: f64,
    pub images: StepImages,
}

pub struct SingleStepPipeline {
    components: FluxComponents,
    scheduler: FlowMatchEulerScheduler,
    hook: Option<Arc<dyn AttentionHook>>,
    callback: Option<Arc<dyn StepEndCallback>>,
    preview_decoder: Option<Arc<dyn LatentDecoder>>,
    session: Option<GenerationSession>,
}

impl SingleStepPipeline {
    pub fn new(components: FluxComponents) -> Self {
        let scheduler = FlowMatchEulerScheduler::new(components.scheduler.clone());
        Self {
            components,
            scheduler,
            hook: None,
            callback: None,
            preview_decoder: None,
            session: None,
        }
    }

    /// Attention of the conditional pass is reported to `hook` on every step.
    pub fn with_attention_hook(mut self, hook: Arc<dyn AttentionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_step_end_callback(mut self, callback: Arc<dyn StepEndCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Decodes per-step images with `decoder` (a tiny autoencoder, say)
    /// instead of the full VAE. Latent output is unaffected.
    pub fn with_preview_decoder(mut self, decoder: Arc<dyn LatentDecoder>) -> Self {
        self.preview_decoder = Some(decoder);
        self
    }

    pub fn components(&self) -> &FluxComponents {
        &self.components
    }

    pub fn session(&self) -> Option<&GenerationSession> {
        self.session.as_ref()
    }

    /// Steps in the prepared schedule, 0 before `prepare`.
    pub fn num_steps(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.num_steps())
    }

    /// Timestep of the step in flight, `None` between steps.
    pub fn current_timestep(&self) -> Option<f64> {
        self.session.as_ref().and_then(|s| s.current_timestep)
    }

    pub fn token_counts(&self) -> &[usize] {
        self.session.as_ref().map_or(&[], |s| s.token_counts())
    }

    pub fn text_len(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.text_len())
    }

    fn device(&self) -> &Device {
        self.components.transformer.device()
    }

    fn dtype(&self) -> DType {
        self.components.transformer.dtype()
    }

    fn vae_scale_factor(&self) -> usize {
        self.components.vae.config().vae_scale_factor()
    }

    /// Builds a fresh session for `request`, replacing any previous one.
    ///
    /// A rejected request leaves the previous session in place.
    pub fn prepare(&mut self, request: GenerationRequest) -> Result<()> {
        let span = info_span!("prepare", steps = request.num_inference_steps);
        let _enter = span.enter();
        let start = Instant::now();

        request.validate()?;
        let callback_tensors = request.callback_tensors()?;
        let (height, width) = self.resolve_size(&request)?;

        let num_images = request.num_images_per_prompt;
        let prompt_batch = request.prompt_batch_size()?;
        let batch_size = prompt_batch * num_images;
        let do_true_cfg = request.wants_true_cfg();
        if !do_true_cfg
            && (request.negative_prompt.is_some() || request.negative_prompt_embeds.is_some())
        {
            debug!(
                true_cfg_scale = request.true_cfg_scale,
                "negative conditioning ignored without true CFG"
            );
        }

        let positive = self.encode_side(
            request.prompt.as_ref(),
            request.prompt_2.as_ref(),
            request.prompt_embeds.as_ref(),
            request.pooled_prompt_embeds.as_ref(),
            request.max_sequence_length,
            num_images,
        )?;
        let negative = if do_true_cfg {
            let encoded = self.encode_side(
                request.negative_prompt.as_ref(),
                request.negative_prompt_2.as_ref(),
                request.negative_prompt_embeds.as_ref(),
                request.negative_pooled_prompt_embeds.as_ref(),
                request.max_sequence_length,
                num_images,
            )?;
            if encoded.prompt_embeds.dim(0)? != batch_size {
                return Err(PipelineError::validation(format!(
                    "negative prompts give {} rows, expected {batch_size}",
                    encoded.prompt_embeds.dim(0)?
                )));
            }
            Some(encoded)
        } else {
            None
        };
        let text_len = positive.prompt_embeds.dim(1)?;
        if let Some(neg) = &negative {
            if neg.prompt_embeds.dim(1)? != text_len {
                return Err(PipelineError::validation(format!(
                    "negative text length {} differs from positive {text_len}",
                    neg.prompt_embeds.dim(1)?
                )));
            }
        }

        let latents = self.prepare_latents(&request, batch_size, height, width)?;
        let vsf = self.vae_scale_factor();
        let latent_image_ids = prepare_latent_image_ids(
            latent_dim(height, vsf) / 2,
            latent_dim(width, vsf) / 2,
            self.device(),
        )?;
        let text_ids = prepare_text_ids(text_len, self.device())?;

        let sigmas = request
            .sigmas
            .clone()
            .unwrap_or_else(|| linear_sigmas(request.num_inference_steps));
        let image_seq_len = latents.dim(1)?;
        let mu = if self.scheduler.config().use_dynamic_shifting {
            Some(self.scheduler.calculate_mu(image_seq_len)?)
        } else {
            None
        };
        let schedule = self.scheduler.set_timesteps(&sigmas, mu)?;

        let guidance = if self.components.transformer.config().guidance_embed {
            Some(Tensor::full(
                request.guidance_scale as f32,
                batch_size,
                self.device(),
            )?)
        } else {
            None
        };

        let (image_embeds, negative_image_embeds) =
            self.prepare_adapter_embeds(&request, prompt_batch, batch_size, height, width)?;

        info!(
            batch_size,
            height,
            width,
            text_len,
            image_seq_len,
            steps = schedule.len(),
            mu = ?mu,
            true_cfg = do_true_cfg,
            adapter = image_embeds.is_some(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "session prepared"
        );

        self.session = Some(GenerationSession {
            prompt_embeds: positive.prompt_embeds,
            pooled_prompt_embeds: positive.pooled_prompt_embeds,
            negative: negative.map(|neg| NegativeConditioning {
                prompt_embeds: neg.prompt_embeds,
                pooled_prompt_embeds: neg.pooled_prompt_embeds,
                image_embeds: negative_image_embeds,
                true_cfg_scale: request.true_cfg_scale,
            }),
            text_ids,
            latent_image_ids,
            latents,
            schedule,
            guidance,
            image_embeds,
            height,
            width,
            output_type: request.output_type,
            callback_tensors,
            token_counts: positive.token_counts,
            last_step: None,
            current_timestep: None,
        });
        Ok(())
    }

    fn resolve_size(&self, request: &GenerationRequest) -> Result<(usize, usize)> {
        let default = self.components.vae.config().default_resolution();
        let multiple = self.vae_scale_factor() * 2;
        let mut dims = [
            ("height", request.height.unwrap_or(default)),
            ("width", request.width.unwrap_or(default)),
        ];
        for (name, dim) in dims.iter_mut() {
            let adjusted = round_down(*dim, multiple);
            if adjusted == 0 {
                return Err(PipelineError::validation(format!(
                    "{name} {dim} is smaller than the minimum of {multiple}"
                )));
            }
            if adjusted != *dim {
                warn!(
                    "{name} {dim} is not divisible by {multiple}, using {adjusted} instead"
                );
                *dim = adjusted;
            }
        }
        Ok((dims[0].1, dims[1].1))
    }

    fn encode_side(
        &self,
        prompt: Option<&PromptInput>,
        prompt_2: Option<&PromptInput>,
        prompt_embeds: Option<&Tensor>,
        pooled_prompt_embeds: Option<&Tensor>,
        max_sequence_length: usize,
        num_images: usize,
    ) -> Result<EncodedPrompt> {
        let encoded = match (prompt, prompt_embeds, pooled_prompt_embeds) {
            (Some(prompt), _, _) => {
                let prompts = prompt.to_vec();
                let prompts_2 = prompt_2.map_or_else(|| prompts.clone(), |p| p.to_vec());
                self.components
                    .text_encoder
                    .encode(&prompts, &prompts_2, max_sequence_length)?
            }
            (None, Some(embeds), Some(pooled)) => {
                let (batch, seq_len, _) = embeds.dims3()?;
                if pooled.dim(0)? != batch {
                    return Err(PipelineError::validation(format!(
                        "pooled embeddings have {} rows, prompt embeddings {batch}",
                        pooled.dim(0)?
                    )));
                }
                EncodedPrompt {
                    prompt_embeds: embeds.clone(),
                    pooled_prompt_embeds: pooled.clone(),
                    token_counts: vec![seq_len; batch],
                }
            }
            _ => {
                return Err(PipelineError::validation(
                    "a prompt or a pair of prompt embeddings is required",
                ))
            }
        };

        let (device, dtype) = (self.device(), self.dtype());
        Ok(EncodedPrompt {
            prompt_embeds: repeat_per_prompt(&encoded.prompt_embeds, num_images)?
                .to_device(device)?
                .to_dtype(dtype)?,
            pooled_prompt_embeds: repeat_per_prompt(&encoded.pooled_prompt_embeds, num_images)?
                .to_device(device)?
                .to_dtype(dtype)?,
            token_counts: encoded
                .token_counts
                .iter()
                .flat_map(|&n| std::iter::repeat(n).take(num_images))
                .collect(),
        })
    }

    fn prepare_latents(
        &self,
        request: &GenerationRequest,
        batch_size: usize,
        height: usize,
        width: usize,
    ) -> Result<Tensor> {
        let vsf = self.vae_scale_factor();
        let channels = self.components.transformer.config().latent_channels();
        let (h, w) = (latent_dim(height, vsf), latent_dim(width, vsf));
        let expected = [batch_size, (h / 2) * (w / 2), channels * 4];

        if let Some(latents) = &request.latents {
            if latents.dims() != expected {
                return Err(PipelineError::validation(format!(
                    "latents shape {:?} does not match expected {expected:?}",
                    latents.dims()
                )));
            }
            return Ok(latents.to_device(self.device())?.to_dtype(self.dtype())?);
        }

        let seed = request.seed.unwrap_or_else(rand::random);
        debug!(seed, "sampling initial noise");
        let noise = seeded_noise((batch_size, channels, h, w), seed, self.dtype(), self.device())?;
        Ok(pack_latents(&noise)?)
    }

    /// Embeddings for both adapter sides. When only one side is given the
    /// other is conditioned on a black image.
    fn prepare_adapter_embeds(
        &self,
        request: &GenerationRequest,
        prompt_batch: usize,
        batch_size: usize,
        height: usize,
        width: usize,
    ) -> Result<(Option<Tensor>, Option<Tensor>)> {
        let (positive, negative) = match (&request.ip_adapter, &request.negative_ip_adapter) {
            (None, None) => return Ok((None, None)),
            (Some(pos), Some(neg)) => (pos.clone(), neg.clone()),
            (Some(pos), None) => {
                let zero = zero_adapter_image(pos, height, width);
                (pos.clone(), AdapterInput::Images(vec![zero]))
            }
            (None, Some(neg)) => {
                let zero = zero_adapter_image(neg, height, width);
                (AdapterInput::Images(vec![zero]), neg.clone())
            }
        };
        if self.components.transformer.config().ip_adapter.is_none() {
            return Err(PipelineError::config(
                "image adapter input given but the transformer has no adapter loaded",
            ));
        }
        let positive = self.adapter_embeds(&positive, prompt_batch, batch_size)?;
        let negative = self.adapter_embeds(&negative, prompt_batch, batch_size)?;
        Ok((Some(positive), Some(negative)))
    }

    fn adapter_embeds(
        &self,
        input: &AdapterInput,
        prompt_batch: usize,
        batch_size: usize,
    ) -> Result<Tensor> {
        let embeds = match input {
            AdapterInput::Embeds(embeds) => embeds.clone(),
            AdapterInput::Images(images) => {
                let encoder = self.components.image_encoder.as_ref().ok_or_else(|| {
                    PipelineError::config("adapter images given but no image encoder is loaded")
                })?;
                encoder.encode(images)?
            }
        };
        let rows = embeds.dim(0)?;
        let embeds = if rows == batch_size {
            embeds
        } else if rows == 1 {
            embeds.repeat((batch_size, 1))?
        } else if rows == prompt_batch {
            repeat_per_prompt(&embeds, batch_size / prompt_batch)?
        } else {
            return Err(PipelineError::validation(format!(
                "{rows} adapter embeddings for a batch of {batch_size}"
            )));
        };
        Ok(embeds.to_device(self.device())?.to_dtype(self.dtype())?)
    }

    /// Runs denoising step `step_index` and returns its output, or `None`
    /// once the schedule is exhausted or nothing has been prepared.
    ///
    /// The caller owns the cursor: the index is trusted, and re-running an
    /// index applies that step again to the current latents.
    pub fn take_single_step(&mut self, step_index: usize) -> Result<Option<StepOutput>> {
        let Some(session) = self.session.as_mut() else {
            debug!(step_index, "no prepared session");
            return Ok(None);
        };
        if step_index >= session.schedule.len() {
            debug!(step_index, steps = session.schedule.len(), "schedule exhausted");
            return Ok(None);
        }
        let expected = session.last_step.map_or(0, |s| s + 1);
        if step_index != expected {
            warn!(step_index, expected, "step index out of order");
        }

        let span = info_span!("step", step_index);
        let _enter = span.enter();
        let start = Instant::now();

        let t = session.schedule.timesteps[step_index];
        session.current_timestep = Some(t);
        let batch = session.latents.dim(0)?;
        let latents_dtype = session.latents.dtype();
        let device = self.components.transformer.device();
        let timestep =
            Tensor::full((t / 1000.0) as f32, batch, device)?.to_dtype(latents_dtype)?;

        let transformer = &self.components.transformer;
        let noise_pred = transformer.forward(
            &DenoiserInputs {
                latents: &session.latents,
                img_ids: &session.latent_image_ids,
                txt: &session.prompt_embeds,
                txt_ids: &session.text_ids,
                timesteps: &timestep,
                pooled: &session.pooled_prompt_embeds,
                guidance: session.guidance.as_ref(),
                adapter_embeds: session.image_embeds.as_ref(),
            },
            self.hook.as_deref(),
        )?;
        let noise_pred = match &session.negative {
            Some(negative) => {
                let neg_pred = transformer.forward(
                    &DenoiserInputs {
                        latents: &session.latents,
                        img_ids: &session.latent_image_ids,
                        txt: &negative.prompt_embeds,
                        txt_ids: &session.text_ids,
                        timesteps: &timestep,
                        pooled: &negative.pooled_prompt_embeds,
                        guidance: session.guidance.as_ref(),
                        adapter_embeds: negative.image_embeds.as_ref(),
                    },
                    None,
                )?;
                apply_true_cfg(&noise_pred, &neg_pred, negative.true_cfg_scale)?
            }
            None => noise_pred,
        };
        let forward_ms = start.elapsed().as_millis() as u64;

        let mut latents = self
            .scheduler
            .step(&session.schedule, step_index, &noise_pred, &session.latents)?;
        if latents.dtype() != latents_dtype {
            latents = latents.to_dtype(latents_dtype)?;
        }
        session.latents = latents;

        if let Some(callback) = &self.callback {
            let mut tensors = CallbackTensors::new();
            for name in &session.callback_tensors {
                let tensor = match name {
                    CallbackTensor::Latents => session.latents.clone(),
                    CallbackTensor::PromptEmbeds => session.prompt_embeds.clone(),
                };
                tensors.insert(*name, tensor);
            }
            let mut returned = callback.on_step_end(step_index, t, tensors)?;
            if let Some(latents) = returned.remove(&CallbackTensor::Latents) {
                if latents.dims() != session.latents.dims() {
                    return Err(PipelineError::Callback(format!(
                        "returned latents {:?}, session latents are {:?}",
                        latents.dims(),
                        session.latents.dims()
                    )));
                }
                session.latents = latents;
            }
            if let Some(embeds) = returned.remove(&CallbackTensor::PromptEmbeds) {
                if embeds.dims() != session.prompt_embeds.dims() {
                    return Err(PipelineError::Callback(format!(
                        "returned prompt_embeds {:?}, session prompt_embeds are {:?}",
                        embeds.dims(),
                        session.prompt_embeds.dims()
                    )));
                }
                session.prompt_embeds = embeds;
            }
        }

        let decoder = self
            .preview_decoder
            .as_deref()
            .unwrap_or(self.components.vae.as_ref());
        let images = decode(decoder, session)?;
        session.current_timestep = None;
        session.last_step = Some(step_index);

        info!(
            timestep = t,
            forward_ms,
            total_ms = start.elapsed().as_millis() as u64,
            "step complete"
        );
        Ok(Some(StepOutput {
            step_index,
            timestep: t,
            images,
        }))
    }
}

fn decode(vae: &dyn LatentDecoder, session: &GenerationSession) -> Result<StepImages> {
    if session.output_type == OutputType::Latent {
        return Ok(StepImages::Latent(session.latents.clone()));
    }
    let cfg = vae.config();
    let latents = unpack_latents(
        &session.latents,
        session.height,
        session.width,
        cfg.vae_scale_factor(),
    )?;
    let latents = ((latents / cfg.scaling_factor)? + cfg.shift_factor)?;
    let decoded = vae.decode(&latents)?;
    let pixels = image_processor::denormalize(&decoded)?;
    Ok(match session.output_type {
        OutputType::Tensor => StepImages::Tensor(pixels),
        _ => StepImages::Rgb(image_processor::to_rgb8(&pixels)?),
    })
}

/// Black image matching the supplied adapter image, or the output size when
/// only embeddings were given.
fn zero_adapter_image(given: &AdapterInput, height: usize, width: usize) -> AdapterImage {
    let (w, h) = given
        .placeholder_size()
        .unwrap_or((width as u32, height as u32));
    AdapterImage::new(w, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::{AttentionRecorder, BlockFamily};
    use crate::testing::{tiny_vae_config, MockComponents, MockDecoder};

    fn request(prompt: &str, steps: usize) -> GenerationRequest {
        GenerationRequest::new(prompt)
            .with_steps(steps)
            .with_size(64, 64)
            .with_seed(7)
    }

    #[test]
    fn steps_then_exhaustion() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        assert!(pipe.take_single_step(0).unwrap().is_none());

        pipe.prepare(request("a red fox", 3)).unwrap();
        assert_eq!(pipe.num_steps(), 3);
        for i in 0..3 {
            let out = pipe.take_single_step(i).unwrap().unwrap();
            assert_eq!(out.step_index, i);
            assert!(matches!(out.images, StepImages::Rgb(ref imgs) if imgs.len() == 1));
            assert!(pipe.current_timestep().is_none());
        }
        assert!(pipe.take_single_step(3).unwrap().is_none());
        assert_eq!(mocks.vae.decodes(), 3);
        assert_eq!(mocks.transformer.calls().len(), 3);
    }

    #[test]
    fn session_shapes_follow_request() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        let mut req = request("a red fox", 2);
        req.num_images_per_prompt = 2;
        pipe.prepare(req).unwrap();

        let session = pipe.session().unwrap();
        assert_eq!(session.latents().dims(), &[2, 16, 16]);
        assert_eq!(session.latent_image_ids().dims(), &[16, 3]);
        assert_eq!(session.text_ids().dims(), &[6, 3]);
        assert_eq!(session.guidance().unwrap().dims(), &[2]);
        assert_eq!(session.token_counts(), &[3, 3]);
        assert_eq!(session.sigmas().len(), 3);
        assert_eq!(*session.sigmas().last().unwrap(), 0.0);
        assert!(!session.do_true_cfg());
    }

    #[test]
    fn odd_sizes_round_down() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        pipe.prepare(request("a red fox", 1).with_size(70, 100)).unwrap();
        let session = pipe.session().unwrap();
        assert_eq!((session.height(), session.width()), (64, 96));
        assert_eq!(session.latents().dim(1).unwrap(), 4 * 6);

        let err = pipe.prepare(request("a red fox", 1).with_size(8, 64));
        assert!(matches!(err, Err(PipelineError::Validation(_))));
    }

    #[test]
    fn default_size_is_vae_resolution() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        pipe.prepare(GenerationRequest::new("a red fox").with_steps(1)).unwrap();
        let session = pipe.session().unwrap();
        assert_eq!((session.height(), session.width()), (64, 64));
    }

    #[test]
    fn same_seed_same_latents() {
        let mocks = MockComponents::tiny();
        let mut a = SingleStepPipeline::new(mocks.components.clone());
        let mut b = SingleStepPipeline::new(mocks.components.clone());
        a.prepare(request("a red fox", 2)).unwrap();
        b.prepare(request("a red fox", 2)).unwrap();
        let la: Vec<f32> = a.session().unwrap().latents().flatten_all().unwrap().to_vec1().unwrap();
        let lb: Vec<f32> = b.session().unwrap().latents().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(la, lb);
    }

    #[test]
    fn rejected_request_keeps_previous_session() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        pipe.prepare(request("a red fox", 2)).unwrap();
        let bad = GenerationRequest {
            max_sequence_length: 1024,
            ..request("a cat", 5)
        };
        assert!(pipe.prepare(bad).unwrap_err().is_rejection());
        assert_eq!(pipe.num_steps(), 2);
    }

    #[test]
    fn prompt_2_feeds_sequence_encoder() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        let mut req = request("a red fox", 1);
        req.prompt_2 = Some("a red fox in the snow, watercolor".into());
        pipe.prepare(req).unwrap();
        let calls = mocks.text_encoder.calls();
        assert_eq!(calls[0].0, vec!["a red fox".to_string()]);
        assert_eq!(calls[0].1, vec!["a red fox in the snow, watercolor".to_string()]);
    }

    #[test]
    fn negative_prompt_needs_true_cfg() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        let mut req = request("a red fox", 1);
        req.negative_prompt = Some("blurry".into());
        pipe.prepare(req.clone()).unwrap();
        assert!(!pipe.session().unwrap().do_true_cfg());
        assert_eq!(mocks.text_encoder.calls().len(), 1);

        req.true_cfg_scale = 2.0;
        pipe.prepare(req).unwrap();
        assert!(pipe.session().unwrap().do_true_cfg());
        pipe.take_single_step(0).unwrap().unwrap();
        assert_eq!(mocks.text_encoder.calls().len(), 3);
        assert_eq!(mocks.transformer.calls().len(), 2);
    }

    #[test]
    fn true_cfg_combines_predictions() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        let mut req = request("a red fox", 2);
        req.negative_prompt = Some("blurry".into());
        req.true_cfg_scale = 3.0;
        req.output_type = OutputType::Latent;
        pipe.prepare(req).unwrap();

        let before = pipe.session().unwrap().latents().clone();
        let sigmas = pipe.session().unwrap().sigmas().to_vec();
        let out = pipe.take_single_step(0).unwrap().unwrap();
        let StepImages::Latent(after) = out.images else {
            panic!("expected latents");
        };

        let pos = crate::testing::MockPromptEncoder::fill_for("a red fox") as f64;
        let neg = crate::testing::MockPromptEncoder::fill_for("blurry") as f64;
        let velocity = neg + 3.0 * (pos - neg);
        let dt = sigmas[1] - sigmas[0];
        let expected = (before + velocity * dt).unwrap();
        let diff = (after - expected)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "diff {diff}");
    }

    #[test]
    fn hook_sees_only_conditional_pass() {
        let mocks = MockComponents::tiny();
        let recorder = Arc::new(AttentionRecorder::for_model(
            mocks.components.transformer.config(),
        ));
        let mut pipe =
            SingleStepPipeline::new(mocks.components.clone()).with_attention_hook(recorder.clone());
        let mut req = request("a red fox", 2);
        req.negative_prompt = Some("blurry".into());
        req.true_cfg_scale = 2.0;
        pipe.prepare(req).unwrap();
        pipe.take_single_step(0).unwrap();

        let calls = mocks.transformer.calls();
        assert_eq!(calls.iter().filter(|c| c.hooked).count(), 1);
        assert_eq!(recorder.len(BlockFamily::DoubleStream), 2);
        assert_eq!(recorder.len(BlockFamily::SingleStream), 3);
    }

    #[test]
    fn callback_can_replace_latents() {
        let mocks = MockComponents::tiny();
        let callback = |_step: usize, _t: f64, mut tensors: CallbackTensors| -> Result<CallbackTensors> {
            let latents = tensors.remove(&CallbackTensor::Latents).unwrap();
            tensors.insert(CallbackTensor::Latents, latents.zeros_like()?);
            Ok(tensors)
        };
        let mut pipe = SingleStepPipeline::new(mocks.components.clone())
            .with_step_end_callback(Arc::new(callback));
        let mut req = request("a red fox", 2);
        req.output_type = OutputType::Latent;
        pipe.prepare(req).unwrap();
        pipe.take_single_step(0).unwrap();
        let max = pipe
            .session()
            .unwrap()
            .latents()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(max, 0.0);
    }

    #[test]
    fn callback_prompt_embeds_must_keep_shape() {
        let mocks = MockComponents::tiny();
        let callback = |_step: usize, _t: f64, mut tensors: CallbackTensors| -> Result<CallbackTensors> {
            let embeds = tensors.remove(&CallbackTensor::PromptEmbeds).unwrap();
            tensors.insert(CallbackTensor::PromptEmbeds, embeds.narrow(1, 0, 5)?);
            Ok(tensors)
        };
        let mut pipe = SingleStepPipeline::new(mocks.components.clone())
            .with_step_end_callback(Arc::new(callback));
        let mut req = request("a red fox", 2);
        req.callback_tensor_inputs = vec!["latents".into(), "prompt_embeds".into()];
        pipe.prepare(req).unwrap();

        let err = pipe.take_single_step(0).unwrap_err();
        assert!(matches!(err, PipelineError::Callback(_)));
        assert!(err.to_string().contains("prompt_embeds"));
        assert_eq!(pipe.session().unwrap().prompt_embeds().dims(), &[1, 6, 12]);
    }

    #[test]
    fn zero_row_prompt_embeds_are_rejected() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        let req = GenerationRequest {
            prompt: None,
            prompt_embeds: Some(Tensor::zeros((0, 6, 12), DType::F32, &Device::Cpu).unwrap()),
            pooled_prompt_embeds: Some(Tensor::zeros((0, 8), DType::F32, &Device::Cpu).unwrap()),
            ..request("a red fox", 1)
        };
        assert!(matches!(pipe.prepare(req), Err(PipelineError::Validation(_))));
        assert!(pipe.session().is_none());
        assert!(pipe.take_single_step(0).unwrap().is_none());
    }

    #[test]
    fn tensor_output_is_unit_range() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        let mut req = request("a red fox", 1);
        req.output_type = OutputType::Tensor;
        pipe.prepare(req).unwrap();
        let out = pipe.take_single_step(0).unwrap().unwrap();
        let StepImages::Tensor(pixels) = out.images else {
            panic!("expected tensor output");
        };
        assert_eq!(pixels.dims(), &[1, 3, 64, 64]);
        let values: Vec<f32> = pixels.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn preview_decoder_replaces_vae_for_step_images() {
        let mocks = MockComponents::tiny();
        let preview = Arc::new(MockDecoder::new(tiny_vae_config()));
        let mut pipe = SingleStepPipeline::new(mocks.components.clone())
            .with_preview_decoder(preview.clone());
        pipe.prepare(request("a red fox", 2)).unwrap();
        let out = pipe.take_single_step(0).unwrap().unwrap();
        assert!(matches!(out.images, StepImages::Rgb(ref imgs) if imgs.len() == 1));
        assert_eq!(preview.decodes(), 1);
        assert_eq!(mocks.vae.decodes(), 0);
    }

    #[test]
    fn precomputed_latents_are_checked() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        let mut req = request("a red fox", 1);
        req.latents = Some(Tensor::zeros((1, 16, 16), DType::F32, &Device::Cpu).unwrap());
        pipe.prepare(req.clone()).unwrap();

        req.latents = Some(Tensor::zeros((1, 15, 16), DType::F32, &Device::Cpu).unwrap());
        assert!(pipe.prepare(req).is_err());
    }

    #[test]
    fn adapter_input_without_adapter_is_config_error() {
        let mocks = MockComponents::tiny();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        let mut req = request("a red fox", 1);
        req.ip_adapter = Some(AdapterInput::Images(vec![AdapterImage::new(32, 32)]));
        assert!(matches!(pipe.prepare(req), Err(PipelineError::Config(_))));
    }

    #[test]
    fn positive_adapter_image_gets_black_negative() {
        let mocks = MockComponents::tiny_with_adapter();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        let mut req = request("a red fox", 1);
        req.ip_adapter = Some(AdapterInput::Images(vec![AdapterImage::from_pixel(
            40,
            24,
            image::Rgb([255, 255, 255]),
        )]));
        req.negative_prompt = Some("blurry".into());
        req.true_cfg_scale = 2.0;
        pipe.prepare(req).unwrap();

        assert_eq!(mocks.image_encoder.seen_sizes(), vec![(40, 24), (40, 24)]);
        pipe.take_single_step(0).unwrap();
        let fills: Vec<Option<f32>> =
            mocks.transformer.calls().iter().map(|c| c.adapter_fill).collect();
        assert_eq!(fills, vec![Some(1.0), Some(0.0)]);
    }

    #[test]
    fn negative_embeds_only_get_black_positive_of_output_size() {
        let mocks = MockComponents::tiny_with_adapter();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        let mut req = request("a red fox", 1).with_size(48, 64);
        req.negative_ip_adapter = Some(AdapterInput::Embeds(
            Tensor::ones((1, 6), DType::F32, &Device::Cpu).unwrap(),
        ));
        pipe.prepare(req).unwrap();
        assert_eq!(mocks.image_encoder.seen_sizes(), vec![(64, 48)]);
        let session = pipe.session().unwrap();
        assert_eq!(session.image_embeds().unwrap().dims(), &[1, 6]);
    }

    #[test]
    fn negative_adapter_image_gets_black_positive() {
        let mocks = MockComponents::tiny_with_adapter();
        let mut pipe = SingleStepPipeline::new(mocks.components.clone());
        let mut req = request("a red fox", 1);
        req.negative_ip_adapter = Some(AdapterInput::Images(vec![AdapterImage::from_pixel(
            40,
            24,
            image::Rgb([255, 255, 255]),
        )]));
        req.negative_prompt = Some("blurry".into());
        req.true_cfg_scale = 2.0;
        pipe.prepare(req).unwrap();

        assert_eq!(mocks.image_encoder.seen_sizes(), vec![(40, 24), (40, 24)]);
        pipe.take_single_step(0).unwrap();
        let fills: Vec<Option<f32>> =
            mocks.transformer.calls().iter().map(|c| c.adapter_fill).collect();
        assert_eq!(fills, vec![Some(0.0), Some(1.0)]);
    }
}
