//! The generation worker: reconcile, resolve, denoise, post-process, save.

use std::sync::Arc;
use std::time::Instant;

use candle_core::Tensor;
use image::RgbImage;
use seedalchemy_core::frames;
use seedalchemy_core::metadata;
use seedalchemy_core::registry::{BaseFamily, ModelRegistry};
use seedalchemy_core::request::{is_safe_component, ImageRequest, Preview, ProcessRequest};
use seedalchemy_core::{GenerationError, OutputStore};
use seedalchemy_runtime_api::{ModelLoader, PreviewDecoder, StepControl};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{LoadedPipeline, ModelCache};
use crate::conditioning::{self, Conditioning, ConditioningResolver};
use crate::dispatch::{self, ControlInput, Output, Pass, PassOutput, Start, Window};
use crate::imageops;
use crate::noise::SeededNoise;
use crate::preview;
use crate::session::Session;

/// Detect resolution of stand-alone preprocessor runs.
pub const PROCESS_DETECT_RESOLUTION: u32 = 512;

/// Result of a generation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Collection-relative paths of the saved images.
    pub paths: Vec<String>,
    /// One message per image that failed.
    pub errors: Vec<String>,
}

/// Step counter shared by every pass and stage of a request.
struct Progress<'a> {
    session: Option<&'a Session>,
    generator_id: Option<Uuid>,
    step: u64,
    total: u64,
    preview: Preview,
    preview_size: (u32, u32),
    family: BaseFamily,
    decoder: Option<&'a dyn PreviewDecoder>,
}

impl<'a> Progress<'a> {
    fn percent(&self) -> i32 {
        (self.step * 100 / self.total.max(1)).min(100) as i32
    }

    /// Count one step, honour a pending cancel, and report.
    fn next_step(&mut self) -> Result<(), GenerationError> {
        self.step += 1;
        let Some(session) = self.session else {
            return Ok(());
        };
        if session.take_cancel() {
            info!("Cancel observed at step {} of {}", self.step, self.total);
            return Err(GenerationError::Cancelled);
        }
        session.send_progress(frames::progress(self.generator_id, self.percent()));
        Ok(())
    }

    fn on_step(&mut self, latents: &Tensor) -> StepControl {
        if self.next_step().is_err() {
            return StepControl::Cancel;
        }
        self.send_preview(latents);
        StepControl::Continue
    }

    fn send_preview(&self, latents: &Tensor) {
        let Some(session) = self.session else {
            return;
        };
        let decoder = match self.preview {
            Preview::None => return,
            Preview::Latent => None,
            Preview::TinyVae => self.decoder,
        };
        let rendered = preview::render(latents, self.family, decoder, self.preview_size)
            .and_then(|image| metadata::encode_preview(&image));
        match rendered {
            Ok(png) => session.send_blocking(frames::image(self.generator_id, &png)),
            Err(e) => debug!("Preview failed: {:#}", e),
        }
    }
}

/// An image on its way through the post-stages.
#[derive(Clone)]
enum Item {
    Latents(Tensor),
    Image(RgbImage),
}

/// Everything one request reads while it runs.
struct Job<'a> {
    req: &'a ImageRequest,
    cache: &'a ModelCache,
    store: &'a OutputStore,
    conditioning: &'a Conditioning,
    session: Option<&'a Session>,
}

impl<'a> Job<'a> {
    fn base(&self) -> Result<&'a LoadedPipeline, GenerationError> {
        self.cache
            .base()
            .ok_or_else(|| GenerationError::configuration("No base pipeline loaded"))
    }

    fn refiner(&self) -> Result<&'a LoadedPipeline, GenerationError> {
        self.cache
            .refiner()
            .ok_or_else(|| GenerationError::configuration("No refiner loaded"))
    }

    fn controls(&self) -> Vec<ControlInput<'a>> {
        self.req
            .conditions()
            .iter()
            .zip(self.cache.control_nets())
            .zip(&self.conditioning.control_images)
            .map(|((condition, (_, net)), image)| ControlInput {
                net: net.as_ref(),
                image,
                scale: condition.scale,
                guidance_start: condition.guidance_start,
                guidance_end: condition.guidance_end,
            })
            .collect()
    }

    fn start(item: Item) -> Start {
        match item {
            Item::Latents(latents) => Start::Latents(latents),
            Item::Image(image) => Start::Images(vec![image]),
        }
    }

    fn run_pass(
        &self,
        pipeline: &LoadedPipeline,
        steps: u32,
        pass: Pass<'_>,
        noise: &mut SeededNoise,
        progress: &mut Progress<'_>,
    ) -> Result<PassOutput, GenerationError> {
        let scheduler = pipeline.new_scheduler(steps as usize)?;
        let mut callback = |_: usize, _: f64, latents: &Tensor| progress.on_step(latents);
        dispatch::run(pipeline.pipeline.as_ref(), scheduler, pass, noise, &mut callback)
            .map_err(GenerationError::classify)
    }

    fn images(&self, pipeline: &LoadedPipeline, output: PassOutput) -> Result<Vec<RgbImage>, GenerationError> {
        match output {
            PassOutput::Images(images) => Ok(images),
            PassOutput::Latents(latents) => {
                dispatch::decode(pipeline.pipeline.as_ref(), &latents).map_err(GenerationError::classify)
            }
        }
    }

    /// The batched base pass, plus the refiner when it continues the same
    /// schedule.
    fn base_pass(&self, noise: &mut SeededNoise, progress: &mut Progress<'_>) -> Result<Vec<Item>, GenerationError> {
        let req = self.req;
        let count = req.image_count as usize;
        let base = self.base()?;

        if req.img2img.as_ref().is_some_and(|p| p.noise == 0.0) {
            let Some(source) = &self.conditioning.source else {
                return Err(GenerationError::configuration("img2img requires a source image"));
            };
            debug!("Zero noise, skipping the base pass");
            return Ok(vec![Item::Image(imageops::resize_rgb(source, req.width, req.height)); count]);
        }

        let mut window = match req.strength() {
            Some(strength) => Window::strength(strength),
            None => Window::full(),
        };
        if let Some(end) = req.refiner.as_ref().and_then(|r| r.high_noise_end) {
            window = window.ending_at(end, base.train_timesteps());
        }
        let start = match &self.conditioning.source {
            Some(source) => Start::Images(vec![source.clone()]),
            None => Start::Noise,
        };
        let pass = Pass {
            prompt: &req.prompt,
            negative_prompt: &req.negative_prompt,
            batch: count,
            cfg_scale: req.cfg_scale,
            width: req.width,
            height: req.height,
            start,
            window,
            mask: self.conditioning.mask.as_ref(),
            controls: self.controls(),
            output: if req.refiner.is_some() { Output::Latents } else { Output::Images },
        };
        info!("Base pass: {}", pass.shape(base.family));
        let mut items: Vec<Item> = match self.run_pass(base, req.steps, pass, noise, progress)? {
            PassOutput::Latents(latents) => dispatch::unbatch(&latents)
                .map_err(GenerationError::classify)?
                .into_iter()
                .map(Item::Latents)
                .collect(),
            PassOutput::Images(images) => images.into_iter().map(Item::Image).collect(),
        };

        if let Some(end) = req.refiner.as_ref().and_then(|r| r.high_noise_end) {
            items = self.two_stage_refiner(items, end, noise, progress)?;
        }
        Ok(items)
    }

    fn two_stage_refiner(
        &self,
        items: Vec<Item>,
        end: f64,
        noise: &mut SeededNoise,
        progress: &mut Progress<'_>,
    ) -> Result<Vec<Item>, GenerationError> {
        let req = self.req;
        let Some(params) = &req.refiner else {
            return Ok(items);
        };
        let refiner = self.refiner()?;

        let start = if items.iter().all(|item| matches!(item, Item::Latents(_))) {
            let latents: Vec<Tensor> = items
                .into_iter()
                .filter_map(|item| match item {
                    Item::Latents(latents) => Some(latents),
                    Item::Image(_) => None,
                })
                .collect();
            Start::Latents(Tensor::cat(&latents, 0).map_err(|e| GenerationError::Runtime(e.to_string()))?)
        } else {
            Start::Images(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Item::Image(image) => Some(image),
                        Item::Latents(_) => None,
                    })
                    .collect(),
            )
        };

        let pass = Pass {
            prompt: &req.prompt,
            negative_prompt: &req.negative_prompt,
            batch: req.image_count as usize,
            cfg_scale: params.cfg_scale,
            width: req.width,
            height: req.height,
            start,
            window: Window::starting_at(end, refiner.train_timesteps()).with_strength(req.strength()),
            mask: None,
            controls: Vec::new(),
            output: Output::Images,
        };
        info!("Refiner pass: {}", pass.shape(refiner.family));
        let steps = req.refiner_steps().unwrap_or(req.steps);
        let output = self.run_pass(refiner, steps, pass, noise, progress)?;
        Ok(self.images(refiner, output)?.into_iter().map(Item::Image).collect())
    }

    /// Post-stages and save for one image.
    fn finish(&self, item: Item, noise: &mut SeededNoise, progress: &mut Progress<'_>) -> Result<String, GenerationError> {
        let req = self.req;
        let base = self.base()?;

        // Refiner
        let mut item = item;
        if let Some(params) = req.refiner.as_ref().filter(|r| r.high_noise_end.is_none()) {
            let refiner = self.refiner()?;
            let pass = Pass {
                prompt: &req.prompt,
                negative_prompt: &req.negative_prompt,
                batch: 1,
                cfg_scale: params.cfg_scale,
                width: req.width,
                height: req.height,
                start: Self::start(item),
                window: Window::strength(params.noise.unwrap_or(0.0)),
                mask: None,
                controls: Vec::new(),
                output: Output::Images,
            };
            let steps = req.refiner_steps().unwrap_or(req.steps);
            let output = self.run_pass(refiner, steps, pass, noise, progress)?;
            item = Item::Image(self.single(self.images(refiner, output)?)?);
        }

        let mut image = match item {
            Item::Image(image) => image,
            Item::Latents(latents) => self.single(self.images(base, PassOutput::Latents(latents))?)?,
        };

        // High resolution
        if let Some(high_res) = &req.high_res {
            let (width, height) = req.high_res_size();
            let pass = Pass {
                prompt: &req.prompt,
                negative_prompt: &req.negative_prompt,
                batch: 1,
                cfg_scale: high_res.cfg_scale,
                width,
                height,
                start: Start::Images(vec![imageops::resize_rgb(&image, width, height)]),
                window: Window::strength(high_res.noise),
                mask: self.conditioning.mask.as_ref(),
                controls: self.controls(),
                output: Output::Images,
            };
            debug!("High-res pass: {} at {}x{}", pass.shape(base.family), width, height);
            let output = self.run_pass(base, high_res.steps, pass, noise, progress)?;
            image = self.single(self.images(base, output)?)?;
        }

        // Upscale
        let factor = req.upscale.as_ref().map(|u| u.factor).unwrap_or(1);
        let upscaled = match &req.upscale {
            Some(upscale) => {
                let upscaler = self
                    .cache
                    .upscaler()
                    .ok_or_else(|| GenerationError::resource("Upscaler not loaded"))?;
                let output = upscaler
                    .upscale(&image, upscale.factor)
                    .map_err(|e| GenerationError::classify(e.context("Upscaling")))?;
                let output = blend_onto(&image, output, upscale.blend);
                progress.next_step()?;
                output
            }
            None => image.clone(),
        };

        // Face restoration
        let image = match &req.face {
            Some(face) => {
                let restorer = self
                    .cache
                    .face_restorer()
                    .ok_or_else(|| GenerationError::resource("Face restorer not loaded"))?;
                let restored = restorer
                    .restore(&image, &upscaled, factor)
                    .map_err(|e| GenerationError::classify(e.context("Face restoration")))?;
                let output = blend_onto(&upscaled, restored, face.blend);
                progress.next_step()?;
                output
            }
            None => upscaled,
        };

        // Save
        let path = self.save(&image)?;
        progress.next_step()?;
        Ok(path)
    }

    fn single(&self, images: Vec<RgbImage>) -> Result<RgbImage, GenerationError> {
        images
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::Runtime("Pass returned no image".to_string()))
    }

    fn save(&self, image: &RgbImage) -> Result<String, GenerationError> {
        let req = self.req;
        let metadata = metadata::request_metadata(req).map_err(GenerationError::classify)?;
        let png = metadata::encode_png(image, Some(&metadata)).map_err(GenerationError::classify)?;
        let path = self
            .store
            .write_image(&req.user, &req.collection, &png)
            .map_err(|e| GenerationError::classify(e.context("Saving image")))?;
        info!("Saved {}", path);
        if let Some(session) = self.session {
            session.send_blocking(frames::image(req.generator_id, &png));
        }
        Ok(path)
    }
}

/// `base` resized to `overlay` and mixed with it, or `overlay` alone at full
/// strength.
fn blend_onto(base: &RgbImage, overlay: RgbImage, strength: f64) -> RgbImage {
    if strength >= 1.0 {
        return overlay;
    }
    let base = imageops::resize_rgb(base, overlay.width(), overlay.height());
    imageops::blend(&base, &overlay, strength)
}

/// Owns the model cache and runs one request at a time.
pub struct Worker {
    registry: Arc<ModelRegistry>,
    store: OutputStore,
    cache: ModelCache,
    resolver: ConditioningResolver,
}

impl Worker {
    pub fn new(loader: Arc<dyn ModelLoader>, registry: Arc<ModelRegistry>, store: OutputStore) -> Self {
        Self {
            registry,
            store,
            cache: ModelCache::new(loader),
            resolver: ConditioningResolver::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Run a request to completion. Cancellation yields an empty outcome.
    pub fn generate(&mut self, req: &ImageRequest, session: Option<&Session>) -> Result<Outcome, GenerationError> {
        req.validate(&self.registry)?;

        let started = Instant::now();
        info!(
            "Generating {} image(s) with {} / {} ({} steps, {}x{}, seed {})",
            req.image_count, req.model, req.scheduler, req.steps, req.width, req.height, req.seed
        );

        match self.run(req, session) {
            Ok(outcome) => {
                info!(
                    "Generated {} image(s) in {:.1}s ({} failed)",
                    outcome.paths.len(),
                    started.elapsed().as_secs_f64(),
                    outcome.errors.len()
                );
                Ok(outcome)
            }
            Err(GenerationError::Cancelled) => {
                info!("Generation cancelled after {:.1}s", started.elapsed().as_secs_f64());
                Ok(Outcome::default())
            }
            Err(err) => {
                if matches!(err, GenerationError::Resource(_)) {
                    self.cache.clear();
                }
                error!("Generation failed: {}", err);
                Err(err)
            }
        }
    }

    fn reconcile(&mut self, req: &ImageRequest) -> Result<BaseFamily, GenerationError> {
        let registry = Arc::clone(&self.registry);
        let cache = &mut self.cache;

        cache.ensure_base(&registry, &req.model, req.safety_checker)?;
        cache.ensure_control_nets(&registry, req.conditions())?;
        cache.set_loras(&registry, req.loras())?;
        cache.ensure_refiner(&registry, req.refiner.as_ref())?;
        cache.set_scheduler(&req.scheduler)?;

        let family = match cache.base() {
            Some(base) => base.family,
            None => return Err(GenerationError::configuration("No base pipeline loaded")),
        };

        if req.preview == Preview::TinyVae {
            if let Err(e) = cache.ensure_preview_decoder(family) {
                warn!("Tiny VAE preview unavailable, using latent previews: {}", e);
            }
        } else {
            cache.release_preview_decoder();
        }
        if let Some(upscale) = &req.upscale {
            cache.ensure_upscaler(upscale.denoising)?;
        }
        if req.face.is_some() {
            let factor = req.upscale.as_ref().map(|u| u.factor).unwrap_or(1);
            cache.ensure_face_restorer(factor)?;
        }
        Ok(family)
    }

    fn run(&mut self, req: &ImageRequest, session: Option<&Session>) -> Result<Outcome, GenerationError> {
        // Pipelines
        let family = self.reconcile(req)?;

        // Conditioning
        let conditioning = self.resolver.resolve(self.cache.loader().as_ref(), &self.store, req)?;

        let job = Job {
            req,
            cache: &self.cache,
            store: &self.store,
            conditioning: &conditioning,
            session,
        };
        let mut progress = Progress {
            session,
            generator_id: req.generator_id,
            step: 0,
            total: req.total_steps(),
            preview: req.preview,
            preview_size: req.output_size(),
            family,
            decoder: self.cache.preview_decoder(),
        };
        let mut noise = SeededNoise::new(req.seed);
        let mut outcome = Outcome::default();

        // Generate
        let items = match job.base_pass(&mut noise, &mut progress) {
            Ok(items) => items,
            Err(GenerationError::Runtime(message)) => {
                error!("Base pass failed: {}", message);
                if let Some(session) = session {
                    session.send_blocking(frames::error(req.generator_id, &message));
                }
                outcome.errors.push(message);
                return Ok(outcome);
            }
            Err(err) => return Err(err),
        };

        // Post-process
        for (index, item) in items.into_iter().enumerate() {
            match job.finish(item, &mut noise, &mut progress) {
                Ok(path) => outcome.paths.push(path),
                Err(GenerationError::Runtime(message)) => {
                    error!("Image {} failed: {}", index + 1, message);
                    if let Some(session) = session {
                        session.send_blocking(frames::error(req.generator_id, &message));
                    }
                    outcome.errors.push(message);
                }
                Err(err) => return Err(err),
            }
        }

        debug!("Progress ended at {} of {} steps", progress.step, progress.total);
        Ok(outcome)
    }

    /// Run one preprocessor over a stored image and save the result as a new
    /// image in the requested collection.
    pub fn process(&mut self, req: &ProcessRequest) -> Result<String, GenerationError> {
        if !is_safe_component(&req.user) || !is_safe_component(&req.collection) {
            return Err(GenerationError::configuration(format!(
                "Invalid output location {}/{}",
                req.user, req.collection
            )));
        }
        let image = conditioning::open_image(&self.store, &req.user, &req.source)?;
        let processed = self.resolver.process(
            self.cache.loader().as_ref(),
            &image,
            &req.processor,
            &req.params,
            PROCESS_DETECT_RESOLUTION,
        )?;

        let png = metadata::encode_png(&processed.to_rgb8(), None).map_err(GenerationError::classify)?;
        let path = self
            .store
            .write_image(&req.user, &req.collection, &png)
            .map_err(GenerationError::classify)?;
        info!("Processed {} with {} into {}", req.source, req.processor, path);
        Ok(path)
    }
}
