//! Warm models kept across requests.
//!
//! The cache owns at most one base pipeline and one refiner, the ControlNets
//! of the last request, and the auxiliary networks used by post-stages. Each
//! request reconciles it before any work starts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use seedalchemy_core::registry::{BaseFamily, ModelKind, ModelRegistry};
use seedalchemy_core::request::{ControlNetCondition, LoraEntry, RefinerParams};
use seedalchemy_core::schedulers::{self as scheduler_registry, SchedulerSpec};
use seedalchemy_core::GenerationError;
use seedalchemy_runtime_api::{
    ControlNet, FaceRestorer, LoadOptions, ModelLoader, PatchTarget, PipelineModel, PreviewDecoder, Upscaler,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::lora::{self, LoraFile};
use crate::schedulers::{self, Scheduler};

/// A loaded checkpoint together with the state reconciled onto it.
pub struct LoadedPipeline {
    pub model_id: String,
    pub family: BaseFamily,
    pub safety_checker: bool,
    pub pipeline: Box<dyn PipelineModel>,
    /// Taken once at load; every scheduler is built from it.
    scheduler_snapshot: Value,
    scheduler: Option<SchedulerSpec>,
    applied_loras: Vec<(String, f64)>,
    patched: HashSet<PatchTarget>,
}

impl LoadedPipeline {
    fn new(model_id: &str, family: BaseFamily, safety_checker: bool, pipeline: Box<dyn PipelineModel>) -> Self {
        let scheduler_snapshot = pipeline.scheduler_config();
        Self {
            model_id: model_id.to_string(),
            family,
            safety_checker,
            pipeline,
            scheduler_snapshot,
            scheduler: None,
            applied_loras: Vec::new(),
            patched: HashSet::new(),
        }
    }

    pub fn scheduler_snapshot(&self) -> &Value {
        &self.scheduler_snapshot
    }

    pub fn applied_loras(&self) -> &[(String, f64)] {
        &self.applied_loras
    }

    /// Length of the training noise schedule.
    pub fn train_timesteps(&self) -> usize {
        self.scheduler_snapshot
            .get("num_train_timesteps")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(1000)
    }

    pub fn scheduler_id(&self) -> Option<&str> {
        self.scheduler.as_ref().map(|s| s.id)
    }

    /// Fresh scheduler instance for a pass of `steps` steps.
    pub fn new_scheduler(&self, steps: usize) -> Result<Box<dyn Scheduler>, GenerationError> {
        let Some(spec) = &self.scheduler else {
            return Err(GenerationError::configuration("No scheduler selected"));
        };
        schedulers::build(spec, &self.scheduler_snapshot, steps)
            .map_err(|e| GenerationError::configuration(format!("Scheduler {}: {e:#}", spec.id)))
    }

    fn set_scheduler(&mut self, id: &str) -> Result<(), GenerationError> {
        match scheduler_registry::lookup(id) {
            Some(spec) => {
                self.scheduler = Some(spec);
                Ok(())
            }
            None => Err(GenerationError::configuration(format!("Unknown scheduler: {id}"))),
        }
    }

    /// Put the base weights back into every patched group.
    fn restore(&mut self) -> anyhow::Result<()> {
        for target in std::mem::take(&mut self.patched) {
            self.pipeline.apply_deltas(target, HashMap::new())?;
        }
        self.applied_loras.clear();
        Ok(())
    }
}

pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    base: Option<LoadedPipeline>,
    refiner: Option<LoadedPipeline>,
    /// One entry per request condition, in request order.
    control_nets: Vec<(String, Arc<dyn ControlNet>)>,
    preview: Option<(BaseFamily, Box<dyn PreviewDecoder>)>,
    upscaler: Option<(u64, Box<dyn Upscaler>)>,
    face_restorer: Option<(u32, Box<dyn FaceRestorer>)>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            base: None,
            refiner: None,
            control_nets: Vec::new(),
            preview: None,
            upscaler: None,
            face_restorer: None,
        }
    }

    pub fn loader(&self) -> &Arc<dyn ModelLoader> {
        &self.loader
    }

    pub fn base(&self) -> Option<&LoadedPipeline> {
        self.base.as_ref()
    }

    pub fn refiner(&self) -> Option<&LoadedPipeline> {
        self.refiner.as_ref()
    }

    pub fn control_nets(&self) -> &[(String, Arc<dyn ControlNet>)] {
        &self.control_nets
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_none()
            && self.refiner.is_none()
            && self.control_nets.is_empty()
            && self.preview.is_none()
            && self.upscaler.is_none()
            && self.face_restorer.is_none()
    }

    /// Drop everything so the next request starts from nothing.
    pub fn clear(&mut self) {
        if !self.is_empty() {
            info!("Clearing model cache");
        }
        self.base = None;
        self.refiner = None;
        self.control_nets.clear();
        self.preview = None;
        self.upscaler = None;
        self.face_restorer = None;
    }

    /// Make `model_id` the loaded base pipeline, reusing the current one when
    /// the model and safety checker match.
    pub fn ensure_base(
        &mut self,
        registry: &ModelRegistry,
        model_id: &str,
        safety_checker: bool,
    ) -> Result<(), GenerationError> {
        if let Some(base) = &self.base {
            if base.model_id == model_id && base.safety_checker == safety_checker {
                debug!("Reusing base pipeline {}", model_id);
                return Ok(());
            }
        }

        let Some(info) = registry.get_kind(model_id, ModelKind::Checkpoint) else {
            return Err(GenerationError::configuration(format!("Unknown model: {model_id}")));
        };
        let Some(family) = info.base else {
            return Err(GenerationError::configuration(format!("Model {model_id} has no base family")));
        };

        // Release the previous pipeline with clean weights
        if let Some(mut previous) = self.base.take() {
            info!("Releasing base pipeline {}", previous.model_id);
            if let Err(e) = previous.restore() {
                debug!("Could not restore weights of {}: {:#}", previous.model_id, e);
            }
            if previous.family != family {
                self.control_nets.clear();
                self.preview = None;
            }
        }

        let options = LoadOptions {
            safety_checker,
            textual_inversions: registry.textual_inversions(family).into_iter().cloned().collect(),
        };
        info!(
            "Loading base pipeline {} ({}, {} textual inversions)",
            model_id,
            family,
            options.textual_inversions.len()
        );
        match self.loader.load_pipeline(info, &options) {
            Ok(pipeline) => {
                self.base = Some(LoadedPipeline::new(model_id, family, safety_checker, pipeline));
                Ok(())
            }
            Err(e) => {
                self.clear();
                Err(GenerationError::from_load(e.context(format!("Loading {model_id}"))))
            }
        }
    }

    /// Load or release the refiner to match the request.
    pub fn ensure_refiner(
        &mut self,
        registry: &ModelRegistry,
        refiner: Option<&RefinerParams>,
    ) -> Result<(), GenerationError> {
        let Some(params) = refiner else {
            if let Some(previous) = self.refiner.take() {
                info!("Releasing refiner {}", previous.model_id);
            }
            return Ok(());
        };

        if let Some(loaded) = &self.refiner {
            if loaded.model_id == params.model {
                debug!("Reusing refiner {}", params.model);
                return Ok(());
            }
        }
        self.refiner = None;

        let Some(info) = registry.get_kind(&params.model, ModelKind::Checkpoint) else {
            return Err(GenerationError::configuration(format!("Unknown refiner model: {}", params.model)));
        };
        let Some(family) = info.base.filter(|f| f.is_sdxl()) else {
            return Err(GenerationError::configuration(format!("Refiner {} is not an SDXL model", params.model)));
        };

        let options = LoadOptions {
            safety_checker: false,
            textual_inversions: registry.textual_inversions(family).into_iter().cloned().collect(),
        };
        info!("Loading refiner {}", params.model);
        let pipeline = self
            .loader
            .load_pipeline(info, &options)
            .map_err(|e| GenerationError::from_load(e.context(format!("Loading {}", params.model))))?;
        self.refiner = Some(LoadedPipeline::new(&params.model, family, false, pipeline));
        Ok(())
    }

    /// Match the loaded ControlNets to the request's conditions, in order.
    pub fn ensure_control_nets(
        &mut self,
        registry: &ModelRegistry,
        conditions: &[ControlNetCondition],
    ) -> Result<(), GenerationError> {
        let mut loaded: HashMap<String, Arc<dyn ControlNet>> = self.control_nets.drain(..).collect();
        let mut wanted = Vec::with_capacity(conditions.len());

        for condition in conditions {
            let net = match loaded.get(&condition.model) {
                Some(net) => {
                    debug!("Reusing ControlNet {}", condition.model);
                    Arc::clone(net)
                }
                None => {
                    let Some(info) = registry.get_kind(&condition.model, ModelKind::Controlnet) else {
                        return Err(GenerationError::configuration(format!(
                            "Unknown ControlNet model: {}",
                            condition.model
                        )));
                    };
                    info!("Loading ControlNet {}", condition.model);
                    let net = self.loader.load_controlnet(info).map_err(|e| {
                        GenerationError::from_load(e.context(format!("Loading {}", condition.model)))
                    })?;
                    loaded.insert(condition.model.clone(), Arc::clone(&net));
                    net
                }
            };
            wanted.push((condition.model.clone(), net));
        }

        self.control_nets = wanted;
        Ok(())
    }

    /// Select the scheduler used by both the base pipeline and the refiner.
    pub fn set_scheduler(&mut self, id: &str) -> Result<(), GenerationError> {
        for pipeline in [self.base.as_mut(), self.refiner.as_mut()].into_iter().flatten() {
            pipeline.set_scheduler(id)?;
        }
        Ok(())
    }

    /// Patch the base pipeline with `entries`, reverting whatever was
    /// applied before.
    pub fn set_loras(&mut self, registry: &ModelRegistry, entries: &[LoraEntry]) -> Result<(), GenerationError> {
        let Some(base) = self.base.as_mut() else {
            return Err(GenerationError::configuration("No base pipeline loaded"));
        };

        let wanted: Vec<(String, f64)> = entries.iter().map(|e| (e.model.clone(), e.weight)).collect();
        if base.applied_loras == wanted {
            if !wanted.is_empty() {
                debug!("LoRAs unchanged");
            }
            return Ok(());
        }
        if base.family.is_sdxl() && entries.len() > 1 {
            return Err(GenerationError::configuration("Only one LoRA is supported on SDXL models"));
        }

        let mut state_dicts = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(info) = registry.get_kind(&entry.model, ModelKind::Lora) else {
                return Err(GenerationError::configuration(format!("Unknown LoRA: {}", entry.model)));
            };
            info!("Loading LoRA {} at {}", entry.model, entry.weight);
            let tensors = self
                .loader
                .load_lora(info)
                .map_err(|e| GenerationError::from_load(e.context(format!("Loading {}", entry.model))))?;
            state_dicts.push(tensors);
        }
        let files: Vec<LoraFile<'_>> = entries
            .iter()
            .zip(&state_dicts)
            .map(|(entry, tensors)| LoraFile {
                name: &entry.model,
                tensors,
                multiplier: entry.weight,
            })
            .collect();

        let deltas = lora::compute_deltas(base.pipeline.as_ref(), &files).map_err(GenerationError::classify)?;

        let previously = std::mem::take(&mut base.patched);
        base.applied_loras.clear();
        let apply = |base: &mut LoadedPipeline| -> anyhow::Result<()> {
            for target in previously.iter().filter(|t| !deltas.contains_key(t)) {
                base.pipeline.apply_deltas(*target, HashMap::new())?;
            }
            for (target, target_deltas) in deltas {
                base.pipeline.apply_deltas(target, target_deltas)?;
                base.patched.insert(target);
            }
            Ok(())
        };
        if let Err(e) = apply(base) {
            // Weights may carry deltas nothing tracks any more
            warn!("Patching {} failed, unloading it: {:#}", base.model_id, e);
            self.base = None;
            return Err(GenerationError::classify(e));
        }
        base.applied_loras = wanted;
        Ok(())
    }

    /// Load the tiny autoencoder for `family` unless it is already warm.
    pub fn ensure_preview_decoder(&mut self, family: BaseFamily) -> Result<(), GenerationError> {
        if matches!(&self.preview, Some((loaded, _)) if *loaded == family) {
            return Ok(());
        }
        self.preview = None;
        info!("Loading preview decoder for {}", family);
        let decoder = self.loader.load_preview_decoder(family).map_err(GenerationError::from_load)?;
        self.preview = Some((family, decoder));
        Ok(())
    }

    pub fn preview_decoder(&self) -> Option<&dyn PreviewDecoder> {
        self.preview.as_ref().map(|(_, decoder)| decoder.as_ref())
    }

    pub fn release_preview_decoder(&mut self) {
        if self.preview.take().is_some() {
            debug!("Released preview decoder");
        }
    }

    pub fn ensure_upscaler(&mut self, denoising: f64) -> Result<(), GenerationError> {
        let key = denoising.to_bits();
        if matches!(&self.upscaler, Some((loaded, _)) if *loaded == key) {
            return Ok(());
        }
        self.upscaler = None;
        info!("Loading upscaler (denoising {})", denoising);
        let upscaler = self.loader.load_upscaler(denoising).map_err(GenerationError::from_load)?;
        self.upscaler = Some((key, upscaler));
        Ok(())
    }

    pub fn upscaler(&self) -> Option<&dyn Upscaler> {
        self.upscaler.as_ref().map(|(_, upscaler)| upscaler.as_ref())
    }

    pub fn ensure_face_restorer(&mut self, factor: u32) -> Result<(), GenerationError> {
        if matches!(&self.face_restorer, Some((loaded, _)) if *loaded == factor) {
            return Ok(());
        }
        self.face_restorer = None;
        info!("Loading face restorer (x{})", factor);
        let restorer = self.loader.load_face_restorer(factor).map_err(GenerationError::from_load)?;
        self.face_restorer = Some((factor, restorer));
        Ok(())
    }

    pub fn face_restorer(&self) -> Option<&dyn FaceRestorer> {
        self.face_restorer.as_ref().map(|(_, restorer)| restorer.as_ref())
    }
}
