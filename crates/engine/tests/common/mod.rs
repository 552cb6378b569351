//! In-memory backend used by the worker tests.
//!
//! Every component runs on small CPU tensors. The loader records each load
//! and the pipelines record each weight patch so tests can check what the
//! cache reused.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, RgbImage};
use seedalchemy_core::frames::Frame;
use seedalchemy_core::registry::{BaseFamily, ModelInfo, ModelKind, ModelLocation, ModelRegistry};
use seedalchemy_core::OutputStore;
use seedalchemy_engine::Worker;
use seedalchemy_runtime_api::{
    AddedConditions, BackendCaps, ControlNet, ControlResiduals, Denoiser, EncodedPrompt, FaceRestorer, LatentCodec,
    LoadOptions, ModelLoader, PatchTarget, PipelineModel, Preprocessor, PreviewDecoder, ProcessorClass, TextEncoder,
    Upscaler,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const SIZE: u32 = 64;
pub const LORA_LAYER: &str = "down_blocks.0.proj.weight";

/// Shared counters and switches of the fake backend.
#[derive(Default)]
pub struct Recorder {
    pub loads: Mutex<Vec<String>>,
    pub patches: Mutex<Vec<(PatchTarget, usize)>>,
    pub denoiser_calls: AtomicUsize,
    pub control_calls: AtomicUsize,
    pub preprocessor_calls: AtomicUsize,
    pub face_calls: AtomicUsize,
    /// Fail this many face restorations before succeeding.
    pub face_failures: AtomicUsize,
    /// Sleep per denoiser call.
    pub step_delay_ms: AtomicUsize,
    /// Fail weight patches once this many more have succeeded.
    pub patches_before_failure: Mutex<Option<usize>>,
}

impl Recorder {
    pub fn loads_of(&self, prefix: &str) -> usize {
        self.loads
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }

    fn record(&self, entry: String) {
        self.loads.lock().unwrap().push(entry);
    }
}

/// Splits on whitespace, one id per word.
struct WordEncoder {
    pooled: bool,
}

impl TextEncoder for WordEncoder {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.split_whitespace().map(|w| w.len() as u32 + 1).collect())
    }

    fn bos_token_id(&self) -> u32 {
        100
    }

    fn eos_token_id(&self) -> u32 {
        101
    }

    fn pad_token_id(&self) -> u32 {
        0
    }

    fn max_length(&self) -> usize {
        8
    }

    fn encode(&self, ids: &[u32]) -> Result<EncodedPrompt> {
        let values: Vec<f32> = ids.iter().flat_map(|&id| [id as f32 / 100.0; 4]).collect();
        let hidden = Tensor::from_vec(values, (1, ids.len(), 4), &Device::Cpu)?;
        let pooled = if self.pooled {
            Some(Tensor::new(&[[ids[1] as f32 / 100.0, 0.5]], &Device::Cpu)?)
        } else {
            None
        };
        Ok(EncodedPrompt { hidden, pooled })
    }
}

struct ZeroDenoiser {
    in_channels: usize,
    recorder: Arc<Recorder>,
}

impl Denoiser for ZeroDenoiser {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn forward(
        &self,
        latents: &Tensor,
        _timestep: f64,
        encoder_hidden_states: &Tensor,
        added: Option<&AddedConditions>,
        _control: Option<&ControlResiduals>,
    ) -> Result<Tensor> {
        if latents.dim(1)? != self.in_channels {
            bail!("Expected {} channels, got {}", self.in_channels, latents.dim(1)?);
        }
        if encoder_hidden_states.dim(0)? != latents.dim(0)? {
            bail!("Hidden states do not match the latent batch");
        }
        if let Some(added) = added {
            if added.time_ids.dim(0)? != latents.dim(0)? {
                bail!("Time ids do not match the latent batch");
            }
        }
        self.recorder.denoiser_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.recorder.step_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay as u64));
        }
        Ok(latents.narrow(1, 0, 4)?.zeros_like()?)
    }
}

/// Averages 8×8 blocks into latents and repeats them back out.
struct BlockCodec;

impl LatentCodec for BlockCodec {
    fn scaling_factor(&self) -> f64 {
        0.5
    }

    fn encode(&self, image: &Tensor) -> Result<Tensor> {
        let pooled = image.avg_pool2d(8)?;
        let mean = pooled.mean_keepdim(1)?;
        Ok(Tensor::cat(&[&pooled, &mean], 1)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = latents.dims4()?;
        Ok(latents.narrow(1, 0, 3)?.upsample_nearest2d(h * 8, w * 8)?)
    }
}

struct FakePipeline {
    family: BaseFamily,
    encoders: Vec<WordEncoder>,
    denoiser: ZeroDenoiser,
    codec: BlockCodec,
    device: Device,
    recorder: Arc<Recorder>,
}

impl PipelineModel for FakePipeline {
    fn family(&self) -> BaseFamily {
        self.family
    }

    fn text_encoders(&self) -> Vec<&dyn TextEncoder> {
        self.encoders.iter().map(|e| e as &dyn TextEncoder).collect()
    }

    fn denoiser(&self) -> &dyn Denoiser {
        &self.denoiser
    }

    fn codec(&self) -> &dyn LatentCodec {
        &self.codec
    }

    fn scheduler_config(&self) -> Value {
        json!({
            "_class_name": "EulerDiscreteScheduler",
            "beta_start": 0.00085,
            "beta_end": 0.012,
            "beta_schedule": "scaled_linear",
            "num_train_timesteps": 1000,
            "steps_offset": 1,
            "timestep_spacing": "leading",
            "trained_betas": null
        })
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn weight_names(&self, target: PatchTarget) -> Vec<String> {
        match target {
            PatchTarget::Unet => vec![LORA_LAYER.to_string()],
            PatchTarget::TextEncoder(_) => Vec::new(),
        }
    }

    fn apply_deltas(&mut self, target: PatchTarget, deltas: HashMap<String, Tensor>) -> Result<()> {
        let mut remaining = self.recorder.patches_before_failure.lock().unwrap();
        match remaining.as_mut() {
            Some(0) => bail!("Shape mismatch patching {target:?}"),
            Some(n) => *n -= 1,
            None => {}
        }
        self.recorder.patches.lock().unwrap().push((target, deltas.len()));
        Ok(())
    }
}

struct CountingControlNet {
    recorder: Arc<Recorder>,
}

impl ControlNet for CountingControlNet {
    fn forward(
        &self,
        latents: &Tensor,
        _timestep: f64,
        _encoder_hidden_states: &Tensor,
        control_image: &Tensor,
        _scale: f64,
        _added: Option<&AddedConditions>,
    ) -> Result<ControlResiduals> {
        if control_image.dim(0)? != latents.dim(0)? {
            bail!("Control image batch does not match the latents");
        }
        self.recorder.control_calls.fetch_add(1, Ordering::SeqCst);
        let zeros = latents.narrow(1, 0, 4)?.zeros_like()?;
        Ok(ControlResiduals {
            down: vec![zeros.clone()],
            mid: zeros,
        })
    }
}

struct CountingPreprocessor {
    recorder: Arc<Recorder>,
}

impl Preprocessor for CountingPreprocessor {
    fn process(
        &mut self,
        image: &DynamicImage,
        _detect_resolution: u32,
        _params: &BTreeMap<String, f64>,
    ) -> Result<DynamicImage> {
        self.recorder.preprocessor_calls.fetch_add(1, Ordering::SeqCst);
        Ok(DynamicImage::ImageRgb8(image.grayscale().to_rgb8()))
    }
}

struct NearestUpscaler;

impl Upscaler for NearestUpscaler {
    fn upscale(&self, image: &RgbImage, factor: u32) -> Result<RgbImage> {
        Ok(image::imageops::resize(
            image,
            image.width() * factor,
            image.height() * factor,
            image::imageops::FilterType::Nearest,
        ))
    }
}

struct PassthroughRestorer {
    recorder: Arc<Recorder>,
}

impl FaceRestorer for PassthroughRestorer {
    fn restore(&self, _image: &RgbImage, upscaled: &RgbImage, _factor: u32) -> Result<RgbImage> {
        self.recorder.face_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.recorder.face_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.recorder.face_failures.store(pending - 1, Ordering::SeqCst);
            bail!("No face detector output");
        }
        Ok(upscaled.clone())
    }
}

struct GreyPreview;

impl PreviewDecoder for GreyPreview {
    fn decode(&self, latents: &Tensor) -> Result<RgbImage> {
        let (_, _, h, w) = latents.dims4()?;
        Ok(RgbImage::from_pixel(w as u32 * 8, h as u32 * 8, image::Rgb([128, 128, 128])))
    }
}

pub struct FakeLoader {
    pub recorder: Arc<Recorder>,
}

impl ModelLoader for FakeLoader {
    fn caps(&self) -> BackendCaps {
        BackendCaps {
            control_net: true,
            face_restoration: true,
            upscale: true,
            tiny_vae_preview: true,
        }
    }

    fn load_pipeline(&self, info: &ModelInfo, _options: &LoadOptions) -> Result<Box<dyn PipelineModel>> {
        if info.name.starts_with("broken") {
            return Err(anyhow!("unet/diffusion_pytorch_model.safetensors not found"));
        }
        self.recorder.record(format!("pipeline:{}", info.name));
        let family = info.base.ok_or_else(|| anyhow!("No family"))?;
        let encoders = match family {
            BaseFamily::Sdxl => vec![WordEncoder { pooled: false }, WordEncoder { pooled: true }],
            BaseFamily::SdxlRefiner => vec![WordEncoder { pooled: true }],
            _ => vec![WordEncoder { pooled: false }],
        };
        let in_channels = if info.name.contains("inpainting") { 9 } else { 4 };
        Ok(Box::new(FakePipeline {
            family,
            encoders,
            denoiser: ZeroDenoiser {
                in_channels,
                recorder: Arc::clone(&self.recorder),
            },
            codec: BlockCodec,
            device: Device::Cpu,
            recorder: Arc::clone(&self.recorder),
        }))
    }

    fn load_controlnet(&self, info: &ModelInfo) -> Result<Arc<dyn ControlNet>> {
        if info.name.starts_with("broken") {
            return Err(anyhow!("diffusion_pytorch_model.safetensors not found"));
        }
        self.recorder.record(format!("controlnet:{}", info.name));
        Ok(Arc::new(CountingControlNet {
            recorder: Arc::clone(&self.recorder),
        }))
    }

    fn load_lora(&self, info: &ModelInfo) -> Result<HashMap<String, Tensor>> {
        self.recorder.record(format!("lora:{}", info.name));
        let stem = LORA_LAYER.trim_end_matches(".weight").replace('.', "_");
        Ok(HashMap::from([
            (
                format!("lora_unet_{stem}.lora_up.weight"),
                Tensor::ones((4, 1), DType::F32, &Device::Cpu)?,
            ),
            (
                format!("lora_unet_{stem}.lora_down.weight"),
                Tensor::ones((1, 4), DType::F32, &Device::Cpu)?,
            ),
        ]))
    }

    fn load_preview_decoder(&self, family: BaseFamily) -> Result<Box<dyn PreviewDecoder>> {
        self.recorder.record(format!("preview:{family}"));
        Ok(Box::new(GreyPreview))
    }

    fn load_preprocessor(&self, class: ProcessorClass) -> Result<Box<dyn Preprocessor>> {
        self.recorder.record(format!("preprocessor:{class:?}"));
        Ok(Box::new(CountingPreprocessor {
            recorder: Arc::clone(&self.recorder),
        }))
    }

    fn load_upscaler(&self, denoising: f64) -> Result<Box<dyn Upscaler>> {
        self.recorder.record(format!("upscaler:{denoising}"));
        Ok(Box::new(NearestUpscaler))
    }

    fn load_face_restorer(&self, factor: u32) -> Result<Box<dyn FaceRestorer>> {
        self.recorder.record(format!("face:{factor}"));
        Ok(Box::new(PassthroughRestorer {
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

fn local(name: &str, kind: ModelKind, base: BaseFamily) -> ModelInfo {
    ModelInfo {
        name: name.to_string(),
        kind,
        base: Some(base),
        location: ModelLocation::Local {
            path: format!("/models/{name}").into(),
        },
    }
}

pub fn registry() -> ModelRegistry {
    let mut registry = ModelRegistry::default();
    registry.add(local("sd-1.5", ModelKind::Checkpoint, BaseFamily::Sd1));
    registry.add(local("sd-1.5-inpainting", ModelKind::Checkpoint, BaseFamily::Sd1));
    registry.add(local("sd-2.1", ModelKind::Checkpoint, BaseFamily::Sd2));
    registry.add(local("broken-1.5", ModelKind::Checkpoint, BaseFamily::Sd1));
    registry.add(local("sdxl-base", ModelKind::Checkpoint, BaseFamily::Sdxl));
    registry.add(local("sdxl-refiner", ModelKind::Checkpoint, BaseFamily::SdxlRefiner));
    registry.add(local("control_v11p_sd15_canny", ModelKind::Controlnet, BaseFamily::Sd1));
    registry.add(local("control_v11p_sd15_scribble", ModelKind::Controlnet, BaseFamily::Sd1));
    registry.add(local("broken-controlnet", ModelKind::Controlnet, BaseFamily::Sd1));
    registry.add(local("pixel-style", ModelKind::Lora, BaseFamily::Sd1));
    registry.add(local("ink-style", ModelKind::Lora, BaseFamily::Sd1));
    registry.add(local("xl-style", ModelKind::Lora, BaseFamily::Sdxl));
    registry.add(local("xl-detail", ModelKind::Lora, BaseFamily::Sdxl));
    registry
}

pub struct Harness {
    pub dir: TempDir,
    pub recorder: Arc<Recorder>,
    pub store: OutputStore,
    pub worker: Worker,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let store = OutputStore::new(dir.path());
        let loader = Arc::new(FakeLoader {
            recorder: Arc::clone(&recorder),
        });
        let worker = Worker::new(loader, Arc::new(registry()), store.clone());
        Self {
            dir,
            recorder,
            store,
            worker,
        }
    }

    /// Store a gradient test image and return its collection path.
    pub fn source_image(&self, collection: &str) -> String {
        let image = RgbImage::from_fn(SIZE, SIZE, |x, y| image::Rgb([(x * 4) as u8, (y * 4) as u8, 90]));
        let png = seedalchemy_core::metadata::encode_png(&image, None).unwrap();
        self.store.write_image("default", collection, &png).unwrap()
    }

    /// Store a white image whose left half is opaque and right half
    /// transparent.
    pub fn half_transparent_image(&self, collection: &str) -> String {
        let image = image::RgbaImage::from_fn(SIZE, SIZE, |x, _| {
            image::Rgba([255, 255, 255, if x < SIZE / 2 { 255 } else { 0 }])
        });
        let mut png = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        self.store.write_image("default", collection, &png).unwrap()
    }

    pub fn loader(&self) -> FakeLoader {
        FakeLoader {
            recorder: Arc::clone(&self.recorder),
        }
    }

    pub fn files(&self, collection: &str) -> Vec<String> {
        self.store.images("default", collection).unwrap_or_default()
    }
}

/// Every frame currently queued.
pub fn drain(receiver: &mut mpsc::Receiver<Vec<u8>>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(bytes) = receiver.try_recv() {
        frames.push(Frame::decode(&bytes).unwrap());
    }
    frames
}

pub fn progress_count(frames: &[Frame]) -> usize {
    frames
        .iter()
        .filter(|f| matches!(f, Frame::Progress { .. }))
        .count()
}

pub fn image_frames(frames: &[Frame]) -> Vec<&Vec<u8>> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Image { png, .. } => Some(png),
            _ => None,
        })
        .collect()
}
