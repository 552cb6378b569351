//! seedalchemy_runtime_diffusion - Candle backend for the generation worker
//!
//! This crate provides Stable Diffusion 1/2, SDXL and SDXL refiner pipelines,
//! the tiny-autoencoder preview decoder, the Real-ESRGAN upscaler and the
//! fixed-filter preprocessors, all on HuggingFace's candle library.
//! Supports Metal (macOS) and CUDA (Linux/Windows) acceleration.

mod clip;
mod convert;
mod esrgan;
mod pipeline;
mod preprocessors;
mod taesd;
mod unet;
pub mod weights;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use seedalchemy_core::config::DeviceChoice;
use seedalchemy_core::{Config, GenerationError, ModelInfo};
use seedalchemy_runtime_api::{
    BackendCaps, BaseFamily, ControlNet, FaceRestorer, LoadOptions, ModelLoader, PipelineModel,
    Preprocessor, PreviewDecoder, ProcessorClass, Upscaler,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use pipeline::SdPipeline;
use weights::ModelFiles;

/// Pick the accelerator; `auto` tries CUDA, then Metal, then the CPU.
pub fn select_device(choice: DeviceChoice) -> Result<Device> {
    let device = match choice {
        DeviceChoice::Cuda => Device::new_cuda(0)?,
        DeviceChoice::Metal => Device::new_metal(0)?,
        DeviceChoice::Cpu => Device::Cpu,
        DeviceChoice::Auto => {
            if candle_core::utils::cuda_is_available() {
                Device::new_cuda(0)?
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(0)?
            } else {
                Device::Cpu
            }
        }
    };
    tracing::info!("Using device {:?}", device);
    Ok(device)
}

/// F16 on CUDA, F32 elsewhere, unless configured.
pub fn select_dtype(device: &Device, configured: Option<&str>) -> Result<DType> {
    match configured {
        Some("f16") => Ok(DType::F16),
        Some("bf16") => Ok(DType::BF16),
        Some("f32") => Ok(DType::F32),
        Some(other) => anyhow::bail!("Unknown dtype: {}", other),
        None => Ok(match device {
            Device::Cuda(_) => DType::F16,
            _ => DType::F32,
        }),
    }
}

pub struct CandleLoader {
    device: Device,
    dtype: DType,
    hub_cache: PathBuf,
    /// Real-ESRGAN weights directory
    esrgan_dir: PathBuf,
}

impl CandleLoader {
    pub fn new(hub_cache: &Path, esrgan_dir: &Path, device: Device, dtype: DType) -> Self {
        Self {
            device,
            dtype,
            hub_cache: hub_cache.to_path_buf(),
            esrgan_dir: esrgan_dir.to_path_buf(),
        }
    }

    /// Device, dtype and cache directories taken from the configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let device = select_device(config.device.device)?;
        let dtype = select_dtype(&device, config.device.dtype.as_deref())?;
        tracing::info!("Using dtype {:?}", dtype);
        Ok(Self::new(
            &config.hub_cache_dir(),
            &config.aux_cache_dir("realesrgan"),
            device,
            dtype,
        ))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl ModelLoader for CandleLoader {
    fn caps(&self) -> BackendCaps {
        BackendCaps {
            control_net: false,
            face_restoration: false,
            upscale: true,
            tiny_vae_preview: true,
        }
    }

    fn load_pipeline(&self, info: &ModelInfo, options: &LoadOptions) -> Result<Box<dyn PipelineModel>> {
        let Some(family) = info.base else {
            return Err(GenerationError::configuration(format!("{} has no base model type", info.name)).into());
        };
        let files = ModelFiles::resolve(info, &self.hub_cache);
        let pipeline = SdPipeline::load(&files, family, options, &self.hub_cache, &self.device, self.dtype)?;
        Ok(Box::new(pipeline))
    }

    fn load_controlnet(&self, info: &ModelInfo) -> Result<Arc<dyn ControlNet>> {
        Err(GenerationError::resource(format!("ControlNet {} cannot run on the candle backend", info.name)).into())
    }

    fn load_lora(&self, info: &ModelInfo) -> Result<HashMap<String, Tensor>> {
        let files = ModelFiles::resolve(info, &self.hub_cache);
        let path = match files.single_file() {
            Some(path) => path.to_path_buf(),
            None => files.require("pytorch_lora_weights.safetensors")?,
        };
        if path.extension().and_then(|e| e.to_str()) != Some("safetensors") {
            return Err(GenerationError::resource(format!("LoRA {} is not a safetensors file", info.name)).into());
        }
        tracing::info!("Loading LoRA {} from {:?}", info.name, path);
        Ok(candle_core::safetensors::load(&path, &self.device)?)
    }

    fn load_preview_decoder(&self, family: BaseFamily) -> Result<Box<dyn PreviewDecoder>> {
        let files = ModelFiles::hub(taesd::repo_id(family), &self.hub_cache);
        let weights = files.weights("", "diffusion_pytorch_model", false)?;
        Ok(Box::new(taesd::TinyDecoder::load(&weights, &self.device, self.dtype)?))
    }

    fn load_preprocessor(&self, class: ProcessorClass) -> Result<Box<dyn Preprocessor>> {
        match preprocessors::new(class) {
            Some(preprocessor) => Ok(preprocessor),
            None => {
                let weights = class.weights_repo().unwrap_or("bundled");
                Err(GenerationError::resource(format!(
                    "The {:?} detector ({} weights) cannot run on the candle backend",
                    class, weights
                ))
                .into())
            }
        }
    }

    fn load_upscaler(&self, denoising: f64) -> Result<Box<dyn Upscaler>> {
        let dir = &self.esrgan_dir;
        let mut needed = vec![esrgan::DENOISE_WEIGHTS];
        if denoising < 1.0 {
            needed.push(esrgan::WEIGHTS);
        }
        if let Some(missing) = needed.iter().find(|f| !dir.join(f).is_file()) {
            return Err(GenerationError::resource(format!("Real-ESRGAN weights {:?} not found", dir.join(missing))).into());
        }
        Ok(Box::new(esrgan::CompactEsrgan::load(dir, denoising, &self.device, self.dtype)?))
    }

    fn load_face_restorer(&self, _factor: u32) -> Result<Box<dyn FaceRestorer>> {
        Err(GenerationError::resource("GFPGAN face restoration cannot run on the candle backend").into())
    }
}
