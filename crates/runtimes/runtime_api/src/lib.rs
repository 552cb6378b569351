//! seedalchemy_runtime_api - Backend traits for diffusion runtimes
//!
//! The engine drives every neural component through these traits; a backend
//! (candle today) implements them and hands out instances through a
//! [`ModelLoader`]. Tensors cross the seam as `candle_core::Tensor`, bitmaps
//! as `image` buffers.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub use seedalchemy_core::processors::ProcessorClass;
pub use seedalchemy_core::registry::{BaseFamily, ModelInfo};

/// What a backend can run. Requests needing a missing capability fail when
/// the cache reconciles.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendCaps {
    pub control_net: bool,
    pub face_restoration: bool,
    pub upscale: bool,
    pub tiny_vae_preview: bool,
}

/// Returned by per-step callbacks; the sampler loop stops on `Cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Cancel,
}

/// Output of one text encoder for one token chunk.
#[derive(Debug, Clone)]
pub struct EncodedPrompt {
    /// `[1, tokens, hidden]`
    pub hidden: Tensor,
    /// `[1, projection]`, only from encoders with a projection head
    pub pooled: Option<Tensor>,
}

pub trait TextEncoder: Send + Sync {
    /// Token ids without begin/end markers.
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    fn bos_token_id(&self) -> u32;

    fn eos_token_id(&self) -> u32;

    fn pad_token_id(&self) -> u32;

    /// Window length including begin/end markers.
    fn max_length(&self) -> usize {
        77
    }

    /// Encode one padded window of `max_length` ids.
    fn encode(&self, ids: &[u32]) -> Result<EncodedPrompt>;

    /// Registered textual-inversion tokens with their vector counts.
    fn textual_inversions(&self) -> Vec<(String, usize)> {
        Vec::new()
    }
}

/// SDXL micro-conditioning passed next to the text embeddings.
#[derive(Debug, Clone)]
pub struct AddedConditions {
    pub text_embeds: Tensor,
    pub time_ids: Tensor,
}

/// Residuals a ControlNet adds to the UNet skip connections.
#[derive(Debug, Clone)]
pub struct ControlResiduals {
    pub down: Vec<Tensor>,
    pub mid: Tensor,
}

impl ControlResiduals {
    /// Element-wise sum, used to merge several nets.
    pub fn add(&self, other: &ControlResiduals) -> Result<ControlResiduals> {
        let down = self
            .down
            .iter()
            .zip(&other.down)
            .map(|(a, b)| a.add(b))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(ControlResiduals {
            down,
            mid: self.mid.add(&other.mid)?,
        })
    }
}

pub trait Denoiser: Send + Sync {
    /// Latent channels expected on input; 9 for inpainting checkpoints.
    fn in_channels(&self) -> usize;

    fn forward(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        added: Option<&AddedConditions>,
        control: Option<&ControlResiduals>,
    ) -> Result<Tensor>;
}

pub trait LatentCodec: Send + Sync {
    fn scaling_factor(&self) -> f64;

    /// `[B, 3, H, W]` in `[-1, 1]` to unscaled latents.
    fn encode(&self, image: &Tensor) -> Result<Tensor>;

    /// Unscaled latents to `[B, 3, H, W]` in `[-1, 1]`.
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

pub trait ControlNet: Send + Sync {
    /// `control_image` is `[B, 3, H, W]` in `[0, 1]`.
    fn forward(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        control_image: &Tensor,
        scale: f64,
        added: Option<&AddedConditions>,
    ) -> Result<ControlResiduals>;
}

/// Fast latent-to-image decoder for previews.
pub trait PreviewDecoder: Send + Sync {
    /// Takes scaled latents of the first batch entry.
    fn decode(&self, latents: &Tensor) -> Result<RgbImage>;
}

pub trait Preprocessor: Send + Sync {
    fn process(
        &mut self,
        image: &DynamicImage,
        detect_resolution: u32,
        params: &BTreeMap<String, f64>,
    ) -> Result<DynamicImage>;
}

pub trait Upscaler: Send + Sync {
    fn upscale(&self, image: &RgbImage, factor: u32) -> Result<RgbImage>;
}

pub trait FaceRestorer: Send + Sync {
    /// Restore faces found in `image` and paste them onto `upscaled`.
    fn restore(&self, image: &RgbImage, upscaled: &RgbImage, factor: u32) -> Result<RgbImage>;
}

/// Weight groups LoRA deltas can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchTarget {
    Unet,
    TextEncoder(usize),
}

/// A loaded checkpoint: encoders, denoiser and latent codec.
pub trait PipelineModel: Send + Sync {
    fn family(&self) -> BaseFamily;

    /// One encoder for SD 1/2 and the refiner, two for SDXL base.
    fn text_encoders(&self) -> Vec<&dyn TextEncoder>;

    fn denoiser(&self) -> &dyn Denoiser;

    fn codec(&self) -> &dyn LatentCodec;

    /// Scheduler configuration shipped with the checkpoint.
    fn scheduler_config(&self) -> serde_json::Value;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    /// Names of patchable weights, e.g. `down_blocks.0.attentions.0.proj_in.weight`.
    fn weight_names(&self, target: PatchTarget) -> Vec<String>;

    /// Rebuild the target from its base weights plus `deltas`. An empty map
    /// restores the base weights.
    fn apply_deltas(&mut self, target: PatchTarget, deltas: HashMap<String, Tensor>) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub safety_checker: bool,
    pub textual_inversions: Vec<ModelInfo>,
}

/// Factory for every component the engine may need.
pub trait ModelLoader: Send + Sync {
    fn caps(&self) -> BackendCaps;

    fn load_pipeline(&self, info: &ModelInfo, options: &LoadOptions) -> Result<Box<dyn PipelineModel>>;

    fn load_controlnet(&self, info: &ModelInfo) -> Result<Arc<dyn ControlNet>>;

    /// Raw LoRA state dict keyed as stored in the file.
    fn load_lora(&self, info: &ModelInfo) -> Result<HashMap<String, Tensor>>;

    fn load_preview_decoder(&self, family: BaseFamily) -> Result<Box<dyn PreviewDecoder>>;

    fn load_preprocessor(&self, class: ProcessorClass) -> Result<Box<dyn Preprocessor>>;

    fn load_upscaler(&self, denoising: f64) -> Result<Box<dyn Upscaler>>;

    fn load_face_restorer(&self, factor: u32) -> Result<Box<dyn FaceRestorer>>;
}
