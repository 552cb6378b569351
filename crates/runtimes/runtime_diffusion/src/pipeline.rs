//! Stable Diffusion pipelines assembled from a diffusers directory.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use seedalchemy_core::{GenerationError, ModelInfo, ModelLocation};
use seedalchemy_runtime_api::{
    BaseFamily, Denoiser, LatentCodec, LoadOptions, PatchTarget, PipelineModel, TextEncoder,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::clip::{self, ClipConfig, ClipTextEncoder, HiddenOutput};
use crate::unet::{SdUnet, VaeCodec};
use crate::weights::ModelFiles;

/// One text encoder slot of a family.
struct EncoderSpec {
    component: &'static str,
    tokenizer: &'static str,
    config: fn() -> ClipConfig,
    output: HiddenOutput,
    pad_with_eos: bool,
    /// Hub repository providing `tokenizer.json` when the checkpoint ships
    /// only the slow tokenizer files
    fallback_tokenizer: &'static str,
}

const VIT_L_TOKENIZER: &str = "openai/clip-vit-large-patch14";
const VIT_H_TOKENIZER: &str = "laion/CLIP-ViT-H-14-laion2B-s32B-b79K";
const VIT_BIG_G_TOKENIZER: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";

fn encoder_specs(family: BaseFamily) -> Vec<EncoderSpec> {
    let first = |config: fn() -> ClipConfig, output, pad_with_eos, fallback_tokenizer| EncoderSpec {
        component: "text_encoder",
        tokenizer: "tokenizer",
        config,
        output,
        pad_with_eos,
        fallback_tokenizer,
    };
    let second = EncoderSpec {
        component: "text_encoder_2",
        tokenizer: "tokenizer_2",
        config: ClipConfig::vit_big_g,
        output: HiddenOutput::Penultimate,
        pad_with_eos: false,
        fallback_tokenizer: VIT_BIG_G_TOKENIZER,
    };

    match family {
        BaseFamily::Sd1 => vec![first(ClipConfig::vit_l, HiddenOutput::Last, true, VIT_L_TOKENIZER)],
        BaseFamily::Sd2 => vec![first(ClipConfig::vit_h, HiddenOutput::Last, false, VIT_H_TOKENIZER)],
        BaseFamily::Sdxl => vec![
            first(ClipConfig::vit_l, HiddenOutput::Penultimate, true, VIT_L_TOKENIZER),
            second,
        ],
        BaseFamily::SdxlRefiner => vec![second],
    }
}

/// Scheduler settings used when a checkpoint ships none.
pub fn default_scheduler_config(family: BaseFamily) -> serde_json::Value {
    let prediction_type = match family {
        BaseFamily::Sd2 => "v_prediction",
        _ => "epsilon",
    };
    json!({
        "num_train_timesteps": 1000,
        "beta_start": 0.00085,
        "beta_end": 0.012,
        "beta_schedule": "scaled_linear",
        "prediction_type": prediction_type,
        "steps_offset": 1,
        "timestep_spacing": "leading",
    })
}

fn load_inversion(info: &ModelInfo) -> Result<HashMap<String, Tensor>> {
    let ModelLocation::Local { path } = &info.location else {
        anyhow::bail!("only local textual inversions are supported");
    };
    match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => Ok(candle_core::safetensors::load(path, &Device::Cpu)?),
        _ => Ok(candle_core::pickle::read_all(path)?.into_iter().collect()),
    }
}

pub struct SdPipeline {
    family: BaseFamily,
    encoders: Vec<ClipTextEncoder>,
    unet: SdUnet,
    vae: VaeCodec,
    scheduler: serde_json::Value,
    device: Device,
    dtype: DType,
}

impl SdPipeline {
    pub fn load(
        files: &ModelFiles,
        family: BaseFamily,
        options: &LoadOptions,
        hub_cache: &Path,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if files.single_file().is_some() {
            return Err(GenerationError::configuration(format!(
                "{} is a single-file checkpoint; convert it to the diffusers layout",
                files.name()
            ))
            .into());
        }
        let prefer_fp16 = dtype == DType::F16;

        // Load text encoders
        let mut encoders = Vec::new();
        for spec in encoder_specs(family) {
            let weights = files.weights(spec.component, "model", prefer_fp16)?;
            let tokenizer = match files.get(&format!("{}/tokenizer.json", spec.tokenizer)) {
                Some(path) => path,
                None => ModelFiles::hub(spec.fallback_tokenizer, hub_cache).require("tokenizer.json")?,
            };
            let config = files
                .config::<ClipConfig>(&format!("{}/config.json", spec.component))?
                .unwrap_or_else(spec.config);
            encoders.push(ClipTextEncoder::load(
                &weights,
                &tokenizer,
                config,
                spec.output,
                spec.pad_with_eos,
                device,
                dtype,
            )?);
        }

        // Register textual inversions
        let mut added = false;
        for inversion in &options.textual_inversions {
            let tensors = match load_inversion(inversion) {
                Ok(tensors) => tensors,
                Err(e) => {
                    warn!("Skipping textual inversion {}: {:#}", inversion.name, e);
                    continue;
                }
            };
            for encoder in encoders.iter_mut() {
                match clip::inversion_vectors(&tensors, encoder.hidden_size())? {
                    Some(vectors) => {
                        encoder.add_inversion(&inversion.name, &vectors.to_device(device)?)?;
                        added = true;
                    }
                    None => debug!(
                        "Textual inversion {} has no vectors of width {}",
                        inversion.name,
                        encoder.hidden_size()
                    ),
                }
            }
        }
        if added {
            for encoder in encoders.iter_mut() {
                encoder.rebuild(&HashMap::new())?;
            }
        }

        // Load UNet
        let unet = SdUnet::load(
            &files.weights("unet", "diffusion_pytorch_model", prefer_fp16)?,
            family,
            device,
            dtype,
        )?;

        // Load VAE
        let vae_dtype = if family.is_sdxl() && dtype == DType::F16 {
            DType::F32
        } else {
            dtype
        };
        let vae = VaeCodec::load(
            &files.weights("vae", "diffusion_pytorch_model", vae_dtype == DType::F16)?,
            family,
            device,
            vae_dtype,
        )?;

        let scheduler = files
            .config::<serde_json::Value>("scheduler/scheduler_config.json")?
            .unwrap_or_else(|| default_scheduler_config(family));

        if options.safety_checker {
            debug!("No safety checker on the candle backend; images are returned unfiltered");
        }
        info!("Loaded {} pipeline {}", family, files.name());

        Ok(Self {
            family,
            encoders,
            unet,
            vae,
            scheduler,
            device: device.clone(),
            dtype,
        })
    }
}

impl PipelineModel for SdPipeline {
    fn family(&self) -> BaseFamily {
        self.family
    }

    fn text_encoders(&self) -> Vec<&dyn TextEncoder> {
        self.encoders.iter().map(|e| e as &dyn TextEncoder).collect()
    }

    fn denoiser(&self) -> &dyn Denoiser {
        &self.unet
    }

    fn codec(&self) -> &dyn LatentCodec {
        &self.vae
    }

    fn scheduler_config(&self) -> serde_json::Value {
        self.scheduler.clone()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn weight_names(&self, target: PatchTarget) -> Vec<String> {
        match target {
            PatchTarget::Unet => self.unet.weight_names(),
            PatchTarget::TextEncoder(i) => self.encoders.get(i).map(|e| e.weight_names()).unwrap_or_default(),
        }
    }

    fn apply_deltas(&mut self, target: PatchTarget, deltas: HashMap<String, Tensor>) -> Result<()> {
        match target {
            PatchTarget::Unet => self.unet.rebuild(&deltas),
            PatchTarget::TextEncoder(i) => match self.encoders.get_mut(i) {
                Some(encoder) => encoder.rebuild(&deltas),
                None => anyhow::bail!("Pipeline has no text encoder {}", i),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use seedalchemy_core::ModelKind;

    #[test]
    fn encoder_layout_per_family() {
        let xl = encoder_specs(BaseFamily::Sdxl);
        assert_eq!(xl.len(), 2);
        assert_eq!(xl[1].component, "text_encoder_2");
        assert!(xl.iter().all(|s| s.output == HiddenOutput::Penultimate));

        let refiner = encoder_specs(BaseFamily::SdxlRefiner);
        assert_eq!(refiner.len(), 1);
        assert_eq!((refiner[0].config)().hidden_size, 1280);

        let sd2 = encoder_specs(BaseFamily::Sd2);
        assert!(!sd2[0].pad_with_eos);
        assert_eq!(sd2[0].output, HiddenOutput::Last);
    }

    #[test]
    fn default_scheduler_predicts_velocity_for_sd2() {
        assert_eq!(default_scheduler_config(BaseFamily::Sd2)["prediction_type"], "v_prediction");
        assert_eq!(default_scheduler_config(BaseFamily::Sdxl)["prediction_type"], "epsilon");
    }

    #[test]
    fn single_file_checkpoints_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.safetensors");
        std::fs::write(&file, b"").unwrap();
        let info = ModelInfo {
            name: "model".to_string(),
            kind: ModelKind::Checkpoint,
            base: Some(BaseFamily::Sd1),
            location: ModelLocation::Local { path: file },
        };
        let files = ModelFiles::resolve(&info, dir.path());
        let err = SdPipeline::load(&files, BaseFamily::Sd1, &LoadOptions::default(), dir.path(), &Device::Cpu, DType::F32)
            .err()
            .unwrap();
        assert_matches!(err.downcast::<GenerationError>(), Ok(GenerationError::Configuration(_)));
    }
}
