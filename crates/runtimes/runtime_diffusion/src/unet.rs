//! The conditional UNet and the VAE around it.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::unet_2d::{
    BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig,
};
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use seedalchemy_runtime_api::{AddedConditions, BaseFamily, ControlResiduals, Denoiser, LatentCodec};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

const LATENT_CHANNELS: usize = 4;

fn block(out_channels: usize, use_cross_attn: Option<usize>, attention_head_dim: usize) -> BlockConfig {
    BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim,
    }
}

/// Architecture of each family's UNet, as in the diffusers `unet/config.json`.
pub fn unet_config(family: BaseFamily) -> UNet2DConditionModelConfig {
    let (blocks, cross_attention_dim, use_linear_projection) = match family {
        BaseFamily::Sd1 => (
            vec![block(320, Some(1), 8), block(640, Some(1), 8), block(1280, Some(1), 8), block(1280, None, 8)],
            768,
            false,
        ),
        BaseFamily::Sd2 => (
            vec![block(320, Some(1), 5), block(640, Some(1), 10), block(1280, Some(1), 20), block(1280, None, 20)],
            1024,
            true,
        ),
        BaseFamily::Sdxl => (
            vec![block(320, None, 5), block(640, Some(2), 10), block(1280, Some(10), 20)],
            2048,
            true,
        ),
        BaseFamily::SdxlRefiner => (
            vec![block(384, None, 6), block(768, Some(4), 12), block(1536, Some(4), 24), block(1536, None, 24)],
            1280,
            true,
        ),
    };

    UNet2DConditionModelConfig {
        blocks,
        center_input_sample: false,
        cross_attention_dim,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size: None,
        use_linear_projection,
    }
}

/// UNet rebuilt from an in-memory weight map so LoRA deltas can be applied.
///
/// The candle UNet has no text-time embedding and no residual inputs, so
/// SDXL micro-conditioning is not used and ControlNet residuals are refused.
pub struct SdUnet {
    model: UNet2DConditionModel,
    base: HashMap<String, Tensor>,
    family: BaseFamily,
    in_channels: usize,
    device: Device,
    dtype: DType,
}

impl SdUnet {
    pub fn load(weights: &Path, family: BaseFamily, device: &Device, dtype: DType) -> Result<Self> {
        let base = candle_core::safetensors::load(weights, device)?;
        let in_channels = match base.get("conv_in.weight") {
            Some(conv_in) => conv_in.dims()[1],
            None => bail!("UNet weights in {:?} have no conv_in", weights),
        };
        let model = Self::build(&base, family, in_channels, device, dtype)?;
        debug!("Loaded {} UNet with {} input channels", family, in_channels);

        Ok(Self {
            model,
            base,
            family,
            in_channels,
            device: device.clone(),
            dtype,
        })
    }

    fn build(
        weights: &HashMap<String, Tensor>,
        family: BaseFamily,
        in_channels: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<UNet2DConditionModel> {
        let vb = VarBuilder::from_tensors(weights.clone(), dtype, device);
        Ok(UNet2DConditionModel::new(
            vb,
            in_channels,
            LATENT_CHANNELS,
            false,
            unet_config(family),
        )?)
    }

    pub fn rebuild(&mut self, deltas: &HashMap<String, Tensor>) -> Result<()> {
        let mut weights = self.base.clone();
        for (name, delta) in deltas {
            let Some(weight) = weights.get(name) else {
                bail!("UNet has no weight {}", name);
            };
            let patched = (weight.to_dtype(DType::F32)? + delta.to_dtype(DType::F32)?)?;
            weights.insert(name.clone(), patched);
        }
        self.model = Self::build(&weights, self.family, self.in_channels, &self.device, self.dtype)?;
        Ok(())
    }

    pub fn weight_names(&self) -> Vec<String> {
        self.base.keys().cloned().collect()
    }
}

impl Denoiser for SdUnet {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn forward(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        _added: Option<&AddedConditions>,
        control: Option<&ControlResiduals>,
    ) -> Result<Tensor> {
        if control.is_some() {
            bail!("ControlNet residuals are not supported by the candle UNet");
        }
        let out = self.model.forward(
            &latents.to_dtype(self.dtype)?,
            timestep,
            &encoder_hidden_states.to_dtype(self.dtype)?,
        )?;
        Ok(out.to_dtype(latents.dtype())?)
    }
}

/// KL autoencoder. SDXL weights overflow in half precision, so callers
/// load them in F32.
pub struct VaeCodec {
    vae: AutoEncoderKL,
    scaling_factor: f64,
    dtype: DType,
}

impl VaeCodec {
    pub fn load(weights: &Path, family: BaseFamily, device: &Device, dtype: DType) -> Result<Self> {
        let config = match family {
            BaseFamily::Sd1 => StableDiffusionConfig::v1_5(None, None, None),
            BaseFamily::Sd2 => StableDiffusionConfig::v2_1(None, None, None),
            BaseFamily::Sdxl | BaseFamily::SdxlRefiner => StableDiffusionConfig::sdxl(None, None, None),
        };
        let vae = config.build_vae(weights, device, dtype)?;
        Ok(Self {
            vae,
            scaling_factor: scaling_factor(family),
            dtype,
        })
    }
}

pub fn scaling_factor(family: BaseFamily) -> f64 {
    if family.is_sdxl() {
        0.13025
    } else {
        0.18215
    }
}

impl LatentCodec for VaeCodec {
    fn scaling_factor(&self) -> f64 {
        self.scaling_factor
    }

    fn encode(&self, image: &Tensor) -> Result<Tensor> {
        let dist = self.vae.encode(&image.to_dtype(self.dtype)?)?;
        Ok(dist.sample()?.to_dtype(image.dtype())?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let image = self.vae.decode(&latents.to_dtype(self.dtype)?)?;
        Ok(image.to_dtype(latents.dtype())?)
    }
}
