//! Real-ESRGAN general x4v3 (SRVGGNetCompact) upscaler.
//!
//! The denoising strength `s` selects `s · wdn + (1 − s) · regular`
//! weights; at 1 the `wdn` variant is used alone.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};
use image::imageops::FilterType;
use image::RgbImage;
use seedalchemy_runtime_api::Upscaler;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::convert;

pub const WEIGHTS: &str = "realesr-general-x4v3.pth";
pub const DENOISE_WEIGHTS: &str = "realesr-general-wdn-x4v3.pth";

const FEATURES: usize = 64;
const BODY_CONVS: usize = 32;
const SCALE: usize = 4;

fn read_params(path: &Path) -> Result<HashMap<String, Tensor>> {
    let tensors = candle_core::pickle::read_all_with_key(path, Some("params"))?;
    Ok(tensors.into_iter().collect())
}

/// `s · denoise + (1 − s) · regular`, key by key.
fn blend_weights(
    denoise: &HashMap<String, Tensor>,
    regular: &HashMap<String, Tensor>,
    strength: f64,
) -> Result<HashMap<String, Tensor>> {
    let mut blended = HashMap::with_capacity(regular.len());
    for (name, weight) in regular {
        let Some(other) = denoise.get(name) else {
            bail!("Denoising weights have no {}", name);
        };
        let mixed = ((other.to_dtype(DType::F32)? * strength)? + (weight.to_dtype(DType::F32)? * (1.0 - strength))?)?;
        blended.insert(name.clone(), mixed);
    }
    Ok(blended)
}

pub struct CompactEsrgan {
    convs: Vec<Conv2d>,
    /// Per-channel PReLU slopes, shaped `[1, C, 1, 1]`
    slopes: Vec<Tensor>,
    device: Device,
    dtype: DType,
}

impl CompactEsrgan {
    pub fn load(dir: &Path, denoising: f64, device: &Device, dtype: DType) -> Result<Self> {
        let denoise = read_params(&dir.join(DENOISE_WEIGHTS))?;
        let weights = if denoising < 1.0 {
            let regular = read_params(&dir.join(WEIGHTS))?;
            blend_weights(&denoise, &regular, denoising)?
        } else {
            denoise
        };
        debug!("Loaded Real-ESRGAN with denoising {}", denoising);
        Self::new(VarBuilder::from_tensors(weights, dtype, device), device, dtype)
    }

    fn new(vb: VarBuilder, device: &Device, dtype: DType) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let body = vb.pp("body");

        let mut convs = Vec::with_capacity(BODY_CONVS + 2);
        let mut slopes = Vec::with_capacity(BODY_CONVS + 1);
        let mut index = 0usize;
        convs.push(candle_nn::conv2d(3, FEATURES, 3, config, body.pp(index))?);
        for _ in 0..=BODY_CONVS {
            index += 1;
            slopes.push(body.pp(index).get(FEATURES, "weight")?.reshape((1, FEATURES, 1, 1))?);
            index += 1;
            let out = if convs.len() == BODY_CONVS + 1 { 3 * SCALE * SCALE } else { FEATURES };
            convs.push(candle_nn::conv2d(FEATURES, out, 3, config, body.pp(index))?);
        }

        Ok(Self {
            convs,
            slopes,
            device: device.clone(),
            dtype,
        })
    }

    /// `[1, 3, H, W]` in `[0, 1]` to `[1, 3, 4H, 4W]`.
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut out = xs.clone();
        for (i, conv) in self.convs.iter().enumerate() {
            out = conv.forward(&out)?;
            if let Some(slope) = self.slopes.get(i) {
                out = (out.relu()? + out.minimum(0.0)?.broadcast_mul(slope)?)?;
            }
        }
        let out = candle_nn::ops::pixel_shuffle(&out, SCALE)?;
        let (_, _, h, w) = xs.dims4()?;
        out + xs.upsample_nearest2d(h * SCALE, w * SCALE)?
    }
}

impl Upscaler for CompactEsrgan {
    fn upscale(&self, image: &RgbImage, factor: u32) -> Result<RgbImage> {
        let input = convert::rgb_to_unit(image, &self.device, self.dtype)?;
        let output = convert::unit_to_rgb(&self.forward(&input)?)?;

        let (width, height) = image.dimensions();
        if factor as usize == SCALE {
            return Ok(output);
        }
        Ok(image::imageops::resize(&output, width * factor, height * factor, FilterType::Lanczos3))
    }
}
