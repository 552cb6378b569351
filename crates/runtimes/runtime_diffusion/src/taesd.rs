//! Tiny autoencoder decoder (TAESD / TAESDXL) for step previews.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};
use image::RgbImage;
use seedalchemy_runtime_api::{BaseFamily, PreviewDecoder};
use std::path::Path;

use crate::convert;

const CHANNELS: usize = 64;

pub fn repo_id(family: BaseFamily) -> &'static str {
    if family.is_sdxl() {
        "madebyollin/taesdxl"
    } else {
        "madebyollin/taesd"
    }
}

struct Block {
    convs: [Conv2d; 3],
}

impl Block {
    fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let conv = |i: usize| candle_nn::conv2d(CHANNELS, CHANNELS, 3, padded(), vb.pp(format!("conv.{i}")));
        Ok(Self {
            convs: [conv(0)?, conv(2)?, conv(4)?],
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.convs[0].forward(xs)?.relu()?;
        let h = self.convs[1].forward(&h)?.relu()?;
        let h = self.convs[2].forward(&h)?;
        (h + xs)?.relu()
    }
}

enum Layer {
    Conv(Conv2d),
    Relu,
    Block(Block),
    Upsample,
}

fn padded() -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        ..Default::default()
    }
}

pub struct TinyDecoder {
    layers: Vec<Layer>,
    dtype: DType,
}

impl TinyDecoder {
    pub fn load(weights: &Path, device: &Device, dtype: DType) -> Result<Self> {
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
        Self::new(vb.pp("decoder.layers"), dtype)
    }

    /// Layers indexed like the diffusers `DecoderTiny` sequential.
    fn new(vb: VarBuilder, dtype: DType) -> Result<Self> {
        let mut layers = Vec::new();
        let mut index = 0usize;
        let mut next = || {
            index += 1;
            index - 1
        };

        layers.push(Layer::Conv(candle_nn::conv2d(4, CHANNELS, 3, padded(), vb.pp(next().to_string()))?));
        layers.push(Layer::Relu);
        next();
        for (stage, blocks) in [3usize, 3, 3, 1].into_iter().enumerate() {
            for _ in 0..blocks {
                layers.push(Layer::Block(Block::new(vb.pp(next().to_string()))?));
            }
            if stage < 3 {
                layers.push(Layer::Upsample);
                next();
                let conv = candle_nn::conv2d_no_bias(CHANNELS, CHANNELS, 3, padded(), vb.pp(next().to_string()))?;
                layers.push(Layer::Conv(conv));
            } else {
                let conv = candle_nn::conv2d(CHANNELS, 3, 3, padded(), vb.pp(next().to_string()))?;
                layers.push(Layer::Conv(conv));
            }
        }

        Ok(Self { layers, dtype })
    }

    /// `[1, 4, h, w]` scaled latents to `[1, 3, 8h, 8w]` in `[0, 1]`.
    fn forward(&self, latents: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = ((latents / 3.0)?.tanh()? * 3.0)?;
        for layer in &self.layers {
            xs = match layer {
                Layer::Conv(conv) => conv.forward(&xs)?,
                Layer::Relu => xs.relu()?,
                Layer::Block(block) => block.forward(&xs)?,
                Layer::Upsample => {
                    let (_, _, h, w) = xs.dims4()?;
                    xs.upsample_nearest2d(h * 2, w * 2)?
                }
            };
        }
        Ok(xs)
    }
}

impl PreviewDecoder for TinyDecoder {
    fn decode(&self, latents: &Tensor) -> Result<RgbImage> {
        let first = latents.i(0..1)?.to_dtype(self.dtype)?;
        convert::unit_to_rgb(&self.forward(&first)?)
    }
}
