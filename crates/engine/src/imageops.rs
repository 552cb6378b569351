//! Conversions between `image` buffers and candle tensors.

use anyhow::{bail, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};

fn rgb_to_chw(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let data = Tensor::from_vec(
        image.as_raw().clone(),
        (height as usize, width as usize, 3),
        &Device::Cpu,
    )?;
    Ok(data
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .unsqueeze(0)?
        .to_device(device)?)
}

/// `[1, 3, H, W]` in `[-1, 1]`.
pub fn rgb_to_tensor(image: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    Ok(rgb_to_chw(image, device)?
        .affine(1.0 / 127.5, -1.0)?
        .to_dtype(dtype)?)
}

/// `[1, 3, H, W]` in `[0, 1]`, the layout ControlNets take.
pub fn rgb_to_unit_tensor(image: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    Ok(rgb_to_chw(image, device)?
        .affine(1.0 / 255.0, 0.0)?
        .to_dtype(dtype)?)
}

/// `[B, 3, H, W]` in `[-1, 1]` to one image per batch entry.
pub fn tensor_to_rgb(images: &Tensor) -> Result<Vec<RgbImage>> {
    let (batch, channels, height, width) = images.dims4()?;
    if channels != 3 {
        bail!("Expected 3 image channels, got {}", channels);
    }
    let pixels = ((images.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
        .round()?
        .to_dtype(DType::U8)?
        .to_device(&Device::Cpu)?;

    let mut out = Vec::with_capacity(batch);
    for i in 0..batch {
        let raw = pixels.i(i)?.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
        match RgbImage::from_raw(width as u32, height as u32, raw) {
            Some(image) => out.push(image),
            None => bail!("Error converting tensor to image buffer"),
        }
    }
    Ok(out)
}

/// `[1, 1, H, W]` with 1 where the mask asks for regeneration.
pub fn mask_to_tensor(mask: &GrayImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = mask.dimensions();
    let values: Vec<f32> = mask
        .as_raw()
        .iter()
        .map(|&v| if v >= 128 { 1.0 } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(values, (1, 1, height as usize, width as usize), &Device::Cpu)?
        .to_device(device)?
        .to_dtype(dtype)?)
}

pub fn resize_rgb(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    image::imageops::resize(image, width, height, FilterType::Lanczos3)
}

pub fn resize_gray(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    image::imageops::resize(image, width, height, FilterType::Lanczos3)
}

/// `base·(1 - alpha) + overlay·alpha`; `overlay` is resized to `base` first.
pub fn blend(base: &RgbImage, overlay: &RgbImage, alpha: f64) -> RgbImage {
    let overlay = resize_rgb(overlay, base.width(), base.height());
    let alpha = alpha.clamp(0.0, 1.0) as f32;
    let mut out = base.clone();
    for (dst, src) in out.pixels_mut().zip(overlay.pixels()) {
        for c in 0..3 {
            let mixed = dst.0[c] as f32 * (1.0 - alpha) + src.0[c] as f32 * alpha;
            dst.0[c] = mixed.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}
