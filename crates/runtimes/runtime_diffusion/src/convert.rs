//! Bitmap and tensor conversion for the pixel-space networks.

use anyhow::{bail, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use image::RgbImage;

/// `[1, 3, H, W]` in `[0, 1]`.
pub fn rgb_to_unit(image: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let tensor = Tensor::from_vec(image.as_raw().clone(), (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?
        .to_dtype(DType::F32)?;
    Ok((tensor / 255.0)?.to_dtype(dtype)?)
}

/// First batch entry of a `[B, 3, H, W]` tensor in `[0, 1]`.
pub fn unit_to_rgb(tensor: &Tensor) -> Result<RgbImage> {
    let (_, channels, height, width) = tensor.dims4()?;
    if channels != 3 {
        bail!("Expected 3 image channels, got {}", channels);
    }
    let raw = (tensor.i(0)?.to_dtype(DType::F32)?.clamp(0f32, 1f32)? * 255.0)?
        .round()?
        .to_dtype(DType::U8)?
        .to_device(&Device::Cpu)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| anyhow::anyhow!("Error converting tensor to image buffer"))
}
