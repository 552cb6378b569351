//! Per-step preview images.

use anyhow::{bail, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use image::imageops::FilterType;
use image::RgbImage;
use seedalchemy_runtime_api::{BaseFamily, PreviewDecoder};

/// Latent channel to RGB projection for SD 1/2 latents.
const SD_LATENT_RGB: [[f32; 3]; 4] = [
    [0.3444, 0.1385, 0.0670],
    [0.1247, 0.4027, 0.1494],
    [-0.3192, 0.2513, 0.2103],
    [-0.1307, -0.1874, -0.7445],
];

/// Latent channel to RGB projection for SDXL latents.
const SDXL_LATENT_RGB: [[f32; 3]; 4] = [
    [0.3816, 0.4930, 0.5320],
    [-0.3753, 0.1631, 0.1739],
    [0.1770, 0.3588, -0.2048],
    [-0.4350, -0.2644, -0.4289],
];

/// Project the first batch entry of `latents` straight to RGB at latent
/// resolution.
pub fn latent_rgb(latents: &Tensor, family: BaseFamily) -> Result<RgbImage> {
    let factors = if family.is_sdxl() {
        SDXL_LATENT_RGB
    } else {
        SD_LATENT_RGB
    };
    let factors = Tensor::new(&factors, &Device::Cpu)?;

    let sample = latents.i(0)?.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let (channels, height, width) = sample.dims3()?;
    if channels != 4 {
        bail!("Latent preview expects 4 channels, got {}", channels);
    }

    let rgb = sample
        .permute((1, 2, 0))?
        .reshape((height * width, 4))?
        .matmul(&factors)?;
    let pixels = (((rgb + 1.0)? / 2.0)?.clamp(0f32, 1f32)? * 255.0)?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;

    match RgbImage::from_raw(width as u32, height as u32, pixels) {
        Some(image) => Ok(image),
        None => bail!("Error converting latent preview to image buffer"),
    }
}

/// Render a preview at `size`: the latent projection is scaled with
/// nearest-neighbour sampling, a decoder image bilinearly.
pub fn render(
    latents: &Tensor,
    family: BaseFamily,
    decoder: Option<&dyn PreviewDecoder>,
    size: (u32, u32),
) -> Result<RgbImage> {
    let (image, filter) = match decoder {
        Some(decoder) => (decoder.decode(latents)?, FilterType::Triangle),
        None => (latent_rgb(latents, family)?, FilterType::Nearest),
    };
    if image.dimensions() == size {
        return Ok(image);
    }
    Ok(image::imageops::resize(&image, size.0, size.1, filter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_latents_are_mid_grey() {
        let latents = Tensor::zeros((2, 4, 8, 6), DType::F32, &Device::Cpu).unwrap();
        let image = latent_rgb(&latents, BaseFamily::Sd1).unwrap();
        assert_eq!(image.dimensions(), (6, 8));
        assert!(image.pixels().all(|p| p.0 == [127, 127, 127]));
    }

    #[test]
    fn families_use_their_own_factors() {
        let mut values = vec![0f32; 4];
        values[0] = 1.0;
        let latents = Tensor::from_vec(values, (1, 4, 1, 1), &Device::Cpu).unwrap();
        let sd = latent_rgb(&latents, BaseFamily::Sd2).unwrap();
        let xl = latent_rgb(&latents, BaseFamily::SdxlRefiner).unwrap();
        assert_eq!(sd.get_pixel(0, 0).0, [171, 145, 136]);
        assert_eq!(xl.get_pixel(0, 0).0, [176, 190, 195]);
    }

    #[test]
    fn render_scales_to_output_size() {
        let latents = Tensor::zeros((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let image = render(&latents, BaseFamily::Sd1, None, (64, 48)).unwrap();
        assert_eq!(image.dimensions(), (64, 48));
    }

    #[test]
    fn rejects_non_latent_input() {
        let pixels = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(latent_rgb(&pixels, BaseFamily::Sd1).is_err());
    }
}
