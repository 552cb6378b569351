//! Classical control-image preprocessors.
//!
//! Every detector first resizes the input so its short side matches the
//! detect resolution, rounded to a multiple of 64.

use anyhow::Result;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma, Rgb, Rgb32FImage, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use seedalchemy_runtime_api::{Preprocessor, ProcessorClass};
use std::collections::BTreeMap;

/// The fixed-filter detector for `class`; neural detectors have none here.
pub fn new(class: ProcessorClass) -> Option<Box<dyn Preprocessor>> {
    let preprocessor: Box<dyn Preprocessor> = match class {
        ProcessorClass::Canny => Box::new(Canny),
        ProcessorClass::ScribbleXdog => Box::new(ScribbleXdog),
        ProcessorClass::ContentShuffle => Box::new(ContentShuffle),
        ProcessorClass::Invert => Box::new(Invert),
        _ => return None,
    };
    Some(preprocessor)
}

fn param(params: &BTreeMap<String, f64>, name: &str, default: f64) -> f64 {
    params.get(name).copied().unwrap_or(default)
}

fn resize_for_detection(image: &DynamicImage, resolution: u32) -> RgbImage {
    let image = image.to_rgb8();
    let (width, height) = image.dimensions();
    let k = resolution as f64 / width.min(height).max(1) as f64;
    let round64 = |v: u32| (((v as f64 * k) / 64.0).round() as u32 * 64).max(64);
    let (w, h) = (round64(width), round64(height));
    if (w, h) == (width, height) {
        return image;
    }
    let filter = if k > 1.0 { FilterType::Lanczos3 } else { FilterType::Triangle };
    image::imageops::resize(&image, w, h, filter)
}

fn luma(image: &RgbImage) -> GrayImage {
    DynamicImage::ImageRgb8(image.clone()).to_luma8()
}

fn gray_to_rgb(image: &GrayImage) -> DynamicImage {
    DynamicImage::ImageLuma8(image.clone()).to_rgb8().into()
}

/// Canny edge detector: 3×3 Sobel gradients with L1 magnitude, non-maximum
/// suppression and hysteresis between `low` and `high`.
pub struct Canny;

pub fn canny(image: &GrayImage, low: f64, high: f64) -> GrayImage {
    let (width, height) = image.dimensions();
    let (w, h) = (width as i64, height as i64);
    let at = |x: i64, y: i64| image.get_pixel(x.clamp(0, w - 1) as u32, y.clamp(0, h - 1) as u32)[0] as i32;

    let mut gx = vec![0i32; (w * h) as usize];
    let mut gy = vec![0i32; (w * h) as usize];
    let mut magnitude = vec![0f64; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) as usize;
            gx[i] = (at(x + 1, y - 1) + 2 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2 * at(x - 1, y) + at(x - 1, y + 1));
            gy[i] = (at(x - 1, y + 1) + 2 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2 * at(x, y - 1) + at(x + 1, y - 1));
            magnitude[i] = (gx[i].abs() + gy[i].abs()) as f64;
        }
    }

    let mag = |x: i64, y: i64| {
        if x < 0 || y < 0 || x >= w || y >= h {
            0.0
        } else {
            magnitude[(y * w + x) as usize]
        }
    };

    // 0 none, 1 weak, 2 strong
    let mut state = vec![0u8; (w * h) as usize];
    let mut stack = Vec::new();
    let tan22 = 22.5f64.to_radians().tan();
    let tan67 = 67.5f64.to_radians().tan();
    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) as usize;
            let m = magnitude[i];
            if m <= low {
                continue;
            }
            let (dx, dy) = (gx[i] as f64, gy[i] as f64);
            let (ax, ay) = (dx.abs(), dy.abs());
            let (n1, n2) = if ay <= ax * tan22 {
                (mag(x - 1, y), mag(x + 1, y))
            } else if ay >= ax * tan67 {
                (mag(x, y - 1), mag(x, y + 1))
            } else if (dx > 0.0) == (dy > 0.0) {
                (mag(x - 1, y - 1), mag(x + 1, y + 1))
            } else {
                (mag(x + 1, y - 1), mag(x - 1, y + 1))
            };
            if m < n1 || m < n2 {
                continue;
            }
            if m > high {
                state[i] = 2;
                stack.push((x, y));
            } else {
                state[i] = 1;
            }
        }
    }

    while let Some((x, y)) = stack.pop() {
        for (nx, ny) in [(-1, -1), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1)] {
            let (px, py) = (x + nx, y + ny);
            if px < 0 || py < 0 || px >= w || py >= h {
                continue;
            }
            let j = (py * w + px) as usize;
            if state[j] == 1 {
                state[j] = 2;
                stack.push((px, py));
            }
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        let i = (y as i64 * w + x as i64) as usize;
        Luma([if state[i] == 2 { 255 } else { 0 }])
    })
}

impl Preprocessor for Canny {
    fn process(
        &mut self,
        image: &DynamicImage,
        detect_resolution: u32,
        params: &BTreeMap<String, f64>,
    ) -> Result<DynamicImage> {
        let image = resize_for_detection(image, detect_resolution);
        let edges = canny(&luma(&image), param(params, "low", 100.0), param(params, "high", 200.0));
        Ok(gray_to_rgb(&edges))
    }
}

/// Difference-of-Gaussians scribbles; pixels whose darkening exceeds
/// `threshold` become white lines.
pub struct ScribbleXdog;

pub fn xdog(image: &RgbImage, threshold: f64) -> GrayImage {
    let float: Rgb32FImage = DynamicImage::ImageRgb8(image.clone()).to_rgb32f();
    let fine = image::imageops::blur(&float, 0.5);
    let coarse = image::imageops::blur(&float, 5.0);

    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let (f, c) = (fine.get_pixel(x, y), coarse.get_pixel(x, y));
        let darkening = (0..3).map(|k| (c[k] - f[k]) * 255.0).fold(f32::INFINITY, f32::min);
        let dog = (255.0 - darkening).clamp(0.0, 255.0).floor();
        Luma([if 2.0 * (255.0 - dog as f64) > threshold { 255 } else { 0 }])
    })
}

impl Preprocessor for ScribbleXdog {
    fn process(
        &mut self,
        image: &DynamicImage,
        detect_resolution: u32,
        params: &BTreeMap<String, f64>,
    ) -> Result<DynamicImage> {
        let image = resize_for_detection(image, detect_resolution);
        Ok(gray_to_rgb(&xdog(&image, param(params, "threshold", 32.0))))
    }
}

/// Warps the image along a smooth random flow field so content is kept
/// but layout is lost.
pub struct ContentShuffle;

/// Smooth noise in `[0, 1]`: a coarse random grid every `f` pixels,
/// bilinearly upsampled and normalised.
fn noise_disk(rng: &mut StdRng, width: u32, height: u32, f: u32) -> Vec<f32> {
    let (gw, gh) = ((width / f + 2) as usize, (height / f + 2) as usize);
    let grid: Vec<f32> = (0..gw * gh).map(|_| rng.gen::<f32>()).collect();
    let (fw, fh) = ((width + 2 * f) as f32, (height + 2 * f) as f32);

    let mut noise = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let cx = (((x + f) as f32 + 0.5) * gw as f32 / fw - 0.5).clamp(0.0, (gw - 1) as f32);
            let cy = (((y + f) as f32 + 0.5) * gh as f32 / fh - 0.5).clamp(0.0, (gh - 1) as f32);
            let (x0, y0) = (cx.floor() as usize, cy.floor() as usize);
            let (x1, y1) = ((x0 + 1).min(gw - 1), (y0 + 1).min(gh - 1));
            let (tx, ty) = (cx - x0 as f32, cy - y0 as f32);
            let top = grid[y0 * gw + x0] * (1.0 - tx) + grid[y0 * gw + x1] * tx;
            let bottom = grid[y1 * gw + x0] * (1.0 - tx) + grid[y1 * gw + x1] * tx;
            noise.push(top * (1.0 - ty) + bottom * ty);
        }
    }

    let min = noise.iter().copied().fold(f32::INFINITY, f32::min);
    let max = noise.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = (max - min).max(f32::EPSILON);
    noise.iter().map(|v| (v - min) / range).collect()
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = image.dimensions();
    let x = x.clamp(0.0, (w - 1) as f32);
    let y = y.clamp(0.0, (h - 1) as f32);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (tx, ty) = (x - x0 as f32, y - y0 as f32);

    let mut out = [0u8; 3];
    for (k, value) in out.iter_mut().enumerate() {
        let p = |px: u32, py: u32| image.get_pixel(px, py)[k] as f32;
        let top = p(x0, y0) * (1.0 - tx) + p(x1, y0) * tx;
        let bottom = p(x0, y1) * (1.0 - tx) + p(x1, y1) * tx;
        *value = (top * (1.0 - ty) + bottom * ty).round() as u8;
    }
    Rgb(out)
}

pub fn shuffle(image: &RgbImage, seed: u64) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut rng = StdRng::seed_from_u64(seed);
    let fx = noise_disk(&mut rng, width, height, 256);
    let fy = noise_disk(&mut rng, width, height, 256);

    RgbImage::from_fn(width, height, |x, y| {
        let i = (y * width + x) as usize;
        sample_bilinear(image, fx[i] * (width - 1) as f32, fy[i] * (height - 1) as f32)
    })
}

impl Preprocessor for ContentShuffle {
    fn process(
        &mut self,
        image: &DynamicImage,
        detect_resolution: u32,
        params: &BTreeMap<String, f64>,
    ) -> Result<DynamicImage> {
        let image = resize_for_detection(image, detect_resolution);
        let seed = param(params, "seed", 0.0).max(0.0) as u64;
        Ok(shuffle(&image, seed).into())
    }
}

pub struct Invert;

impl Preprocessor for Invert {
    fn process(
        &mut self,
        image: &DynamicImage,
        detect_resolution: u32,
        _params: &BTreeMap<String, f64>,
    ) -> Result<DynamicImage> {
        let mut image = resize_for_detection(image, detect_resolution);
        image::imageops::invert(&mut image);
        Ok(image.into())
    }
}
