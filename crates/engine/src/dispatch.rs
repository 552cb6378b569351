//! A single sampling loop covering every pipeline shape.
//!
//! A [`Pass`] describes one invocation: where the latents start, which part
//! of the schedule runs, whether a mask or ControlNets steer it, and what it
//! returns. [`run`] projects that onto the loaded model's encoders and
//! denoiser.

use std::fmt;

use anyhow::{bail, Result};
use candle_core::{DType, IndexOp, Tensor};
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use seedalchemy_core::GenerationError;
use seedalchemy_runtime_api::{AddedConditions, BaseFamily, ControlNet, ControlResiduals, PipelineModel, StepControl};
use tracing::debug;

use crate::imageops;
use crate::noise::SeededNoise;
use crate::prompt::{self, PromptEmbeddings};
use crate::schedulers::Scheduler;

/// Aesthetic scores the refiner is conditioned on.
const POSITIVE_AESTHETIC_SCORE: f64 = 6.0;
const NEGATIVE_AESTHETIC_SCORE: f64 = 2.5;

/// Latent channels of every supported autoencoder.
const LATENT_CHANNELS: usize = 4;

/// Where the latents of a pass come from.
pub enum Start {
    /// Pure noise at the scheduler's initial sigma.
    Noise,
    /// Images encoded by the pass; one per batch entry, or one for all.
    Images(Vec<RgbImage>),
    /// Scaled latents from an earlier pass.
    Latents(Tensor),
}

/// The part of the schedule a pass runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    /// Run the last `floor(steps · strength)` timesteps, noising the start
    /// latents to the first of them. `None` runs every timestep.
    pub strength: Option<f64>,
    /// Run only timesteps below this fraction of the training schedule,
    /// continuing the given latents without adding noise unless the window
    /// opens the strength tail.
    pub denoising_start: Option<f64>,
    /// Stop once this fraction of the training schedule is reached.
    pub denoising_end: Option<f64>,
    pub train_timesteps: usize,
}

impl Window {
    pub fn full() -> Self {
        Self {
            strength: None,
            denoising_start: None,
            denoising_end: None,
            train_timesteps: 1000,
        }
    }

    pub fn strength(strength: f64) -> Self {
        Self {
            strength: Some(strength),
            ..Self::full()
        }
    }

    pub fn ending_at(self, fraction: f64, train_timesteps: usize) -> Self {
        Self {
            denoising_end: Some(fraction),
            train_timesteps,
            ..self
        }
    }

    pub fn starting_at(fraction: f64, train_timesteps: usize) -> Self {
        Self {
            denoising_start: Some(fraction),
            train_timesteps,
            ..Self::full()
        }
    }

    pub fn with_strength(self, strength: Option<f64>) -> Self {
        Self { strength, ..self }
    }

    fn cutoff(&self, fraction: f64) -> f64 {
        let train = self.train_timesteps as f64;
        (train - fraction * train).round()
    }

    /// First index of the strength tail of `steps` timesteps.
    fn tail_start(&self, steps: usize) -> usize {
        match self.strength {
            Some(strength) => steps - ((steps as f64 * strength.clamp(0.0, 1.0)) as usize).min(steps),
            None => 0,
        }
    }

    /// Whether a window that continues earlier latents still owns the first
    /// step of the strength tail, so nothing has noised the source yet.
    fn opens_tail(&self, steps: usize, indices: &[usize]) -> bool {
        self.strength.is_some() && indices.first() == Some(&self.tail_start(steps))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Latents,
    Images,
}

pub enum PassOutput {
    /// Scaled latents, `[B, 4, H/8, W/8]`.
    Latents(Tensor),
    Images(Vec<RgbImage>),
}

/// One ControlNet with its conditioning image and span.
pub struct ControlInput<'a> {
    pub net: &'a dyn ControlNet,
    pub image: &'a RgbImage,
    pub scale: f64,
    pub guidance_start: f64,
    pub guidance_end: f64,
}

pub struct Pass<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub batch: usize,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub start: Start,
    pub window: Window,
    pub mask: Option<&'a GrayImage>,
    pub controls: Vec<ControlInput<'a>>,
    pub output: Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    TextToImage,
    ImageToImage,
    Inpaint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guidance {
    None,
    SingleControlNet,
    MultiControlNet,
}

/// The concrete pipeline a pass amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub family: BaseFamily,
    pub mode: Mode,
    pub guidance: Guidance,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            Mode::TextToImage => "txt2img",
            Mode::ImageToImage => "img2img",
            Mode::Inpaint => "inpaint",
        };
        write!(f, "{} {}", self.family, mode)?;
        match self.guidance {
            Guidance::None => Ok(()),
            Guidance::SingleControlNet => write!(f, " + controlnet"),
            Guidance::MultiControlNet => write!(f, " + multi-controlnet"),
        }
    }
}

impl Pass<'_> {
    pub fn shape(&self, family: BaseFamily) -> Shape {
        let mode = match (&self.start, self.mask) {
            (Start::Noise, _) => Mode::TextToImage,
            (_, Some(_)) => Mode::Inpaint,
            _ => Mode::ImageToImage,
        };
        let guidance = match self.controls.len() {
            0 => Guidance::None,
            1 => Guidance::SingleControlNet,
            _ => Guidance::MultiControlNet,
        };
        Shape { family, mode, guidance }
    }
}

/// Indices into `timesteps` the window runs.
pub fn select_indices(timesteps: &[f64], window: Window) -> Vec<usize> {
    let steps = timesteps.len();
    let mut indices: Vec<usize> = (window.tail_start(steps)..steps).collect();
    if let Some(start) = window.denoising_start {
        let cutoff = window.cutoff(start);
        indices.retain(|&i| timesteps[i] < cutoff);
    }
    if let Some(end) = window.denoising_end {
        let cutoff = window.cutoff(end);
        indices.retain(|&i| timesteps[i] >= cutoff);
    }
    indices
}

/// Whether a ControlNet spanning `[start, end]` applies at position `i` of
/// `len` steps.
fn control_active(i: usize, len: usize, start: f64, end: f64) -> bool {
    let len = len.max(1) as f64;
    !((i as f64) / len < start || (i as f64 + 1.0) / len > end)
}

fn encode_images(
    model: &dyn PipelineModel,
    images: &[RgbImage],
    width: u32,
    height: u32,
    batch: usize,
) -> Result<Tensor> {
    let codec = model.codec();
    let mut latents = Vec::with_capacity(images.len());
    for image in images {
        let image = imageops::resize_rgb(image, width, height);
        let pixels = imageops::rgb_to_tensor(&image, model.device(), model.dtype())?;
        let encoded = (codec.encode(&pixels)?.to_dtype(DType::F32)? * codec.scaling_factor())?;
        latents.push(encoded);
    }
    let latents = Tensor::cat(&latents, 0)?;
    match latents.dim(0)? {
        n if n == batch => Ok(latents),
        1 => Ok(latents.repeat((batch, 1, 1, 1))?),
        n => bail!("{} start images for a batch of {}", n, batch),
    }
}

fn decode_latents(model: &dyn PipelineModel, latents: &Tensor) -> Result<Vec<RgbImage>> {
    let codec = model.codec();
    let latents = (latents / codec.scaling_factor())?.to_dtype(model.dtype())?;
    imageops::tensor_to_rgb(&codec.decode(&latents)?)
}

/// Hidden states and SDXL conditions for a CFG batch of `[uncond, cond]`.
fn conditioning(
    model: &dyn PipelineModel,
    embeddings: &PromptEmbeddings,
    batch: usize,
    guided: bool,
    width: u32,
    height: u32,
) -> Result<(Tensor, Option<AddedConditions>)> {
    let dtype = model.dtype();
    let repeat = |t: &Tensor| -> Result<Tensor> {
        let dims = t.dims().len();
        let mut shape = vec![1usize; dims];
        shape[0] = batch;
        Ok(t.repeat(shape)?.to_dtype(dtype)?)
    };

    let cond = repeat(&embeddings.cond)?;
    let hidden = if guided {
        Tensor::cat(&[&repeat(&embeddings.uncond)?, &cond], 0)?
    } else {
        cond
    };

    let family = model.family();
    if !family.is_sdxl() {
        return Ok((hidden, None));
    }

    let (Some(pooled_cond), Some(pooled_uncond)) = (&embeddings.pooled_cond, &embeddings.pooled_uncond) else {
        bail!("SDXL text encoder produced no pooled embeddings");
    };
    let (h, w) = (height as f64, width as f64);
    let time_ids = |aesthetic: f64| -> Vec<f64> {
        if family == BaseFamily::SdxlRefiner {
            vec![h, w, 0.0, 0.0, aesthetic]
        } else {
            vec![h, w, 0.0, 0.0, h, w]
        }
    };
    let row = |values: Vec<f64>| -> Result<Tensor> {
        let values: Vec<f32> = values.into_iter().map(|v| v as f32).collect();
        let len = values.len();
        Ok(Tensor::from_vec(values, (1, len), model.device())?.to_dtype(dtype)?)
    };

    let cond_ids = repeat(&row(time_ids(POSITIVE_AESTHETIC_SCORE))?)?;
    let cond_pooled = repeat(pooled_cond)?;
    let (text_embeds, time_ids) = if guided {
        let uncond_ids = repeat(&row(time_ids(NEGATIVE_AESTHETIC_SCORE))?)?;
        (
            Tensor::cat(&[&repeat(pooled_uncond)?, &cond_pooled], 0)?,
            Tensor::cat(&[&uncond_ids, &cond_ids], 0)?,
        )
    } else {
        (cond_pooled, cond_ids)
    };
    Ok((hidden, Some(AddedConditions { text_embeds, time_ids })))
}

/// Mask and masked-image latents for inpainting.
struct InpaintInputs {
    /// `[B, 1, H/8, W/8]`, 1 where the pass regenerates.
    mask: Tensor,
    masked_latents: Tensor,
    /// Clean latents of the source, for re-imposing the kept region.
    source_latents: Tensor,
}

fn inpaint_inputs(
    model: &dyn PipelineModel,
    mask: &GrayImage,
    source: &[RgbImage],
    source_latents: &Tensor,
    pass: &Pass<'_>,
) -> Result<InpaintInputs> {
    let (width, height) = (pass.width, pass.height);
    let device = model.device();

    let pixel_mask = imageops::resize_gray(mask, width, height);
    let pixel_mask = imageops::mask_to_tensor(&pixel_mask, device, DType::F32)?;
    let keep = pixel_mask.affine(-1.0, 1.0)?;

    let mut masked = Vec::with_capacity(source.len());
    for image in source {
        let image = imageops::resize_rgb(image, width, height);
        let pixels = imageops::rgb_to_tensor(&image, device, DType::F32)?;
        masked.push(pixels.broadcast_mul(&keep)?.to_dtype(model.dtype())?);
    }
    let codec = model.codec();
    let mut masked_latents = Vec::with_capacity(masked.len());
    for pixels in &masked {
        masked_latents.push((codec.encode(pixels)?.to_dtype(DType::F32)? * codec.scaling_factor())?);
    }
    let mut masked_latents = Tensor::cat(&masked_latents, 0)?;
    if masked_latents.dim(0)? == 1 && pass.batch > 1 {
        masked_latents = masked_latents.repeat((pass.batch, 1, 1, 1))?;
    }

    let latent_mask = image::imageops::resize(mask, width / 8, height / 8, FilterType::Nearest);
    let latent_mask = imageops::mask_to_tensor(&latent_mask, device, DType::F32)?.repeat((pass.batch, 1, 1, 1))?;

    Ok(InpaintInputs {
        mask: latent_mask,
        masked_latents,
        source_latents: source_latents.clone(),
    })
}

#[allow(clippy::too_many_arguments)]
fn sum_residuals(
    pass: &Pass<'_>,
    position: usize,
    len: usize,
    model_input: &Tensor,
    timestep: f64,
    hidden: &Tensor,
    control_images: &[Tensor],
    added: Option<&AddedConditions>,
) -> Result<Option<ControlResiduals>> {
    let mut total: Option<ControlResiduals> = None;
    for (control, image) in pass.controls.iter().zip(control_images) {
        if !control_active(position, len, control.guidance_start, control.guidance_end) {
            continue;
        }
        let residuals = control
            .net
            .forward(model_input, timestep, hidden, image, control.scale, added)?;
        total = Some(match total {
            Some(sum) => sum.add(&residuals)?,
            None => residuals,
        });
    }
    Ok(total)
}

/// Run one pass. The callback sees every step's latents and may cancel,
/// which surfaces as [`GenerationError::Cancelled`].
pub fn run(
    model: &dyn PipelineModel,
    mut scheduler: Box<dyn Scheduler>,
    pass: Pass<'_>,
    noise: &mut SeededNoise,
    callback: &mut dyn FnMut(usize, f64, &Tensor) -> StepControl,
) -> Result<PassOutput> {
    if pass.batch == 0 {
        bail!("Pass with an empty batch");
    }
    let shape = pass.shape(model.family());
    let device = model.device().clone();
    let dtype = model.dtype();
    let denoiser = model.denoiser();

    // Encoding
    let encoders = model.text_encoders();
    let embeddings = prompt::encode_pair(&encoders, pass.prompt, pass.negative_prompt)?;
    let guided = pass.cfg_scale > 1.0;
    let (hidden, added) = conditioning(model, &embeddings, pass.batch, guided, pass.width, pass.height)?;

    // Schedule
    let timesteps = scheduler.timesteps().to_vec();
    let indices = select_indices(&timesteps, pass.window);
    debug!(
        "Running {} for {} of {} steps at {}x{}",
        shape,
        indices.len(),
        timesteps.len(),
        pass.width,
        pass.height
    );

    // Latents
    let latent_shape = [
        pass.batch,
        LATENT_CHANNELS,
        (pass.height / 8) as usize,
        (pass.width / 8) as usize,
    ];
    let source_images = match &pass.start {
        Start::Images(images) => Some(images.as_slice()),
        _ => None,
    };
    let source_latents = match &pass.start {
        Start::Noise => None,
        Start::Images(images) => Some(encode_images(model, images, pass.width, pass.height, pass.batch)?),
        Start::Latents(latents) => {
            let latents = latents.to_device(&device)?.to_dtype(DType::F32)?;
            Some(match latents.dim(0)? {
                n if n == pass.batch => latents,
                1 => latents.repeat((pass.batch, 1, 1, 1))?,
                n => bail!("{} start latents for a batch of {}", n, pass.batch),
            })
        }
    };

    let mut initial_noise = None;
    let window = pass.window;
    let continues = window.denoising_start.is_some() && !window.opens_tail(timesteps.len(), &indices);
    let mut latents = match &source_latents {
        None => {
            let sampled = noise.randn(&latent_shape, &device, DType::F32)?;
            (&sampled * scheduler.init_noise_sigma())?
        }
        Some(clean) if continues => clean.clone(),
        Some(clean) if window.strength.map_or(false, |s| s >= 1.0) => {
            let sampled = noise.randn_like(clean)?;
            let noised = (&sampled * scheduler.init_noise_sigma())?;
            initial_noise = Some(sampled);
            noised
        }
        Some(clean) => match indices.first() {
            Some(&first) => {
                let sampled = noise.randn_like(clean)?;
                let noised = scheduler.add_noise(clean, &sampled, first)?;
                initial_noise = Some(sampled);
                noised
            }
            None => clean.clone(),
        },
    };

    let inpaint = match (pass.mask, source_images, &source_latents) {
        (Some(mask), Some(images), Some(clean)) => Some(inpaint_inputs(model, mask, images, clean, &pass)?),
        (Some(_), _, _) => bail!("Inpainting needs a source image"),
        _ => None,
    };
    let concat_inpaint = denoiser.in_channels() == 2 * LATENT_CHANNELS + 1;
    if pass.mask.is_some() && !concat_inpaint && denoiser.in_channels() != LATENT_CHANNELS {
        bail!("Denoiser takes {} channels", denoiser.in_channels());
    }

    let control_images = pass
        .controls
        .iter()
        .map(|control| {
            let image = imageops::resize_rgb(control.image, pass.width, pass.height);
            let tensor = imageops::rgb_to_unit_tensor(&image, &device, dtype)?;
            let copies = if guided { 2 * pass.batch } else { pass.batch };
            Ok(tensor.repeat((copies, 1, 1, 1))?)
        })
        .collect::<Result<Vec<_>>>()?;

    // Denoising
    let len = indices.len();
    for (position, &index) in indices.iter().enumerate() {
        let timestep = timesteps[index];

        let doubled = if guided {
            Tensor::cat(&[&latents, &latents], 0)?
        } else {
            latents.clone()
        };
        let mut model_input = scheduler.scale_model_input(doubled, index)?;
        if let (Some(inputs), true) = (&inpaint, concat_inpaint) {
            let (mask, masked) = if guided {
                (
                    Tensor::cat(&[&inputs.mask, &inputs.mask], 0)?,
                    Tensor::cat(&[&inputs.masked_latents, &inputs.masked_latents], 0)?,
                )
            } else {
                (inputs.mask.clone(), inputs.masked_latents.clone())
            };
            model_input = Tensor::cat(&[&model_input, &mask, &masked], 1)?;
        }
        let model_input = model_input.to_dtype(dtype)?;

        let residuals = sum_residuals(
            &pass,
            position,
            len,
            &model_input,
            timestep,
            &hidden,
            &control_images,
            added.as_ref(),
        )?;
        let prediction = denoiser
            .forward(&model_input, timestep, &hidden, added.as_ref(), residuals.as_ref())?
            .to_dtype(DType::F32)?;

        let prediction = if guided {
            let halves = prediction.chunk(2, 0)?;
            let (uncond, cond) = (&halves[0], &halves[1]);
            (uncond + ((cond - uncond)? * pass.cfg_scale)?)?
        } else {
            prediction
        };

        latents = scheduler.step(&prediction, index, &latents, noise)?;

        // Keep the unmasked region on the source for plain denoisers
        if let (Some(inputs), false) = (&inpaint, concat_inpaint) {
            let kept = match (indices.get(position + 1), &initial_noise) {
                (Some(&next), Some(sampled)) => scheduler.add_noise(&inputs.source_latents, sampled, next)?,
                _ => inputs.source_latents.clone(),
            };
            let keep = inputs.mask.affine(-1.0, 1.0)?;
            latents = (kept.broadcast_mul(&keep)? + latents.broadcast_mul(&inputs.mask)?)?;
        }

        if callback(position, timestep, &latents) == StepControl::Cancel {
            debug!("Pass cancelled at step {}", position);
            return Err(GenerationError::Cancelled.into());
        }
    }

    // Decoding
    match pass.output {
        Output::Latents => Ok(PassOutput::Latents(latents)),
        Output::Images => Ok(PassOutput::Images(decode_latents(model, &latents)?)),
    }
}

/// Split batched latents into one `[1, ...]` tensor per entry.
pub fn unbatch(latents: &Tensor) -> Result<Vec<Tensor>> {
    let batch = latents.dim(0)?;
    (0..batch)
        .map(|i| Ok(latents.i(i..i + 1)?))
        .collect()
}

/// Decode latents produced by an earlier pass.
pub fn decode(model: &dyn PipelineModel, latents: &Tensor) -> Result<Vec<RgbImage>> {
    decode_latents(model, latents)
}
