use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::GenerationError;
use crate::processors;
use crate::registry::{BaseFamily, ModelKind, ModelRegistry};
use crate::schedulers;

/// How intermediate latents are turned into preview frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preview {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "latent", alias = "latent-rgb")]
    Latent,
    #[serde(rename = "tiny_vae", alias = "tiny-vae")]
    TinyVae,
}

fn nullable_preview<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Preview, D::Error> {
    Ok(Option::<Preview>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Img2ImgParams {
    pub source: String,
    #[serde(default = "default_half")]
    pub noise: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InpaintParams {
    pub source: String,
    pub use_alpha_channel: bool,
    pub invert_mask: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlNetCondition {
    pub model: String,
    pub source: String,
    #[serde(default = "default_preprocessor", alias = "processor")]
    pub preprocessor: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
    #[serde(default = "default_one")]
    pub scale: f64,
    #[serde(default)]
    pub guidance_start: f64,
    #[serde(default = "default_one")]
    pub guidance_end: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlNetParams {
    #[serde(default)]
    pub conditions: Vec<ControlNetCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraEntry {
    pub model: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoraParams {
    #[serde(default)]
    pub entries: Vec<LoraEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinerParams {
    pub model: String,
    pub cfg_scale: f64,
    pub high_noise_end: Option<f64>,
    pub steps: Option<u32>,
    pub noise: Option<f64>,
}

impl Default for RefinerParams {
    fn default() -> Self {
        Self {
            model: "stable-diffusion-xl-refiner-1.0".to_string(),
            cfg_scale: 4.0,
            high_noise_end: None,
            steps: None,
            noise: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpscaleParams {
    pub factor: u32,
    #[serde(default = "default_three_quarters")]
    pub denoising: f64,
    #[serde(default = "default_three_quarters")]
    pub blend: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceParams {
    #[serde(default = "default_three_quarters")]
    pub blend: f64,
}

impl Default for FaceParams {
    fn default() -> Self {
        Self { blend: 0.75 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HighResParams {
    pub factor: f64,
    pub steps: u32,
    pub cfg_scale: f64,
    pub noise: f64,
}

impl Default for HighResParams {
    fn default() -> Self {
        Self {
            factor: 1.5,
            steps: 20,
            cfg_scale: 4.0,
            noise: 0.5,
        }
    }
}

/// A fully parameterised generation request. Never mutated once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageRequest {
    pub session_id: Option<Uuid>,
    pub generator_id: Option<Uuid>,
    pub user: String,
    pub collection: String,
    pub image_count: u32,
    #[serde(deserialize_with = "nullable_preview")]
    pub preview: Preview,

    pub model: String,
    pub scheduler: String,
    pub safety_checker: bool,
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub seed: u64,

    pub img2img: Option<Img2ImgParams>,
    pub inpaint: Option<InpaintParams>,
    pub control_net: Option<ControlNetParams>,
    pub lora: Option<LoraParams>,
    pub refiner: Option<RefinerParams>,
    pub upscale: Option<UpscaleParams>,
    pub face: Option<FaceParams>,
    pub high_res: Option<HighResParams>,
}

impl Default for ImageRequest {
    fn default() -> Self {
        Self {
            session_id: None,
            generator_id: None,
            user: "default".to_string(),
            collection: "outputs".to_string(),
            image_count: 1,
            preview: Preview::None,
            model: "stable-diffusion-v1-5".to_string(),
            scheduler: "euler_a".to_string(),
            safety_checker: true,
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: 20,
            cfg_scale: 4.0,
            width: 512,
            height: 512,
            seed: 1,
            img2img: None,
            inpaint: None,
            control_net: None,
            lora: None,
            refiner: None,
            upscale: None,
            face: None,
            high_res: None,
        }
    }
}

fn default_half() -> f64 {
    0.5
}

fn default_one() -> f64 {
    1.0
}

fn default_three_quarters() -> f64 {
    0.75
}

fn default_preprocessor() -> String {
    "none".to_string()
}

fn default_collection() -> String {
    "outputs".to_string()
}

/// Round down to a multiple of `align`.
pub fn align_down(n: u32, align: u32) -> u32 {
    align * (n / align)
}

impl ImageRequest {
    /// Path of the image the base pass starts from. An inpaint source
    /// replaces the img2img one.
    pub fn source_path(&self) -> Option<&str> {
        match (&self.inpaint, &self.img2img) {
            (Some(inpaint), _) if !inpaint.source.is_empty() => Some(inpaint.source.as_str()),
            (_, Some(img2img)) => Some(img2img.source.as_str()),
            _ => None,
        }
    }

    /// Denoising strength of the base pass, when it starts from a source.
    ///
    /// Inpainting without an img2img block regenerates the masked region from
    /// pure noise.
    pub fn strength(&self) -> Option<f64> {
        match (&self.img2img, &self.inpaint) {
            (Some(img2img), _) => Some(img2img.noise),
            (None, Some(_)) => Some(1.0),
            (None, None) => None,
        }
    }

    /// Control conditions, with an empty list meaning no ControlNet.
    pub fn conditions(&self) -> &[ControlNetCondition] {
        self.control_net
            .as_ref()
            .map(|c| c.conditions.as_slice())
            .unwrap_or(&[])
    }

    pub fn loras(&self) -> &[LoraEntry] {
        self.lora.as_ref().map(|l| l.entries.as_slice()).unwrap_or(&[])
    }

    /// True when the base pass hands latents to a refiner that continues the
    /// same schedule.
    pub fn is_two_stage(&self) -> bool {
        self.refiner
            .as_ref()
            .map(|r| r.high_noise_end.is_some())
            .unwrap_or(false)
    }

    /// Steps the refiner schedule is built with.
    pub fn refiner_steps(&self) -> Option<u32> {
        let refiner = self.refiner.as_ref()?;
        if refiner.high_noise_end.is_some() {
            Some(self.steps)
        } else {
            Some(refiner.steps.unwrap_or(self.steps))
        }
    }

    /// Resolution of the high-res pass, or the base resolution without one.
    pub fn high_res_size(&self) -> (u32, u32) {
        match &self.high_res {
            Some(high_res) => (
                align_down((self.width as f64 * high_res.factor) as u32, 8),
                align_down((self.height as f64 * high_res.factor) as u32, 8),
            ),
            None => (self.width, self.height),
        }
    }

    /// Size of every saved image: high-res first, then the upscale factor.
    pub fn output_size(&self) -> (u32, u32) {
        let (w, h) = self.high_res_size();
        let factor = self.upscale.as_ref().map(|u| u.factor).unwrap_or(1);
        (w * factor, h * factor)
    }

    /// Progress budget over the whole request.
    pub fn total_steps(&self) -> u64 {
        let mut per_image: u64 = 1;
        if let Some(refiner) = &self.refiner {
            if refiner.high_noise_end.is_none() {
                let steps = refiner.steps.unwrap_or(self.steps) as f64;
                per_image += (steps * refiner.noise.unwrap_or(0.0)) as u64;
            }
        }
        if let Some(high_res) = &self.high_res {
            per_image += (high_res.steps as f64 * high_res.noise) as u64;
        }
        if self.upscale.is_some() {
            per_image += 1;
        }
        if self.face.is_some() {
            per_image += 1;
        }

        let pipeline_steps = match &self.img2img {
            Some(img2img) => (self.steps as f64 * img2img.noise) as u64,
            None => self.steps as u64,
        };

        pipeline_steps + self.image_count as u64 * per_image
    }

    /// Check the request against the registries before any work starts.
    pub fn validate(&self, registry: &ModelRegistry) -> Result<(), GenerationError> {
        let fail = |message: String| Err(GenerationError::Configuration(message));

        if !is_safe_component(&self.user) {
            return fail(format!("Invalid user: {:?}", self.user));
        }
        if !is_safe_component(&self.collection) {
            return fail(format!("Invalid collection: {:?}", self.collection));
        }
        if self.image_count == 0 {
            return fail("image_count must be at least 1".into());
        }
        if self.steps == 0 {
            return fail("steps must be at least 1".into());
        }
        if self.width == 0 || self.height == 0 || self.width % 8 != 0 || self.height % 8 != 0 {
            return fail(format!(
                "width and height must be positive multiples of 8, got {}x{}",
                self.width, self.height
            ));
        }

        let family = match registry.get_kind(&self.model, ModelKind::Checkpoint) {
            Some(info) => match info.base {
                Some(base) => base,
                None => return fail(format!("Model {} has no base family", self.model)),
            },
            None => return fail(format!("Unknown model: {}", self.model)),
        };

        if schedulers::lookup(&self.scheduler).is_none() {
            return fail(format!("Unknown scheduler: {}", self.scheduler));
        }

        if let Some(img2img) = &self.img2img {
            check_unit("img2img.noise", img2img.noise)?;
        }
        if let Some(inpaint) = &self.inpaint {
            if inpaint.source.is_empty() && self.img2img.is_none() {
                return fail("inpaint requires a source image".into());
            }
        }

        for condition in self.conditions() {
            match registry.get_kind(&condition.model, ModelKind::Controlnet) {
                Some(info) if info.base == Some(family) => {}
                Some(info) => {
                    return fail(format!(
                        "ControlNet {} targets {}, but model {} is {}",
                        condition.model,
                        info.base.map(|b| b.as_str()).unwrap_or("no family"),
                        self.model,
                        family
                    ))
                }
                None => return fail(format!("Unknown ControlNet model: {}", condition.model)),
            }
            if processors::lookup(&condition.preprocessor).is_none() {
                return fail(format!("Unknown preprocessor: {}", condition.preprocessor));
            }
            if condition.guidance_start > condition.guidance_end {
                return fail(format!(
                    "ControlNet {} guidance span is empty",
                    condition.model
                ));
            }
        }

        for entry in self.loras() {
            if registry.get_kind(&entry.model, ModelKind::Lora).is_none() {
                return fail(format!("Unknown LoRA: {}", entry.model));
            }
        }
        if family.is_sdxl() && self.loras().len() > 1 {
            return fail("Only one LoRA is supported on SDXL models".into());
        }

        if let Some(refiner) = &self.refiner {
            match registry.get_kind(&refiner.model, ModelKind::Checkpoint) {
                Some(info) if info.base.map(|b| b.is_sdxl()).unwrap_or(false) => {}
                Some(_) => return fail(format!("Refiner {} is not an SDXL model", refiner.model)),
                None => return fail(format!("Unknown refiner model: {}", refiner.model)),
            }
            match (refiner.high_noise_end, refiner.noise) {
                (Some(end), _) => {
                    if !(end > 0.0 && end < 1.0) {
                        return fail(format!("refiner.high_noise_end must be in (0, 1), got {end}"));
                    }
                }
                (None, Some(noise)) => check_unit("refiner.noise", noise)?,
                (None, None) => {
                    return fail("refiner.noise is required without high_noise_end".into())
                }
            }
            if refiner.steps == Some(0) {
                return fail("refiner.steps must be at least 1".into());
            }
        }

        if let Some(upscale) = &self.upscale {
            if upscale.factor != 2 && upscale.factor != 4 {
                return fail(format!("upscale.factor must be 2 or 4, got {}", upscale.factor));
            }
            check_unit("upscale.denoising", upscale.denoising)?;
            check_unit("upscale.blend", upscale.blend)?;
        }
        if let Some(face) = &self.face {
            check_unit("face.blend", face.blend)?;
        }
        if let Some(high_res) = &self.high_res {
            check_unit("high_res.noise", high_res.noise)?;
            if high_res.steps == 0 {
                return fail("high_res.steps must be at least 1".into());
            }
            let (w, h) = self.high_res_size();
            if !(high_res.factor > 0.0) || w == 0 || h == 0 {
                return fail(format!("Invalid high_res.factor: {}", high_res.factor));
            }
        }

        Ok(())
    }

    /// Base family of the requested model, if it is registered.
    pub fn family(&self, registry: &ModelRegistry) -> Option<BaseFamily> {
        registry.get(&self.model).and_then(|m| m.base)
    }
}

fn check_unit(name: &str, value: f64) -> Result<(), GenerationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(GenerationError::configuration(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

/// A single path component that cannot climb out of its parent.
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && !name.contains(':')
}

/// Run a single preprocessor over an uploaded image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub user: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    pub source: String,
    #[serde(default = "default_preprocessor", alias = "preprocessor")]
    pub processor: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRequest {
    pub user: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub user: String,
    pub src_path: String,
    pub dst_collection: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub session_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelsConfig;
    use crate::registry::{ModelInfo, ModelLocation};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::from_config(&ModelsConfig::default()).unwrap();
        registry.add(ModelInfo {
            name: "pixel-art".into(),
            kind: ModelKind::Lora,
            base: Some(BaseFamily::Sdxl),
            location: ModelLocation::Local { path: "/tmp/pixel-art.safetensors".into() },
        });
        registry.add(ModelInfo {
            name: "film-grain".into(),
            kind: ModelKind::Lora,
            base: Some(BaseFamily::Sdxl),
            location: ModelLocation::Local { path: "/tmp/film-grain.safetensors".into() },
        });
        registry
    }

    fn parse(value: serde_json::Value) -> ImageRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn missing_fields_take_defaults() {
        let req = parse(json!({"prompt": "a red cube", "preview": null}));
        assert_eq!(req.model, "stable-diffusion-v1-5");
        assert_eq!(req.scheduler, "euler_a");
        assert_eq!(req.preview, Preview::None);
        assert_eq!((req.width, req.height, req.steps, req.seed), (512, 512, 20, 1));
        assert!(req.validate(&registry()).is_ok());
    }

    #[test]
    fn preview_accepts_both_spellings() {
        assert_eq!(parse(json!({"preview": "latent"})).preview, Preview::Latent);
        assert_eq!(parse(json!({"preview": "latent-rgb"})).preview, Preview::Latent);
        assert_eq!(parse(json!({"preview": "tiny-vae"})).preview, Preview::TinyVae);
    }

    #[test]
    fn condition_defaults_and_processor_alias() {
        let req = parse(json!({
            "control_net": {"conditions": [{"model": "control_v11p_sd15_canny", "source": "outputs/ref.png", "processor": "canny"}]}
        }));
        let condition = &req.conditions()[0];
        assert_eq!(condition.preprocessor, "canny");
        assert_eq!((condition.scale, condition.guidance_start, condition.guidance_end), (1.0, 0.0, 1.0));
        assert!(req.validate(&registry()).is_ok());
    }

    #[test]
    fn empty_conditions_mean_no_control_net() {
        let req = parse(json!({"control_net": {"conditions": []}}));
        assert!(req.conditions().is_empty());
    }

    #[test]
    fn inpaint_source_wins() {
        let req = parse(json!({
            "img2img": {"source": "outputs/a.png", "noise": 0.4},
            "inpaint": {"source": "outputs/mask.png"}
        }));
        assert_eq!(req.source_path(), Some("outputs/mask.png"));
        assert_eq!(req.strength(), Some(0.4));
        assert_eq!(req.img2img.as_ref().unwrap().source, "outputs/a.png");
    }

    #[test]
    fn progress_budget_matches_scenarios() {
        let basic = parse(json!({"steps": 20}));
        assert_eq!(basic.total_steps(), 21);

        let two_stage = parse(json!({
            "model": "stable-diffusion-xl-base-1.0", "steps": 30, "image_count": 2,
            "refiner": {"high_noise_end": 0.8}
        }));
        assert_eq!(two_stage.total_steps(), 32);
        assert_eq!(two_stage.refiner_steps(), Some(30));

        let enhanced = parse(json!({"steps": 20, "upscale": {"factor": 2, "denoising": 0.5, "blend": 1.0}, "face": {}}));
        assert_eq!(enhanced.total_steps(), 23);
        assert_eq!(enhanced.output_size(), (1024, 1024));

        let staged = parse(json!({
            "steps": 20, "img2img": {"source": "a.png", "noise": 0.75},
            "refiner": {"steps": 10, "noise": 0.35}, "high_res": {}
        }));
        assert_eq!(staged.total_steps(), 15 + 1 + 3 + 10);
    }

    #[test]
    fn high_res_size_aligns_down() {
        let req = parse(json!({"width": 520, "height": 512, "high_res": {"factor": 1.5}}));
        assert_eq!(req.high_res_size(), (776, 768));
    }

    #[test]
    fn invalid_requests_are_configuration_errors() {
        let registry = registry();
        let cases = [
            json!({"width": 500}),
            json!({"model": "unknown"}),
            json!({"scheduler": "unipc"}),
            json!({"img2img": {"source": "a.png", "noise": 1.5}}),
            json!({"upscale": {"factor": 3}}),
            json!({"refiner": {}}),
            json!({"user": "../etc"}),
            json!({"collection": ".trash"}),
            json!({"control_net": {"conditions": [{"model": "control_v11p_sd15_canny", "source": "a.png", "preprocessor": "zoe"}]}}),
            json!({"model": "stable-diffusion-2-1", "control_net": {"conditions": [{"model": "control_v11p_sd15_canny", "source": "a.png"}]}}),
            json!({"model": "stable-diffusion-xl-base-1.0", "lora": {"entries": [{"model": "pixel-art", "weight": 1.0}, {"model": "film-grain", "weight": 0.5}]}}),
            json!({"lora": {"entries": [{"model": "missing", "weight": 1.0}]}}),
        ];
        for case in cases {
            let req = parse(case.clone());
            assert_matches!(req.validate(&registry), Err(GenerationError::Configuration(_)), "{case}");
        }
    }
}
