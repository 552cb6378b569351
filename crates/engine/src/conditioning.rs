//! Decoding of a request's image references.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use seedalchemy_core::processors::{self, ProcessorClass};
use seedalchemy_core::request::ImageRequest;
use seedalchemy_core::{GenerationError, OutputStore};
use seedalchemy_runtime_api::{ModelLoader, Preprocessor};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Decoded inputs of one request. Lives only while the request runs.
#[derive(Debug, Clone, Default)]
pub struct Conditioning {
    /// Source image at its original size; resized by the base pass.
    pub source: Option<RgbImage>,
    /// Regeneration mask at the request size, non-zero meaning "regenerate".
    pub mask: Option<GrayImage>,
    /// One image per control condition, at the request size.
    pub control_images: Vec<RgbImage>,
}

/// Resolves image references and keeps the last preprocessor warm.
#[derive(Default)]
pub struct ConditioningResolver {
    preprocessor: Option<(ProcessorClass, Box<dyn Preprocessor>)>,
}

/// Open an image from the user's tree.
pub fn open_image(store: &OutputStore, user: &str, path: &str) -> Result<DynamicImage, GenerationError> {
    let full_path = store
        .image_path(user, path)
        .map_err(|e| GenerationError::configuration(format!("{e:#}")))?;
    image::open(&full_path)
        .map_err(|e| GenerationError::configuration(format!("Cannot open image {path}: {e}")))
}

impl ConditioningResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Class of the preprocessor currently kept, if any.
    pub fn cached_class(&self) -> Option<ProcessorClass> {
        self.preprocessor.as_ref().map(|(class, _)| *class)
    }

    pub fn resolve(
        &mut self,
        loader: &dyn ModelLoader,
        store: &OutputStore,
        req: &ImageRequest,
    ) -> Result<Conditioning, GenerationError> {
        let mut conditioning = Conditioning::default();

        // Source image
        let source = match req.source_path() {
            Some(path) => Some(open_image(store, &req.user, path)?),
            None => None,
        };

        // Mask image
        if let (Some(inpaint), Some(image)) = (&req.inpaint, &source) {
            let mut mask = if inpaint.use_alpha_channel {
                let rgba = image.to_rgba8();
                GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| image::Luma([rgba.get_pixel(x, y).0[3]]))
            } else {
                image.to_luma8()
            };
            if inpaint.invert_mask {
                image::imageops::invert(&mut mask);
            }
            conditioning.mask = Some(image::imageops::resize(&mask, req.width, req.height, FilterType::Lanczos3));
        }
        conditioning.source = source.map(|image| image.to_rgb8());

        // Conditioning images
        let detect_resolution = req.width.min(req.height);
        for condition in req.conditions() {
            let image = open_image(store, &req.user, &condition.source)?;
            let image = self.process(loader, &image, &condition.preprocessor, &condition.params, detect_resolution)?;
            let image = image.resize_exact(req.width, req.height, FilterType::Lanczos3).to_rgb8();
            conditioning.control_images.push(image);
        }

        Ok(conditioning)
    }

    /// Run the named preprocessor; `none` passes the image through.
    pub fn process(
        &mut self,
        loader: &dyn ModelLoader,
        image: &DynamicImage,
        name: &str,
        params: &BTreeMap<String, f64>,
        detect_resolution: u32,
    ) -> Result<DynamicImage, GenerationError> {
        let Some(info) = processors::lookup(name) else {
            return Err(GenerationError::configuration(format!("Unknown preprocessor: {name}")));
        };
        let Some(class) = info.class else {
            return Ok(image.clone());
        };

        let stale = !matches!(&self.preprocessor, Some((cached, _)) if *cached == class);
        if stale {
            // Only one preprocessor is kept at a time
            self.preprocessor = None;
            info!("Loading preprocessor {}", name);
            let preprocessor = loader.load_preprocessor(class).map_err(GenerationError::from_load)?;
            self.preprocessor = Some((class, preprocessor));
        } else {
            debug!("Reusing preprocessor {}", name);
        }

        let params = info.params(params);
        match self.preprocessor.as_mut() {
            Some((_, preprocessor)) => preprocessor
                .process(image, detect_resolution, &params)
                .map_err(|e| GenerationError::classify(e.context(format!("Preprocessor {name}")))),
            None => Err(GenerationError::resource(format!("Preprocessor {name} unavailable"))),
        }
    }
}
