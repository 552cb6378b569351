use anyhow::{bail, Context, Result};
use image::{imageops, DynamicImage, ImageFormat, RgbaImage};
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metadata;
use crate::request::is_safe_component;

/// Edge length of generated thumbnails.
pub const THUMBNAIL_SIZE: u32 = 256;

const IMAGE_EXTENSIONS: [&str; 6] = ["webp", "png", "jpg", "jpeg", "gif", "bmp"];
const MAX_NAME_ATTEMPTS: usize = 16;

const INDEX_PATTERN: &str = r"^(\d+)(?:\.[0-9a-f]+)?\.png$";

/// Per-user image trees rooted at the configured storage path:
///
/// ```text
/// <user>/settings.json
/// <user>/images/<collection>/NNNNN.XXXXXXXX.png
/// <user>/thumbnails/<collection>/...
/// ```
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, user: &str) -> Result<PathBuf> {
        if !is_safe_component(user) {
            bail!("Invalid user: {:?}", user);
        }
        Ok(self.root.join(user))
    }

    pub fn settings_path(&self, user: &str) -> Result<PathBuf> {
        Ok(self.user_dir(user)?.join("settings.json"))
    }

    pub fn images_dir(&self, user: &str) -> Result<PathBuf> {
        Ok(self.user_dir(user)?.join("images"))
    }

    /// Absolute path of a collection-relative image path.
    pub fn image_path(&self, user: &str, path: &str) -> Result<PathBuf> {
        Ok(self.images_dir(user)?.join(safe_relative(path)?))
    }

    pub fn thumbnail_path(&self, user: &str, path: &str) -> Result<PathBuf> {
        Ok(self.user_dir(user)?.join("thumbnails").join(safe_relative(path)?))
    }

    /// Raw settings blob, `None` when the user has never saved any.
    pub fn read_settings(&self, user: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.settings_path(user)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_settings(&self, user: &str, bytes: &[u8]) -> Result<()> {
        let path = self.settings_path(user)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Sorted collection names, `["outputs"]` when there are none.
    pub fn collections(&self, user: &str) -> Result<Vec<String>> {
        let dir = self.images_dir(user)?;
        let mut collections = Vec::new();
        if dir.is_dir() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with('.') && entry.path().is_dir() {
                    collections.push(name);
                }
            }
        }
        collections.sort();
        if collections.is_empty() {
            collections.push("outputs".to_string());
        }
        Ok(collections)
    }

    /// Images in a collection, newest name first.
    pub fn images(&self, user: &str, collection: &str) -> Result<Vec<String>> {
        let dir = self.image_path(user, collection)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut images = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let lower = name.to_lowercase();
            if IMAGE_EXTENSIONS
                .iter()
                .any(|ext| lower.ends_with(&format!(".{ext}")))
            {
                images.push(format!("{collection}/{name}"));
            }
        }
        images.sort();
        images.reverse();
        Ok(images)
    }

    /// Write an encoded image under a freshly allocated name and return its
    /// collection-relative path. The bytes land in a hidden file first and
    /// are published with a hard link once synced, so listings never see a
    /// partial image.
    pub fn write_image(&self, user: &str, collection: &str, bytes: &[u8]) -> Result<String> {
        let dir = self.collection_dir(user, collection)?;
        let staging = dir.join(format!(".{}.tmp", Uuid::new_v4().simple()));
        let written = stage(&staging, bytes).and_then(|()| {
            let index = next_index(&dir)?;
            publish(&staging, &dir, || output_name(index))
        });
        remove_if_exists(&staging)?;
        let name = written?;
        debug!("Wrote {}/{} ({} bytes)", collection, name, bytes.len());
        Ok(format!("{collection}/{name}"))
    }

    fn collection_dir(&self, user: &str, collection: &str) -> Result<PathBuf> {
        if !is_safe_component(collection) {
            bail!("Invalid collection: {:?}", collection);
        }
        let dir = self.images_dir(user)?.join(collection);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove an image and its thumbnail. Missing files are not an error.
    pub fn delete(&self, user: &str, path: &str) -> Result<()> {
        remove_if_exists(&self.image_path(user, path)?)?;
        remove_if_exists(&self.thumbnail_path(user, path)?)?;
        Ok(())
    }

    /// Move an image into another collection under a new name.
    pub fn move_image(&self, user: &str, src: &str, dst_collection: &str) -> Result<Option<String>> {
        let src_full = self.image_path(user, src)?;
        if !src_full.is_file() {
            return Ok(None);
        }

        let dir = self.collection_dir(user, dst_collection)?;
        let index = next_index(&dir)?;
        let name = publish(&src_full, &dir, || output_name(index))
            .with_context(|| format!("Failed to move {}", src))?;
        fs::remove_file(&src_full).with_context(|| format!("Failed to move {}", src))?;
        let relative = format!("{dst_collection}/{name}");
        remove_if_exists(&self.thumbnail_path(user, src)?)?;
        Ok(Some(relative))
    }

    /// Path of the thumbnail, generating it on first request. `None` when
    /// the image does not exist.
    pub fn thumbnail(&self, user: &str, path: &str) -> Result<Option<PathBuf>> {
        let thumbnail_path = self.thumbnail_path(user, path)?;
        if thumbnail_path.is_file() {
            return Ok(Some(thumbnail_path));
        }

        let image_path = self.image_path(user, path)?;
        if !image_path.is_file() {
            return Ok(None);
        }

        let image = image::open(&image_path)
            .with_context(|| format!("Failed to open {}", image_path.display()))?;
        let thumbnail = create_thumbnail(&image, THUMBNAIL_SIZE);
        if let Some(parent) = thumbnail_path.parent() {
            fs::create_dir_all(parent)?;
        }
        thumbnail.save_with_format(&thumbnail_path, ImageFormat::WebP)?;
        Ok(Some(thumbnail_path))
    }

    /// Textual chunks of an image as a JSON object.
    pub fn metadata(&self, user: &str, path: &str) -> Result<serde_json::Value> {
        let full = self.image_path(user, path)?;
        if !full.is_file() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        Ok(metadata::read_metadata_object(&fs::read(full)?))
    }
}

/// One more than the largest index of any `NNNNN[.hex].png` file.
pub fn next_index(dir: &Path) -> Result<u32> {
    let pattern = Regex::new(INDEX_PATTERN)?;
    let mut index = 0;
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(captures) = pattern.captures(&name) {
                if let Ok(n) = captures[1].parse::<u32>() {
                    index = index.max(n);
                }
            }
        }
    }
    Ok(index + 1)
}

fn output_name(index: u32) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{:05}.{}.png", index, &suffix[..8])
}

fn stage(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

/// Link `source` into `dir` under the first name from `name` that is not
/// taken. Existing files are never replaced.
fn publish(source: &Path, dir: &Path, mut name: impl FnMut() -> String) -> Result<String> {
    for _ in 0..MAX_NAME_ATTEMPTS {
        let candidate = name();
        match fs::hard_link(source, dir.join(&candidate)) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!("Output name {} already taken, drawing another", candidate);
            }
            Err(e) => return Err(e.into()),
        }
    }
    bail!("Could not allocate an output name in {}", dir.display())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Reject absolute paths and any component that could escape the tree.
fn safe_relative(path: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in path.split(['/', '\\']) {
        if component.is_empty() {
            continue;
        }
        if !is_safe_component(component) {
            bail!("Invalid path: {:?}", path);
        }
        relative.push(component);
    }
    if relative.as_os_str().is_empty() {
        bail!("Empty path");
    }
    Ok(relative)
}

/// Letterbox an image into a transparent square no larger than `max_size`.
pub fn create_thumbnail(image: &DynamicImage, max_size: u32) -> RgbaImage {
    let (width, height) = (image.width().max(1), image.height().max(1));
    let size = max_size.min(width.max(height));
    let aspect = width as f64 / height as f64;
    let (new_width, new_height) = if aspect > 1.0 {
        (size, ((size as f64 / aspect) as u32).max(1))
    } else {
        (((size as f64 * aspect) as u32).max(1), size)
    };

    let scaled = image
        .resize_exact(new_width, new_height, imageops::FilterType::Lanczos3)
        .to_rgba8();
    let mut thumbnail = RgbaImage::new(size, size);
    imageops::overlay(
        &mut thumbnail,
        &scaled,
        ((size - new_width) / 2) as i64,
        ((size - new_height) / 2) as i64,
    );
    thumbnail
}
