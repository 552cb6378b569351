//! Locating weight files for registry entries.
//!
//! Local entries point at a diffusers directory or a single file. Remote
//! entries are looked up in the Hugging Face hub cache; nothing is
//! downloaded, so a missing file is a resource error.

use anyhow::Result;
use hf_hub::{Cache, Repo};
use seedalchemy_core::{GenerationError, ModelInfo, ModelLocation};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
enum Root {
    Local(PathBuf),
    Hub {
        cache: Cache,
        repo_id: String,
        subfolder: Option<String>,
    },
}

/// File lookup for one model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    name: String,
    root: Root,
}

impl ModelFiles {
    pub fn resolve(info: &ModelInfo, hub_cache: &Path) -> Self {
        let root = match &info.location {
            ModelLocation::Local { path } => Root::Local(path.clone()),
            ModelLocation::Remote { repo_id, subfolder } => Root::Hub {
                cache: Cache::new(hub_cache.to_path_buf()),
                repo_id: repo_id.clone(),
                subfolder: subfolder.clone(),
            },
        };
        Self {
            name: info.name.clone(),
            root,
        }
    }

    /// A repository in the hub cache that is not in the registry, such as
    /// the tiny autoencoders or a fallback tokenizer.
    pub fn hub(repo_id: &str, hub_cache: &Path) -> Self {
        Self {
            name: repo_id.to_string(),
            root: Root::Hub {
                cache: Cache::new(hub_cache.to_path_buf()),
                repo_id: repo_id.to_string(),
                subfolder: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The weights file when the entry is a single local file.
    pub fn single_file(&self) -> Option<&Path> {
        match &self.root {
            Root::Local(path) if path.is_file() => Some(path),
            _ => None,
        }
    }

    /// Path of `relative` inside the model, if present.
    pub fn get(&self, relative: &str) -> Option<PathBuf> {
        match &self.root {
            Root::Local(path) => {
                let file = path.join(relative);
                file.is_file().then_some(file)
            }
            Root::Hub {
                cache,
                repo_id,
                subfolder,
            } => {
                let relative = match subfolder {
                    Some(subfolder) => format!("{subfolder}/{relative}"),
                    None => relative.to_string(),
                };
                cache.repo(Repo::model(repo_id.clone())).get(&relative)
            }
        }
    }

    pub fn require(&self, relative: &str) -> Result<PathBuf> {
        self.get(relative).ok_or_else(|| {
            GenerationError::resource(format!("{} is missing {}", self.name, relative)).into()
        })
    }

    /// Safetensors weights of a component, preferring the fp16 variant.
    ///
    /// `component` is a diffusers subfolder such as `unet`, or empty for
    /// component repositories.
    pub fn weights(&self, component: &str, stem: &str, prefer_fp16: bool) -> Result<PathBuf> {
        let prefix = if component.is_empty() {
            String::new()
        } else {
            format!("{component}/")
        };
        let mut candidates = Vec::new();
        if prefer_fp16 {
            candidates.push(format!("{prefix}{stem}.fp16.safetensors"));
        }
        candidates.push(format!("{prefix}{stem}.safetensors"));
        if !prefer_fp16 {
            candidates.push(format!("{prefix}{stem}.fp16.safetensors"));
        }

        candidates
            .iter()
            .find_map(|candidate| self.get(candidate))
            .ok_or_else(|| {
                GenerationError::resource(format!(
                    "{} has no weights for {}",
                    self.name,
                    if component.is_empty() { stem } else { component }
                ))
                .into()
            })
    }

    /// Parse a JSON config shipped with the model, `None` when absent.
    pub fn config<T: DeserializeOwned>(&self, relative: &str) -> Result<Option<T>> {
        match self.get(relative) {
            Some(path) => Ok(Some(serde_json::from_reader(std::fs::File::open(&path)?)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use seedalchemy_core::ModelKind;
    use std::fs;

    fn info(location: ModelLocation) -> ModelInfo {
        ModelInfo {
            name: "sd".to_string(),
            kind: ModelKind::Checkpoint,
            base: None,
            location,
        }
    }

    #[test]
    fn local_directory_prefers_fp16_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("unet")).unwrap();
        fs::write(dir.path().join("unet/diffusion_pytorch_model.safetensors"), b"").unwrap();
        fs::write(dir.path().join("unet/diffusion_pytorch_model.fp16.safetensors"), b"").unwrap();

        let files = ModelFiles::resolve(
            &info(ModelLocation::Local { path: dir.path().to_path_buf() }),
            dir.path(),
        );
        let half = files.weights("unet", "diffusion_pytorch_model", true).unwrap();
        let full = files.weights("unet", "diffusion_pytorch_model", false).unwrap();
        assert!(half.ends_with("unet/diffusion_pytorch_model.fp16.safetensors"));
        assert!(full.ends_with("unet/diffusion_pytorch_model.safetensors"));
        assert!(files.single_file().is_none());
    }

    #[test]
    fn missing_weights_are_a_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let files = ModelFiles::resolve(
            &info(ModelLocation::Local { path: dir.path().to_path_buf() }),
            dir.path(),
        );
        let err = files.weights("vae", "diffusion_pytorch_model", false).unwrap_err();
        assert_matches!(err.downcast::<GenerationError>(), Ok(GenerationError::Resource(_)));
    }

    #[test]
    fn remote_entries_read_the_hub_cache_snapshot() {
        let hub = tempfile::tempdir().unwrap();
        let repo = hub.path().join("models--runwayml--stable-diffusion-v1-5");
        fs::create_dir_all(repo.join("refs")).unwrap();
        fs::write(repo.join("refs/main"), "abc123").unwrap();
        let snapshot = repo.join("snapshots/abc123/text_encoder");
        fs::create_dir_all(&snapshot).unwrap();
        fs::write(snapshot.join("model.safetensors"), b"").unwrap();
        fs::write(snapshot.join("config.json"), r#"{"hidden_size": 768}"#).unwrap();

        let files = ModelFiles::resolve(
            &info(ModelLocation::Remote {
                repo_id: "runwayml/stable-diffusion-v1-5".to_string(),
                subfolder: None,
            }),
            hub.path(),
        );
        assert!(files.weights("text_encoder", "model", true).is_ok());
        let config: serde_json::Value = files.config("text_encoder/config.json").unwrap().unwrap();
        assert_eq!(config["hidden_size"], 768);
        assert!(files.config::<serde_json::Value>("unet/config.json").unwrap().is_none());
    }

    #[test]
    fn remote_subfolders_prefix_lookups() {
        let hub = tempfile::tempdir().unwrap();
        let repo = hub.path().join("models--owner--controlnets");
        fs::create_dir_all(repo.join("refs")).unwrap();
        fs::write(repo.join("refs/main"), "rev").unwrap();
        let snapshot = repo.join("snapshots/rev/canny");
        fs::create_dir_all(&snapshot).unwrap();
        fs::write(snapshot.join("diffusion_pytorch_model.safetensors"), b"").unwrap();

        let files = ModelFiles::resolve(
            &info(ModelLocation::Remote {
                repo_id: "owner/controlnets".to_string(),
                subfolder: Some("canny".to_string()),
            }),
            hub.path(),
        );
        assert!(files.weights("", "diffusion_pytorch_model", false).is_ok());
    }
}
