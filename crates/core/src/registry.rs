use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::ModelsConfig;
use crate::controlnets::{self, ControlNetEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    Checkpoint,
    Controlnet,
    Lora,
    TextualInversion,
    Vae,
    Promptgen,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::Controlnet => "controlnet",
            Self::Lora => "lora",
            Self::TextualInversion => "textual-inversion",
            Self::Vae => "vae",
            Self::Promptgen => "promptgen",
        }
    }

    /// Kinds discovered in the local model tree.
    const LOCAL: [ModelKind; 5] = [
        Self::Checkpoint,
        Self::Controlnet,
        Self::Lora,
        Self::TextualInversion,
        Self::Vae,
    ];
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "checkpoint" => Ok(Self::Checkpoint),
            "controlnet" => Ok(Self::Controlnet),
            "lora" => Ok(Self::Lora),
            "textual-inversion" => Ok(Self::TextualInversion),
            "vae" => Ok(Self::Vae),
            "promptgen" => Ok(Self::Promptgen),
            _ => bail!("Unknown model type: {}", s),
        }
    }
}

/// Architecture family a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BaseFamily {
    #[serde(rename = "sd-1")]
    Sd1,
    #[serde(rename = "sd-2")]
    Sd2,
    #[serde(rename = "sdxl")]
    Sdxl,
    #[serde(rename = "sdxl-refiner")]
    SdxlRefiner,
}

impl BaseFamily {
    pub const ALL: [BaseFamily; 4] = [Self::Sd1, Self::Sd2, Self::Sdxl, Self::SdxlRefiner];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sd1 => "sd-1",
            Self::Sd2 => "sd-2",
            Self::Sdxl => "sdxl",
            Self::SdxlRefiner => "sdxl-refiner",
        }
    }

    pub fn is_sdxl(&self) -> bool {
        matches!(self, Self::Sdxl | Self::SdxlRefiner)
    }

    /// Number of text encoders a pipeline of this family carries.
    pub fn encoder_count(&self) -> usize {
        match self {
            Self::Sdxl => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for BaseFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sd-1" => Ok(Self::Sd1),
            "sd-2" => Ok(Self::Sd2),
            "sdxl" => Ok(Self::Sdxl),
            "sdxl-refiner" => Ok(Self::SdxlRefiner),
            _ => bail!("Unknown base model type: {}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ModelLocation {
    /// Diffusers directory or single weights file on disk
    Local { path: PathBuf },
    /// Hugging Face repository, resolved through the local hub cache
    Remote {
        repo_id: String,
        subfolder: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub kind: ModelKind,
    /// `None` only for families-agnostic entries such as prompt generators
    pub base: Option<BaseFamily>,
    pub location: ModelLocation,
}

impl ModelInfo {
    pub fn is_local(&self) -> bool {
        matches!(self.location, ModelLocation::Local { .. })
    }
}

/// One row of the model listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ModelListing {
    #[serde(rename = "type")]
    pub kind: String,
    pub base: String,
    pub name: String,
}

/// Name-keyed table of every model the worker may load.
///
/// Built once at startup; later entries shadow earlier ones with the same name
/// (control-net tables, then configured remote models, then local files).
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelInfo>,
}

impl ModelRegistry {
    pub fn from_config(config: &ModelsConfig) -> Result<Self> {
        let mut registry = ModelRegistry::default();

        if config.install_control_net_v10 {
            registry.add_control_nets(controlnets::V10_MODELS);
        }
        if config.install_control_net_v11 {
            registry.add_control_nets(controlnets::V11_MODELS);
        }
        if config.install_control_net_mediapipe_v2 {
            registry.add_control_nets(controlnets::MEDIAPIPE_V2_MODELS);
        }

        for entry in &config.huggingface_models {
            registry.add(parse_huggingface_entry(entry)?);
        }

        if let Some(models_path) = &config.models_path {
            registry.scan(models_path)?;
        }

        info!("Model registry holds {} entries", registry.models.len());
        Ok(registry)
    }

    /// Register everything under `<root>/<base>/<kind>/<name>`.
    pub fn scan(&mut self, root: &Path) -> Result<()> {
        for base in BaseFamily::ALL {
            let base_path = root.join(base.as_str());
            if !base_path.is_dir() {
                continue;
            }
            for kind in ModelKind::LOCAL {
                let kind_path = base_path.join(kind.as_str());
                if !kind_path.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&kind_path)? {
                    let path = entry?.path();
                    if let Some(name) = local_model_name(&path) {
                        debug!("Found local {} {} model {}", base, kind, name);
                        self.add(ModelInfo {
                            name,
                            kind,
                            base: Some(base),
                            location: ModelLocation::Local { path },
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn add(&mut self, model: ModelInfo) {
        self.models.insert(model.name.clone(), model);
    }

    pub fn get(&self, name: &str) -> Option<&ModelInfo> {
        self.models.get(name)
    }

    /// Look up a model that must be of the given kind.
    pub fn get_kind(&self, name: &str, kind: ModelKind) -> Option<&ModelInfo> {
        self.get(name).filter(|m| m.kind == kind)
    }

    /// Sorted `(type, base, name)` rows.
    pub fn list(&self) -> Vec<ModelListing> {
        let mut rows: Vec<ModelListing> = self
            .models
            .values()
            .map(|m| ModelListing {
                kind: m.kind.to_string(),
                base: m.base.map(|b| b.to_string()).unwrap_or_default(),
                name: m.name.clone(),
            })
            .collect();
        rows.sort();
        rows
    }

    /// Textual inversions registered for a family, sorted by name.
    pub fn textual_inversions(&self, family: BaseFamily) -> Vec<&ModelInfo> {
        let mut found: Vec<&ModelInfo> = self
            .models
            .values()
            .filter(|m| m.kind == ModelKind::TextualInversion && m.base == Some(family))
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn add_control_nets(&mut self, entries: &[ControlNetEntry]) {
        for (base, repo_path, name) in entries {
            self.add(ModelInfo {
                name: name.to_string(),
                kind: ModelKind::Controlnet,
                base: Some(*base),
                location: remote_location(repo_path),
            });
        }
    }
}

/// Split `owner/repo[/sub/folder]` into repo id and optional subfolder.
fn remote_location(repo_path: &str) -> ModelLocation {
    let components: Vec<&str> = repo_path.split('/').collect();
    if components.len() <= 2 {
        ModelLocation::Remote {
            repo_id: repo_path.to_string(),
            subfolder: None,
        }
    } else {
        ModelLocation::Remote {
            repo_id: components[..2].join("/"),
            subfolder: Some(components[2..].join("/")),
        }
    }
}

/// Parse `type:base:repo_id[/subfolder][:name]`.
///
/// Without an explicit name the entry is named after the path past the owner.
pub fn parse_huggingface_entry(entry: &str) -> Result<ModelInfo> {
    const FORM: &str = "type:base:repo_id[/subfolder][:name]";

    let components: Vec<&str> = entry.split(':').collect();
    if components.len() != 3 && components.len() != 4 {
        bail!("Hugging Face models must be in the form {}: {}", FORM, entry);
    }
    let path_components: Vec<&str> = components[2].split('/').collect();
    if path_components.len() < 2 || path_components.iter().any(|c| c.is_empty()) {
        bail!("Hugging Face models must be in the form {}: {}", FORM, entry);
    }

    let kind: ModelKind = components[0].parse()?;
    let base = match components[1] {
        "" => None,
        base => Some(base.parse()?),
    };
    let name = match components.get(3) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => path_components[1..].join("/"),
    };

    Ok(ModelInfo {
        name,
        kind,
        base,
        location: remote_location(components[2]),
    })
}

fn local_model_name(path: &Path) -> Option<String> {
    if path.is_dir() {
        if path.join("model_index.json").exists() || path.join("config.json").exists() {
            return path.file_name().map(|n| n.to_string_lossy().into_owned());
        }
        return None;
    }

    let extension = path.extension()?.to_str()?;
    match extension {
        "safetensors" | "pt" | "ckpt" | "pth" | "bin" => {
            path.file_stem().map(|n| n.to_string_lossy().into_owned())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_config() -> ModelsConfig {
        ModelsConfig {
            models_path: None,
            huggingface_models: Vec::new(),
            install_control_net_v10: false,
            install_control_net_v11: false,
            install_control_net_mediapipe_v2: false,
        }
    }

    #[test]
    fn default_entries_take_name_from_repo() {
        let registry = ModelRegistry::from_config(&ModelsConfig::default()).unwrap();
        let sd15 = registry.get("stable-diffusion-v1-5").unwrap();
        assert_eq!(sd15.kind, ModelKind::Checkpoint);
        assert_eq!(sd15.base, Some(BaseFamily::Sd1));
        assert_eq!(
            sd15.location,
            ModelLocation::Remote {
                repo_id: "runwayml/stable-diffusion-v1-5".into(),
                subfolder: None
            }
        );
        assert!(registry.get("stable-diffusion-xl-refiner-1.0").is_some());
        assert!(registry.get_kind("control_v11p_sd15_canny", ModelKind::Controlnet).is_some());
        assert!(registry.get("control_sd15_canny").is_none());
    }

    #[test]
    fn subfolders_and_explicit_names_parse() {
        let info = parse_huggingface_entry("controlnet:sd-1:CrucibleAI/ControlNetMediaPipeFace/diffusion_sd15:face").unwrap();
        assert_eq!(info.name, "face");
        assert_eq!(
            info.location,
            ModelLocation::Remote {
                repo_id: "CrucibleAI/ControlNetMediaPipeFace".into(),
                subfolder: Some("diffusion_sd15".into())
            }
        );

        let promptgen = parse_huggingface_entry("promptgen::AUTOMATIC/promptgen-lexart").unwrap();
        assert_eq!(promptgen.base, None);
        assert_eq!(promptgen.name, "promptgen-lexart");

        assert!(parse_huggingface_entry("checkpoint:sd-1").is_err());
        assert!(parse_huggingface_entry("checkpoint:sd-1:norepo").is_err());
        assert!(parse_huggingface_entry("checkpoint:sd-9:a/b").is_err());
    }

    #[test]
    fn scan_registers_dirs_and_weight_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let checkpoint = root.join("sd-1/checkpoint/dreamshaper");
        fs::create_dir_all(&checkpoint).unwrap();
        fs::write(checkpoint.join("model_index.json"), "{}").unwrap();
        fs::create_dir_all(root.join("sd-1/checkpoint/half-downloaded")).unwrap();
        fs::create_dir_all(root.join("sd-1/lora")).unwrap();
        fs::write(root.join("sd-1/lora/pixel-art.safetensors"), b"").unwrap();
        fs::write(root.join("sd-1/lora/notes.txt"), b"").unwrap();
        fs::create_dir_all(root.join("sdxl/textual-inversion")).unwrap();
        fs::write(root.join("sdxl/textual-inversion/style.pt"), b"").unwrap();

        let mut config = empty_config();
        config.models_path = Some(root.to_path_buf());
        let registry = ModelRegistry::from_config(&config).unwrap();

        assert_eq!(registry.len(), 3);
        assert!(registry.get("dreamshaper").unwrap().is_local());
        assert!(registry.get("half-downloaded").is_none());
        assert_eq!(registry.get("pixel-art").unwrap().kind, ModelKind::Lora);
        assert_eq!(registry.textual_inversions(BaseFamily::Sdxl).len(), 1);
        assert!(registry.textual_inversions(BaseFamily::Sd1).is_empty());
    }

    #[test]
    fn listing_is_sorted() {
        let mut config = empty_config();
        config.install_control_net_mediapipe_v2 = true;
        config.huggingface_models = vec!["checkpoint:sd-1:a/zeta".into(), "checkpoint:sd-1:a/alpha".into()];
        let rows = ModelRegistry::from_config(&config).unwrap().list();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["alpha", "zeta", "control_v2p_sd15_mediapipe_face", "control_v2p_sd21_mediapipe_face"]
        );
    }
}
