use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable that points at an alternative config file.
pub const CONFIG_ENV: &str = "SEED_ALCHEMY_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Output and cache locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Model discovery settings
    #[serde(default)]
    pub models: ModelsConfig,

    /// Accelerator selection
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the per-user image trees (default: ~/.config/seed-alchemy/storage/)
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Cache root; Hugging Face snapshots are looked up under `huggingface/hub`
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Users offered to the front-end
    #[serde(default = "default_users")]
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Local model tree laid out as `<base>/<kind>/<name>`
    #[serde(default)]
    pub models_path: Option<PathBuf>,

    /// Remote entries as `type:base:repo_id[/subfolder][:name]`
    #[serde(default = "default_huggingface_models")]
    pub huggingface_models: Vec<String>,

    #[serde(default)]
    pub install_control_net_v10: bool,

    #[serde(default = "default_true")]
    pub install_control_net_v11: bool,

    #[serde(default = "default_true")]
    pub install_control_net_mediapipe_v2: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// `auto`, `cuda`, `metal` or `cpu`
    #[serde(default)]
    pub device: DeviceChoice,

    /// Overrides the per-device default dtype (`f16`, `bf16`, `f32`)
    #[serde(default)]
    pub dtype: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    #[default]
    Auto,
    Cuda,
    Metal,
    Cpu,
}

impl std::str::FromStr for DeviceChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "cuda" => Ok(Self::Cuda),
            "metal" | "mps" => Ok(Self::Metal),
            "cpu" => Ok(Self::Cpu),
            _ => anyhow::bail!("Unknown device: {}", s),
        }
    }
}

impl std::fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

fn default_port() -> u16 {
    8000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_storage_path() -> PathBuf {
    Config::base_dir()
        .map(|p| p.join("storage"))
        .unwrap_or_else(|_| PathBuf::from("storage"))
}

fn default_cache_path() -> PathBuf {
    home_dir()
        .map(|p| p.join(".cache"))
        .unwrap_or_else(|_| PathBuf::from(".cache"))
}

fn default_users() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_huggingface_models() -> Vec<String> {
    [
        "checkpoint:sd-1:runwayml/stable-diffusion-v1-5",
        "checkpoint:sd-2:stabilityai/stable-diffusion-2-1",
        "checkpoint:sdxl:stabilityai/stable-diffusion-xl-base-1.0",
        "checkpoint:sdxl-refiner:stabilityai/stable-diffusion-xl-refiner-1.0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_true() -> bool {
    true
}

fn home_dir() -> Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("USERPROFILE").map(PathBuf::from))
        .map_err(|_| anyhow::anyhow!("Could not determine home directory"))
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            cache_path: default_cache_path(),
            users: default_users(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            models_path: None,
            huggingface_models: default_huggingface_models(),
            install_control_net_v10: false,
            install_control_net_v11: true,
            install_control_net_mediapipe_v2: true,
        }
    }
}

impl Config {
    /// Get the base directory: ~/.config/seed-alchemy/
    pub fn base_dir() -> Result<PathBuf> {
        Ok(home_dir()?.join(".config").join("seed-alchemy"))
    }

    /// Load config from `SEED_ALCHEMY_CONFIG` or the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from an explicit file; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the config file path: ~/.config/seed-alchemy/config.toml
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::base_dir()?.join("config.toml"))
    }

    /// Hugging Face hub cache consulted for remote models
    pub fn hub_cache_dir(&self) -> PathBuf {
        self.storage.cache_path.join("huggingface").join("hub")
    }

    /// Cache directory for auxiliary weights (ESRGAN, GFPGAN, ...)
    pub fn aux_cache_dir(&self, subfolder: &str) -> PathBuf {
        self.storage.cache_path.join(subfolder)
    }

    /// Read a dotted key for `seed-alchemy config <key>`
    pub fn get_value(&self, key: &str) -> Result<String> {
        match key {
            "daemon.host" => Ok(self.daemon.host.clone()),
            "daemon.port" => Ok(self.daemon.port.to_string()),
            "storage.storage_path" => Ok(self.storage.storage_path.display().to_string()),
            "storage.cache_path" => Ok(self.storage.cache_path.display().to_string()),
            "storage.users" => Ok(self.storage.users.join(",")),
            "models.models_path" => Ok(self
                .models
                .models_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
            "models.huggingface_models" => Ok(self.models.huggingface_models.join(",")),
            "models.install_control_net_v10" => Ok(self.models.install_control_net_v10.to_string()),
            "models.install_control_net_v11" => Ok(self.models.install_control_net_v11.to_string()),
            "models.install_control_net_mediapipe_v2" => {
                Ok(self.models.install_control_net_mediapipe_v2.to_string())
            }
            "device.device" => Ok(self.device.device.to_string()),
            "device.dtype" => Ok(self.device.dtype.clone().unwrap_or_default()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    /// Write a dotted key for `seed-alchemy config <key> <value>`
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let list = |value: &str| -> Vec<String> {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        match key {
            "daemon.host" => self.daemon.host = value.to_string(),
            "daemon.port" => self.daemon.port = value.parse()?,
            "storage.storage_path" => self.storage.storage_path = value.into(),
            "storage.cache_path" => self.storage.cache_path = value.into(),
            "storage.users" => self.storage.users = list(value),
            "models.models_path" => {
                self.models.models_path = if value.is_empty() {
                    None
                } else {
                    Some(value.into())
                }
            }
            "models.huggingface_models" => self.models.huggingface_models = list(value),
            "models.install_control_net_v10" => self.models.install_control_net_v10 = value.parse()?,
            "models.install_control_net_v11" => self.models.install_control_net_v11 = value.parse()?,
            "models.install_control_net_mediapipe_v2" => {
                self.models.install_control_net_mediapipe_v2 = value.parse()?
            }
            "device.device" => self.device.device = value.parse()?,
            "device.dtype" => {
                self.device.dtype = match value {
                    "" => None,
                    "f16" | "bf16" | "f32" => Some(value.to_string()),
                    _ => anyhow::bail!("Unsupported dtype: {}", value),
                }
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.daemon.port, 8000);
        assert_eq!(config.storage.users, vec!["default".to_string()]);
        assert!(config.models.install_control_net_v11);
        assert!(!config.models.install_control_net_v10);
        assert_eq!(config.device.device, DeviceChoice::Auto);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[daemon]\nport = 9100\n\n[device]\ndevice = \"cpu\"\ndtype = \"f32\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.daemon.port, 9100);
        assert_eq!(config.daemon.host, "127.0.0.1");
        assert_eq!(config.device.device, DeviceChoice::Cpu);
        assert_eq!(config.device.dtype.as_deref(), Some("f32"));
        assert_eq!(config.models.huggingface_models.len(), 4);
    }

    #[test]
    fn save_then_load_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.set_value("storage.users", "alice, bob").unwrap();
        config.set_value("models.models_path", "/srv/models").unwrap();
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn dotted_keys_round_trip() {
        let mut config = Config::default();
        config.set_value("daemon.port", "8123").unwrap();
        config.set_value("device.device", "mps").unwrap();
        assert_eq!(config.get_value("daemon.port").unwrap(), "8123");
        assert_eq!(config.get_value("device.device").unwrap(), "metal");
        assert!(config.set_value("device.dtype", "f64").is_err());
        assert!(config.get_value("inference.top_p").is_err());
    }
}
