use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CACHE_CAPACITY: usize = 64;
const DEFAULT_EXAMPLE_IMAGE: &str = "resources/example.jpg";
const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration.
///
/// Layered: built-in defaults, then an optional TOML file named by
/// `FACELENS_CONFIG`, then `FACELENS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing the model files.
    pub model_dir: PathBuf,
    /// Maximum number of memoized results.
    pub cache_capacity: usize,
    /// Image used when the caller does not supply one.
    pub example_image: PathBuf,
    /// V4L2 device for the live path.
    pub camera_device: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            example_image: PathBuf::from(DEFAULT_EXAMPLE_IMAGE),
            camera_device: DEFAULT_CAMERA_DEVICE.to_string(),
        }
    }
}

impl Config {
    /// Load defaults → `FACELENS_CONFIG` file → environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FACELENS_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACELENS_*` overrides from `lookup`. Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FACELENS_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(capacity) = lookup("FACELENS_CACHE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.cache_capacity = capacity;
        }
        if let Some(image) = lookup("FACELENS_EXAMPLE_IMAGE") {
            self.example_image = PathBuf::from(image);
        }
        if let Some(device) = lookup("FACELENS_CAMERA_DEVICE") {
            self.camera_device = device;
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }
}

/// Locations of every model file the backend may load.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPaths {
    /// Light SCRFD network (`DetectionModel::Hog`).
    pub light_detector: String,
    /// Heavy SCRFD network (`DetectionModel::Cnn`).
    pub heavy_detector: String,
    pub landmarks_68: String,
    pub encoder: String,
    /// SeetaFace cascade for the fast path.
    pub cascade: String,
}

impl ModelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        let file = |name: &str| dir.join(name).to_string_lossy().into_owned();
        Self {
            light_detector: file("det_500m.onnx"),
            heavy_detector: file("det_10g.onnx"),
            landmarks_68: file("landmark_68.onnx"),
            encoder: file("face_encoder_128.onnx"),
            cascade: file("seeta_fd_frontal_v1.0.bin"),
        }
    }
}

/// `$XDG_DATA_HOME/facelens/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facelens")
        .join("models")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_toml_partial_keeps_defaults() {
        let config = Config::from_toml_str("cache_capacity = 8\nmodel_dir = \"/opt/models\"").unwrap();
        assert_eq!(config.cache_capacity, 8);
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.example_image, PathBuf::from(DEFAULT_EXAMPLE_IMAGE));
        assert_eq!(config.camera_device, DEFAULT_CAMERA_DEVICE);
    }

    #[test]
    fn test_toml_rejects_wrong_types() {
        assert!(Config::from_toml_str("cache_capacity = \"many\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FACELENS_MODEL_DIR", "/models"),
            ("FACELENS_CACHE_CAPACITY", "0"),
            ("FACELENS_CAMERA_DEVICE", "/dev/video4"),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.model_dir, PathBuf::from("/models"));
        assert_eq!(config.cache_capacity, 0);
        assert_eq!(config.camera_device, "/dev/video4");
    }

    #[test]
    fn test_env_ignores_bad_numbers() {
        let mut config = Config::default();
        config.apply_overrides(|k| (k == "FACELENS_CACHE_CAPACITY").then(|| "lots".to_string()));
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_model_paths_join_dir() {
        let paths = ModelPaths::in_dir(Path::new("/m"));
        assert_eq!(paths.light_detector, "/m/det_500m.onnx");
        assert_eq!(paths.heavy_detector, "/m/det_10g.onnx");
        assert_eq!(paths.cascade, "/m/seeta_fd_frontal_v1.0.bin");
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = Config::from_file("/nonexistent/facelens.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
