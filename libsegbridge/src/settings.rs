//! Segmentation settings: where the collaborator lives and how frames are handed to it

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// How an image is handed to the segmentation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Read the image natively and pass it as an array
    #[default]
    Array,
    /// Pass the image path as a string and let the collaborator read it
    Path,
}

/// What to do when the segmentation call fails for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FrameErrorPolicy {
    /// Report the frame as failed and carry on with the next one
    #[default]
    Skip,
    /// Call again up to `attempts` more times before reporting the frame as failed
    Retry { attempts: u32 },
    /// Stop processing at the first failed frame
    Abort,
}

impl FrameErrorPolicy {
    /// Total number of calls made for one frame
    pub const fn max_calls(self) -> u32 {
        match self {
            Self::Retry { attempts } => attempts.saturating_add(1),
            Self::Skip | Self::Abort => 1,
        }
    }

    pub const fn aborts(self) -> bool {
        matches!(self, Self::Abort)
    }
}

const fn default_allow_nd() -> bool {
    true
}

/// Location of the segmentation collaborator and how to drive it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationSettings {
    /// Module search path, entries separated like `PATH`
    #[serde(default, alias = "py_path")]
    pub search_path: Option<String>,

    pub module_name: String,

    pub class_name: String,

    #[serde(alias = "get_dyn_seg")]
    pub method_name: String,

    /// Image segmented once at startup to load the model
    #[serde(default)]
    pub warmup_image: Option<PathBuf>,

    #[serde(default)]
    pub input_mode: InputMode,

    #[serde(default)]
    pub frame_error_policy: FrameErrorPolicy,

    /// Accept masks with more than two dimensions
    #[serde(default = "default_allow_nd")]
    pub allow_nd: bool,
}

impl SegmentationSettings {
    pub fn new(
        module_name: impl Into<String>,
        class_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            search_path: None,
            module_name: module_name.into(),
            class_name: class_name.into(),
            method_name: method_name.into(),
            warmup_image: None,
            input_mode: InputMode::default(),
            frame_error_policy: FrameErrorPolicy::default(),
            allow_nd: true,
        }
    }

    /// Load settings from a `.yaml`/`.yml` or `.toml` file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let settings = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(&text)?,
            Some("toml") => Self::from_toml_str(&text)?,
            _ => {
                return Err(BridgeError::Settings(format!(
                    "unrecognised settings file extension: {}",
                    path.display()
                )))
            }
        };
        log::info!("Loaded segmentation settings from {}", path.display());
        log::info!("    search_path: {:?}", settings.search_path);
        log::info!("    module_name: {}", settings.module_name);
        log::info!("    class_name: {}", settings.class_name);
        log::info!("    method_name: {}", settings.method_name);
        settings.validate()?;
        Ok(settings)
    }

    /// Parse YAML settings. A leading `%YAML:1.0` directive line, as written
    /// by OpenCV's `FileStorage`, is skipped.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let body = match text.split_once('\n') {
            Some((first, rest)) if first.trim_start().starts_with("%YAML") => rest,
            _ => text,
        };
        serde_yaml::from_str(body).map_err(|e| BridgeError::Settings(e.to_string()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BridgeError::Settings(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("module_name", &self.module_name),
            ("class_name", &self.class_name),
            ("method_name", &self.method_name),
        ] {
            if value.trim().is_empty() {
                return Err(BridgeError::Settings(format!("{field} must not be empty")));
            }
        }
        if let FrameErrorPolicy::Retry { attempts: 0 } = self.frame_error_policy {
            return Err(BridgeError::Settings(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        Ok(())
    }

    /// Search path entries, split with the platform's path list separator
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.search_path
            .as_deref()
            .map(|paths| std::env::split_paths(paths).collect())
            .unwrap_or_default()
    }
}
