//! Renderer settings
//!
//! Loaded from a TOML file when present, with defaults that work on any
//! machine. Validation layers default off; turn them on during bringup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    /// Window title
    pub title: String,
    /// Initial window size
    pub width: u32,
    pub height: u32,
    /// Enable the Khronos validation layer and the debug messenger
    pub validation: bool,
    /// Which physical device to use, in enumeration order
    pub device_index: usize,
    /// Size of the per-frame uniform ring in bytes
    pub ubo_ring_size: u64,
    /// Render graph config file; the built-in forward config when absent
    pub render_config: Option<PathBuf>,
    /// Directory searched for compiled shaders
    pub shader_dir: PathBuf,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            title: "SceneEngine".to_string(),
            width: 1280,
            height: 720,
            validation: false,
            device_index: 0,
            ubo_ring_size: crate::render::vulkan::buffer::DEFAULT_UBO_RING_SIZE,
            render_config: None,
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

impl RendererSettings {
    /// Load from a TOML file; missing keys fall back to defaults
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let settings = RendererSettings::default();
        assert_eq!(settings.device_index, 0);
        assert!(!settings.validation);
        assert_eq!(settings.ubo_ring_size, 512 * 2048);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings: RendererSettings = toml::from_str(
            r#"
            title = "Demo"
            validation = true
            device_index = 1
            "#,
        )
        .unwrap();
        assert_eq!(settings.title, "Demo");
        assert!(settings.validation);
        assert_eq!(settings.device_index, 1);
        assert_eq!(settings.width, 1280);
        assert_eq!(settings.shader_dir, PathBuf::from("shaders"));
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(toml::from_str::<RendererSettings>("width = \"wide\"").is_err());
    }
}
