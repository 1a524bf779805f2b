//! Render graph configuration
//!
//! The pass layout (render targets, their attachments, and the passes that
//! write them) is data, loaded from a RON file at renderer start. The
//! default configuration is a single forward pass straight to the viewport.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name a pass outputs to when it renders to the swapchain directly
pub const VIEWPORT_TARGET: &str = "Viewport";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read render config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse render config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("Invalid render config: {0}")]
    Invalid(String),
}

/// Channel layout and depth of one render-target attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentFormat {
    RgbaFloat32,
    RgbaFloat16,
    RgbaUint32,
    RgbaUint16,
    RgbaUint8,
    Depth32,
    Depth24,
}

impl AttachmentFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, AttachmentFormat::Depth32 | AttachmentFormat::Depth24)
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            AttachmentFormat::RgbaUint32 | AttachmentFormat::RgbaUint16 | AttachmentFormat::RgbaUint8
        )
    }

    /// Channel depth in bits
    pub fn bits(&self) -> u32 {
        match self {
            AttachmentFormat::RgbaFloat32 | AttachmentFormat::RgbaUint32 | AttachmentFormat::Depth32 => 32,
            AttachmentFormat::RgbaFloat16 | AttachmentFormat::RgbaUint16 => 16,
            AttachmentFormat::Depth24 => 24,
            AttachmentFormat::RgbaUint8 => 8,
        }
    }
}

/// How a pass traverses its input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassType {
    /// Draws scene geometry with per-object state
    Geometry,
    /// Draws one full-screen quad sampling earlier targets
    Quad,
}

/// Shader-tweakable parameter declared in the config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Float(f32),
    Int(i32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
}

/// One named attachment of a render target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    pub name: String,
    pub format: AttachmentFormat,
}

/// Offscreen render target and its attachments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub attachments: Vec<AttachmentConfig>,
}

/// One render pass of the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassConfig {
    pub name: String,
    pub pass_type: PassType,
    /// Shader file names, stages inferred from extensions
    pub shaders: Vec<String>,
    /// Render targets sampled by this pass
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Render target written by this pass, or `Viewport`
    pub output: String,
    /// Values surfaced to the pass's parameter uniform block
    #[serde(default)]
    pub parameters: HashMap<String, ParamValue>,
}

/// Complete render graph description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    pub passes: Vec<PassConfig>,
}

impl RenderConfig {
    /// Load and validate a RON config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// Parse and validate a RON config string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let config: RenderConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Single forward pass rendering straight to the swapchain
    pub fn forward() -> Self {
        Self {
            name: "Forward".to_string(),
            description: "Forward shading, one geometry pass to the viewport".to_string(),
            targets: Vec::new(),
            passes: vec![PassConfig {
                name: "Scene".to_string(),
                pass_type: PassType::Geometry,
                shaders: vec!["forward.vert.spv".to_string(), "forward.frag.spv".to_string()],
                inputs: Vec::new(),
                output: VIEWPORT_TARGET.to_string(),
                parameters: HashMap::new(),
            }],
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.passes.is_empty() {
            return Err(ConfigError::Invalid("No passes defined".to_string()));
        }

        let target_names: Vec<&str> = self.targets.iter().map(|t| t.name.as_str()).collect();
        for target in &self.targets {
            if target.attachments.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Target '{}' has no attachments",
                    target.name
                )));
            }
            let depth_count = target.attachments.iter().filter(|a| a.format.is_depth()).count();
            if depth_count > 1 {
                return Err(ConfigError::Invalid(format!(
                    "Target '{}' declares more than one depth attachment",
                    target.name
                )));
            }
        }

        for pass in &self.passes {
            if pass.shaders.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Pass '{}' has no shaders",
                    pass.name
                )));
            }
            if pass.output != VIEWPORT_TARGET && !target_names.contains(&pass.output.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Pass '{}' outputs to unknown target '{}'",
                    pass.name, pass.output
                )));
            }
            for input in &pass.inputs {
                if !target_names.contains(&input.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "Pass '{}' reads unknown target '{input}'",
                        pass.name
                    )));
                }
            }
        }

        if self.passes.last().map(|p| p.output.as_str()) != Some(VIEWPORT_TARGET) {
            return Err(ConfigError::Invalid(
                "Final pass must output to the viewport".to_string(),
            ));
        }

        Ok(())
    }

    /// Look up a target's attachment list
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFERRED: &str = r#"
        RenderConfig(
            name: "Deferred",
            description: "Geometry into a G-buffer, then a lighting quad",
            targets: [
                TargetConfig(
                    name: "GBuffer",
                    attachments: [
                        AttachmentConfig(name: "Albedo", format: RgbaUint8),
                        AttachmentConfig(name: "Normal", format: RgbaFloat16),
                        AttachmentConfig(name: "Depth", format: Depth32),
                    ],
                ),
            ],
            passes: [
                PassConfig(
                    name: "Scene",
                    pass_type: Geometry,
                    shaders: ["gbuffer.vert.spv", "gbuffer.frag.spv"],
                    output: "GBuffer",
                ),
                PassConfig(
                    name: "Lighting",
                    pass_type: Quad,
                    shaders: ["quad.vert.spv", "lighting.frag.spv"],
                    inputs: ["GBuffer"],
                    output: "Viewport",
                    parameters: { "exposure": Float(1.0) },
                ),
            ],
        )
    "#;

    #[test]
    fn test_parse_deferred_config() {
        let config = RenderConfig::from_str(DEFERRED).unwrap();
        assert_eq!(config.passes.len(), 2);
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.passes[1].inputs, vec!["GBuffer"]);
        assert_eq!(
            config.passes[1].parameters.get("exposure"),
            Some(&ParamValue::Float(1.0))
        );
    }

    #[test]
    fn test_default_forward_config_is_valid() {
        let config = RenderConfig::forward();
        assert!(config.validate().is_ok());
        assert_eq!(config.passes.len(), 1);
        assert_eq!(config.passes[0].output, VIEWPORT_TARGET);
    }

    #[test]
    fn test_unknown_output_target_rejected() {
        let mut config = RenderConfig::forward();
        config.passes[0].output = "Nowhere".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_final_pass_must_hit_viewport() {
        let mut config = RenderConfig::from_str(DEFERRED).unwrap();
        config.passes.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_two_depth_attachments_rejected() {
        let mut config = RenderConfig::from_str(DEFERRED).unwrap();
        config.targets[0].attachments.push(AttachmentConfig {
            name: "Depth2".to_string(),
            format: AttachmentFormat::Depth24,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_format_properties() {
        assert!(AttachmentFormat::Depth32.is_depth());
        assert!(!AttachmentFormat::RgbaFloat16.is_depth());
        assert!(AttachmentFormat::RgbaUint16.is_unsigned());
        assert_eq!(AttachmentFormat::RgbaFloat32.bits(), 32);
        assert_eq!(AttachmentFormat::Depth24.bits(), 24);
    }
}
