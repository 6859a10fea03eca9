//! Declarative pipeline descriptions.
//!
//! A pipeline is written as a list of stages tagged by `kind`:
//!
//! ```toml
//! name = "flatbed color"
//!
//! [[stages]]
//! kind = "format_convert"
//! target = "rgb24"
//!
//! [[stages]]
//! kind = "color_correction"
//! gamma = 1.8
//! auto_white_balance = true
//!
//! [[stages]]
//! kind = "noise_reduction"
//! algorithm = "bilateral"
//! strength = 0.3
//! ```

use crate::core::error::{ConfigError, ProcessingResult};
use crate::core::format::PixelFormat;
use crate::core::node::ProcessingNode;
use crate::nodes::color::IDENTITY_MATRIX;
use crate::nodes::{
    ColorCorrectionNode, FormatConvertNode, NoiseAlgorithm, NoiseReductionNode, PixelShiftNode,
    SinkNode, SourceNode,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn one() -> f32 {
    1.0
}

fn half() -> f32 {
    0.5
}

fn identity_matrix() -> [[f32; 3]; 3] {
    IDENTITY_MATRIX
}

/// Serializable description of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    Source {
        #[serde(default)]
        expected_format: Option<PixelFormat>,
        #[serde(default)]
        max_width: Option<u32>,
        #[serde(default)]
        max_height: Option<u32>,
    },
    FormatConvert {
        target: PixelFormat,
    },
    PixelShift {
        #[serde(default)]
        dx: f32,
        #[serde(default)]
        dy: f32,
        #[serde(default)]
        channel_offsets: Vec<(f32, f32)>,
    },
    ColorCorrection {
        #[serde(default = "one")]
        brightness: f32,
        #[serde(default = "one")]
        contrast: f32,
        #[serde(default = "one")]
        gamma: f32,
        #[serde(default = "one")]
        saturation: f32,
        #[serde(default = "identity_matrix")]
        matrix: [[f32; 3]; 3],
        #[serde(default)]
        auto_white_balance: bool,
        #[serde(default)]
        auto_color_restoration: bool,
    },
    NoiseReduction {
        #[serde(default)]
        algorithm: NoiseAlgorithm,
        #[serde(default = "half")]
        strength: f32,
        #[serde(default)]
        preserve_details: bool,
    },
    Sink {
        #[serde(default)]
        convert_to: Option<PixelFormat>,
    },
}

impl StageConfig {
    /// Build and validate the node this stage describes.
    pub fn build(&self) -> ProcessingResult<Box<dyn ProcessingNode>> {
        let node: Box<dyn ProcessingNode> = match self {
            StageConfig::Source {
                expected_format,
                max_width,
                max_height,
            } => {
                let mut node = SourceNode::new();
                if let Some(format) = expected_format {
                    node = node.with_format(*format);
                }
                if max_width.is_some() || max_height.is_some() {
                    node = node.with_max_dimensions(
                        max_width.unwrap_or(u32::MAX),
                        max_height.unwrap_or(u32::MAX),
                    );
                }
                Box::new(node)
            }
            StageConfig::FormatConvert { target } => Box::new(FormatConvertNode::new(*target)),
            StageConfig::PixelShift {
                dx,
                dy,
                channel_offsets,
            } => Box::new(PixelShiftNode::new(*dx, *dy).with_channel_offsets(channel_offsets.clone())),
            StageConfig::ColorCorrection {
                brightness,
                contrast,
                gamma,
                saturation,
                matrix,
                auto_white_balance,
                auto_color_restoration,
            } => Box::new(
                ColorCorrectionNode::new()
                    .with_brightness(*brightness)
                    .with_contrast(*contrast)
                    .with_gamma(*gamma)
                    .with_saturation(*saturation)
                    .with_matrix(*matrix)
                    .with_auto_white_balance(*auto_white_balance)
                    .with_auto_color_restoration(*auto_color_restoration),
            ),
            StageConfig::NoiseReduction {
                algorithm,
                strength,
                preserve_details,
            } => Box::new(
                NoiseReductionNode::new(*algorithm, *strength).with_preserve_details(*preserve_details),
            ),
            StageConfig::Sink { convert_to } => {
                let mut node = SinkNode::new();
                if let Some(format) = convert_to {
                    node = node.with_output_format(*format);
                }
                Box::new(node)
            }
        };
        node.validate()?;
        Ok(node)
    }
}

/// A named, ordered list of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescription {
    /// Description format version.
    #[serde(default = "PipelineDescription::current_version")]
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl PipelineDescription {
    /// Current format version.
    pub const VERSION: &'static str = "1.0.0";

    fn current_version() -> String {
        Self::VERSION.to_string()
    }

    pub fn new(stages: Vec<StageConfig>) -> Self {
        Self {
            version: Self::current_version(),
            name: None,
            stages,
        }
    }

    /// Parse from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for PipelineDescription {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
