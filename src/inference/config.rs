//! Model and generation configuration consumed by the caches
//!
//! Mirrors the decoder section of a model's `genai_config`-style JSON. Every
//! slot-name template has a default, so a minimal config only carries the
//! geometry.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Model-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture tag, e.g. `"llama"` or `"whisper"`
    #[serde(rename = "type")]
    pub model_type: String,

    /// Maximum sequence length the model supports
    pub context_length: usize,

    pub decoder: DecoderConfig,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.context_length == 0 {
            return Err(Error::InvalidConfig {
                reason: "context_length must be > 0".into(),
            });
        }
        self.decoder.validate(self.context_length)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::InvalidConfig {
            reason: format!("IO error: {e}"),
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| Error::InvalidConfig {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn is_whisper(&self) -> bool {
        self.model_type == "whisper"
    }
}

/// Decoder geometry and slot names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub num_hidden_layers: usize,
    pub num_key_value_heads: usize,
    pub head_size: usize,

    #[serde(default)]
    pub inputs: DecoderInputNames,

    #[serde(default)]
    pub outputs: DecoderOutputNames,

    /// Encoder sequence length of the cross-attention cache
    #[serde(default = "default_cross_attention_length")]
    pub cross_attention_length: usize,

    #[serde(default)]
    pub sliding_window: Option<SlidingWindowConfig>,
}

fn default_cross_attention_length() -> usize {
    1500
}

impl DecoderConfig {
    pub fn validate(&self, context_length: usize) -> Result<()> {
        if self.num_hidden_layers == 0 {
            return Err(Error::InvalidConfig {
                reason: "num_hidden_layers must be > 0".into(),
            });
        }
        if self.num_key_value_heads == 0 {
            return Err(Error::InvalidConfig {
                reason: "num_key_value_heads must be > 0".into(),
            });
        }
        if self.head_size == 0 {
            return Err(Error::InvalidConfig {
                reason: "head_size must be > 0".into(),
            });
        }
        if self.cross_attention_length == 0 {
            return Err(Error::InvalidConfig {
                reason: "cross_attention_length must be > 0".into(),
            });
        }
        if let Some(window) = &self.sliding_window {
            window.validate(context_length)?;
        }
        Ok(())
    }
}

/// Input slot-name templates. Each holds exactly one `%d`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderInputNames {
    /// Combined key/value past, one per layer
    #[serde(default = "default_past_names")]
    pub past_names: String,
    #[serde(default = "default_past_key_names")]
    pub past_key_names: String,
    #[serde(default = "default_past_value_names")]
    pub past_value_names: String,
    #[serde(default = "default_cross_past_key_names")]
    pub cross_past_key_names: String,
    #[serde(default = "default_cross_past_value_names")]
    pub cross_past_value_names: String,
}

fn default_past_names() -> String {
    "past_%d".into()
}

fn default_past_key_names() -> String {
    "past_key_values.%d.key".into()
}

fn default_past_value_names() -> String {
    "past_key_values.%d.value".into()
}

fn default_cross_past_key_names() -> String {
    "past_key_cross_%d".into()
}

fn default_cross_past_value_names() -> String {
    "past_value_cross_%d".into()
}

impl Default for DecoderInputNames {
    fn default() -> Self {
        Self {
            past_names: default_past_names(),
            past_key_names: default_past_key_names(),
            past_value_names: default_past_value_names(),
            cross_past_key_names: default_cross_past_key_names(),
            cross_past_value_names: default_cross_past_value_names(),
        }
    }
}

/// Output slot-name templates. Each holds exactly one `%d`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderOutputNames {
    #[serde(default = "default_present_names")]
    pub present_names: String,
    #[serde(default = "default_present_key_names")]
    pub present_key_names: String,
    #[serde(default = "default_present_value_names")]
    pub present_value_names: String,
    #[serde(default = "default_cross_present_key_names")]
    pub cross_present_key_names: String,
    #[serde(default = "default_cross_present_value_names")]
    pub cross_present_value_names: String,
}

fn default_present_names() -> String {
    "present_%d".into()
}

fn default_present_key_names() -> String {
    "present.%d.key".into()
}

fn default_present_value_names() -> String {
    "present.%d.value".into()
}

fn default_cross_present_key_names() -> String {
    "present_key_cross_%d".into()
}

fn default_cross_present_value_names() -> String {
    "present_value_cross_%d".into()
}

impl Default for DecoderOutputNames {
    fn default() -> Self {
        Self {
            present_names: default_present_names(),
            present_key_names: default_present_key_names(),
            present_value_names: default_present_value_names(),
            cross_present_key_names: default_cross_present_key_names(),
            cross_present_value_names: default_cross_present_value_names(),
        }
    }
}

/// Fixed-capacity sliding-window cache settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Positions consumed per step before the window collapses to 1
    pub window_size: usize,

    /// Byte written into every "in" position at construction
    #[serde(default)]
    pub pad_value: u8,
}

impl SlidingWindowConfig {
    pub fn validate(&self, context_length: usize) -> Result<()> {
        if self.window_size == 0 || self.window_size >= context_length {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "sliding window_size ({}) must be in 1..{}",
                    self.window_size, context_length
                ),
            });
        }
        Ok(())
    }
}

/// Per-generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorParams {
    pub batch_size: usize,

    /// Prompt length of the first decoder run
    pub sequence_length: usize,

    #[serde(default)]
    pub search: SearchConfig,
}

impl GeneratorParams {
    pub fn new(batch_size: usize, sequence_length: usize) -> Self {
        Self {
            batch_size,
            sequence_length,
            search: SearchConfig::default(),
        }
    }

    /// Rows of every past tensor.
    pub fn batch_beam_size(&self) -> usize {
        self.batch_size * self.search.num_beams
    }

    /// `search.max_length`, falling back to the model context length.
    pub fn max_length(&self, model: &ModelConfig) -> usize {
        self.search.max_length.unwrap_or(model.context_length)
    }

    pub fn validate(&self, model: &ModelConfig) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig {
                reason: "batch_size must be > 0".into(),
            });
        }
        if self.search.num_beams == 0 {
            return Err(Error::InvalidConfig {
                reason: "num_beams must be > 0".into(),
            });
        }
        let max_length = self.max_length(model);
        if max_length == 0 || self.sequence_length > max_length {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "sequence_length ({}) must not exceed max_length ({})",
                    self.sequence_length, max_length
                ),
            });
        }
        Ok(())
    }
}

/// Search settings relevant to cache layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_num_beams")]
    pub num_beams: usize,

    #[serde(default)]
    pub max_length: Option<usize>,

    /// Request one fixed buffer per slot serving as both past and present
    #[serde(default)]
    pub past_present_share_buffer: bool,
}

fn default_num_beams() -> usize {
    1
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            num_beams: default_num_beams(),
            max_length: None,
            past_present_share_buffer: false,
        }
    }
}
