use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Which of the two model variants to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Separate language and vision encoders fused at the pooled outputs.
    #[default]
    TwoStream,
    /// Baseline: text tokens and image regions share one encoder.
    SingleStream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Width of every hidden state, text and visual alike.
    pub hidden_size: i64,
    /// Number of attention heads per layer.
    pub num_heads: i64,
    /// Encoder depth for the text stream (or the shared stream of the baseline).
    pub text_layers: i64,
    /// Encoder depth for the visual stream; unused by the baseline.
    pub visual_layers: i64,
    /// Size of the word-piece vocabulary.
    pub vocab_size: i64,
    /// Maximum number of text positions.
    pub max_position_embeddings: i64,
    /// Number of segment ids.
    pub type_vocab_size: i64,
    /// Width of one region feature vector.
    pub v_feature_size: i64,
    /// Width of one region box descriptor.
    pub v_spatial_size: i64,
    pub dropout: f64,
    pub layer_norm_epsilon: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            num_heads: 12,
            text_layers: 6,
            visual_layers: 2,
            vocab_size: 30522,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            v_feature_size: 2048,
            v_spatial_size: 5,
            dropout: 0.1,
            layer_norm_epsilon: 1e-12,
        }
    }
}

impl ModelConfig {
    pub fn head_size(&self) -> i64 {
        self.hidden_size / self.num_heads
    }

    /// Reads a config from JSON or YAML, picked by file extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let is_json = path.extension().map_or(false, |ext| ext == "json");
        if is_json {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(serde_yaml::from_str(&content)?)
        }
    }
}
