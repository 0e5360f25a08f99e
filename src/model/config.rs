//! Model configuration parsing

use crate::tensor::DType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Model configuration parsed from config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hidden size (embedding dimension)
    pub hidden_size: usize,

    /// Number of transformer layers
    pub num_hidden_layers: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of KV heads (for GQA)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    /// Vocabulary size
    #[serde(default)]
    pub vocab_size: usize,

    /// Numeric precision of session tensors ("float16" or "float32")
    #[serde(default = "default_torch_dtype")]
    pub torch_dtype: String,

    /// End-of-sequence token ids. config.json carries `eos_token_id` as
    /// either a scalar or an array depending on the model family; both are
    /// normalized here during parsing.
    #[serde(skip)]
    pub eos_token_ids: Vec<i64>,
}

fn default_torch_dtype() -> String {
    "float32".to_string()
}

impl ModelConfig {
    /// Load config from a model directory
    pub fn from_dir(model_dir: impl AsRef<Path>) -> Result<Self> {
        let config_path = model_dir.as_ref().join("config.json");
        let config_str = std::fs::read_to_string(&config_path)
            .map_err(|e| Error::Load(format!("failed to read config.json: {}", e)))?;

        let raw: Value = serde_json::from_str(&config_str)
            .map_err(|e| Error::Load(format!("failed to parse config.json: {}", e)))?;

        Self::from_json(&raw)
    }

    /// Parse config from an already-loaded JSON value
    pub fn from_json(raw: &Value) -> Result<Self> {
        let mut config: ModelConfig = serde_json::from_value(raw.clone())
            .map_err(|e| Error::Load(format!("failed to parse config.json: {}", e)))?;

        if config.num_attention_heads == 0 {
            return Err(Error::Load("num_attention_heads must be nonzero".to_string()));
        }

        config.eos_token_ids = parse_eos_token_ids(raw);
        Ok(config)
    }

    /// Numeric precision for KV cache buffers and logits
    pub fn precision(&self) -> Result<DType> {
        DType::from_config_str(&self.torch_dtype)
            .filter(DType::is_float)
            .ok_or_else(|| Error::Load(format!("unsupported torch_dtype: {}", self.torch_dtype)))
    }

    /// Get number of KV heads (defaults to num_attention_heads if not set)
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Get head dimension
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Shape template for an empty KV cache entry. The cache-length axis
    /// (index 2) starts at zero and grows one per generated token.
    pub fn kv_cache_shape(&self) -> Vec<usize> {
        vec![1, self.num_kv_heads(), 0, self.head_dim()]
    }
}

/// `eos_token_id` may be a single id or an array of ids.
fn parse_eos_token_ids(raw: &Value) -> Vec<i64> {
    match raw.get("eos_token_id") {
        Some(Value::Number(n)) => n.as_i64().into_iter().collect(),
        Some(Value::Array(ids)) => ids.iter().filter_map(Value::as_i64).collect(),
        _ => Vec::new(),
    }
}
