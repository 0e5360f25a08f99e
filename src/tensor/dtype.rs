//! Data types for tensors

use serde::{Deserialize, Serialize};

/// Supported data types for session tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// 64-bit signed integer (token ids, masks, positions)
    I64,
}

impl DType {
    /// Size in bytes of a single element
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
        }
    }

    /// Parse from a config.json `torch_dtype` string
    pub fn from_config_str(s: &str) -> Option<Self> {
        match s {
            "float32" | "F32" => Some(DType::F32),
            "float16" | "F16" => Some(DType::F16),
            "int64" | "I64" => Some(DType::I64),
            _ => None,
        }
    }

    /// Is this a floating point type?
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
