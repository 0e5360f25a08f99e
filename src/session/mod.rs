//! Inference session abstraction and named-tensor exchange types
//!
//! The tensor-execution engine is an external collaborator: this crate only
//! sees an opaque [`Session`] that consumes the current [`Feed`] and returns
//! a named [`Outputs`] map. Ownership of every tensor crossing that boundary
//! is explicit: outputs belong to the caller until they are absorbed into
//! the feed or released.

mod feed;
mod state;

pub use feed::{
    parse_present_name, past_key_name, Feed, KvKind, KvSlot, ATTENTION_MASK, INPUT_IDS,
    PAST_KEY_PREFIX, POSITION_IDS, PRESENT_PREFIX,
};
pub use state::SessionState;

use crate::model::ModelConfig;
use crate::tensor::Tensor;
use crate::Result;
use std::collections::HashMap;

/// Name of the next-token prediction output
pub const LOGITS_OUTPUT: &str = "logits";

/// Execution options passed to each inference call
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Hint the runtime to shrink its memory arena after this call.
    /// Performance advice only, never semantically required.
    pub shrink_arena: bool,
}

/// An opaque inference session: accepts the feed, returns named outputs.
pub trait Session: Send {
    /// Run one inference step over the current feed
    fn run(&mut self, feed: &Feed, options: &RunOptions) -> Result<Outputs>;
}

/// Constructs a session from raw weight bytes.
pub trait SessionBuilder {
    fn build(&self, weights: &[u8], config: &ModelConfig) -> Result<Box<dyn Session>>;
}

/// Named output tensors from one inference call.
///
/// The map owns its tensors until they are `take`n out or released.
#[derive(Debug, Default)]
pub struct Outputs {
    tensors: HashMap<String, Tensor>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an output tensor, transferring ownership into the map
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Remove and return an output, transferring ownership to the caller
    pub fn take(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    /// Names of the outputs still held by the map
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Release every tensor still held by the map
    pub fn release_all(&mut self) {
        for (_, mut tensor) in self.tensors.drain() {
            tensor.release();
        }
    }
}
