//! genloop-rs: greedy autoregressive decoding over an opaque inference session
//!
//! This library drives token-by-token generation against a stateful
//! inference session: each step feeds the newest token plus the cached
//! key/value state, argmaxes the returned logits, and swaps the fresh cache
//! in, until a stop token, the token budget, or a cancellation request ends
//! the loop. The session itself (construction, execution providers, the
//! tensor engine) is an external collaborator behind the [`Session`] trait.
//!
//! ## Key Features
//!
//! - **Explicit buffer ownership**: device-resident tensors are released
//!   exactly once on every exit path; leaks and double releases are counted
//!   on a [`ReleaseLedger`]
//! - **Typed feed**: named tensor slots (`input_ids`, `attention_mask`,
//!   `position_ids`, per-layer KV cache) instead of a string-keyed map
//! - **Cooperative cancellation**: a cloneable [`StopHandle`] polled once
//!   per loop iteration
//! - **Progress callbacks**: full-sequence snapshots every 32 tokens and at
//!   loop exit
//!
//! ## Architecture
//!
//! ```text
//! caller ──► GenerationEngine ──► per-step tensors ──► SessionState ──► Session
//!               ▲    │                                      │
//!               │    └── argmax / append / callback ◄── logits + present.*
//!               └──────── full token sequence ◄── KV cache swap
//! ```

pub mod error;
pub mod inference;
pub mod model;
pub mod session;
pub mod tensor;

// Re-exports
pub use error::{Error, Result};
pub use inference::{GenerationEngine, StopHandle};
pub use model::{ModelBundle, ModelConfig};
pub use session::{Feed, Outputs, RunOptions, Session, SessionBuilder, SessionState};
pub use tensor::{DType, Device, ReleaseLedger, Tensor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
