//! Session lifecycle and persistent KV cache state
//!
//! Owns the session handle, the feed it is invoked with, and the model
//! metadata fixed at load time. Everything here is transactional with
//! respect to buffer ownership: a failed load leaves the same fully
//! released state as an explicit [`SessionState::release`].

use super::feed::{parse_present_name, Feed, KvKind, PRESENT_PREFIX};
use super::{Outputs, RunOptions, Session, SessionBuilder};
use crate::model::ModelBundle;
use crate::tensor::{DType, ReleaseLedger, Tensor};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Session handle, feed, and load-time model metadata.
pub struct SessionState {
    session: Option<Box<dyn Session>>,
    feed: Feed,
    stop_tokens: Vec<i64>,
    num_layers: usize,
    kv_shape: Vec<usize>,
    precision: DType,
    ledger: Arc<ReleaseLedger>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// Create an empty state with no active session
    pub fn new() -> Self {
        Self::with_ledger(Arc::new(ReleaseLedger::new()))
    }

    /// Create an empty state sharing an existing buffer ledger
    pub fn with_ledger(ledger: Arc<ReleaseLedger>) -> Self {
        Self {
            session: None,
            feed: Feed::default(),
            stop_tokens: Vec::new(),
            num_layers: 0,
            kv_shape: Vec::new(),
            precision: DType::F32,
            ledger,
        }
    }

    /// Whether a session is active and ready to run
    pub fn is_ready(&self) -> bool {
        self.session.is_some()
    }

    /// Buffer ledger shared with session-created device tensors
    pub fn ledger(&self) -> &Arc<ReleaseLedger> {
        &self.ledger
    }

    /// Token ids that terminate generation
    pub fn stop_tokens(&self) -> &[i64] {
        &self.stop_tokens
    }

    /// Add a model-family-specific stop id (e.g. a chat end marker) on top
    /// of the config-declared set
    pub fn add_stop_token(&mut self, token: i64) {
        if !self.stop_tokens.contains(&token) {
            self.stop_tokens.push(token);
        }
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn precision(&self) -> DType {
        self.precision
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut Feed {
        &mut self.feed
    }

    /// Replace any existing session with one built from the bundle.
    ///
    /// The prior session and its cache tensors are released first. On any
    /// failure the state is left fully released, never half-loaded.
    pub fn load(&mut self, bundle: &ModelBundle, builder: &dyn SessionBuilder) -> Result<()> {
        self.release();

        let config = &bundle.config;
        let precision = config.precision()?;

        let session = builder
            .build(bundle.weights(), config)
            .map_err(|e| Error::Load(format!("session construction failed: {}", e)))?;

        self.session = Some(session);
        self.stop_tokens = config.eos_token_ids.clone();
        self.num_layers = config.num_hidden_layers;
        self.kv_shape = config.kv_cache_shape();
        self.precision = precision;
        self.initialize_feed();

        info!(
            "session loaded: {} layers, cache template {:?}, precision {}, stop tokens {:?}",
            self.num_layers, self.kv_shape, self.precision, self.stop_tokens
        );
        Ok(())
    }

    /// Reset the feed to the empty-cache state: release everything currently
    /// held, then install one zero-length placeholder per layer per KV slot.
    /// Idempotent; safe to call before any generation.
    pub fn initialize_feed(&mut self) {
        self.feed.release_all();
        self.feed = Feed::with_layers(self.num_layers);
        for layer in 0..self.num_layers {
            self.feed.set_cache(
                layer,
                KvKind::Key,
                Tensor::empty(self.precision, self.kv_shape.clone()),
            );
            self.feed.set_cache(
                layer,
                KvKind::Value,
                Tensor::empty(self.precision, self.kv_shape.clone()),
            );
        }
    }

    /// Run one inference step over the current feed
    pub fn run(&mut self, options: &RunOptions) -> Result<Outputs> {
        let session = self.session.as_mut().ok_or(Error::SessionNotReady)?;
        session.run(&self.feed, options)
    }

    /// Greedy next-token selection over the final sequence position of a
    /// `[batch, seq, vocab]` logits tensor. First index wins ties; any
    /// non-finite value is rejected rather than silently selected.
    pub fn argmax(logits: &Tensor) -> Result<i64> {
        let shape = logits.shape();
        if shape.len() != 3 {
            return Err(Error::InvalidOutput(format!(
                "expected [batch, seq, vocab] logits, got {:?}",
                shape
            )));
        }
        let (seq, vocab) = (shape[1], shape[2]);
        if seq == 0 || vocab == 0 {
            return Err(Error::InvalidOutput(format!(
                "empty logits tensor {:?}",
                shape
            )));
        }

        // Next-token prediction reads only the final timestep's row.
        let row = logits
            .f32_range((seq - 1) * vocab, vocab)
            .map_err(|e| Error::InvalidOutput(format!("logits: {}", e)))?;

        let mut best = 0usize;
        let mut best_val = f32::NEG_INFINITY;
        for (i, &v) in row.iter().enumerate() {
            if !v.is_finite() {
                return Err(Error::InvalidOutput(format!(
                    "non-finite logit {} at vocab index {}",
                    v, i
                )));
            }
            if v > best_val {
                best_val = v;
                best = i;
            }
        }

        i64::try_from(best)
            .map_err(|_| Error::TokenDecode(format!("token index {} exceeds i64 range", best)))
    }

    /// Swap the step's fresh `present.*` outputs into the `past_key_values.*`
    /// feed slots, releasing the superseded cache tensors first. Outputs that
    /// do not carry the present prefix stay in the map, still owned by the
    /// caller.
    pub fn update_kv_cache(&mut self, outputs: &mut Outputs) {
        self.feed.release_cache();

        let present: Vec<String> = outputs
            .names()
            .filter(|name| name.starts_with(PRESENT_PREFIX))
            .map(str::to_owned)
            .collect();

        for name in present {
            if let Some((layer, kind)) = parse_present_name(&name) {
                if let Some(tensor) = outputs.take(&name) {
                    self.feed.set_cache(layer, kind, tensor);
                }
            }
        }
    }

    /// Tear down the session and every tensor in the feed. Idempotent.
    pub fn release(&mut self) {
        self.feed.release_all();
        if let Some(session) = self.session.take() {
            drop(session);
            debug!("session released");
        }
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.release();
    }
}
