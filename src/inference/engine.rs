//! Greedy decode loop over a loaded session
//!
//! Each iteration feeds the session the newest token plus the cached KV
//! state, argmaxes the returned logits, swaps the fresh cache in, and
//! rebuilds the single-token inputs. Every tensor the loop constructs is
//! released on every exit path: normal completion, stop token, budget,
//! cancellation, and propagated session errors alike.

use crate::session::{RunOptions, SessionState, LOGITS_OUTPUT};
use crate::tensor::Tensor;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Progress callback cadence, in tokens
pub const CALLBACK_INTERVAL: usize = 32;

/// Cloneable handle for requesting cooperative cancellation.
///
/// `generate` holds `&mut self` for its whole duration, so a progress
/// callback cannot reach the engine directly; it captures one of these
/// instead. Takes effect at the next loop-iteration check.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Request cancellation of the in-flight `generate` call
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Drives autoregressive greedy decoding against a [`SessionState`].
///
/// Holds single-writer mutable state (the feed, the output sequence, the
/// scratch tensors); concurrent `generate` calls are unrepresentable since
/// `generate` takes `&mut self`.
pub struct GenerationEngine {
    state: SessionState,
    output: Vec<i64>,
    cancelled: Arc<AtomicBool>,
    use_position_ids: bool,
}

impl GenerationEngine {
    /// Create an engine around a session state
    pub fn new(state: SessionState) -> Self {
        Self {
            state,
            output: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            use_position_ids: true,
        }
    }

    /// Disable position-id inputs for model families that derive positions
    /// from the cache length
    pub fn with_position_ids(mut self, enabled: bool) -> Self {
        self.use_position_ids = enabled;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    /// Handle for cancelling from a progress callback or another thread
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.cancelled))
    }

    /// Request cooperative cancellation; polled once per loop iteration
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Generate greedily from the prompt until a stop token, the token
    /// budget, or cancellation ends the loop.
    ///
    /// Returns the full sequence (prompt plus continuation). `max_tokens`
    /// bounds the total length including the prompt. The callback receives a
    /// snapshot of the full sequence every [`CALLBACK_INTERVAL`] tokens and
    /// once more when the loop ends. The callback must not panic; unwinding
    /// through the loop skips the explicit release of in-flight buffers.
    pub fn generate(
        &mut self,
        prompt: &[i64],
        mut progress: Option<&mut dyn FnMut(&[i64])>,
        max_tokens: usize,
    ) -> Result<Vec<i64>> {
        if !self.state.is_ready() {
            return Err(Error::SessionNotReady);
        }

        // A stop request from before this call must not cancel it.
        self.cancelled.store(false, Ordering::Release);
        self.output.clear();
        self.output.extend_from_slice(prompt);

        info!(
            "generating from {} prompt tokens, budget {}",
            prompt.len(),
            max_tokens
        );

        let result = self.prefill_and_decode(prompt, &mut progress, max_tokens);

        // Scratch tensors are released on every exit path, error included.
        self.release_scratch();

        result?;
        if let Some(cb) = progress.as_mut() {
            cb(&self.output);
        }
        Ok(self.output.clone())
    }

    /// Clear the output sequence, release scratch tensors, and tear down the
    /// session and cache
    pub fn dispose(&mut self) {
        self.output.clear();
        self.release_scratch();
        self.state.release();
    }

    fn prefill_and_decode(
        &mut self,
        prompt: &[i64],
        progress: &mut Option<&mut dyn FnMut(&[i64])>,
        max_tokens: usize,
    ) -> Result<()> {
        // Prefill inputs span the whole prompt.
        let feed = self.state.feed_mut();
        feed.set_input_ids(Tensor::from_i64(prompt, vec![1, prompt.len()])?);
        if self.use_position_ids {
            let seq_len = self.output.len();
            let positions: Vec<i64> =
                ((seq_len - prompt.len()) as i64..seq_len as i64).collect();
            feed.set_position_ids(Tensor::from_i64(&positions, vec![1, prompt.len()])?);
        }

        let options = RunOptions { shrink_arena: true };

        while self.keep_going(max_tokens) {
            // Fresh all-ones mask over the sequence so far; the prior mask
            // is released by the slot swap.
            self.state
                .feed_mut()
                .set_attention_mask(Tensor::ones_i64(vec![1, self.output.len()]));

            let mut outputs = self.state.run(&options)?;

            let Some(mut logits) = outputs.take(LOGITS_OUTPUT) else {
                outputs.release_all();
                return Err(Error::MissingOutput(LOGITS_OUTPUT.to_string()));
            };

            let next = match SessionState::argmax(&logits) {
                Ok(token) => token,
                Err(err) => {
                    // Numeric corruption degrades to a truncated result
                    // rather than failing the whole call.
                    warn!("terminating generation early: {}", err);
                    logits.release();
                    outputs.release_all();
                    break;
                }
            };
            logits.release();

            self.output.push(next);
            debug!("step emitted token {} (len {})", next, self.output.len());

            if self.output.len() % CALLBACK_INTERVAL == 0 {
                if let Some(cb) = progress.as_mut() {
                    cb(&self.output);
                }
            }

            self.state.update_kv_cache(&mut outputs);
            // Whatever the cache did not absorb is ours to release.
            outputs.release_all();

            // Next step feeds only the token just emitted.
            let feed = self.state.feed_mut();
            feed.set_input_ids(Tensor::from_i64(&[next], vec![1, 1])?);
            if self.use_position_ids {
                let pos = self.output.len() as i64;
                feed.set_position_ids(Tensor::from_i64(&[pos], vec![1, 1])?);
            }
        }

        Ok(())
    }

    /// Loop guard: stop token, token budget, and cancellation flag
    fn keep_going(&self, max_tokens: usize) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            debug!("generation cancelled at len {}", self.output.len());
            return false;
        }
        if self.output.len() >= max_tokens {
            return false;
        }
        match self.output.last() {
            Some(last) => !self.state.stop_tokens().contains(last),
            None => true,
        }
    }

    fn release_scratch(&mut self) {
        let feed = self.state.feed_mut();
        if let Some(mut t) = feed.take_input_ids() {
            t.release();
        }
        if let Some(mut t) = feed.take_attention_mask() {
            t.release();
        }
        if let Some(mut t) = feed.take_position_ids() {
            t.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBundle, ModelConfig};
    use crate::session::{Feed, Outputs, Session, SessionBuilder};
    use crate::tensor::{DType, ReleaseLedger};
    use std::sync::Mutex;

    const VOCAB: usize = 16;
    const LAYERS: usize = 2;

    /// Scripted session: emits a fixed token per step through one-hot
    /// logits, with optional injected failures.
    struct MockSession {
        script: Vec<i64>,
        step: usize,
        fail_at: Option<usize>,
        nan_at: Option<usize>,
        omit_logits: bool,
        ledger: Arc<ReleaseLedger>,
    }

    impl Session for MockSession {
        fn run(&mut self, feed: &Feed, _options: &RunOptions) -> Result<Outputs> {
            if Some(self.step) == self.fail_at {
                return Err(Error::Session("injected failure".to_string()));
            }

            let seq = feed.input_ids().expect("input_ids installed").shape()[1];
            let token = *self
                .script
                .get(self.step.min(self.script.len() - 1))
                .unwrap();

            let mut logits = vec![0.0f32; seq * VOCAB];
            logits[(seq - 1) * VOCAB + token as usize] = 10.0;
            if Some(self.step) == self.nan_at {
                logits[(seq - 1) * VOCAB] = f32::NAN;
            }
            self.step += 1;

            let mut outputs = Outputs::new();
            if !self.omit_logits {
                outputs.insert(
                    LOGITS_OUTPUT,
                    Tensor::from_f32(&logits, DType::F32, vec![1, seq, VOCAB]).unwrap(),
                );
            }
            for layer in 0..LAYERS {
                for kind in ["key", "value"] {
                    outputs.insert(
                        format!("present.{}.{}", layer, kind),
                        Tensor::device_resident(
                            vec![0u8; 4],
                            DType::F16,
                            vec![1, 4, 1, 2],
                            Arc::clone(&self.ledger),
                        ),
                    );
                }
            }
            Ok(outputs)
        }
    }

    struct MockBuilder {
        script: Vec<i64>,
        fail_at: Option<usize>,
        nan_at: Option<usize>,
        omit_logits: bool,
        ledger: Arc<ReleaseLedger>,
    }

    impl SessionBuilder for MockBuilder {
        fn build(&self, _weights: &[u8], _config: &ModelConfig) -> Result<Box<dyn Session>> {
            Ok(Box::new(MockSession {
                script: self.script.clone(),
                step: 0,
                fail_at: self.fail_at,
                nan_at: self.nan_at,
                omit_logits: self.omit_logits,
                ledger: Arc::clone(&self.ledger),
            }))
        }
    }

    fn engine_with(builder: MockBuilder) -> GenerationEngine {
        let config = ModelConfig::from_json(&serde_json::json!({
            "hidden_size": 8,
            "num_hidden_layers": LAYERS,
            "num_attention_heads": 4,
            "vocab_size": VOCAB,
            "torch_dtype": "float16",
            "eos_token_id": 2
        }))
        .unwrap();
        let bundle = ModelBundle::new(config, Vec::new());

        let mut state = SessionState::with_ledger(Arc::clone(&builder.ledger));
        state.load(&bundle, &builder).unwrap();
        GenerationEngine::new(state)
    }

    fn scripted_engine(script: Vec<i64>) -> GenerationEngine {
        engine_with(MockBuilder {
            script,
            fail_at: None,
            nan_at: None,
            omit_logits: false,
            ledger: Arc::new(ReleaseLedger::new()),
        })
    }

    #[test]
    fn test_stop_token_ends_generation() {
        let mut engine = scripted_engine(vec![7, 7, 2, 9]);
        let output = engine.generate(&[5], None, 100).unwrap();
        assert_eq!(output, vec![5, 7, 7, 2]);
        assert_eq!(output.iter().filter(|&&t| t == 2).count(), 1);
    }

    #[test]
    fn test_max_tokens_bounds_total_length() {
        let mut engine = scripted_engine(vec![9]);
        let output = engine.generate(&[5, 6], None, 6).unwrap();
        assert_eq!(output, vec![5, 6, 9, 9, 9, 9]);
    }

    #[test]
    fn test_prompt_ending_with_stop_token_generates_nothing() {
        let mut engine = scripted_engine(vec![9]);
        let output = engine.generate(&[5, 2], None, 100).unwrap();
        assert_eq!(output, vec![5, 2]);
    }

    #[test]
    fn test_generate_without_session() {
        let mut engine = GenerationEngine::new(SessionState::new());
        assert!(matches!(
            engine.generate(&[1], None, 10),
            Err(Error::SessionNotReady)
        ));
    }

    #[test]
    fn test_stop_before_generate_has_no_effect() {
        let mut engine = scripted_engine(vec![7, 2]);
        engine.stop();
        let output = engine.generate(&[5], None, 100).unwrap();
        // The flag was reset at entry, so tokens were still produced.
        assert_eq!(output, vec![5, 7, 2]);
    }

    #[test]
    fn test_callback_cadence() {
        let mut engine = scripted_engine(vec![9]);
        let lengths = Mutex::new(Vec::new());
        let mut callback = |tokens: &[i64]| lengths.lock().unwrap().push(tokens.len());

        let output = engine.generate(&[5], Some(&mut callback), 65).unwrap();
        assert_eq!(output.len(), 65);
        assert_eq!(*lengths.lock().unwrap(), vec![32, 64, 65]);
    }

    #[test]
    fn test_cancellation_from_callback() {
        let mut engine = scripted_engine(vec![9]);
        let handle = engine.stop_handle();
        let snapshots = Mutex::new(Vec::new());
        let mut callback = |tokens: &[i64]| {
            snapshots.lock().unwrap().push(tokens.to_vec());
            handle.stop();
        };

        let output = engine.generate(&[5, 6, 7], Some(&mut callback), 100).unwrap();
        assert_eq!(&output[..3], &[5, 6, 7]);
        // Cancellation lands at the next iteration check: no output beyond
        // the batch boundary plus at most one step.
        assert!(output.len() >= 32 && output.len() <= 33);

        let snapshots = snapshots.lock().unwrap();
        assert_eq!(snapshots.first().unwrap().len(), 32);
        // Final callback reports the same, now-cancelled sequence.
        assert_eq!(snapshots.last().unwrap(), &output);
    }

    #[test]
    fn test_missing_logits_propagates_after_cleanup() {
        let mut engine = engine_with(MockBuilder {
            script: vec![9],
            fail_at: None,
            nan_at: None,
            omit_logits: true,
            ledger: Arc::new(ReleaseLedger::new()),
        });

        let err = engine.generate(&[5], None, 10).unwrap_err();
        assert!(matches!(err, Error::MissingOutput(_)));
        // Scratch slots were cleaned on the error path.
        assert!(engine.state().feed().input_ids().is_none());
        assert!(engine.state().feed().attention_mask().is_none());
        assert!(engine.state().feed().position_ids().is_none());
    }

    #[test]
    fn test_nan_logits_degrade_to_partial_result() {
        let mut engine = engine_with(MockBuilder {
            script: vec![7],
            fail_at: None,
            nan_at: Some(2),
            omit_logits: false,
            ledger: Arc::new(ReleaseLedger::new()),
        });

        // Steps 0 and 1 emit normally; step 2 returns corrupt logits and the
        // loop ends early with the tokens produced so far.
        let output = engine.generate(&[5], None, 100).unwrap();
        assert_eq!(output, vec![5, 7, 7]);
    }

    #[test]
    fn test_session_failure_releases_every_buffer_once() {
        let ledger = Arc::new(ReleaseLedger::new());
        let mut engine = engine_with(MockBuilder {
            script: vec![9],
            fail_at: Some(2),
            nan_at: None,
            omit_logits: false,
            ledger: Arc::clone(&ledger),
        });

        let err = engine.generate(&[5], None, 100).unwrap_err();
        assert!(matches!(err, Error::Session(_)));

        // The cache keeps the last successful step's tensors until teardown.
        assert_eq!(ledger.live(), 2 * LAYERS);
        engine.dispose();

        assert_eq!(ledger.allocated(), 2 * 2 * LAYERS);
        assert_eq!(ledger.released(), ledger.allocated());
        assert_eq!(ledger.double_released(), 0);
        assert_eq!(ledger.leaked(), 0);
    }

    #[test]
    fn test_clean_run_leaves_no_live_buffers_after_dispose() {
        let ledger = Arc::new(ReleaseLedger::new());
        let mut engine = engine_with(MockBuilder {
            script: vec![7, 7, 7, 2],
            fail_at: None,
            nan_at: None,
            omit_logits: false,
            ledger: Arc::clone(&ledger),
        });

        engine.generate(&[5], None, 100).unwrap();
        engine.dispose();

        assert_eq!(ledger.released(), ledger.allocated());
        assert_eq!(ledger.double_released(), 0);
        assert_eq!(ledger.leaked(), 0);
    }

    #[test]
    fn test_secondary_stop_token() {
        // A chat-style end marker distinct from the configured eos (2).
        let mut engine = scripted_engine(vec![9, 11, 3]);
        engine.state_mut().add_stop_token(11);
        let output = engine.generate(&[5], None, 100).unwrap();
        assert_eq!(output, vec![5, 9, 11]);
    }

    #[test]
    fn test_position_ids_disabled() {
        let mut engine = scripted_engine(vec![2]).with_position_ids(false);
        let output = engine.generate(&[5], None, 10).unwrap();
        assert_eq!(output, vec![5, 2]);
        assert!(engine.state().feed().position_ids().is_none());
    }
}
