//! The named-tensor input bundle for one inference call
//!
//! Slots are explicit fields rather than a string-keyed map, so each
//! tensor's owner is statically clear. Wire names are produced only at the
//! session boundary via [`Feed::entries`].

use crate::tensor::Tensor;
use tracing::warn;

/// Wire name of the current-step token ids
pub const INPUT_IDS: &str = "input_ids";
/// Wire name of the all-ones mask over the sequence so far
pub const ATTENTION_MASK: &str = "attention_mask";
/// Wire name of the absolute positions of the current input slice
pub const POSITION_IDS: &str = "position_ids";
/// Prefix of cached key/value inputs (`past_key_values.<layer>.<kind>`)
pub const PAST_KEY_PREFIX: &str = "past_key_values";
/// Prefix of fresh key/value outputs (`present.<layer>.<kind>`)
pub const PRESENT_PREFIX: &str = "present";

/// Key or value half of one layer's cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvKind {
    Key,
    Value,
}

impl KvKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvKind::Key => "key",
            KvKind::Value => "value",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "key" => Some(KvKind::Key),
            "value" => Some(KvKind::Value),
            _ => None,
        }
    }
}

/// Cached key/value tensors for one transformer layer
#[derive(Debug, Default)]
pub struct KvSlot {
    pub key: Option<Tensor>,
    pub value: Option<Tensor>,
}

impl KvSlot {
    fn release(&mut self) {
        if let Some(mut t) = self.key.take() {
            t.release();
        }
        if let Some(mut t) = self.value.take() {
            t.release();
        }
    }
}

/// The complete input bundle submitted to one inference call.
///
/// Installing a tensor into an occupied slot releases the previous occupant;
/// taking a tensor out transfers ownership to the caller.
#[derive(Debug, Default)]
pub struct Feed {
    input_ids: Option<Tensor>,
    attention_mask: Option<Tensor>,
    position_ids: Option<Tensor>,
    cache: Vec<KvSlot>,
}

impl Feed {
    /// Create a feed with one empty cache slot pair per layer
    pub fn with_layers(num_layers: usize) -> Self {
        let mut cache = Vec::with_capacity(num_layers);
        cache.resize_with(num_layers, KvSlot::default);
        Self {
            cache,
            ..Self::default()
        }
    }

    pub fn num_layers(&self) -> usize {
        self.cache.len()
    }

    /// Install the current-step token ids, releasing any prior tensor
    pub fn set_input_ids(&mut self, tensor: Tensor) {
        if let Some(mut old) = self.input_ids.replace(tensor) {
            old.release();
        }
    }

    /// Install the attention mask, releasing any prior tensor
    pub fn set_attention_mask(&mut self, tensor: Tensor) {
        if let Some(mut old) = self.attention_mask.replace(tensor) {
            old.release();
        }
    }

    /// Install the position ids, releasing any prior tensor
    pub fn set_position_ids(&mut self, tensor: Tensor) {
        if let Some(mut old) = self.position_ids.replace(tensor) {
            old.release();
        }
    }

    pub fn input_ids(&self) -> Option<&Tensor> {
        self.input_ids.as_ref()
    }

    pub fn attention_mask(&self) -> Option<&Tensor> {
        self.attention_mask.as_ref()
    }

    pub fn position_ids(&self) -> Option<&Tensor> {
        self.position_ids.as_ref()
    }

    /// Take the current-step token ids out of the feed
    pub fn take_input_ids(&mut self) -> Option<Tensor> {
        self.input_ids.take()
    }

    /// Take the attention mask out of the feed
    pub fn take_attention_mask(&mut self) -> Option<Tensor> {
        self.attention_mask.take()
    }

    /// Take the position ids out of the feed
    pub fn take_position_ids(&mut self) -> Option<Tensor> {
        self.position_ids.take()
    }

    /// Install a cache tensor, releasing any prior occupant of the slot.
    /// A layer index beyond the configured layer count releases the tensor
    /// and logs, keeping the single-owner invariant.
    pub fn set_cache(&mut self, layer: usize, kind: KvKind, mut tensor: Tensor) {
        match self.cache.get_mut(layer) {
            Some(slot) => {
                let target = match kind {
                    KvKind::Key => &mut slot.key,
                    KvKind::Value => &mut slot.value,
                };
                if let Some(mut old) = target.replace(tensor) {
                    old.release();
                }
            }
            None => {
                warn!("cache tensor for out-of-range layer {} discarded", layer);
                tensor.release();
            }
        }
    }

    pub fn cache_slots(&self) -> &[KvSlot] {
        &self.cache
    }

    /// Release and clear only the KV cache slots
    pub fn release_cache(&mut self) {
        for slot in &mut self.cache {
            slot.release();
        }
    }

    /// Release and clear every tensor held by the feed
    pub fn release_all(&mut self) {
        if let Some(mut t) = self.input_ids.take() {
            t.release();
        }
        if let Some(mut t) = self.attention_mask.take() {
            t.release();
        }
        if let Some(mut t) = self.position_ids.take() {
            t.release();
        }
        self.release_cache();
    }

    /// Iterate occupied slots as (wire name, tensor), the view a session
    /// consumes
    pub fn entries(&self) -> Vec<(String, &Tensor)> {
        let mut entries = Vec::with_capacity(3 + 2 * self.cache.len());
        if let Some(t) = &self.input_ids {
            entries.push((INPUT_IDS.to_string(), t));
        }
        if let Some(t) = &self.attention_mask {
            entries.push((ATTENTION_MASK.to_string(), t));
        }
        if let Some(t) = &self.position_ids {
            entries.push((POSITION_IDS.to_string(), t));
        }
        for (layer, slot) in self.cache.iter().enumerate() {
            if let Some(t) = &slot.key {
                entries.push((past_key_name(layer, KvKind::Key), t));
            }
            if let Some(t) = &slot.value {
                entries.push((past_key_name(layer, KvKind::Value), t));
            }
        }
        entries
    }
}

/// Wire name of a cached KV input: `past_key_values.<layer>.<kind>`
pub fn past_key_name(layer: usize, kind: KvKind) -> String {
    format!("{}.{}.{}", PAST_KEY_PREFIX, layer, kind.as_str())
}

/// Parse a `present.<layer>.<kind>` output name
pub fn parse_present_name(name: &str) -> Option<(usize, KvKind)> {
    let rest = name.strip_prefix(PRESENT_PREFIX)?.strip_prefix('.')?;
    let (layer, kind) = rest.split_once('.')?;
    Some((layer.parse().ok()?, KvKind::from_str(kind)?))
}
