use crate::{SlotId, Token};
use anyhow::Result;
use std::fmt::{Debug, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: Token,
    pub pos: usize,
    pub slot: SlotId,
    pub logits: bool,
}

/// Tokens handed to a single decode call. Holds at most `max_len()` entries.
pub struct Batch {
    size: usize,
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new(n_tokens: usize) -> Self {
        assert!(n_tokens > 0);
        Batch {
            size: n_tokens,
            entries: Vec::with_capacity(n_tokens),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.size
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.size
    }

    pub fn add_token(&mut self, token: Token, pos: usize, slot: SlotId, logits: bool) {
        assert!(self.entries.len() < self.size, "batch overflow");
        self.entries.push(BatchEntry {
            token,
            pos,
            slot,
            logits,
        });
    }

    /// Number of entries that request a logits row.
    pub fn num_logits(&self) -> usize {
        self.entries.iter().filter(|e| e.logits).count()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }
}

impl Debug for Batch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Batch {{ size: {}, n_tokens: {} }}", self.size, self.len())
    }
}

/// The native forward pass plus its KV cache. The scheduler sequences these
/// calls; it never looks inside the cache.
///
/// At most one `decode()` is in flight at any time, so implementations do
/// not need to be reentrant.
pub trait DecodeEngine {
    fn vocab_size(&self) -> usize;

    fn decode(&mut self, batch: &Batch) -> Result<()>;

    /// Logits of the last decoded batch, `rows * vocab_size` entries.
    /// Row `i` belongs to the `i`-th entry that requested logits.
    /// Samplers mutate rows in place.
    fn logits(&mut self, rows: usize) -> Result<&mut [f32]>;

    fn clear_cache(&mut self);

    fn copy_sequence(&mut self, src: SlotId, dst: SlotId);

    /// Remove positions `[from, to)` of `slot`; `None` means up to the end.
    fn remove_sequence_range(&mut self, slot: SlotId, from: usize, to: Option<usize>);

    fn clear_sequence(&mut self, slot: SlotId) {
        self.remove_sequence_range(slot, 0, None);
    }
}

pub trait Tokenizer: Send + Sync {
    fn vocab_size(&self) -> usize;

    fn encode(&self, text: &str) -> Vec<Token>;

    fn token_bytes(&self, token: Token) -> Vec<u8>;

    fn token_text(&self, token: Token) -> String {
        String::from_utf8_lossy(&self.token_bytes(token)).into_owned()
    }
}
