//! In-process stand-ins for the native engine and tokenizer.
//!
//! `SimEngine` keeps the token contents of every sequence slot and checks
//! each decode call the way a real KV cache would fail: slot out of range,
//! position not directly after the cached tokens, batch over capacity.
//! Logits are produced by a script from the cached tokens of the slot.

use crate::{
    engine::{Batch, DecodeEngine, Tokenizer},
    SlotId, Token,
};
use anyhow::{bail, Result};

/// Special tokens following the 256 byte tokens.
pub const EOT_TOKEN: Token = 256;
pub const BOS_TOKEN: Token = 257;
pub const BYTE_VOCAB_SIZE: usize = 258;

/// One token per byte.
#[derive(Debug, Clone, Default)]
pub struct ByteTokenizer {}

impl ByteTokenizer {
    pub fn new() -> Self {
        ByteTokenizer {}
    }
}

impl Tokenizer for ByteTokenizer {
    fn vocab_size(&self) -> usize {
        BYTE_VOCAB_SIZE
    }

    fn encode(&self, text: &str) -> Vec<Token> {
        text.bytes().map(|b| b as Token).collect()
    }

    fn token_bytes(&self, token: Token) -> Vec<u8> {
        if token < 256 {
            vec![token as u8]
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp {
    Decode { n_tokens: usize, n_logits: usize },
    ClearCache,
    Copy { src: SlotId, dst: SlotId },
    Remove { slot: SlotId, from: usize, to: Option<usize> },
}

/// Fills the logits row for a sequence given its cached tokens.
pub type LogitsFn = Box<dyn FnMut(&[Token], &mut [f32]) + Send>;

/// Peak at the byte following the last one; after a special token, `a`.
pub fn next_byte_logits(tokens: &[Token], row: &mut [f32]) {
    row.fill(0.0);
    let next = match tokens.last() {
        Some(&t) if t < 256 => (t + 1) % 256,
        _ => b'a' as Token,
    };
    row[next as usize] = 10.0;
}

pub struct SimEngine {
    vocab_size: usize,
    max_batch: usize,
    kv_capacity: Option<usize>,
    kv: Vec<Vec<Token>>,
    logits: Vec<f32>,
    n_rows: usize,
    logits_fn: LogitsFn,
    ops: Vec<CacheOp>,
    fail_decodes: usize,
    num_decodes: usize,
    num_tokens: usize,
    max_seen_batch: usize,
}

impl SimEngine {
    pub fn new(vocab_size: usize, n_slots: usize, max_batch: usize) -> Self {
        Self::with_logits(vocab_size, n_slots, max_batch, Box::new(next_byte_logits))
    }

    pub fn with_logits(
        vocab_size: usize,
        n_slots: usize,
        max_batch: usize,
        logits_fn: LogitsFn,
    ) -> Self {
        SimEngine {
            vocab_size,
            max_batch,
            kv_capacity: None,
            kv: vec![Vec::new(); n_slots],
            logits: Vec::new(),
            n_rows: 0,
            logits_fn,
            ops: Vec::new(),
            fail_decodes: 0,
            num_decodes: 0,
            num_tokens: 0,
            max_seen_batch: 0,
        }
    }

    /// Fail decode calls once more than `cap` tokens would be cached.
    pub fn set_kv_capacity(&mut self, cap: Option<usize>) {
        self.kv_capacity = cap;
    }

    pub fn set_logits_fn(&mut self, f: LogitsFn) {
        self.logits_fn = f;
    }

    /// Make the next `n` decode calls fail without touching the cache.
    pub fn fail_next_decodes(&mut self, n: usize) {
        self.fail_decodes = n;
    }

    pub fn n_slots(&self) -> usize {
        self.kv.len()
    }

    pub fn kv(&self, slot: SlotId) -> &[Token] {
        &self.kv[slot]
    }

    pub fn kv_tokens(&self) -> usize {
        self.kv.iter().map(|s| s.len()).sum()
    }

    pub fn used_slots(&self) -> Vec<SlotId> {
        (0..self.kv.len()).filter(|&s| !self.kv[s].is_empty()).collect()
    }

    pub fn ops(&self) -> &[CacheOp] {
        &self.ops
    }

    pub fn take_ops(&mut self) -> Vec<CacheOp> {
        std::mem::take(&mut self.ops)
    }

    pub fn num_decodes(&self) -> usize {
        self.num_decodes
    }

    pub fn num_decoded_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn max_seen_batch(&self) -> usize {
        self.max_seen_batch
    }
}

impl DecodeEngine for SimEngine {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        if self.fail_decodes > 0 {
            self.fail_decodes -= 1;
            bail!("simulated decode failure");
        }
        if batch.is_empty() {
            bail!("empty batch");
        }
        if batch.len() > self.max_batch {
            bail!("batch of {} exceeds {}", batch.len(), self.max_batch);
        }

        let mut lens: Vec<usize> = self.kv.iter().map(|s| s.len()).collect();
        for e in batch.entries() {
            if e.slot >= lens.len() {
                bail!("slot {} out of range", e.slot);
            }
            if e.token as usize >= self.vocab_size {
                bail!("token {} out of range", e.token);
            }
            if e.pos != lens[e.slot] {
                bail!(
                    "slot {}: expected pos {}, got {}",
                    e.slot,
                    lens[e.slot],
                    e.pos
                );
            }
            lens[e.slot] += 1;
        }
        if let Some(cap) = self.kv_capacity {
            let total: usize = lens.iter().sum();
            if total > cap {
                bail!("no KV space: {} > {}", total, cap);
            }
        }

        let n_logits = batch.num_logits();
        self.logits.clear();
        self.logits.resize(n_logits * self.vocab_size, 0.0);
        let mut row = 0;
        for e in batch.entries() {
            self.kv[e.slot].push(e.token);
            if e.logits {
                let dst = &mut self.logits[row * self.vocab_size..(row + 1) * self.vocab_size];
                (self.logits_fn)(&self.kv[e.slot], dst);
                row += 1;
            }
        }
        self.n_rows = n_logits;
        self.num_decodes += 1;
        self.num_tokens += batch.len();
        self.max_seen_batch = std::cmp::max(self.max_seen_batch, batch.len());
        self.ops.push(CacheOp::Decode {
            n_tokens: batch.len(),
            n_logits,
        });
        Ok(())
    }

    fn logits(&mut self, rows: usize) -> Result<&mut [f32]> {
        if rows > self.n_rows {
            bail!("asked for {} rows, last decode produced {}", rows, self.n_rows);
        }
        Ok(&mut self.logits[..rows * self.vocab_size])
    }

    fn clear_cache(&mut self) {
        for s in self.kv.iter_mut() {
            s.clear();
        }
        self.ops.push(CacheOp::ClearCache);
    }

    fn copy_sequence(&mut self, src: SlotId, dst: SlotId) {
        let tokens = self.kv[src].clone();
        self.kv[dst] = tokens;
        self.ops.push(CacheOp::Copy { src, dst });
    }

    fn remove_sequence_range(&mut self, slot: SlotId, from: usize, to: Option<usize>) {
        let seq = &mut self.kv[slot];
        let end = std::cmp::min(to.unwrap_or(seq.len()), seq.len());
        if from < end {
            seq.drain(from..end);
        }
        self.ops.push(CacheOp::Remove { slot, from, to });
    }
}
