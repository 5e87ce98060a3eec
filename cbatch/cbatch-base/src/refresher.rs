//! Admission control and cache layout.
//!
//! The refresher moves requests from the pending queue into the active set,
//! prunes requests that stopped generating and keeps sequence slots
//! compact. Two policies are available:
//!
//! * [`RefreshPolicy::Full`] clears the whole cache and re-prefills every
//!   admitted request. Higher throughput, but every refresh stalls
//!   generation until all prompts are processed again.
//! * [`RefreshPolicy::Additive`] moves surviving sequences down to
//!   `[0, active)` and prefills only the new requests. Lower latency for
//!   queued work.
//!
//! Prefill leaves the final batch un-flushed; the processor's next decode
//! call carries those tokens together with the generation step.

use crate::{
    config::{RefreshPolicy, SchedulerConfig},
    engine::{Batch, DecodeEngine},
    request::InferenceRequest,
};
use anyhow::{bail, Result};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Finished or cancelled requests dropped from the active set.
    pub pruned: usize,
    /// Whether the active set was rebuilt or extended.
    pub refreshed: bool,
    /// Requests moved from the pending queue into the active set.
    pub admitted: usize,
    /// Trailing active requests whose prompts went into the batch.
    pub prefilled: usize,
    /// Sequences moved by defragmentation.
    pub moved: usize,
    /// Occupancy after admission.
    pub occupancy: usize,
}

pub struct ContextRefresher {
    policy: RefreshPolicy,
    max_context_size: usize,
    max_batch_size: usize,
    sweet_spot: f32,
}

impl ContextRefresher {
    pub fn new(config: &SchedulerConfig) -> Self {
        ContextRefresher {
            policy: config.refresh_policy,
            max_context_size: config.max_context_size,
            max_batch_size: config.max_batch_size,
            sweet_spot: config.sweet_spot,
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    pub fn refresh<E: DecodeEngine + ?Sized>(
        &self,
        engine: &mut E,
        batch: &mut Batch,
        active: &mut Vec<InferenceRequest>,
        pending: &mut VecDeque<InferenceRequest>,
    ) -> Result<RefreshOutcome> {
        match self.policy {
            RefreshPolicy::Full => self.full_refresh(engine, batch, active, pending),
            RefreshPolicy::Additive => self.additive_refresh(engine, batch, active, pending),
        }
    }

    pub fn full_refresh<E: DecodeEngine + ?Sized>(
        &self,
        engine: &mut E,
        batch: &mut Batch,
        active: &mut Vec<InferenceRequest>,
        pending: &mut VecDeque<InferenceRequest>,
    ) -> Result<RefreshOutcome> {
        let (refresh, occupancy, pruned) = self.should_refresh(engine, active, pending);
        if !refresh {
            return Ok(RefreshOutcome {
                pruned,
                occupancy,
                ..Default::default()
            });
        }

        if !self.head_fits(active, pending, occupancy) {
            // clearing would only re-prefill the same set
            return Ok(RefreshOutcome {
                pruned,
                occupancy,
                ..Default::default()
            });
        }

        engine.clear_cache();
        for req in active.iter_mut() {
            req.set_slot(None);
        }
        let (admitted, occupancy) = self.admit(active, pending, occupancy);
        self.prefill_or_evict(engine, batch, active, 0)?;

        log::debug!(
            "full refresh: {} admitted, {} active, {} queued, occupancy {}/{}",
            admitted,
            active.len(),
            pending.len(),
            occupancy,
            self.max_context_size
        );
        Ok(RefreshOutcome {
            pruned,
            refreshed: true,
            admitted,
            prefilled: active.len(),
            moved: 0,
            occupancy,
        })
    }

    pub fn additive_refresh<E: DecodeEngine + ?Sized>(
        &self,
        engine: &mut E,
        batch: &mut Batch,
        active: &mut Vec<InferenceRequest>,
        pending: &mut VecDeque<InferenceRequest>,
    ) -> Result<RefreshOutcome> {
        let (refresh, occupancy, pruned) = self.should_refresh(engine, active, pending);
        if !refresh {
            return Ok(RefreshOutcome {
                pruned,
                occupancy,
                ..Default::default()
            });
        }

        let moved = self.defrag(engine, active)?;
        let (admitted, occupancy) = self.admit(active, pending, occupancy);
        let start = active.len() - admitted;
        self.prefill_or_evict(engine, batch, active, start)?;

        log::debug!(
            "additive refresh: {} moved, {} admitted, {} active, {} queued, occupancy {}/{}",
            moved,
            admitted,
            active.len(),
            pending.len(),
            occupancy,
            self.max_context_size
        );
        Ok(RefreshOutcome {
            pruned,
            refreshed: true,
            admitted,
            prefilled: admitted,
            moved,
            occupancy,
        })
    }

    /// Drop active requests that no longer generate (clearing their
    /// sequences) and cancelled pending ones, then decide whether a refresh
    /// is worthwhile. Returns `(refresh, occupancy, pruned)`.
    ///
    /// With every active request still generating, nothing queued, or the
    /// cache loaded past the sweet spot, neither the active set nor the
    /// cache is touched.
    pub fn should_refresh<E: DecodeEngine + ?Sized>(
        &self,
        engine: &mut E,
        active: &mut Vec<InferenceRequest>,
        pending: &mut VecDeque<InferenceRequest>,
    ) -> (bool, usize, usize) {
        let mut occupancy = 0;
        let mut pruned = 0;
        let mut idx = active.len();
        while idx > 0 {
            idx -= 1;
            if active[idx].needs_gen() {
                occupancy += active[idx].total_tokens();
                continue;
            }
            let mut req = active.remove(idx);
            if let Some(slot) = req.slot() {
                engine.clear_sequence(slot);
            }
            log::trace!("prune {:?}", req);
            req.dispose();
            pruned += 1;
        }

        pending.retain(|r| r.needs_gen());

        let threshold = self.sweet_spot as f64 * self.max_context_size as f64;
        let refresh = !pending.is_empty() && (occupancy as f64) < threshold;
        (refresh, occupancy, pruned)
    }

    fn headroom(&self, num_active: usize, min_remaining: usize) -> usize {
        self.max_context_size
            .saturating_sub(num_active.saturating_mul(min_remaining))
    }

    /// Whether [`Self::admit`] would take at least the head of the queue.
    pub fn head_fits(
        &self,
        active: &[InferenceRequest],
        pending: &VecDeque<InferenceRequest>,
        occupancy: usize,
    ) -> bool {
        let head = match pending.front() {
            Some(head) => head,
            None => return false,
        };
        let min_remaining = active
            .iter()
            .map(|r| r.remaining_tokens())
            .min()
            .unwrap_or(usize::MAX);
        let headroom = self.headroom(active.len(), min_remaining);
        active.len() < self.max_batch_size
            && occupancy < headroom
            && occupancy + head.total_tokens() + head.remaining_tokens() <= headroom
    }

    /// FIFO greedy admission. Space is reserved for every active request to
    /// produce at least the smallest remaining budget among them; the head
    /// of the queue is admitted only if its prompt and full budget fit the
    /// rest. Never skips ahead of a head that does not fit. Returns
    /// `(admitted, occupancy)`.
    pub fn admit(
        &self,
        active: &mut Vec<InferenceRequest>,
        pending: &mut VecDeque<InferenceRequest>,
        mut occupancy: usize,
    ) -> (usize, usize) {
        let mut min_remaining = active
            .iter()
            .map(|r| r.remaining_tokens())
            .min()
            .unwrap_or(usize::MAX);
        let mut headroom = self.headroom(active.len(), min_remaining);
        let mut admitted = 0;

        while occupancy < headroom && active.len() < self.max_batch_size {
            let need = match pending.front() {
                Some(head) => head.total_tokens() + head.remaining_tokens(),
                None => break,
            };
            if occupancy + need > headroom {
                break;
            }
            let req = match pending.pop_front() {
                Some(req) => req,
                None => break,
            };
            occupancy += req.total_tokens();
            min_remaining = std::cmp::min(min_remaining, req.remaining_tokens());
            active.push(req);
            headroom = self.headroom(active.len(), min_remaining);
            admitted += 1;
        }

        (admitted, occupancy)
    }

    /// Move every request whose slot is `>= active.len()` to the lowest
    /// free slot below it. Afterwards slots are a permutation of
    /// `[0, active.len())`. Returns the number of moves.
    pub fn defrag<E: DecodeEngine + ?Sized>(
        &self,
        engine: &mut E,
        active: &mut [InferenceRequest],
    ) -> Result<usize> {
        let n = active.len();
        let mut occupied = vec![false; n];
        for req in active.iter() {
            if let Some(slot) = req.slot() {
                if slot < n {
                    if occupied[slot] {
                        bail!("slot {} assigned twice", slot);
                    }
                    occupied[slot] = true;
                }
            }
        }

        let mut free = occupied
            .iter()
            .enumerate()
            .filter(|(_, taken)| !**taken)
            .map(|(idx, _)| idx);
        let mut moved = 0;
        for req in active.iter_mut() {
            let src = req.slot();
            if matches!(src, Some(slot) if slot < n) {
                continue;
            }
            let dst = match free.next() {
                Some(dst) => dst,
                None => bail!("no free slot for req {}", req.id()),
            };
            if let Some(src) = src {
                engine.copy_sequence(src, dst);
                engine.clear_sequence(src);
                log::trace!("req {}: slot {} -> {}", req.id(), src, dst);
            }
            req.set_slot(Some(dst));
            moved += 1;
        }
        Ok(moved)
    }

    fn prefill_or_evict<E: DecodeEngine + ?Sized>(
        &self,
        engine: &mut E,
        batch: &mut Batch,
        active: &mut Vec<InferenceRequest>,
        start: usize,
    ) -> Result<()> {
        let res = self.prefill(engine, batch, active, start);
        if let Err(e) = &res {
            batch.clear();
            self.evict_from(engine, active, start, &format!("prefill failed: {e}"));
        }
        res
    }

    /// Fail `active[start..]`, clear their sequences and drop them.
    /// Requests below `start` keep their slots and cache entries.
    pub fn evict_from<E: DecodeEngine + ?Sized>(
        &self,
        engine: &mut E,
        active: &mut Vec<InferenceRequest>,
        start: usize,
        msg: &str,
    ) {
        for mut req in active.drain(start..) {
            req.fail(msg);
            if let Some(slot) = req.slot() {
                engine.clear_sequence(slot);
            }
            req.dispose();
        }
    }

    /// Assign slot `i` to `active[i]` for `i >= start` and submit all of
    /// its tokens except the last without logits, decoding whenever the
    /// batch fills up.
    pub fn prefill<E: DecodeEngine + ?Sized>(
        &self,
        engine: &mut E,
        batch: &mut Batch,
        active: &mut [InferenceRequest],
        start: usize,
    ) -> Result<()> {
        for (slot, req) in active.iter_mut().enumerate().skip(start) {
            req.set_slot(Some(slot));
            let tokens = req.tokens();
            let n = tokens.len().saturating_sub(1);
            for (pos, &tok) in tokens[..n].iter().enumerate() {
                batch.add_token(tok, pos, slot, false);
                if batch.is_full() {
                    engine.decode(batch)?;
                    batch.clear();
                }
            }
        }
        Ok(())
    }
}
