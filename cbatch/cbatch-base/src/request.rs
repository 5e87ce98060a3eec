use crate::{
    decoder::DecodeBuffer,
    pool::Lease,
    sampler::Sampler,
    HashSet, ModelContext, SamplingParams, SlotId, Token,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Debug, Display},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    None,
    /// End-of-turn or stop token sampled.
    Stop,
    /// `max_tokens` reached.
    Limit,
    /// The decode call for this request failed.
    Error,
}

impl StopReason {
    pub fn is_final(&self) -> bool {
        *self != StopReason::None
    }
}

impl Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::None => "none",
            StopReason::Stop => "stop",
            StopReason::Limit => "limit",
            StopReason::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub text: String,
    pub stop_reason: StopReason,
    /// Number of sampled tokens combined into `text`; 0 for closing chunks.
    pub token_count: usize,
}

impl OutputChunk {
    pub fn closing(stop_reason: StopReason) -> Self {
        OutputChunk {
            text: String::new(),
            stop_reason,
            token_count: 0,
        }
    }
}

/// One generation session, owned by the scheduler once submitted.
pub struct InferenceRequest {
    id: usize,
    ctx: Arc<ModelContext>,
    sampler: Box<dyn Sampler>,
    prompt_len: usize,
    max_tokens: usize,
    stop_tokens: HashSet<Token>,
    slot: Option<SlotId>,
    last_token: Token,
    decoder: Option<Lease<DecodeBuffer>>,
    held: usize,
    stop_reason: StopReason,
    live: Arc<AtomicBool>,
    out: UnboundedSender<OutputChunk>,
    disposed: bool,
}

impl InferenceRequest {
    /// Normally created by [`crate::Submitter::submit`]; `sampler` must be
    /// initialized with the prompt already.
    pub fn new(
        id: usize,
        ctx: Arc<ModelContext>,
        sampler: Box<dyn Sampler>,
        params: &SamplingParams,
        out: UnboundedSender<OutputChunk>,
        live: Arc<AtomicBool>,
    ) -> Self {
        let tokens = &sampler.state().tokens;
        let prompt_len = tokens.len();
        let last_token = tokens.last().copied().unwrap_or(ctx.eot_token());
        InferenceRequest {
            id,
            ctx,
            prompt_len,
            max_tokens: params.max_tokens,
            stop_tokens: params.stop_tokens.iter().copied().collect(),
            slot: None,
            last_token,
            decoder: None,
            held: 0,
            stop_reason: StopReason::None,
            live,
            out,
            disposed: false,
            sampler,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Prompt followed by every accepted token.
    pub fn tokens(&self) -> &[Token] {
        &self.sampler.state().tokens
    }

    pub fn received_tokens(&self) -> usize {
        self.sampler.state().received
    }

    pub fn remaining_tokens(&self) -> usize {
        self.max_tokens.saturating_sub(self.received_tokens())
    }

    pub fn total_tokens(&self) -> usize {
        self.tokens().len()
    }

    /// Cache position of the token fed to the next decode call.
    pub fn position(&self) -> usize {
        self.total_tokens().saturating_sub(1)
    }

    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    pub(crate) fn set_slot(&mut self, slot: Option<SlotId>) {
        self.slot = slot;
    }

    /// Last prompt token until the first sample, then the last sampled token.
    pub fn last_token(&self) -> Token {
        self.last_token
    }

    pub fn needs_gen(&self) -> bool {
        !self.stop_reason.is_final() && self.live.load(Ordering::Acquire)
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    pub fn sampler(&self) -> &dyn Sampler {
        self.sampler.as_ref()
    }

    pub fn held_tokens(&self) -> usize {
        self.held
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Sample from this request's logits row and emit the resulting chunk.
    /// Does nothing (and returns `None`) once the request no longer
    /// generates.
    pub fn handle_logits(&mut self, logits: &mut [f32]) -> Option<Token> {
        if !self.needs_gen() {
            return None;
        }

        let token = self.sampler.sample_token(logits);
        self.last_token = token;

        if token == self.ctx.eot_token() || self.stop_tokens.contains(&token) {
            self.finish(StopReason::Stop);
            return Some(token);
        }

        self.sampler.post_sample(token);
        self.emit_token(token);

        if self.received_tokens() >= self.max_tokens {
            self.finish(StopReason::Limit);
        }
        Some(token)
    }

    fn emit_token(&mut self, token: Token) {
        let bytes = self.ctx.tokenizer().token_bytes(token);
        if self.held == 0 {
            if let Ok(text) = std::str::from_utf8(&bytes) {
                self.send(text.to_string(), StopReason::None, 1);
                return;
            }
        }

        let decoder = self
            .decoder
            .get_or_insert_with(|| self.ctx.decoders().rent());
        match decoder.push(&bytes) {
            Some(text) => {
                let count = self.held + 1;
                self.held = 0;
                self.send(text, StopReason::None, count);
            }
            None => self.held += 1,
        }
    }

    fn flush_partial(&mut self) {
        if let Some(text) = self.decoder.as_mut().and_then(|d| d.finish()) {
            let count = std::cmp::max(self.held, 1);
            self.held = 0;
            log::debug!("req {}: flushing incomplete character", self.id);
            self.send(text, StopReason::None, count);
        }
    }

    fn finish(&mut self, reason: StopReason) {
        self.flush_partial();
        self.stop_reason = reason;
        self.send(String::new(), reason, 0);
        self.live.store(false, Ordering::Release);
        log::trace!(
            "req {}: {} after {} tokens",
            self.id,
            reason,
            self.received_tokens()
        );
    }

    /// Terminate with `StopReason::Error`, unless already terminal.
    pub(crate) fn fail(&mut self, msg: &str) {
        if self.stop_reason.is_final() {
            return;
        }
        log::warn!("req {} failed: {}", self.id, msg);
        self.finish(StopReason::Error);
    }

    fn send(&self, text: String, stop_reason: StopReason, token_count: usize) {
        // the consumer may be gone already
        let _ = self.out.send(OutputChunk {
            text,
            stop_reason,
            token_count,
        });
    }

    /// Return sampler buffers and the decode buffer to their pools.
    /// Safe to call more than once; also runs on drop.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.flush_partial();
        self.live.store(false, Ordering::Release);
        self.sampler.release();
        self.decoder = None;
    }
}

impl Drop for InferenceRequest {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Debug for InferenceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("prompt_len", &self.prompt_len)
            .field("received", &self.received_tokens())
            .field("max_tokens", &self.max_tokens)
            .field("stop_reason", &self.stop_reason)
            .finish()
    }
}

/// Consumer side of a submitted request.
///
/// Dropping the handle cancels the request.
pub struct RequestHandle {
    id: usize,
    rx: UnboundedReceiver<OutputChunk>,
    live: Arc<AtomicBool>,
}

impl RequestHandle {
    pub fn new(id: usize, rx: UnboundedReceiver<OutputChunk>, live: Arc<AtomicBool>) -> Self {
        RequestHandle { id, rx, live }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Next chunk if one is ready.
    pub fn try_next(&mut self) -> Option<OutputChunk> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next chunk; `None` once the request is gone and drained.
    pub async fn next(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }

    /// Like `next()`, for use outside of an async runtime.
    pub fn blocking_next(&mut self) -> Option<OutputChunk> {
        self.rx.blocking_recv()
    }

    /// Every chunk that is ready right now.
    pub fn drain(&mut self) -> Vec<OutputChunk> {
        let mut res = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            res.push(chunk);
        }
        res
    }

    pub fn is_generating(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Observed by the scheduler at its next prune; tokens already in
    /// flight are not aborted.
    pub fn cancel(&self) {
        self.live.store(false, Ordering::Release);
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
