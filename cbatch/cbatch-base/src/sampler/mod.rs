//! Per-request token selection.
//!
//! A sampler is created and initialized by the [`SamplerFactory`] when a
//! request is submitted, consumes one full-vocabulary logits row per decode
//! step on the scheduler thread, and gives its pooled buffers back when it
//! is released or dropped. Different requests in one batch may use
//! different samplers.

mod quick;
mod reference;
mod standard;

pub use quick::QuickSampler;
pub use reference::ReferenceSampler;
pub use standard::StandardSampler;

use crate::{
    config::{QuickSettings, ReferenceSettings, SamplingParams, StandardSettings},
    ModelContext, Token,
};
use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    /// Penalties, refusal bias and noise temperature; arg-max.
    #[default]
    Standard,
    /// Fixed-strength switches and unit noise temperature; arg-max.
    Quick,
    /// Filter chain followed by a categorical draw.
    Reference,
}

/// Running sequence as seen by a sampler: the prompt followed by every
/// accepted token.
#[derive(Debug, Default, Clone)]
pub struct SamplerState {
    pub tokens: Vec<Token>,
    pub received: usize,
}

impl SamplerState {
    pub fn new(prompt: &[Token]) -> Self {
        SamplerState {
            tokens: prompt.to_vec(),
            received: 0,
        }
    }

    /// The last `range` tokens (or all of them if there are fewer).
    pub fn window(&self, range: usize) -> &[Token] {
        let start = self.tokens.len().saturating_sub(range);
        &self.tokens[start..]
    }
}

pub trait Sampler: Send {
    fn kind(&self) -> SamplerKind;

    /// Rent per-request state and seed penalties from the tail of `prompt`.
    fn initialize(&mut self, params: &SamplingParams, prompt: &[Token]) -> Result<()>;

    /// Pick a token from a full-vocabulary row; the row may be modified.
    /// The result is always in `[0, logits.len())`.
    fn sample_token(&mut self, logits: &mut [f32]) -> Token;

    fn state(&self) -> &SamplerState;

    fn state_mut(&mut self) -> &mut SamplerState;

    /// Penalty bookkeeping for an accepted token.
    fn on_accept(&mut self, _token: Token) {}

    /// Record `token` as part of the running sequence. Not called for a
    /// token that ends the request.
    fn post_sample(&mut self, token: Token) {
        let state = self.state_mut();
        state.tokens.push(token);
        state.received += 1;
        self.on_accept(token);
    }

    /// Return pooled buffers now rather than on drop.
    fn release(&mut self) {}
}

pub fn add_in_place(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += *s;
    }
}

pub fn mul_in_place(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d *= *s;
    }
}

/// Index of the largest entry; NaN never wins, ties go to the lowest index.
pub fn argmax(logits: &[f32]) -> Token {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &v) in logits.iter().enumerate() {
        if v > best_val {
            best = idx;
            best_val = v;
        }
    }
    best as Token
}

/// Divide positive logits by `penalty`, multiply negative ones.
pub(crate) fn apply_repetition_penalty(logit: &mut f32, penalty: f32) {
    if *logit > 0.0 {
        *logit /= penalty;
    } else {
        *logit *= penalty;
    }
}

/// Deployment-level sampler selection: a default kind plus default settings
/// for every kind. Requests may pick another kind and override fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerFactory {
    pub default_kind: SamplerKind,
    pub standard: StandardSettings,
    pub quick: QuickSettings,
    pub reference: ReferenceSettings,
}

impl SamplerFactory {
    pub fn new(default_kind: SamplerKind) -> Self {
        SamplerFactory {
            default_kind,
            ..Default::default()
        }
    }

    pub fn kind_for(&self, params: &SamplingParams) -> SamplerKind {
        params.sampler.unwrap_or(self.default_kind)
    }

    pub fn create(
        &self,
        ctx: &Arc<ModelContext>,
        params: &SamplingParams,
        prompt: &[Token],
    ) -> Result<Box<dyn Sampler>> {
        let mut sampler: Box<dyn Sampler> = match self.kind_for(params) {
            SamplerKind::Standard => {
                Box::new(StandardSampler::new(ctx.clone(), self.standard.clone()))
            }
            SamplerKind::Quick => Box::new(QuickSampler::new(ctx.clone(), self.quick.clone())),
            SamplerKind::Reference => Box::new(ReferenceSampler::new(
                ctx.vocab_size(),
                self.reference.clone(),
            )),
        };
        sampler.initialize(params, prompt)?;
        Ok(sampler)
    }
}
