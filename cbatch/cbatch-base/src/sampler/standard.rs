use super::{apply_repetition_penalty, argmax, Sampler, SamplerKind, SamplerState};
use crate::{
    config::{SamplingParams, StandardSettings},
    pool::{Buffer, BufferKind, Lease, TokenSet},
    sampler::add_in_place,
    ModelContext, Token,
};
use anyhow::Result;
use std::sync::Arc;

/// The fast path for batching: additive penalty buffers, a multiplicative
/// repetition penalty over distinct recent tokens, noise temperature and
/// arg-max. Buffers are only rented for the features a request enables.
pub struct StandardSampler {
    ctx: Arc<ModelContext>,
    settings: StandardSettings,
    state: SamplerState,
    logit_bias: Option<Buffer>,
    frequency: Option<Buffer>,
    presence: Option<Buffer>,
    distinct: Option<Lease<TokenSet>>,
}

impl StandardSampler {
    pub fn new(ctx: Arc<ModelContext>, settings: StandardSettings) -> Self {
        StandardSampler {
            ctx,
            settings,
            state: SamplerState::default(),
            logit_bias: None,
            frequency: None,
            presence: None,
            distinct: None,
        }
    }

    pub fn settings(&self) -> &StandardSettings {
        &self.settings
    }

    fn register(&mut self, token: Token) {
        let idx = token as usize;
        if let Some(freq) = self.frequency.as_mut() {
            if let Some(v) = freq.get_mut(idx) {
                *v -= self.settings.frequency_penalty;
            }
        }
        if let Some(pres) = self.presence.as_mut() {
            if let Some(v) = pres.get_mut(idx) {
                if *v == 0.0 {
                    *v -= self.settings.presence_penalty;
                }
            }
        }
        if let Some(set) = self.distinct.as_mut() {
            set.insert(token);
        }
    }
}

impl Sampler for StandardSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Standard
    }

    fn initialize(&mut self, params: &SamplingParams, prompt: &[Token]) -> Result<()> {
        self.release();
        self.settings = self.settings.merged(params);
        self.state = SamplerState::new(prompt);

        let pool = self.ctx.buffers();
        if !params.logit_bias.is_empty() {
            let mut buf = pool.rent(BufferKind::LogitBias);
            for (&tok, &bias) in params.logit_bias.iter() {
                if let Some(v) = buf.get_mut(tok as usize) {
                    *v = bias;
                }
            }
            self.logit_bias = Some(buf);
        }

        let s = &self.settings;
        if s.repetition_penalty != 1.0 {
            self.distinct = Some(pool.rent_set());
        }
        if s.presence_penalty != 0.0 {
            self.presence = Some(pool.rent(BufferKind::Presence));
        }
        if s.frequency_penalty != 0.0 {
            self.frequency = Some(pool.rent(BufferKind::Frequency));
        }

        if self.distinct.is_some() || self.presence.is_some() || self.frequency.is_some() {
            let window = self.state.window(self.settings.repetition_range).to_vec();
            for tok in window {
                self.register(tok);
            }
        }
        Ok(())
    }

    fn sample_token(&mut self, logits: &mut [f32]) -> Token {
        if self.settings.prevent_refusals && self.state.received < self.settings.min_tokens {
            self.ctx.bias().prevent_refusals(logits);
        }

        if let Some(bias) = self.logit_bias.as_ref() {
            add_in_place(logits, bias);
        }
        if let Some(freq) = self.frequency.as_ref() {
            add_in_place(logits, freq);
        }
        if let Some(pres) = self.presence.as_ref() {
            add_in_place(logits, pres);
        }
        if let Some(set) = self.distinct.as_ref() {
            for &tok in set.iter() {
                if let Some(v) = logits.get_mut(tok as usize) {
                    apply_repetition_penalty(v, self.settings.repetition_penalty);
                }
            }
        }

        if self.settings.temperature != 0.0 {
            self.ctx.noise().apply(logits, self.settings.temperature);
        }
        argmax(logits)
    }

    fn state(&self) -> &SamplerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SamplerState {
        &mut self.state
    }

    fn on_accept(&mut self, token: Token) {
        self.register(token);
    }

    fn release(&mut self) {
        self.logit_bias = None;
        self.frequency = None;
        self.presence = None;
        self.distinct = None;
    }
}
