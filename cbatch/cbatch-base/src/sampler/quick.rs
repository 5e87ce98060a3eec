use super::{argmax, Sampler, SamplerKind, SamplerState};
use crate::{
    config::{QuickSettings, SamplingParams},
    pool::{Buffer, BufferKind},
    sampler::add_in_place,
    ModelContext, Token,
};
use anyhow::Result;
use std::sync::Arc;

const ACCEPT_FREQUENCY_PENALTY: f32 = 0.1;
const PRESENCE_PENALTY: f32 = 0.2;
const PROMPT_FREQUENCY_PENALTY: f32 = 0.2;
const MAX_EOT_SUPPRESSION: f32 = 5.0;

/// Unit noise temperature used by the quick sampler.
const QUICK_TEMPERATURE: f32 = 1.0;

/// On/off switches with fixed strengths, unit noise temperature and arg-max.
pub struct QuickSampler {
    ctx: Arc<ModelContext>,
    settings: QuickSettings,
    state: SamplerState,
    logit_bias: Option<Buffer>,
    frequency: Option<Buffer>,
    presence: Option<Buffer>,
}

impl QuickSampler {
    pub fn new(ctx: Arc<ModelContext>, settings: QuickSettings) -> Self {
        QuickSampler {
            ctx,
            settings,
            state: SamplerState::default(),
            logit_bias: None,
            frequency: None,
            presence: None,
        }
    }

    pub fn settings(&self) -> &QuickSettings {
        &self.settings
    }

    /// Ceiling for the end-of-turn logit: -5 at the start of the response,
    /// rising linearly to 0 at the ideal length.
    pub fn eot_ceiling(received: usize, ideal: usize) -> f32 {
        let progress = std::cmp::min(received, ideal) as f32 / ideal as f32;
        -MAX_EOT_SUPPRESSION * (1.0 - progress)
    }
}

impl Sampler for QuickSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Quick
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

        if self.settings.penalize_repetition {
            let mut freq = pool.rent(BufferKind::Frequency);
            let mut pres = pool.rent(BufferKind::Presence);
            // older prompt tokens weigh less; the first token is never penalized
            let n = prompt.len();
            let lo = std::cmp::max(n.saturating_sub(self.settings.repetition_range), 1);
            for i in (lo + 1..n).rev() {
                let idx = prompt[i] as usize;
                if idx >= freq.len() {
                    continue;
                }
                freq[idx] -= PROMPT_FREQUENCY_PENALTY * (i as f32 / (2.0 * n as f32));
                if pres[idx] == 0.0 {
                    pres[idx] -= PRESENCE_PENALTY;
                }
            }
            self.frequency = Some(freq);
            self.presence = Some(pres);
        }
        Ok(())
    }

    fn sample_token(&mut self, logits: &mut [f32]) -> Token {
        let bias = self.ctx.bias();
        if self.settings.prevent_refusals && self.state.received < self.settings.min_tokens {
            bias.prevent_refusals(logits);
        }
        if self.settings.single_line {
            bias.prevent_newlines(logits);
        }
        if self.settings.ban_caps {
            bias.prevent_caps(logits);
        }

        let ideal = self.settings.ideal_response_length;
        if ideal > 0 {
            let ceiling = Self::eot_ceiling(self.state.received, ideal);
            if let Some(v) = logits.get_mut(self.ctx.eot_token() as usize) {
                *v = v.min(ceiling);
            }
        }

        if let Some(freq) = self.frequency.as_ref() {
            add_in_place(logits, freq);
        }
        if let Some(pres) = self.presence.as_ref() {
            add_in_place(logits, pres);
        }
        if let Some(lb) = self.logit_bias.as_ref() {
            add_in_place(logits, lb);
        }

        self.ctx.noise().apply(logits, QUICK_TEMPERATURE);
        argmax(logits)
    }

    fn state(&self) -> &SamplerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SamplerState {
        &mut self.state
    }

    fn on_accept(&mut self, token: Token) {
        let idx = token as usize;
        if let (Some(freq), Some(pres)) = (self.frequency.as_mut(), self.presence.as_mut()) {
            if idx < freq.len() {
                freq[idx] -= ACCEPT_FREQUENCY_PENALTY;
                if pres[idx] == 0.0 {
                    pres[idx] -= PRESENCE_PENALTY;
                }
            }
        }
    }

    fn release(&mut self) {
        self.logit_bias = None;
        self.frequency = None;
        self.presence = None;
    }
}
