// filter chain follows llama.cpp's llama_sample_* functions

use super::{apply_repetition_penalty, argmax, Sampler, SamplerKind, SamplerState};
use crate::{
    config::{ReferenceSettings, SamplingParams, SAMPLING_EPS},
    HashMap, Token,
};
use anyhow::Result;
use rand::{distributions::Distribution, rngs::StdRng, SeedableRng};

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: Token,
    logit: f32,
    p: f32,
}

/// Slower, exact sampler: repetition penalties, logit bias, top-k, tail-free,
/// typical, top-p, min-p, temperature, then a categorical draw.
pub struct ReferenceSampler {
    vocab_size: usize,
    settings: ReferenceSettings,
    state: SamplerState,
    logit_bias: Vec<(Token, f32)>,
    rng: StdRng,
    candidates: Vec<Candidate>,
}

impl ReferenceSampler {
    pub fn new(vocab_size: usize, settings: ReferenceSettings) -> Self {
        ReferenceSampler {
            vocab_size,
            settings,
            state: SamplerState::default(),
            logit_bias: Vec::new(),
            rng: StdRng::from_entropy(),
            candidates: Vec::new(),
        }
    }

    pub fn settings(&self) -> &ReferenceSettings {
        &self.settings
    }

    fn penalize(&self, logits: &mut [f32]) {
        let s = &self.settings;
        if s.repetition_penalty == 1.0 && s.frequency_penalty == 0.0 && s.presence_penalty == 0.0
        {
            return;
        }
        let mut counts: HashMap<Token, usize> = HashMap::default();
        for &tok in self.state.window(s.repetition_range) {
            *counts.entry(tok).or_insert(0) += 1;
        }
        for (&tok, &count) in counts.iter() {
            if let Some(v) = logits.get_mut(tok as usize) {
                apply_repetition_penalty(v, s.repetition_penalty);
                *v -= count as f32 * s.frequency_penalty + s.presence_penalty;
            }
        }
    }

    fn draw(&mut self) -> Option<Token> {
        softmax(&mut self.candidates);
        let dist =
            rand::distributions::WeightedIndex::new(self.candidates.iter().map(|c| c.p)).ok()?;
        let idx = dist.sample(&mut self.rng);
        Some(self.candidates[idx].id)
    }
}

fn sort_desc(cands: &mut [Candidate]) {
    cands.sort_by(|a, b| b.logit.total_cmp(&a.logit));
}

fn softmax(cands: &mut [Candidate]) {
    if cands.is_empty() {
        return;
    }
    sort_desc(cands);
    let max = cands[0].logit;
    let mut sum = 0.0f32;
    for c in cands.iter_mut() {
        c.p = (c.logit - max).exp();
        sum += c.p;
    }
    for c in cands.iter_mut() {
        c.p /= sum;
    }
}

fn top_k(cands: &mut Vec<Candidate>, k: usize) {
    if k == 0 || k >= cands.len() {
        return;
    }
    sort_desc(cands);
    cands.truncate(k);
}

fn tail_free(cands: &mut Vec<Candidate>, z: f32) {
    if z >= 1.0 || cands.len() <= 2 {
        return;
    }
    softmax(cands);
    let first: Vec<f32> = cands.windows(2).map(|w| w[0].p - w[1].p).collect();
    let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();
    let total: f32 = second.iter().sum();
    if total > 0.0 {
        for d in second.iter_mut() {
            *d /= total;
        }
    }
    let mut cum = 0.0;
    let mut keep = cands.len();
    for (i, d) in second.iter().enumerate() {
        cum += d;
        if cum > z && i >= 1 {
            keep = i;
            break;
        }
    }
    cands.truncate(keep);
}

fn typical(cands: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 {
        return;
    }
    softmax(cands);
    let entropy: f32 = cands
        .iter()
        .filter(|c| c.p > 0.0)
        .map(|c| -c.p * c.p.ln())
        .sum();
    let mut order: Vec<(f32, Candidate)> = cands
        .iter()
        .map(|c| ((-c.p.ln() - entropy).abs(), *c))
        .collect();
    order.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut cum = 0.0;
    let mut keep = order.len();
    for (i, (_, c)) in order.iter().enumerate() {
        cum += c.p;
        if cum > p {
            keep = i + 1;
            break;
        }
    }
    cands.clear();
    cands.extend(order.into_iter().take(keep).map(|(_, c)| c));
}

fn top_p(cands: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 {
        return;
    }
    softmax(cands);
    let mut cum = 0.0;
    let mut keep = cands.len();
    for (i, c) in cands.iter().enumerate() {
        cum += c.p;
        if cum >= p {
            keep = i + 1;
            break;
        }
    }
    cands.truncate(keep);
}

fn min_p(cands: &mut Vec<Candidate>, p: f32) {
    if p <= 0.0 || cands.is_empty() {
        return;
    }
    softmax(cands);
    let threshold = p * cands[0].p;
    let keep = cands.iter().take_while(|c| c.p >= threshold).count();
    cands.truncate(std::cmp::max(keep, 1));
}

impl Sampler for ReferenceSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::Reference
    }

    fn initialize(&mut self, params: &SamplingParams, prompt: &[Token]) -> Result<()> {
        self.settings = self.settings.merged(params);
        self.state = SamplerState::new(prompt);
        self.logit_bias = params
            .logit_bias
            .iter()
            .filter(|(tok, _)| (**tok as usize) < self.vocab_size)
            .map(|(&tok, &bias)| (tok, bias))
            .collect();
        self.rng = match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(())
    }

    fn sample_token(&mut self, logits: &mut [f32]) -> Token {
        self.penalize(logits);
        for &(tok, bias) in self.logit_bias.iter() {
            if let Some(v) = logits.get_mut(tok as usize) {
                *v = bias;
            }
        }

        let s = self.settings.clone();
        if s.temperature < SAMPLING_EPS {
            return argmax(logits);
        }

        self.candidates.clear();
        self.candidates.extend(
            logits
                .iter()
                .enumerate()
                .filter(|(_, l)| !l.is_nan())
                .map(|(id, &logit)| Candidate {
                    id: id as Token,
                    logit,
                    p: 0.0,
                }),
        );
        if self.candidates.is_empty() {
            return 0;
        }

        top_k(&mut self.candidates, s.top_k);
        tail_free(&mut self.candidates, s.tfs_z);
        typical(&mut self.candidates, s.typical_p);
        top_p(&mut self.candidates, s.top_p);
        min_p(&mut self.candidates, s.min_p);
        for c in self.candidates.iter_mut() {
            c.logit /= s.temperature;
        }

        match self.draw() {
            Some(tok) => tok,
            None => {
                log::warn!("degenerate distribution; falling back to arg-max");
                self.candidates[0].id
            }
        }
    }

    fn state(&self) -> &SamplerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SamplerState {
        &mut self.state
    }
}
