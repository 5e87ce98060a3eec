use crate::{bail_user, sampler::SamplerKind, HashMap, Token};
use anyhow::Result;
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

pub const SAMPLING_EPS: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPolicy {
    /// Clear the cache and re-prefill every admitted request.
    Full,
    /// Compact the cache in place and prefill only newly admitted requests.
    Additive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Capacity of the KV cache, in tokens, shared by all active requests.
    pub max_context_size: usize,
    /// Maximum number of tokens per decode call; also the number of sequence slots.
    pub max_batch_size: usize,
    /// Refresh only when occupancy is below this fraction of `max_context_size`.
    pub sweet_spot: f32,
    pub refresh_policy: RefreshPolicy,
    /// Idle backoff bounds when work is queued but nothing is active.
    pub idle_min_ms: u64,
    pub idle_max_ms: u64,
    /// Stop the scheduling loop on a decode failure instead of failing the batch.
    pub fatal_decode_errors: bool,
    /// Log throughput every this many steps; 0 disables.
    pub stats_interval: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_context_size: 4096,
            max_batch_size: 32,
            sweet_spot: 0.5,
            refresh_policy: RefreshPolicy::Full,
            idle_min_ms: 1,
            idle_max_ms: 32,
            fatal_decode_errors: false,
            stats_interval: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn verify(&self) -> Result<()> {
        if self.max_context_size == 0 {
            bail_user!("max_context_size must be positive");
        }
        if self.max_batch_size == 0 {
            bail_user!("max_batch_size must be positive");
        }
        if !(self.sweet_spot > 0.0 && self.sweet_spot <= 1.0) {
            bail_user!("sweet_spot must be in (0, 1], got {}.", self.sweet_spot);
        }
        if self.idle_min_ms == 0 || self.idle_max_ms < self.idle_min_ms {
            bail_user!(
                "idle backoff must satisfy 0 < min <= max, got {}..{}",
                self.idle_min_ms,
                self.idle_max_ms
            );
        }
        Ok(())
    }

    /// Occupancy threshold below which a refresh is worthwhile.
    pub fn refresh_threshold(&self) -> usize {
        (self.sweet_spot as f64 * self.max_context_size as f64) as usize
    }
}

#[derive(Args, Debug, Clone)]
pub struct SchedulerArgs {
    /// KV cache capacity in tokens
    #[arg(long, default_value_t = 4096, help_heading = "Scheduler")]
    pub max_context_size: usize,

    /// Max tokens per decode call (and number of sequence slots)
    #[arg(long, default_value_t = 32, help_heading = "Scheduler")]
    pub max_batch_size: usize,

    /// Refresh when occupancy drops below this fraction of the context
    #[arg(long, default_value_t = 0.5, help_heading = "Scheduler")]
    pub sweet_spot: f32,

    /// How to rebuild the active set
    #[arg(long, value_enum, default_value_t = RefreshPolicy::Full, help_heading = "Scheduler")]
    pub refresh_policy: RefreshPolicy,

    /// Stop scheduling on the first decode failure
    #[arg(long, default_value_t = false, help_heading = "Scheduler")]
    pub fatal_decode_errors: bool,

    /// Log throughput every N steps (0 to disable)
    #[arg(long, default_value_t = 10, help_heading = "Scheduler")]
    pub stats_interval: usize,
}

impl SchedulerArgs {
    pub fn to_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_context_size: self.max_context_size,
            max_batch_size: self.max_batch_size,
            sweet_spot: self.sweet_spot,
            refresh_policy: self.refresh_policy,
            fatal_decode_errors: self.fatal_decode_errors,
            stats_interval: self.stats_interval,
            ..SchedulerConfig::default()
        }
    }
}

/// Per-request sampling parameters.
///
/// Unset fields fall back to the defaults of the chosen sampler, see
/// [`crate::SamplerFactory`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Sampler to use instead of the deployment default.
    pub sampler: Option<SamplerKind>,

    pub temperature: Option<f32>,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub min_p: Option<f32>,
    pub tfs_z: Option<f32>,
    pub typical_p: Option<f32>,

    /// Multiplicative penalty for tokens in the lookback window; 1.0 disables.
    pub repetition_penalty: Option<f32>,
    /// Flat penalty the first time a token shows up.
    pub presence_penalty: Option<f32>,
    /// Penalty per occurrence of a token.
    pub frequency_penalty: Option<f32>,
    /// Length of the lookback window for penalties.
    pub repetition_range: Option<usize>,
    /// Number of initial tokens during which refusal openers are pushed down.
    pub min_tokens: Option<usize>,
    pub prevent_refusals: Option<bool>,

    /// Stay on a single line (quick sampler).
    pub single_line: Option<bool>,
    /// Avoid tokens with capital letters (quick sampler).
    pub ban_caps: Option<bool>,
    /// Push towards ending the turn around this many tokens (quick sampler).
    pub ideal_response_length: Option<usize>,
    /// Recency-weighted repetition penalty (quick sampler).
    pub penalize_repetition: Option<bool>,

    pub logit_bias: HashMap<Token, f32>,

    /// Maximum number of tokens to generate.
    pub max_tokens: usize,

    /// Tokens that end the generation besides the end-of-turn token.
    pub stop_tokens: Vec<Token>,

    /// Seed for the reference sampler.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            sampler: None,
            temperature: None,
            top_k: None,
            top_p: None,
            min_p: None,
            tfs_z: None,
            typical_p: None,
            repetition_penalty: None,
            presence_penalty: None,
            frequency_penalty: None,
            repetition_range: None,
            min_tokens: None,
            prevent_refusals: None,
            single_line: None,
            ban_caps: None,
            ideal_response_length: None,
            penalize_repetition: None,
            logit_bias: HashMap::default(),
            max_tokens: 300,
            stop_tokens: Vec::new(),
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn with_max_tokens(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }

    /// Verifies the parameters against a vocabulary of `vocab_size` tokens.
    pub fn verify_args(&self, vocab_size: usize) -> Result<()> {
        if self.max_tokens < 1 {
            bail_user!("max_tokens must be at least 1, got {}.", self.max_tokens);
        }
        if let Some(t) = self.temperature {
            if !(t >= 0.0 && t <= 2.0) {
                bail_user!("temperature must be in [0, 2], got {}.", t);
            }
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                bail_user!("top_p must be in (0, 1], got {}.", p);
            }
        }
        if let Some(p) = self.min_p {
            if !(p >= 0.0 && p <= 1.0) {
                bail_user!("min_p must be in [0, 1], got {}.", p);
            }
        }
        if let Some(p) = self.typical_p {
            if !(p > 0.0 && p <= 1.0) {
                bail_user!("typical_p must be in (0, 1], got {}.", p);
            }
        }
        if let Some(z) = self.tfs_z {
            if !(z > 0.0 && z <= 1.0) {
                bail_user!("tfs_z must be in (0, 1], got {}.", z);
            }
        }
        if self.top_k == Some(0) {
            bail_user!("top_k must be at least 1 when set.");
        }
        if let Some(r) = self.repetition_penalty {
            if !(r > 0.0) {
                bail_user!("repetition_penalty must be positive, got {}.", r);
            }
        }
        if let Some(p) = self.presence_penalty {
            if !(p >= -2.0 && p <= 2.0) {
                bail_user!("presence_penalty must be in [-2, 2], got {}.", p);
            }
        }
        if let Some(p) = self.frequency_penalty {
            if !(p >= -2.0 && p <= 2.0) {
                bail_user!("frequency_penalty must be in [-2, 2], got {}.", p);
            }
        }
        for (&tok, &bias) in self.logit_bias.iter() {
            if tok as usize >= vocab_size {
                bail_user!("logit_bias token {} out of range (vocab {})", tok, vocab_size);
            }
            if !bias.is_finite() {
                bail_user!("logit_bias for token {} must be finite", tok);
            }
        }
        for &tok in self.stop_tokens.iter() {
            if tok as usize >= vocab_size {
                bail_user!("stop token {} out of range (vocab {})", tok, vocab_size);
            }
        }
        Ok(())
    }
}

/// Defaults of the fast standard sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardSettings {
    pub temperature: f32,
    pub repetition_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub repetition_range: usize,
    pub min_tokens: usize,
    pub prevent_refusals: bool,
}

impl Default for StandardSettings {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            repetition_penalty: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            repetition_range: 2048,
            min_tokens: 10,
            prevent_refusals: true,
        }
    }
}

impl StandardSettings {
    pub fn merged(&self, p: &SamplingParams) -> Self {
        Self {
            temperature: p.temperature.unwrap_or(self.temperature),
            repetition_penalty: p.repetition_penalty.unwrap_or(self.repetition_penalty),
            presence_penalty: p.presence_penalty.unwrap_or(self.presence_penalty),
            frequency_penalty: p.frequency_penalty.unwrap_or(self.frequency_penalty),
            repetition_range: p.repetition_range.unwrap_or(self.repetition_range),
            min_tokens: p.min_tokens.unwrap_or(self.min_tokens),
            prevent_refusals: p.prevent_refusals.unwrap_or(self.prevent_refusals),
        }
    }
}

/// Defaults of the quick sampler; its knobs are on/off with fixed strength.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickSettings {
    pub single_line: bool,
    pub ban_caps: bool,
    pub prevent_refusals: bool,
    pub min_tokens: usize,
    /// 0 disables the length pressure.
    pub ideal_response_length: usize,
    pub penalize_repetition: bool,
    pub repetition_range: usize,
}

impl Default for QuickSettings {
    fn default() -> Self {
        Self {
            single_line: false,
            ban_caps: false,
            prevent_refusals: true,
            min_tokens: 10,
            ideal_response_length: 0,
            penalize_repetition: false,
            repetition_range: 1024,
        }
    }
}

impl QuickSettings {
    pub fn merged(&self, p: &SamplingParams) -> Self {
        Self {
            single_line: p.single_line.unwrap_or(self.single_line),
            ban_caps: p.ban_caps.unwrap_or(self.ban_caps),
            prevent_refusals: p.prevent_refusals.unwrap_or(self.prevent_refusals),
            min_tokens: p.min_tokens.unwrap_or(self.min_tokens),
            ideal_response_length: p
                .ideal_response_length
                .unwrap_or(self.ideal_response_length),
            penalize_repetition: p.penalize_repetition.unwrap_or(self.penalize_repetition),
            repetition_range: p.repetition_range.unwrap_or(self.repetition_range),
        }
    }
}

/// Defaults of the reference (filter chain) sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceSettings {
    pub temperature: f32,
    /// 0 disables.
    pub top_k: usize,
    pub top_p: f32,
    pub min_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub repetition_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub repetition_range: usize,
    pub seed: Option<u64>,
}

impl Default for ReferenceSettings {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            tfs_z: 1.0,
            typical_p: 1.0,
            repetition_penalty: 1.2,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            repetition_range: 1024,
            seed: None,
        }
    }
}

impl ReferenceSettings {
    pub fn merged(&self, p: &SamplingParams) -> Self {
        Self {
            temperature: p.temperature.unwrap_or(self.temperature),
            top_k: p.top_k.unwrap_or(self.top_k),
            top_p: p.top_p.unwrap_or(self.top_p),
            min_p: p.min_p.unwrap_or(self.min_p),
            tfs_z: p.tfs_z.unwrap_or(self.tfs_z),
            typical_p: p.typical_p.unwrap_or(self.typical_p),
            repetition_penalty: p.repetition_penalty.unwrap_or(self.repetition_penalty),
            presence_penalty: p.presence_penalty.unwrap_or(self.presence_penalty),
            frequency_penalty: p.frequency_penalty.unwrap_or(self.frequency_penalty),
            repetition_range: p.repetition_range.unwrap_or(self.repetition_range),
            seed: p.seed.or(self.seed),
        }
    }
}
