use std::{
    fmt::{Display, Write},
    time::{Duration, Instant},
};

/// Tokens generated per logging window.
pub struct ThroughputStats {
    interval: usize,
    steps: usize,
    window_tokens: usize,
    window_start: Instant,
    total_tokens: usize,
    started: Instant,
}

impl ThroughputStats {
    /// `interval == 0` disables logging; totals are kept regardless.
    pub fn new(interval: usize) -> Self {
        let now = Instant::now();
        ThroughputStats {
            interval,
            steps: 0,
            window_tokens: 0,
            window_start: now,
            total_tokens: 0,
            started: now,
        }
    }

    pub fn record(&mut self, tokens: usize, active: usize, queued: usize) {
        self.steps += 1;
        self.window_tokens += tokens;
        self.total_tokens += tokens;
        if self.interval == 0 || self.steps % self.interval != 0 {
            return;
        }
        let secs = self.window_start.elapsed().as_secs_f64();
        log::debug!(
            "{:4} tokens in {:.2}s ({:.2} T/s) -- {:3} active, {:4} in queue",
            self.window_tokens,
            secs,
            self.window_tokens as f64 / secs.max(1e-9),
            active,
            queued
        );
        self.window_tokens = 0;
        self.window_start = Instant::now();
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    /// Average tokens per second since creation.
    pub fn tokens_per_sec(&self) -> f64 {
        self.total_tokens as f64 / self.started.elapsed().as_secs_f64().max(1e-9)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Refresh,
    Decode,
    Sample,
}

impl Phase {
    const ALL: [Phase; 3] = [Phase::Refresh, Phase::Decode, Phase::Sample];

    fn name(&self) -> &'static str {
        match self {
            Phase::Refresh => "refresh",
            Phase::Decode => "decode",
            Phase::Sample => "sample",
        }
    }
}

/// Time spent in each phase of a scheduler step.
#[derive(Debug, Default, Clone)]
pub struct StepTimers {
    elapsed: [Duration; 3],
    num: [u32; 3],
}

impl StepTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, phase: Phase, since: Instant) {
        self.elapsed[phase as usize] += since.elapsed();
        self.num[phase as usize] += 1;
    }

    pub fn average(&self, phase: Phase) -> Duration {
        let idx = phase as usize;
        self.elapsed[idx] / std::cmp::max(1, self.num[idx])
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn pp(&self) -> String {
        let total: Duration = self.elapsed.iter().sum();
        let mut f = String::new();
        for phase in Phase::ALL {
            let idx = phase as usize;
            let perc = 100.0 * self.elapsed[idx].as_secs_f64() / total.as_secs_f64().max(1e-9);
            let _ = writeln!(
                f,
                "  {:4.1}% {:8.3}ms (x{}) {}",
                perc,
                self.average(phase).as_secs_f64() * 1000.0,
                self.num[idx],
                phase.name()
            );
        }
        f
    }
}

impl Display for StepTimers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pp())
    }
}
