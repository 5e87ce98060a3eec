//! Multiplicative-noise "temperature" for the fast samplers.
//!
//! Instead of a softmax draw, a logits row is multiplied elementwise by a
//! vector of random scales and the arg-max of the result is taken. This is
//! an approximation of categorical sampling, not an implementation of it.
//!
//! Temperatures in `[0, 2]` are bucketed in 0.05 steps (41 buckets). Bucket
//! `t` draws scales uniformly from `[1 - max(0, (t - 1) / 2), 1 + t / 5]`;
//! the end-of-turn entry is never scaled above 1. Scale vectors are
//! pre-generated; a used vector goes to a background thread which re-rolls
//! it and puts it back into its bucket.

use crate::{sampler::mul_in_place, Token};
use anyhow::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};

pub const NUM_BUCKETS: usize = 41;
pub const BUCKET_STEP: f32 = 0.05;

const REFILL_MAILBOX: usize = NUM_BUCKETS * 4;

pub fn bucket_of(temperature: f32) -> usize {
    let b = (temperature / BUCKET_STEP).round();
    if b >= 0.0 {
        std::cmp::min(b as usize, NUM_BUCKETS - 1)
    } else {
        // negative or NaN
        0
    }
}

/// Lower and upper multiplier for a bucket.
pub fn scale_range(bucket: usize) -> (f32, f32) {
    let temperature = bucket as f32 * BUCKET_STEP;
    let lo = 1.0 - f32::max(0.0, (temperature - 1.0) / 2.0);
    let hi = 1.0 + temperature / 5.0;
    (lo, hi)
}

struct Bucket {
    lo: f32,
    hi: f32,
    ready: Mutex<Vec<Vec<f32>>>,
}

struct BankInner {
    vocab_size: usize,
    eot_token: Token,
    buckets: Vec<Bucket>,
}

impl BankInner {
    fn fill(&self, bucket: usize, buf: &mut [f32], rng: &mut StdRng) {
        let b = &self.buckets[bucket];
        for v in buf.iter_mut() {
            *v = b.lo + (b.hi - b.lo) * rng.gen::<f32>();
        }
        if let Some(v) = buf.get_mut(self.eot_token as usize) {
            *v = v.min(1.0);
        }
    }

    fn fresh(&self, bucket: usize, rng: &mut StdRng) -> Vec<f32> {
        let mut buf = vec![0.0f32; self.vocab_size];
        self.fill(bucket, &mut buf, rng);
        buf
    }
}

pub struct TemperatureBank {
    inner: Arc<BankInner>,
    rng: Mutex<StdRng>,
    refill: mpsc::Sender<(usize, Vec<f32>)>,
}

impl TemperatureBank {
    /// Pre-generates `depth` scale vectors per bucket and starts the refill
    /// thread, which exits once the bank is dropped.
    pub fn new(vocab_size: usize, eot_token: Token, depth: usize, seed: Option<u64>) -> Result<Self> {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let buckets = (0..NUM_BUCKETS)
            .map(|idx| {
                let (lo, hi) = scale_range(idx);
                Bucket {
                    lo,
                    hi,
                    ready: Mutex::new(Vec::with_capacity(depth)),
                }
            })
            .collect();
        let inner = Arc::new(BankInner {
            vocab_size,
            eot_token,
            buckets,
        });
        for idx in 0..NUM_BUCKETS {
            let bufs = (0..depth).map(|_| inner.fresh(idx, &mut rng)).collect();
            *inner.buckets[idx].ready.lock().unwrap() = bufs;
        }

        let (tx, mut rx) = mpsc::channel::<(usize, Vec<f32>)>(REFILL_MAILBOX);
        let worker = inner.clone();
        let mut worker_rng = StdRng::from_rng(&mut rng).unwrap_or_else(|_| StdRng::from_entropy());
        std::thread::Builder::new()
            .name("cbatch-noise".to_string())
            .spawn(move || {
                while let Some((bucket, mut buf)) = rx.blocking_recv() {
                    worker.fill(bucket, &mut buf, &mut worker_rng);
                    worker.buckets[bucket].ready.lock().unwrap().push(buf);
                }
                log::trace!("noise refill thread done");
            })?;

        log::debug!(
            "temperature bank: {} buckets x {} buffers of {} entries",
            NUM_BUCKETS,
            depth,
            vocab_size
        );

        Ok(TemperatureBank {
            inner,
            rng: Mutex::new(rng),
            refill: tx,
        })
    }

    /// Multiply `logits` by a random scale vector for `temperature`.
    pub fn apply(&self, logits: &mut [f32], temperature: f32) {
        let bucket = bucket_of(temperature);
        let ready = self.inner.buckets[bucket].ready.lock().unwrap().pop();
        let buf = match ready {
            Some(buf) => buf,
            None => self.inner.fresh(bucket, &mut self.rng.lock().unwrap()),
        };
        mul_in_place(logits, &buf);

        match self.refill.try_send((bucket, buf)) {
            Ok(()) => {}
            Err(TrySendError::Full((bucket, mut buf))) | Err(TrySendError::Closed((bucket, mut buf))) => {
                self.inner
                    .fill(bucket, &mut buf, &mut self.rng.lock().unwrap());
                self.inner.buckets[bucket].ready.lock().unwrap().push(buf);
            }
        }
    }

    pub fn num_ready(&self, temperature: f32) -> usize {
        self.inner.buckets[bucket_of(temperature)]
            .ready
            .lock()
            .unwrap()
            .len()
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.vocab_size
    }
}
