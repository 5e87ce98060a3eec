use crate::{
    bail_user,
    config::SchedulerConfig,
    engine::{Batch, DecodeEngine},
    refresher::{ContextRefresher, RefreshOutcome},
    request::{InferenceRequest, RequestHandle},
    sampler::SamplerFactory,
    stats::{Phase, StepTimers, ThroughputStats},
    limit_tokens, ModelContext, SamplingParams, Token,
};
use anyhow::{anyhow, bail, Result};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

const TIMERS_INTERVAL: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing active and nothing queued.
    Idle,
    /// Requests are queued but none could be activated.
    Waiting,
    /// One decode call; `sampled` requests produced a token.
    Decoded { active: usize, sampled: usize },
}

/// The scheduling loop for one model context.
///
/// Sole owner of the active set, the pending queue and the batch; every
/// engine call happens from here, one at a time.
pub struct BatchProcessor<E: DecodeEngine> {
    engine: E,
    ctx: Arc<ModelContext>,
    config: SchedulerConfig,
    refresher: ContextRefresher,
    batch: Batch,
    active: Vec<InferenceRequest>,
    pending: VecDeque<InferenceRequest>,
    inbox: UnboundedReceiver<InferenceRequest>,
    inbox_closed: bool,
    stats: ThroughputStats,
    timers: StepTimers,
    last_refresh: RefreshOutcome,
}

impl<E: DecodeEngine> BatchProcessor<E> {
    pub fn new(
        engine: E,
        ctx: Arc<ModelContext>,
        config: SchedulerConfig,
        factory: SamplerFactory,
    ) -> Result<(Self, Submitter)> {
        config.verify()?;
        if engine.vocab_size() != ctx.vocab_size() {
            bail!(
                "engine vocab size {} != tokenizer vocab size {}",
                engine.vocab_size(),
                ctx.vocab_size()
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let submitter = Submitter {
            ctx: ctx.clone(),
            factory: Arc::new(factory),
            tx,
            next_id: Arc::new(AtomicUsize::new(1)),
            max_context_size: config.max_context_size,
        };

        log::info!(
            "batch processor: context {}, batch {}, sweet spot {}, {:?} refresh",
            config.max_context_size,
            config.max_batch_size,
            config.sweet_spot,
            config.refresh_policy
        );

        let processor = BatchProcessor {
            engine,
            ctx,
            refresher: ContextRefresher::new(&config),
            batch: Batch::new(config.max_batch_size),
            active: Vec::with_capacity(config.max_batch_size),
            pending: VecDeque::new(),
            inbox: rx,
            inbox_closed: false,
            stats: ThroughputStats::new(config.stats_interval),
            timers: StepTimers::new(),
            last_refresh: RefreshOutcome::default(),
            config,
        };
        Ok((processor, submitter))
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn context(&self) -> &Arc<ModelContext> {
        &self.ctx
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn active(&self) -> &[InferenceRequest] {
        &self.active
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Tokens held in the cache by active requests.
    pub fn occupancy(&self) -> usize {
        self.active.iter().map(|r| r.total_tokens()).sum()
    }

    pub fn last_refresh(&self) -> &RefreshOutcome {
        &self.last_refresh
    }

    pub fn stats(&self) -> &ThroughputStats {
        &self.stats
    }

    pub fn timers(&self) -> &StepTimers {
        &self.timers
    }

    fn drain_inbox(&mut self) {
        loop {
            match self.inbox.try_recv() {
                Ok(req) => self.pending.push_back(req),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.inbox_closed = true;
                    break;
                }
            }
        }
    }

    fn fail_active(&mut self, msg: &str) {
        for req in self.active.iter_mut() {
            req.fail(msg);
        }
    }

    /// One iteration: refresh, decode the next token of every active
    /// request, sample.
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.drain_inbox();
        if self.active.is_empty() && self.pending.is_empty() {
            return Ok(StepOutcome::Idle);
        }

        let t0 = Instant::now();
        let refreshed = self.refresher.refresh(
            &mut self.engine,
            &mut self.batch,
            &mut self.active,
            &mut self.pending,
        );
        self.timers.add(Phase::Refresh, t0);
        match refreshed {
            Ok(outcome) => self.last_refresh = outcome,
            Err(e) => {
                // the admitted requests are already failed and evicted
                self.last_refresh = RefreshOutcome::default();
                if self.config.fatal_decode_errors {
                    return Err(e);
                }
                log::error!("refresh failed: {e:?}");
            }
        }

        if let Err(e) = self.flush_prefill() {
            if self.config.fatal_decode_errors {
                return Err(e);
            }
            log::error!("prefill flush failed: {e:?}");
        }

        if self.active.is_empty() {
            return Ok(StepOutcome::Waiting);
        }

        let sampled = match self.infer_next_token_logits() {
            Ok(n) => n,
            Err(e) => {
                self.batch.clear();
                if self.config.fatal_decode_errors {
                    return Err(e);
                }
                log::error!("decode failed: {e:?}");
                self.fail_active(&format!("decode failed: {e}"));
                0
            }
        };

        let num_active = self.active.len();
        self.stats.record(sampled, num_active, self.pending.len());
        if self.stats.steps() % TIMERS_INTERVAL == 0 && log::log_enabled!(log::Level::Debug) {
            log::debug!("step timers:\n{}", self.timers.pp());
            self.timers.reset();
        }

        Ok(StepOutcome::Decoded {
            active: num_active,
            sampled,
        })
    }

    /// Decode leftover prefill tokens on their own when the generation step
    /// would not fit next to them. On failure only the requests whose
    /// prompts were in the batch are dropped.
    fn flush_prefill(&mut self) -> Result<()> {
        if self.batch.is_empty() || self.batch.len() + self.active.len() <= self.batch.max_len() {
            return Ok(());
        }
        let t0 = Instant::now();
        let res = self.engine.decode(&self.batch);
        self.batch.clear();
        self.timers.add(Phase::Refresh, t0);
        if let Err(e) = &res {
            let start = self.active.len().saturating_sub(self.last_refresh.prefilled);
            self.refresher.evict_from(
                &mut self.engine,
                &mut self.active,
                start,
                &format!("prefill failed: {e}"),
            );
        }
        res
    }

    fn infer_next_token_logits(&mut self) -> Result<usize> {
        let t0 = Instant::now();
        for req in self.active.iter() {
            let slot = match req.slot() {
                Some(slot) => slot,
                None => bail!("active req {} has no slot", req.id()),
            };
            self.batch
                .add_token(req.last_token(), req.position(), slot, true);
        }
        self.engine.decode(&self.batch)?;
        self.batch.clear();
        self.timers.add(Phase::Decode, t0);

        let t0 = Instant::now();
        let vocab_size = self.ctx.vocab_size();
        let logits = self.engine.logits(self.active.len())?;
        let mut sampled = 0;
        for (req, row) in self
            .active
            .iter_mut()
            .zip(logits.chunks_exact_mut(vocab_size))
        {
            if req.handle_logits(row).is_some() {
                sampled += 1;
            }
        }
        self.timers.add(Phase::Sample, t0);
        Ok(sampled)
    }

    /// Run until every [`Submitter`] is dropped and all work is done.
    ///
    /// Blocks on the inbox when there is nothing to do; backs off
    /// exponentially while requests are queued but none are active.
    pub fn run(&mut self) -> Result<()> {
        let min_wait = self.config.idle_min_ms;
        let max_wait = self.config.idle_max_ms;
        let mut wait = min_wait;
        loop {
            match self.step()? {
                StepOutcome::Idle => {
                    wait = min_wait;
                    if self.inbox_closed {
                        break;
                    }
                    match self.inbox.blocking_recv() {
                        Some(req) => self.pending.push_back(req),
                        None => self.inbox_closed = true,
                    }
                }
                StepOutcome::Waiting => {
                    std::thread::sleep(Duration::from_millis(wait));
                    wait = std::cmp::min(wait * 2, max_wait);
                }
                StepOutcome::Decoded { .. } => wait = min_wait,
            }
        }
        log::info!(
            "batch processor done: {} tokens in {} steps ({:.2} T/s)",
            self.stats.total_tokens(),
            self.stats.steps(),
            self.stats.tokens_per_sec()
        );
        Ok(())
    }
}

impl<E: DecodeEngine + Send + 'static> BatchProcessor<E> {
    /// Run on a dedicated thread; the processor is handed back on exit.
    pub fn spawn(mut self) -> Result<JoinHandle<Result<Self>>> {
        let handle = std::thread::Builder::new()
            .name("cbatch-scheduler".to_string())
            .spawn(move || {
                self.run()?;
                Ok(self)
            })?;
        Ok(handle)
    }
}

/// Producer side of the pending queue. Cheap to clone; usable from any
/// thread.
#[derive(Clone)]
pub struct Submitter {
    ctx: Arc<ModelContext>,
    factory: Arc<SamplerFactory>,
    tx: UnboundedSender<InferenceRequest>,
    next_id: Arc<AtomicUsize>,
    max_context_size: usize,
}

impl Submitter {
    pub fn context(&self) -> &Arc<ModelContext> {
        &self.ctx
    }

    /// Queue a tokenized prompt. Fails with a [`crate::UserError`] for an
    /// empty prompt, invalid parameters or a request that could never fit
    /// in the context.
    pub fn submit(&self, prompt: Vec<Token>, params: SamplingParams) -> Result<RequestHandle> {
        let vocab_size = self.ctx.vocab_size();
        if prompt.is_empty() {
            bail_user!("prompt must not be empty");
        }
        if let Some(tok) = prompt.iter().find(|t| **t as usize >= vocab_size) {
            bail_user!("prompt token {} out of range (vocab {})", tok, vocab_size);
        }
        params.verify_args(vocab_size)?;
        let needed = prompt.len() + params.max_tokens;
        if needed > self.max_context_size {
            bail_user!(
                "prompt ({}) plus max_tokens ({}) exceeds context size {}",
                prompt.len(),
                params.max_tokens,
                self.max_context_size
            );
        }

        let sampler = self.factory.create(&self.ctx, &params, &prompt)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let live = Arc::new(AtomicBool::new(true));
        let req = InferenceRequest::new(id, self.ctx.clone(), sampler, &params, tx, live.clone());

        log::trace!("submit req {}: {}", id, limit_tokens(&prompt, 16));
        self.tx
            .send(req)
            .map_err(|_| anyhow!("batch processor is gone"))?;
        Ok(RequestHandle::new(id, rx, live))
    }

    pub fn submit_text(&self, text: &str, params: SamplingParams) -> Result<RequestHandle> {
        let prompt = self.ctx.tokenizer().encode(text);
        self.submit(prompt, params)
    }

    pub fn cancel(&self, handle: &RequestHandle) {
        handle.cancel();
    }
}
