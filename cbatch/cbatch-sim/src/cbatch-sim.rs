use anyhow::Result;
use cbatch::{
    engine::{Batch, DecodeEngine},
    sim::{ByteTokenizer, SimEngine, BYTE_VOCAB_SIZE, EOT_TOKEN},
    BatchProcessor, ContextOptions, LogMode, ModelContext, RequestHandle, SamplerFactory,
    SamplerKind, SamplingParams, SchedulerArgs, SlotId, StopReason, Token, UserError,
};
use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Drive the continuous-batching scheduler with a simulated model.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct SimArgs {
    #[clap(flatten)]
    pub scheduler: SchedulerArgs,

    /// Number of requests to submit
    #[arg(long, short = 'n', default_value_t = 1000, help_heading = "Load")]
    pub requests: usize,

    /// Tokens to request per generation
    #[arg(long, default_value_t = 64, help_heading = "Load")]
    pub max_tokens: usize,

    /// Client threads; each submits its share of requests and polls them
    #[arg(long, default_value_t = 4, help_heading = "Load")]
    pub clients: usize,

    /// JSONL file, one {"prompt": "...", <sampling params>} per line
    #[arg(long, help_heading = "Load")]
    pub jsonl: Option<String>,

    /// Print every response at the end
    #[arg(long, default_value_t = false, help_heading = "Load")]
    pub print: bool,

    /// Default sampler
    #[arg(long, value_enum, default_value_t = SamplerKind::Standard, help_heading = "Sampling")]
    pub sampler: SamplerKind,

    #[arg(long, help_heading = "Sampling")]
    pub temperature: Option<f32>,

    #[arg(long, help_heading = "Sampling")]
    pub repetition_penalty: Option<f32>,

    /// Seed for the simulated model, the noise bank and the reference sampler
    #[arg(long, help_heading = "Sampling")]
    pub seed: Option<u64>,

    /// Chance that the simulated model strongly prefers end-of-turn at a step
    #[arg(long, default_value_t = 0.02, help_heading = "Model")]
    pub eot_prob: f64,

    /// Simulated cost of one decode call, in microseconds
    #[arg(long, default_value_t = 0, help_heading = "Model")]
    pub call_us: u64,

    /// Simulated cost per batched token, in microseconds
    #[arg(long, default_value_t = 0, help_heading = "Model")]
    pub token_us: u64,

    /// Set RUST_LOG, e.g. "debug" or "cbatch=trace"
    #[arg(long, help_heading = "Logging")]
    pub log: Option<String>,

    /// Enable daemon mode (log timestamps)
    #[arg(long, default_value_t = false, help_heading = "Logging")]
    pub daemon: bool,
}

#[derive(Debug, Deserialize)]
struct JsonlRequest {
    prompt: String,
    #[serde(flatten)]
    params: SamplingParams,
}

/// Adds a fixed per-call and per-token latency to the simulator.
struct TimedEngine {
    inner: SimEngine,
    call_cost: Duration,
    token_cost: Duration,
}

impl DecodeEngine for TimedEngine {
    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        let cost = self.call_cost + self.token_cost * batch.len() as u32;
        if !cost.is_zero() {
            std::thread::sleep(cost);
        }
        self.inner.decode(batch)
    }

    fn logits(&mut self, rows: usize) -> Result<&mut [f32]> {
        self.inner.logits(rows)
    }

    fn clear_cache(&mut self) {
        self.inner.clear_cache()
    }

    fn copy_sequence(&mut self, src: SlotId, dst: SlotId) {
        self.inner.copy_sequence(src, dst)
    }

    fn remove_sequence_range(&mut self, slot: SlotId, from: usize, to: Option<usize>) {
        self.inner.remove_sequence_range(slot, from, to)
    }
}

/// Lowercase letters in order, a space after `z`, occasionally end-of-turn.
fn letters_model(seed: u64, eot_prob: f64) -> impl FnMut(&[Token], &mut [f32]) + Send {
    let mut rng = StdRng::seed_from_u64(seed);
    let eot_prob = eot_prob.clamp(0.0, 1.0);
    move |tokens: &[Token], row: &mut [f32]| {
        row.fill(0.0);
        let next = match tokens.last() {
            Some(&t) if (b'a' as Token..b'z' as Token).contains(&t) => t + 1,
            Some(&t) if t == b'z' as Token => b' ' as Token,
            _ => b'a' as Token,
        };
        row[next as usize] = 10.0;
        for c in b'a'..=b'z' {
            row[c as usize] += rng.gen::<f32>();
        }
        if eot_prob > 0.0 && rng.gen_bool(eot_prob) {
            row[EOT_TOKEN as usize] = 20.0;
        }
    }
}

fn load_requests(args: &SimArgs) -> Result<Vec<(String, SamplingParams)>> {
    let mut defaults = SamplingParams::with_max_tokens(args.max_tokens);
    defaults.temperature = args.temperature;
    defaults.repetition_penalty = args.repetition_penalty;
    defaults.seed = args.seed;

    if let Some(path) = &args.jsonl {
        let text = std::fs::read_to_string(path)?;
        let mut res = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()).take(args.requests) {
            let req: JsonlRequest = serde_json::from_str(line)?;
            res.push((req.prompt, req.params));
        }
        log::info!("loaded {} requests from {}", res.len(), path);
        return Ok(res);
    }

    let shared = "You are Jonas, knower of everything and master of nothing. You will take a role \
                  in this adventure and guide the player towards a creative and motivating journey!";
    let variants = ["Super short response.", "Short response.", "Long response."];
    Ok((0..args.requests)
        .map(|idx| {
            let prompt = format!("{} {}", shared, variants[idx % variants.len()]);
            (prompt, defaults.clone())
        })
        .collect())
}

struct Response {
    idx: usize,
    text: String,
    tokens: usize,
    stop_reason: StopReason,
}

fn poll_all(mut handles: Vec<(usize, RequestHandle)>) -> Vec<Response> {
    let mut done = Vec::with_capacity(handles.len());
    let mut partial: Vec<(String, usize)> = vec![(String::new(), 0); handles.len()];
    let mut live: Vec<bool> = vec![true; handles.len()];
    let mut remaining = handles.len();

    while remaining > 0 {
        let mut progress = false;
        for (i, (idx, handle)) in handles.iter_mut().enumerate() {
            if !live[i] {
                continue;
            }
            // the closing chunk is queued before the flag drops
            let gone = !handle.is_generating();
            let mut stop_reason = None;
            for chunk in handle.drain() {
                progress = true;
                partial[i].0.push_str(&chunk.text);
                partial[i].1 += chunk.token_count;
                if chunk.stop_reason.is_final() {
                    stop_reason = Some(chunk.stop_reason);
                    break;
                }
            }
            if stop_reason.is_none() && gone {
                stop_reason = Some(StopReason::Error);
            }
            if let Some(stop_reason) = stop_reason {
                live[i] = false;
                remaining -= 1;
                done.push(Response {
                    idx: *idx,
                    text: std::mem::take(&mut partial[i].0),
                    tokens: partial[i].1,
                    stop_reason,
                });
            }
        }
        if !progress {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    done
}

fn main() -> Result<()> {
    let args = SimArgs::parse();
    if let Some(v) = &args.log {
        std::env::set_var("RUST_LOG", v);
    }
    cbatch::init_log(if args.daemon {
        LogMode::Daemon
    } else {
        LogMode::Normal
    })?;

    let seed = args.seed.unwrap_or(42);
    let ctx = ModelContext::new(
        Arc::new(ByteTokenizer::new()),
        EOT_TOKEN,
        ContextOptions {
            seed: args.seed,
            ..ContextOptions::default()
        },
    )?;

    let config = args.scheduler.to_config();
    let engine = TimedEngine {
        inner: SimEngine::with_logits(
            BYTE_VOCAB_SIZE,
            config.max_batch_size,
            config.max_batch_size,
            Box::new(letters_model(seed, args.eot_prob)),
        ),
        call_cost: Duration::from_micros(args.call_us),
        token_cost: Duration::from_micros(args.token_us),
    };
    let (processor, submitter) =
        BatchProcessor::new(engine, ctx, config, SamplerFactory::new(args.sampler))?;
    let scheduler = processor.spawn()?;

    let requests = load_requests(&args)?;
    let total = requests.len();
    let num_clients = std::cmp::max(1, args.clients);
    let begin = Instant::now();

    let mut shares: Vec<Vec<(usize, String, SamplingParams)>> = vec![Vec::new(); num_clients];
    for (idx, (prompt, params)) in requests.into_iter().enumerate() {
        shares[idx % num_clients].push((idx, prompt, params));
    }

    let clients: Vec<_> = shares
        .into_iter()
        .map(|share| {
            let submitter = submitter.clone();
            std::thread::spawn(move || {
                let mut handles = Vec::new();
                let mut rejected = 0;
                for (idx, prompt, params) in share {
                    match submitter.submit_text(&prompt, params) {
                        Ok(h) => handles.push((idx, h)),
                        Err(e) if UserError::is_self(&e) => {
                            log::warn!("request {} rejected: {}", idx, e);
                            rejected += 1;
                        }
                        Err(e) => {
                            log::error!("request {} failed: {:?}", idx, e);
                            rejected += 1;
                        }
                    }
                }
                (poll_all(handles), rejected)
            })
        })
        .collect();
    drop(submitter);

    let mut responses = Vec::with_capacity(total);
    let mut rejected = 0;
    for client in clients {
        match client.join() {
            Ok((mut r, n)) => {
                responses.append(&mut r);
                rejected += n;
            }
            Err(_) => anyhow::bail!("client thread panicked"),
        }
    }

    let elapsed = begin.elapsed().as_secs_f64();
    let tokens: usize = responses.iter().map(|r| r.tokens).sum();
    let errors = responses
        .iter()
        .filter(|r| r.stop_reason == StopReason::Error)
        .count();
    println!(
        "Completed {} requests in {:.2}s, for a total of {} tokens. ({:.2} T/s)",
        responses.len(),
        elapsed,
        tokens,
        tokens as f64 / elapsed.max(1e-9)
    );
    if rejected > 0 || errors > 0 {
        println!("{} rejected, {} failed", rejected, errors);
    }

    if args.print {
        responses.sort_by_key(|r| r.idx);
        let dashes = "-".repeat(56);
        for r in responses.iter() {
            println!("{}\n{} ({}, {} tokens):\n{}", dashes, r.idx + 1, r.stop_reason, r.tokens, r.text);
        }
    }

    let processor = match scheduler.join() {
        Ok(res) => res?,
        Err(_) => anyhow::bail!("scheduler thread panicked"),
    };
    log::info!("scheduler timers:\n{}", processor.timers().pp());
    Ok(())
}
