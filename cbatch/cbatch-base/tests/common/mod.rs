#![allow(dead_code)]

use cbatch::{
    sim::{ByteTokenizer, SimEngine, BYTE_VOCAB_SIZE, EOT_TOKEN},
    BatchProcessor, ContextOptions, InferenceRequest, ModelContext, OutputChunk, RefreshPolicy,
    RequestHandle, SamplerFactory, SamplingParams, SchedulerConfig, StepOutcome, StopReason,
    Submitter, Token,
};
use std::sync::{atomic::AtomicBool, Arc};
use tokio::sync::mpsc;

pub fn ctx() -> Arc<ModelContext> {
    ModelContext::new(
        Arc::new(ByteTokenizer::new()),
        EOT_TOKEN,
        ContextOptions {
            noise_depth: 1,
            seed: Some(1),
            ..ContextOptions::default()
        },
    )
    .unwrap()
}

/// Arg-max sampling with no refusal bias, so the output follows the logits.
pub fn greedy(max_tokens: usize) -> SamplingParams {
    SamplingParams {
        temperature: Some(0.0),
        prevent_refusals: Some(false),
        ..SamplingParams::with_max_tokens(max_tokens)
    }
}

/// `len` lowercase letters starting at `first`, wrapping after `z`.
pub fn prompt(first: u8, len: usize) -> Vec<Token> {
    (0..len)
        .map(|i| b'a' as Token + (((first - b'a') as usize + i) % 26) as Token)
        .collect()
}

pub fn request(
    ctx: &Arc<ModelContext>,
    id: usize,
    prompt: &[Token],
    params: &SamplingParams,
) -> (InferenceRequest, RequestHandle) {
    let sampler = SamplerFactory::default()
        .create(ctx, params, prompt)
        .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let live = Arc::new(AtomicBool::new(true));
    let req = InferenceRequest::new(id, ctx.clone(), sampler, params, tx, live.clone());
    (req, RequestHandle::new(id, rx, live))
}

/// A row that makes `token` the clear winner.
pub fn peak(token: Token) -> Vec<f32> {
    let mut row = vec![0.0f32; BYTE_VOCAB_SIZE];
    row[token as usize] = 10.0;
    row
}

pub fn config(max_context_size: usize, max_batch_size: usize, policy: RefreshPolicy) -> SchedulerConfig {
    SchedulerConfig {
        max_context_size,
        max_batch_size,
        refresh_policy: policy,
        stats_interval: 0,
        ..SchedulerConfig::default()
    }
}

pub fn processor(config: SchedulerConfig) -> (BatchProcessor<SimEngine>, Submitter) {
    let engine = SimEngine::new(
        BYTE_VOCAB_SIZE,
        config.max_batch_size,
        config.max_batch_size,
    );
    BatchProcessor::new(engine, ctx(), config, SamplerFactory::default()).unwrap()
}

/// Step until nothing is active or queued; panics if that takes too long.
pub fn run_to_idle(processor: &mut BatchProcessor<SimEngine>) -> usize {
    for steps in 0..10_000 {
        if processor.step().unwrap() == StepOutcome::Idle {
            return steps;
        }
    }
    panic!("processor did not go idle");
}

/// Text of all chunks and the final stop reason.
pub fn collect(handle: &mut RequestHandle) -> (String, usize, StopReason) {
    let mut text = String::new();
    let mut tokens = 0;
    let mut reason = StopReason::None;
    for OutputChunk {
        text: t,
        stop_reason,
        token_count,
    } in handle.drain()
    {
        text.push_str(&t);
        tokens += token_count;
        if stop_reason.is_final() {
            reason = stop_reason;
        }
    }
    (text, tokens, reason)
}
