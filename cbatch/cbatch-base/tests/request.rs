mod common;

use cbatch::{
    decoder::REPLACEMENT_CHAR,
    pool::BufferKind,
    sim::EOT_TOKEN,
    OutputChunk, SamplingParams, StopReason, Token,
};
use common::{collect, ctx, greedy, peak, request};

fn tok(c: u8) -> Token {
    c as Token
}

#[test]
fn test_end_of_turn_stops() {
    let ctx = ctx();
    let (mut req, mut h) = request(&ctx, 1, &[tok(b'h'), tok(b'i')], &greedy(10));

    assert_eq!(req.handle_logits(&mut peak(tok(b'!'))), Some(tok(b'!')));
    assert_eq!(req.handle_logits(&mut peak(EOT_TOKEN)), Some(EOT_TOKEN));

    assert_eq!(
        h.drain(),
        vec![
            OutputChunk {
                text: "!".to_string(),
                stop_reason: StopReason::None,
                token_count: 1,
            },
            OutputChunk::closing(StopReason::Stop),
        ]
    );
    assert_eq!(req.stop_reason(), StopReason::Stop);
    assert!(!req.needs_gen());
    assert!(!h.is_generating());
    // the end-of-turn token is not part of the sequence
    assert_eq!(req.total_tokens(), 3);
    assert_eq!(req.received_tokens(), 1);

    assert_eq!(req.handle_logits(&mut peak(tok(b'x'))), None);
    assert!(h.drain().is_empty());
    assert_eq!(req.received_tokens(), 1);
}

#[test]
fn test_stop_token() {
    let ctx = ctx();
    let params = SamplingParams {
        stop_tokens: vec![tok(b'.')],
        ..greedy(10)
    };
    let (mut req, mut h) = request(&ctx, 1, &[tok(b'a')], &params);

    req.handle_logits(&mut peak(tok(b'o')));
    req.handle_logits(&mut peak(tok(b'k')));
    req.handle_logits(&mut peak(tok(b'.')));

    let (text, tokens, reason) = collect(&mut h);
    assert_eq!(text, "ok");
    assert_eq!(tokens, 2);
    assert_eq!(reason, StopReason::Stop);
}

#[test]
fn test_max_tokens_limit() {
    let ctx = ctx();
    let (mut req, mut h) = request(&ctx, 1, &[tok(b'a')], &greedy(5));
    assert_eq!(req.remaining_tokens(), 5);

    for i in 0..5 {
        assert!(req.needs_gen(), "stopped early at {}", i);
        req.handle_logits(&mut peak(tok(b'x')));
    }
    assert!(!req.needs_gen());
    assert_eq!(req.stop_reason(), StopReason::Limit);
    assert_eq!(req.received_tokens(), 5);
    assert_eq!(req.remaining_tokens(), 0);

    let chunks = h.drain();
    assert_eq!(chunks.len(), 6);
    for c in chunks[..5].iter() {
        assert_eq!(c.text, "x");
        assert_eq!(c.stop_reason, StopReason::None);
        assert_eq!(c.token_count, 1);
    }
    assert_eq!(chunks[5], OutputChunk::closing(StopReason::Limit));
}

#[test]
fn test_sequence_and_position_grow() {
    let ctx = ctx();
    let (mut req, _h) = request(&ctx, 7, &[tok(b'a'), tok(b'b'), tok(b'c')], &greedy(5));
    assert_eq!(req.id(), 7);
    assert_eq!(req.prompt_len(), 3);
    assert_eq!(req.last_token(), tok(b'c'));
    assert_eq!(req.position(), 2);
    assert_eq!(req.slot(), None);

    req.handle_logits(&mut peak(tok(b'd')));
    assert_eq!(req.tokens(), &[tok(b'a'), tok(b'b'), tok(b'c'), tok(b'd')]);
    assert_eq!(req.last_token(), tok(b'd'));
    assert_eq!(req.position(), 3);
    assert_eq!(req.prompt_len(), 3);
}

#[test]
fn test_split_character() {
    let ctx = ctx();
    let (mut req, mut h) = request(&ctx, 1, &[tok(b'a')], &greedy(10));
    let bytes = "é".as_bytes();

    req.handle_logits(&mut peak(bytes[0] as Token));
    assert!(h.drain().is_empty());
    assert_eq!(req.held_tokens(), 1);

    req.handle_logits(&mut peak(bytes[1] as Token));
    assert_eq!(req.held_tokens(), 0);
    assert_eq!(
        h.drain(),
        vec![OutputChunk {
            text: "é".to_string(),
            stop_reason: StopReason::None,
            token_count: 2,
        }]
    );
}

#[test]
fn test_partial_character_flushed_on_stop() {
    let ctx = ctx();
    let (mut req, mut h) = request(&ctx, 1, &[tok(b'a')], &greedy(10));
    req.handle_logits(&mut peak("€".as_bytes()[0] as Token));
    req.handle_logits(&mut peak(EOT_TOKEN));

    assert_eq!(
        h.drain(),
        vec![
            OutputChunk {
                text: REPLACEMENT_CHAR.to_string(),
                stop_reason: StopReason::None,
                token_count: 1,
            },
            OutputChunk::closing(StopReason::Stop),
        ]
    );
}

#[test]
fn test_dispose_returns_buffers() {
    let ctx = ctx();
    let params = SamplingParams {
        presence_penalty: Some(0.5),
        frequency_penalty: Some(0.1),
        ..greedy(10)
    };
    let (mut req, h) = request(&ctx, 1, &[tok(b'a'), tok(b'b')], &params);
    let pool = ctx.buffers();
    assert_eq!(pool.stats(BufferKind::Presence).free, 0);
    assert_eq!(pool.stats(BufferKind::Frequency).free, 0);

    req.dispose();
    assert!(req.is_disposed());
    assert!(!h.is_generating());
    assert_eq!(pool.stats(BufferKind::Presence).free, 1);
    assert_eq!(pool.stats(BufferKind::Frequency).free, 1);

    req.dispose();
    drop(req);
    assert_eq!(pool.stats(BufferKind::Presence).allocated, 1);
    assert_eq!(pool.stats(BufferKind::Presence).free, 1);
}

#[test]
fn test_drop_returns_decoder() {
    let ctx = ctx();
    let (mut req, mut h) = request(&ctx, 1, &[tok(b'a')], &greedy(10));
    req.handle_logits(&mut peak("€".as_bytes()[0] as Token));
    assert_eq!(ctx.decoders().stats().allocated, 1);
    assert_eq!(ctx.decoders().stats().free, 0);

    drop(req);
    assert_eq!(ctx.decoders().stats().free, 1);
    // held bytes are flushed, but no stop reason is reported
    let chunks = h.drain();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text, REPLACEMENT_CHAR.to_string());
    assert_eq!(chunks[0].stop_reason, StopReason::None);
}

#[test]
fn test_cancel_stops_generation() {
    let ctx = ctx();
    let (mut req, h) = request(&ctx, 1, &[tok(b'a')], &greedy(10));
    assert!(req.needs_gen());
    h.cancel();
    assert!(!req.needs_gen());
    assert_eq!(req.handle_logits(&mut peak(tok(b'x'))), None);
    assert_eq!(req.received_tokens(), 0);
}

#[test]
fn test_dropped_handle_cancels() {
    let ctx = ctx();
    let (mut req, h) = request(&ctx, 1, &[tok(b'a')], &greedy(10));
    drop(h);
    assert!(!req.needs_gen());
    assert_eq!(req.handle_logits(&mut peak(tok(b'x'))), None);
}

#[test]
fn test_chunk_json() {
    let chunk = OutputChunk {
        text: "hi".to_string(),
        stop_reason: StopReason::None,
        token_count: 2,
    };
    assert_eq!(
        serde_json::to_value(&chunk).unwrap(),
        serde_json::json!({"text": "hi", "stop_reason": "none", "token_count": 2})
    );
    let closing: OutputChunk =
        serde_json::from_str(r#"{"text": "", "stop_reason": "limit", "token_count": 0}"#).unwrap();
    assert_eq!(closing, OutputChunk::closing(StopReason::Limit));
    assert_eq!(StopReason::Error.to_string(), "error");
}
