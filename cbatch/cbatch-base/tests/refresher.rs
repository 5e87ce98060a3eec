mod common;

use cbatch::{
    refresher::ContextRefresher,
    sim::{CacheOp, SimEngine, BYTE_VOCAB_SIZE},
    Batch, DecodeEngine, InferenceRequest, RefreshPolicy, RequestHandle, SchedulerConfig,
};
use common::{config, ctx, greedy, prompt, request};
use std::collections::VecDeque;

fn engine(n_slots: usize) -> SimEngine {
    SimEngine::new(BYTE_VOCAB_SIZE, n_slots, 64)
}

struct Queue {
    pending: VecDeque<InferenceRequest>,
    handles: Vec<RequestHandle>,
}

/// Requests with the given prompt lengths and `max_tokens`, ids from 1.
fn queue(specs: &[(usize, usize)]) -> Queue {
    let ctx = ctx();
    let mut pending = VecDeque::new();
    let mut handles = Vec::new();
    for (idx, &(len, max_tokens)) in specs.iter().enumerate() {
        let p = prompt(b'a' + idx as u8, len);
        let (req, h) = request(&ctx, idx + 1, &p, &greedy(max_tokens));
        pending.push_back(req);
        handles.push(h);
    }
    Queue { pending, handles }
}

fn sweet(max_context_size: usize, sweet_spot: f32, policy: RefreshPolicy) -> SchedulerConfig {
    SchedulerConfig {
        sweet_spot,
        ..config(max_context_size, 8, policy)
    }
}

#[test]
fn test_refresh_below_sweet_spot() {
    let refresher = ContextRefresher::new(&sweet(100, 0.5, RefreshPolicy::Full));
    let mut e = engine(8);
    let mut q = queue(&[(20, 5), (10, 5)]);
    let mut active = vec![q.pending.pop_front().unwrap()];

    let (refresh, occupancy, pruned) = refresher.should_refresh(&mut e, &mut active, &mut q.pending);
    assert!(refresh);
    assert_eq!(occupancy, 20);
    assert_eq!(pruned, 0);
    assert!(e.ops().is_empty());
}

#[test]
fn test_no_refresh_past_sweet_spot() {
    let refresher = ContextRefresher::new(&sweet(100, 0.5, RefreshPolicy::Full));
    let mut e = engine(8);
    let mut q = queue(&[(60, 5), (10, 5)]);
    let mut active = vec![q.pending.pop_front().unwrap()];

    let (refresh, occupancy, _) = refresher.should_refresh(&mut e, &mut active, &mut q.pending);
    assert!(!refresh);
    assert_eq!(occupancy, 60);
}

#[test]
fn test_no_refresh_with_empty_queue() {
    let refresher = ContextRefresher::new(&config(1000, 8, RefreshPolicy::Full));
    let mut e = engine(8);
    let mut batch = Batch::new(64);
    let mut q = queue(&[(5, 5), (6, 5)]);
    let mut active = Vec::new();
    refresher
        .refresh(&mut e, &mut batch, &mut active, &mut q.pending)
        .unwrap();
    assert_eq!(active.len(), 2);
    e.decode(&batch).unwrap();
    batch.clear();
    e.take_ops();

    let outcome = refresher
        .refresh(&mut e, &mut batch, &mut active, &mut q.pending)
        .unwrap();
    assert!(!outcome.refreshed);
    assert_eq!(outcome.occupancy, 11);
    assert!(e.ops().is_empty());
    assert!(batch.is_empty());
    assert_eq!(active[0].slot(), Some(0));
    assert_eq!(active[1].slot(), Some(1));
}

#[test]
fn test_admits_in_fifo_order() {
    let refresher = ContextRefresher::new(&config(100, 8, RefreshPolicy::Full));
    let mut q = queue(&[(10, 5), (15, 5)]);
    let mut active = Vec::new();

    let (admitted, occupancy) = refresher.admit(&mut active, &mut q.pending, 0);
    assert_eq!(admitted, 2);
    assert_eq!(occupancy, 25);
    assert_eq!(active.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![1, 2]);
    assert!(q.pending.is_empty());
}

#[test]
fn test_admission_reserves_room_to_generate() {
    // each admitted request shrinks the headroom by the smallest remaining budget
    let refresher = ContextRefresher::new(&config(100, 8, RefreshPolicy::Full));
    let mut q = queue(&[(20, 20), (20, 20), (20, 20), (20, 20)]);
    let mut active = Vec::new();

    let (admitted, occupancy) = refresher.admit(&mut active, &mut q.pending, 0);
    // 40 <= 100; 20 + 40 <= 80; 40 + 40 > 60
    assert_eq!(admitted, 2);
    assert_eq!(occupancy, 40);
    assert_eq!(q.pending.len(), 2);
    assert_eq!(q.pending.front().unwrap().id(), 3);
}

#[test]
fn test_oversized_head_blocks_queue() {
    let refresher = ContextRefresher::new(&config(100, 8, RefreshPolicy::Full));
    let mut e = engine(8);
    let mut batch = Batch::new(64);
    let mut q = queue(&[(30, 10), (50, 20), (5, 5)]);
    let mut active = vec![q.pending.pop_front().unwrap()];

    assert!(!refresher.head_fits(&active, &q.pending, 30));
    let (admitted, _) = refresher.admit(&mut active, &mut q.pending, 30);
    assert_eq!(admitted, 0);
    assert_eq!(q.pending.len(), 2);

    let outcome = refresher
        .full_refresh(&mut e, &mut batch, &mut active, &mut q.pending)
        .unwrap();
    assert!(!outcome.refreshed);
    assert!(!e.ops().contains(&CacheOp::ClearCache));
    assert_eq!(q.pending.len(), 2);
}

#[test]
fn test_admission_bounded_by_slots() {
    let refresher = ContextRefresher::new(&config(1000, 2, RefreshPolicy::Full));
    let mut q = queue(&[(3, 3), (3, 3), (3, 3)]);
    let mut active = Vec::new();

    let (admitted, occupancy) = refresher.admit(&mut active, &mut q.pending, 0);
    assert_eq!(admitted, 2);
    assert_eq!(occupancy, 6);
    assert_eq!(q.pending.len(), 1);
}

#[test]
fn test_admitted_occupancy_within_context() {
    let refresher = ContextRefresher::new(&config(128, 16, RefreshPolicy::Full));
    let specs: Vec<(usize, usize)> = (0..20).map(|i| (3 + (i * 7) % 13, 2 + (i * 5) % 9)).collect();
    let mut q = queue(&specs);
    let mut active = Vec::new();

    let (admitted, occupancy) = refresher.admit(&mut active, &mut q.pending, 0);
    assert!(admitted > 0);
    let total: usize = active.iter().map(|r| r.total_tokens()).sum();
    assert_eq!(total, occupancy);
    assert!(occupancy <= 128);
    let min_remaining = active.iter().map(|r| r.remaining_tokens()).min().unwrap();
    assert!(occupancy + active.len() * min_remaining <= 128);
}

#[test]
fn test_prune_finished_and_cancelled() {
    let refresher = ContextRefresher::new(&config(1000, 8, RefreshPolicy::Full));
    let mut e = engine(8);
    let mut batch = Batch::new(64);
    let mut q = queue(&[(4, 5), (4, 5), (4, 5), (4, 5)]);
    let mut active = Vec::new();
    refresher
        .refresh(&mut e, &mut batch, &mut active, &mut q.pending)
        .unwrap();
    e.decode(&batch).unwrap();
    batch.clear();
    e.take_ops();

    q.handles[1].cancel();
    q.handles[3].cancel();
    let (_, occupancy, pruned) = refresher.should_refresh(&mut e, &mut active, &mut q.pending);
    assert_eq!(pruned, 2);
    assert_eq!(occupancy, 8);
    assert_eq!(active.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(
        e.take_ops(),
        vec![
            CacheOp::Remove { slot: 3, from: 0, to: None },
            CacheOp::Remove { slot: 1, from: 0, to: None },
        ]
    );
    assert!(e.kv(1).is_empty());
    assert!(e.kv(3).is_empty());
    assert_eq!(e.kv(0).len(), 3);
}

#[test]
fn test_cancelled_pending_dropped() {
    let refresher = ContextRefresher::new(&config(1000, 8, RefreshPolicy::Full));
    let mut e = engine(8);
    let mut q = queue(&[(4, 5), (4, 5)]);
    let mut active = Vec::new();
    q.handles[0].cancel();

    let (refresh, _, _) = refresher.should_refresh(&mut e, &mut active, &mut q.pending);
    assert!(refresh);
    assert_eq!(q.pending.len(), 1);
    assert_eq!(q.pending[0].id(), 2);
}

#[test]
fn test_full_refresh_reprefills_everything() {
    let refresher = ContextRefresher::new(&config(1000, 8, RefreshPolicy::Full));
    let mut e = engine(8);
    let mut batch = Batch::new(64);
    let mut q = queue(&[(4, 5)]);
    let mut active = Vec::new();
    refresher
        .refresh(&mut e, &mut batch, &mut active, &mut q.pending)
        .unwrap();
    e.decode(&batch).unwrap();
    batch.clear();
    e.take_ops();

    let mut more = queue(&[(6, 5)]);
    let outcome = refresher
        .refresh(&mut e, &mut batch, &mut active, &mut more.pending)
        .unwrap();
    assert!(outcome.refreshed);
    assert_eq!(outcome.admitted, 1);
    assert_eq!(outcome.occupancy, 10);
    assert_eq!(e.take_ops(), vec![CacheOp::ClearCache]);
    assert_eq!(batch.len(), 3 + 5);
    assert!(batch.entries().iter().all(|b| !b.logits));
    assert_eq!(active[0].slot(), Some(0));
    assert_eq!(active[1].slot(), Some(1));
}

#[test]
fn test_additive_refresh_compacts_slots() {
    let refresher = ContextRefresher::new(&config(1000, 8, RefreshPolicy::Additive));
    let mut e = engine(8);
    let mut batch = Batch::new(64);
    let mut q = queue(&[(4, 5), (5, 5), (6, 5), (7, 5)]);
    let mut active = Vec::new();
    refresher
        .refresh(&mut e, &mut batch, &mut active, &mut q.pending)
        .unwrap();
    e.decode(&batch).unwrap();
    batch.clear();
    e.take_ops();
    let moved_tokens = e.kv(3).to_vec();
    assert_eq!(moved_tokens.len(), 6);

    q.handles[1].cancel();
    let mut more = queue(&[(3, 5)]);
    let outcome = refresher
        .refresh(&mut e, &mut batch, &mut active, &mut more.pending)
        .unwrap();

    assert!(outcome.refreshed);
    assert_eq!(outcome.pruned, 1);
    assert_eq!(outcome.moved, 1);
    assert_eq!(outcome.admitted, 1);
    assert_eq!(
        e.take_ops(),
        vec![
            CacheOp::Remove { slot: 1, from: 0, to: None },
            CacheOp::Copy { src: 3, dst: 1 },
            CacheOp::Remove { slot: 3, from: 0, to: None },
        ]
    );
    assert_eq!(e.kv(1), &moved_tokens[..]);
    assert!(e.kv(3).is_empty());

    let mut slots: Vec<usize> = active.iter().map(|r| r.slot().unwrap()).collect();
    assert_eq!(slots[3], 3);
    slots.sort();
    assert_eq!(slots, vec![0, 1, 2, 3]);
    // only the new request is prefilled
    assert_eq!(batch.len(), 2);
    assert!(batch.entries().iter().all(|b| b.slot == 3));
}

#[test]
fn test_defrag_keeps_compact_layout() {
    let refresher = ContextRefresher::new(&config(1000, 8, RefreshPolicy::Additive));
    let mut e = engine(8);
    let mut batch = Batch::new(64);
    let mut q = queue(&[(4, 5), (5, 5)]);
    let mut active = Vec::new();
    refresher
        .refresh(&mut e, &mut batch, &mut active, &mut q.pending)
        .unwrap();
    e.take_ops();

    assert_eq!(refresher.defrag(&mut e, &mut active).unwrap(), 0);
    assert!(e.ops().is_empty());
}

#[test]
fn test_prefill_decodes_full_batches() {
    let refresher = ContextRefresher::new(&config(1000, 4, RefreshPolicy::Full));
    let mut e = engine(4);
    let mut batch = Batch::new(4);
    let mut q = queue(&[(10, 5)]);
    let mut active = Vec::new();
    refresher
        .refresh(&mut e, &mut batch, &mut active, &mut q.pending)
        .unwrap();

    // 9 prompt tokens: two full batches decoded, one token left over
    assert_eq!(e.num_decodes(), 2);
    assert_eq!(e.kv(0).len(), 8);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.entries()[0].pos, 8);
    assert_eq!(active[0].position(), 9);
}

#[test]
fn test_prefill_failure_propagates() {
    let refresher = ContextRefresher::new(&config(1000, 4, RefreshPolicy::Full));
    let mut e = engine(4);
    e.fail_next_decodes(1);
    let mut batch = Batch::new(4);
    let mut q = queue(&[(10, 5)]);
    let mut active = Vec::new();
    assert!(refresher
        .refresh(&mut e, &mut batch, &mut active, &mut q.pending)
        .is_err());
    // the admitted request is failed and dropped with nothing left behind
    assert!(active.is_empty());
    assert!(batch.is_empty());
    assert!(e.kv(0).is_empty());
}
