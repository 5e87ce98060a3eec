//! Free-lists of per-request scratch state.
//!
//! Every rented item comes back as a [`Lease`]; dropping the lease recycles
//! the item (zero-fill, clear, reset) and puts it back on its free-list, so
//! an item is owned by at most one request at a time and returning it does
//! not depend on anyone remembering to call a dispose method.
//! Pools grow on demand and never shrink.

use crate::{HashSet, Token};
use std::{
    fmt::Display,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

pub trait Recycle {
    /// Bring the item back to its freshly-allocated state.
    fn recycle(&mut self);
}

impl Recycle for Vec<f32> {
    fn recycle(&mut self) {
        self.fill(0.0);
    }
}

pub type TokenSet = HashSet<Token>;

impl Recycle for TokenSet {
    fn recycle(&mut self) {
        self.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub allocated: usize,
    pub free: usize,
    pub hits: usize,
    pub misses: usize,
}

impl Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "allocated: {}; free: {}; hits: {}; misses: {}",
            self.allocated, self.free, self.hits, self.misses
        )
    }
}

struct FreeList<T> {
    free: Mutex<Vec<T>>,
    allocated: AtomicUsize,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

pub struct Recycler<T> {
    list: Arc<FreeList<T>>,
    make: Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T> Clone for Recycler<T> {
    fn clone(&self) -> Self {
        Self {
            list: self.list.clone(),
            make: self.make.clone(),
        }
    }
}

impl<T: Recycle> Recycler<T> {
    pub fn new(make: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            list: Arc::new(FreeList {
                free: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
                hits: AtomicUsize::new(0),
                misses: AtomicUsize::new(0),
            }),
            make: Arc::new(make),
        }
    }

    pub fn rent(&self) -> Lease<T> {
        let reused = self.list.free.lock().unwrap().pop();
        let item = match reused {
            Some(item) => {
                self.list.hits.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                self.list.misses.fetch_add(1, Ordering::Relaxed);
                self.list.allocated.fetch_add(1, Ordering::Relaxed);
                (self.make)()
            }
        };
        Lease {
            item: Some(item),
            home: self.list.clone(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.list.allocated.load(Ordering::Relaxed),
            free: self.list.free.lock().unwrap().len(),
            hits: self.list.hits.load(Ordering::Relaxed),
            misses: self.list.misses.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive handle to a pooled item; returns it on drop.
pub struct Lease<T: Recycle> {
    item: Option<T>,
    home: Arc<FreeList<T>>,
}

impl<T: Recycle> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("lease already returned")
    }
}

impl<T: Recycle> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("lease already returned")
    }
}

impl<T: Recycle> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(mut item) = self.item.take() {
            item.recycle();
            if let Ok(mut free) = self.home.free.lock() {
                free.push(item);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    LogitBias,
    Frequency,
    Presence,
    Scratch,
}

impl BufferKind {
    pub const ALL: [BufferKind; 4] = [
        BufferKind::LogitBias,
        BufferKind::Frequency,
        BufferKind::Presence,
        BufferKind::Scratch,
    ];
}

pub type Buffer = Lease<Vec<f32>>;

/// Vocabulary-sized `f32` vectors, one free-list per [`BufferKind`], plus
/// the pooled distinct-token sets used by repetition penalties.
#[derive(Clone)]
pub struct BufferPool {
    vocab_size: usize,
    lists: Vec<Recycler<Vec<f32>>>,
    sets: Recycler<TokenSet>,
}

impl BufferPool {
    pub fn new(vocab_size: usize) -> Self {
        let lists = BufferKind::ALL
            .iter()
            .map(|_| Recycler::new(move || vec![0.0f32; vocab_size]))
            .collect();
        Self {
            vocab_size,
            lists,
            sets: Recycler::new(|| {
                TokenSet::with_capacity_and_hasher(1024, Default::default())
            }),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// A zeroed vector of `vocab_size` entries.
    pub fn rent(&self, kind: BufferKind) -> Buffer {
        self.lists[kind as usize].rent()
    }

    /// An empty token set.
    pub fn rent_set(&self) -> Lease<TokenSet> {
        self.sets.rent()
    }

    pub fn stats(&self, kind: BufferKind) -> PoolStats {
        self.lists[kind as usize].stats()
    }

    pub fn set_stats(&self) -> PoolStats {
        self.sets.stats()
    }
}
