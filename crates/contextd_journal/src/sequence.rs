//! Sequence store contract and in-memory implementation.

use crate::error::JournalResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// A durable, never-decreasing counter that hands out csns.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Returns the latest assigned csn, 0 if none.
    async fn get_current_csn(&self) -> JournalResult<u64>;

    /// Persists and returns the next csn.
    async fn increment(&self) -> JournalResult<u64>;

    /// Raises the counter to `seq` if it is behind. Never lowers it.
    async fn update(&self, seq: u64) -> JournalResult<()>;
}

/// In-memory sequence counter.
#[derive(Debug, Default)]
pub struct MemorySequence {
    current: AtomicU64,
}

impl MemorySequence {
    /// Creates a counter starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a counter starting at `current`.
    pub fn starting_at(current: u64) -> Self {
        Self {
            current: AtomicU64::new(current),
        }
    }
}

#[async_trait]
impl SequenceStore for MemorySequence {
    async fn get_current_csn(&self) -> JournalResult<u64> {
        Ok(self.current.load(Ordering::Acquire))
    }

    async fn increment(&self) -> JournalResult<u64> {
        Ok(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }

    async fn update(&self, seq: u64) -> JournalResult<()> {
        self.current.fetch_max(seq, Ordering::AcqRel);
        Ok(())
    }
}
