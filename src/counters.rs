//! Performance counters: Count how many times we do various important operations.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use enum_map::{Enum, EnumMap};
use tracing::*;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    MetaCacheHit,
    MetaCacheMiss,
    MetaCacheEviction,
    PrefetchHit,
    PrefetchMiss,
    PrefetchDrop,
    PrefetchEviction,
    BlobLifted,
    BlobDuplicate,
    FileToBuffer,
    FileToMmap,
    RenameRetry,
    RenameHop,
    SymlinkRetry,
}

static COUNTER_MAP: LazyLock<EnumMap<Op, AtomicUsize>> = LazyLock::new(EnumMap::default);

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

#[cfg(test)]
pub fn count(which: Op) -> usize {
    COUNTER_MAP[which].load(Ordering::Relaxed)
}

pub fn log_counts() {
    // Probably not needed; but we're probably calling this once at program exit.
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0) // Ignore things we didn't do
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::MetaCacheHit => "catalog cache hits",
        Op::MetaCacheMiss => "catalog cache misses",
        Op::MetaCacheEviction => "catalog cache evictions",
        Op::PrefetchHit => "prefetch hits",
        Op::PrefetchMiss => "prefetch misses",
        Op::PrefetchDrop => "prefetch requests dropped",
        Op::PrefetchEviction => "prefetch evictions",
        Op::BlobLifted => "blobs lifted",
        Op::BlobDuplicate => "duplicate blobs skipped",
        Op::FileToBuffer => "input files buffered",
        Op::FileToMmap => "input files memory mapped",
        Op::RenameRetry => "rename retries",
        Op::RenameHop => "renames via intermediate hop",
        Op::SymlinkRetry => "symlink retries",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}
