//! Byte-budget eviction over the registry.
//!
//! Candidates are loaded entries with zero live owners. Iteration follows
//! registry enumeration order, which is arbitrary among unowned entries, not
//! LRU. Reclaim is not reentrant: a call that overlaps a running pass is a
//! no-op.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::debug;

use crate::entry::{CacheEntry, EntryState, SizePressure};
use crate::registry::Shared;

/// How far a reclaim pass should shrink the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Dispose every unowned entry regardless of size.
    Unconditional,
    /// Shrink until the total is at or below the full byte budget.
    TargetFull,
    /// Shrink until the total is at or below half the byte budget.
    TargetHalf,
}

impl EvictionPolicy {
    fn target_bytes(self, shared: &Shared) -> u64 {
        match self {
            Self::Unconditional => 0,
            Self::TargetFull => shared.max_budget_bytes(),
            Self::TargetHalf => shared.max_budget_bytes() / 2,
        }
    }
}

impl From<SizePressure> for EvictionPolicy {
    fn from(pressure: SizePressure) -> Self {
        match pressure {
            SizePressure::MatchHalfBudget => Self::TargetHalf,
            _ => Self::TargetFull,
        }
    }
}

/// Dispose unowned loaded entries until the policy's target is met.
/// Returns the number of bytes released.
///
/// Two passes: mark candidates against a projected total without touching
/// the maps, then dispose the marked set. Disposal removes entries from the
/// registry, so it must not run while map shards are being iterated.
pub(crate) fn reclaim(shared: &Shared, policy: EvictionPolicy) -> u64 {
    if shared.reclaim_in_progress.swap(true, Ordering::AcqRel) {
        debug!("Reclaim pass already running; skipping");
        return 0;
    }

    let initial = shared.total_bytes();
    let target = policy.target_bytes(shared);
    let mut projected = initial;
    let mut marked: Vec<Arc<CacheEntry>> = Vec::new();

    'providers: for inner in shared.entries.iter() {
        for item in inner.iter() {
            if policy != EvictionPolicy::Unconditional && projected <= target {
                break 'providers;
            }
            let entry = item.value();
            if entry.state() == EntryState::Loaded && entry.use_count() == 0 {
                entry.mark_for_disposal();
                projected = projected.saturating_sub(entry.weight_bytes());
                marked.push(Arc::clone(entry));
            }
        }
    }

    for entry in &marked {
        entry.dispose();
    }

    shared.reclaim_in_progress.store(false, Ordering::Release);
    // A load finishing mid-pass can leave the final total above `initial`.
    let released = initial.saturating_sub(shared.total_bytes());
    debug!(
        policy = ?policy,
        released,
        remaining = shared.total_bytes(),
        disposed = marked.len(),
        "Reclaim pass finished"
    );
    released
}
