//! Owner tokens for reference counting across cache consumers.
//!
//! A consumer binds an [`Owner`] to every entry it holds interest in. Entries
//! keep weak back-references only, so a consumer that drops its token without
//! releasing never pins an entry: the dead reference is pruned lazily on the
//! next owners-set traversal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct OwnerCell {
    id: u64,
}

/// Opaque consumer identity. Cheap to clone; clones share the same identity.
#[derive(Debug, Clone)]
pub struct Owner {
    cell: Arc<OwnerCell>,
}

impl Owner {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(OwnerCell {
                id: NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.cell.id
    }

    pub(crate) fn downgrade(&self) -> OwnerRef {
        OwnerRef {
            id: self.cell.id,
            cell: Arc::downgrade(&self.cell),
        }
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self::new()
    }
}

/// Weak back-reference held by an entry. Never dereferenced, only checked
/// for liveness.
#[derive(Debug, Clone)]
pub(crate) struct OwnerRef {
    id: u64,
    cell: Weak<OwnerCell>,
}

impl OwnerRef {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_live(&self) -> bool {
        self.cell.strong_count() > 0
    }
}
