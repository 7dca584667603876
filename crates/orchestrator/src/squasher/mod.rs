//! Squashers fold partial snapshots into the complete state of each store, in block order.

use backfill_primitives::{BlockNumber, BlockRange};
use backfill_storage::KvStore;
use std::collections::{btree_map, BTreeMap};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

mod multi;
mod single;

pub use multi::MultiSquasher;
pub use single::{Squasher, SquasherError, SquasherOutput, SquasherState};

/// Alias type for squasher event producers.
pub type SquasherEventsSender = UnboundedSender<SquasherEvent>;

/// Alias type for squasher event consumers.
pub type SquasherEventsReceiver = UnboundedReceiver<SquasherEvent>;

/// Progress reported by squashers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SquasherEvent {
    /// A partial was merged: the store is complete up to `range.end()`.
    Merged {
        /// Store module.
        module: String,
        /// Merged partial.
        range: BlockRange,
    },
    /// The store reached its target block.
    Completed {
        /// Store module.
        module: String,
        /// Target block.
        end: BlockNumber,
    },
}

/// Final state of every store of a request, valid at the linear handoff block.
#[derive(Debug, Default)]
pub struct StoreMap(BTreeMap<String, KvStore>);

impl StoreMap {
    /// Store of `module`.
    pub fn get(&self, module: &str) -> Option<&KvStore> {
        self.0.get(module)
    }

    /// Number of stores.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the request required no store.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the stores, by module name.
    pub fn iter(&self) -> btree_map::Iter<'_, String, KvStore> {
        self.0.iter()
    }

    /// Returns the stores by module name.
    pub fn into_inner(self) -> BTreeMap<String, KvStore> {
        self.0
    }
}

impl FromIterator<(String, KvStore)> for StoreMap {
    fn from_iter<T: IntoIterator<Item = (String, KvStore)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
