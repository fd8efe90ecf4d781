//! Sealed, sorted view of `(timestamp, id)` pairs that the reconciler runs
//! range queries against. Sealing is a one-way transition: once sorted and
//! frozen, concurrent readers can binary-search it without synchronization.

use super::bound::{Bound, Item, Timestamp};
use super::error::NegentropyError;
use super::fingerprint::Accumulator;

#[derive(Debug, Default)]
pub struct Storage {
    items: Vec<Item>,
    sealed: bool,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an item. Valid before sealing only.
    pub fn add(&mut self, item: Item) -> Result<(), NegentropyError> {
        if self.sealed {
            return Err(NegentropyError::StorageSealed);
        }
        self.items.push(item);
        Ok(())
    }

    /// Sorts by `(timestamp, id)` and freezes the storage against further
    /// mutation.
    pub fn seal(&mut self) {
        self.items.sort_unstable();
        self.items.dedup();
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn require_sealed(&self) -> Result<(), NegentropyError> {
        if self.sealed {
            Ok(())
        } else {
            Err(NegentropyError::StorageNotSealed)
        }
    }

    fn bound_cmp_item(bound: &Bound, item: &Item) -> std::cmp::Ordering {
        Bound::at_item(item).cmp(bound)
    }

    /// Index of the first item `>= bound`.
    fn lower_index(&self, bound: &Bound) -> usize {
        self.items
            .partition_point(|item| Self::bound_cmp_item(bound, item) == std::cmp::Ordering::Less)
    }

    /// Items in `[lower, upper)`.
    pub fn range(&self, lower: &Bound, upper: &Bound) -> Result<&[Item], NegentropyError> {
        self.require_sealed()?;
        let start = self.lower_index(lower);
        let end = self.lower_index(upper);
        Ok(&self.items[start..end.max(start)])
    }

    pub fn count_in_range(&self, lower: &Bound, upper: &Bound) -> Result<usize, NegentropyError> {
        Ok(self.range(lower, upper)?.len())
    }

    /// A bound at the median index of `[lower, upper)`, suitable for
    /// splitting a mismatched range into two.
    pub fn midpoint(&self, lower: &Bound, upper: &Bound) -> Result<Bound, NegentropyError> {
        let items = self.range(lower, upper)?;
        if items.is_empty() {
            return Ok(upper.clone());
        }
        let mid = items.len() / 2;
        let neighbor = items.get(mid + 1);
        Ok(Bound::at_item_minimal(&items[mid], neighbor))
    }

    /// Fingerprint over `[lower, upper)`.
    pub fn fingerprint(
        &self,
        lower: &Bound,
        upper: &Bound,
    ) -> Result<[u8; 16], NegentropyError> {
        let items = self.range(lower, upper)?;
        let mut acc = Accumulator::new();
        for item in items {
            acc.add(&item.id);
        }
        Ok(acc.fingerprint(items.len() as u64))
    }

    /// Builds a sealed storage from a pre-fetched set of `(timestamp, id)`
    /// pairs, e.g. streamed from a `scan(filter)` over the event store.
    pub fn from_items(items: impl IntoIterator<Item = Item>) -> Self {
        let mut storage = Storage {
            items: items.into_iter().collect(),
            sealed: false,
        };
        storage.seal();
        storage
    }
}

/// `lower` for `Bound::min()`, useful so call sites don't re-spell it.
pub fn full_range() -> (Bound, Bound) {
    (Bound::min(), Bound::max())
}

pub fn is_infinite(bound: &Bound) -> bool {
    matches!(bound.timestamp, Timestamp::Infinity)
}
