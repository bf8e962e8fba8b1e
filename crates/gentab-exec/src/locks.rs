//! In-process per-row generation locks. Rows generate in parallel across a
//! table, but no two concurrent generations may write the same row's
//! cells; acquisition is all-or-nothing per request.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use gentab_core::types::{RowId, TableId};
use gentab_core::{Error, Result};

#[derive(Default, Debug)]
pub struct RowLocks {
    held: Mutex<HashSet<(TableId, RowId)>>,
}

impl RowLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire(
        self: &Arc<Self>,
        table_id: &TableId,
        row_ids: &[RowId],
    ) -> Result<RowLockGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        for row_id in row_ids {
            if held.contains(&(table_id.clone(), row_id.clone())) {
                return Err(Error::concurrency(format!(
                    "row '{row_id}' of table '{table_id}' is already generating"
                )));
            }
        }
        let keys: Vec<(TableId, RowId)> =
            row_ids.iter().map(|r| (table_id.clone(), r.clone())).collect();
        for key in &keys {
            held.insert(key.clone());
        }
        Ok(RowLockGuard { locks: Arc::clone(self), keys })
    }
}

/// Releases the rows on drop, including on cancellation.
#[derive(Debug)]
pub struct RowLockGuard {
    locks: Arc<RowLocks>,
    keys: Vec<(TableId, RowId)>,
}

impl Drop for RowLockGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            held.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisition_is_all_or_nothing_and_released_on_drop() {
        let locks = RowLocks::new();
        let t = "t".to_string();
        let guard = locks.try_acquire(&t, &["r1".to_string(), "r2".to_string()]).unwrap();
        // Overlap on r2: whole request rejected, r3 not left half-locked.
        let err = locks
            .try_acquire(&t, &["r3".to_string(), "r2".to_string()])
            .expect_err("overlap");
        assert_eq!(err.kind(), "concurrency");
        locks.try_acquire(&t, &["r3".to_string()]).expect("r3 still free");
        drop(guard);
        locks.try_acquire(&t, &["r1".to_string(), "r2".to_string()]).expect("released");
    }

    #[test]
    fn same_row_id_in_different_tables_does_not_conflict() {
        let locks = RowLocks::new();
        let _a = locks.try_acquire(&"a".to_string(), &["r".to_string()]).unwrap();
        locks.try_acquire(&"b".to_string(), &["r".to_string()]).expect("independent");
    }
}
