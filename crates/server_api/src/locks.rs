use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use shared::domain::BoardId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One writer per board. Guards for different boards never contend.
#[derive(Clone, Default)]
pub struct BoardLocks {
    inner: Arc<Mutex<HashMap<BoardId, Arc<AsyncMutex<()>>>>>,
}

impl BoardLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, board_id: BoardId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(board_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Drops locks nobody holds or waits on, plus the entry for `board_id`.
    pub fn forget(&self, board_id: BoardId) {
        let mut locks = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(&board_id);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn tracked(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
#[path = "tests/locks_tests.rs"]
mod tests;
