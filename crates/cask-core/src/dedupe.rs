//! Per-identity single-flight. At most one fetch runs per package
//! identity within one controller; every caller that arrives while it
//! is in flight shares the winner's outcome, success or failure. The
//! entry is dropped once the last interested caller has taken the
//! result, so a later request starts fresh (failures are not cached).

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

pub struct RequestDedupe<T> {
    inflight: DashMap<String, Arc<OnceCell<T>>>,
}

impl<T: Clone> RequestDedupe<T> {
    pub fn new() -> Self {
        Self { inflight: DashMap::new() }
    }

    /// Run `work` for `id`, unless a call for the same identity is
    /// already in flight, in which case await and share its outcome.
    pub async fn run<F>(&self, id: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        // The shard lock is released at the end of this statement; only
        // the Arc travels across the await below.
        let cell = Arc::clone(
            self.inflight
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );
        let result = cell.get_or_init(|| work).await.clone();
        drop(cell);
        // Last caller out removes the entry.
        self.inflight
            .remove_if(id, |_, cell| Arc::strong_count(cell) == 1);
        result
    }

    pub fn clear(&self) {
        self.inflight.clear();
    }
}

impl<T: Clone> Default for RequestDedupe<T> {
    fn default() -> Self {
        Self::new()
    }
}
