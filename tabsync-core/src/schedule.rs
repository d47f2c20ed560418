//! Single-flight action queues keyed by store identity.
//!
//! Loads and saves touching the same store run one at a time, in the order
//! they were scheduled. Actions for different stores run independently.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::trace;

type Action = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default)]
struct Queue {
    running: bool,
    actions: VecDeque<Action>,
}

/// FIFO action queues, one per store key.
#[derive(Default)]
pub struct Scheduler {
    queues: Mutex<HashMap<usize, Queue>>,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues `action` behind any pending actions for `key` and waits for it.
    ///
    /// Returns `None` if the action was dropped before completing.
    pub async fn schedule<F, T>(self: &Arc<Self>, key: usize, action: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let action: Action = Box::pin(async move {
            let _ = done_tx.send(action.await);
        });

        let start = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            let queue = queues.entry(key).or_default();
            queue.actions.push_back(action);
            !std::mem::replace(&mut queue.running, true)
        };
        if start {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move { scheduler.run(key).await });
        }

        done_rx.await.ok()
    }

    /// Whether an action for `key` is running or queued.
    pub fn is_busy(&self, key: usize) -> bool {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.get(&key).is_some_and(|queue| queue.running)
    }

    /// Drops every queued (not yet running) action for `key`.
    pub fn clear(&self, key: usize) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = queues.get_mut(&key) {
            queue.actions.clear();
        }
    }

    async fn run(&self, key: usize) {
        loop {
            let next = {
                let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
                match queues.get_mut(&key).and_then(|queue| queue.actions.pop_front()) {
                    Some(action) => action,
                    None => {
                        queues.remove(&key);
                        trace!(key, "Action queue drained");
                        return;
                    }
                }
            };
            next.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_actions_for_one_key_run_in_order_without_overlap() {
        let scheduler = Scheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u64 {
            let scheduler = scheduler.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .schedule(1, async move {
                        log.lock().unwrap().push(format!("start {i}"));
                        tokio::time::sleep(Duration::from_millis(5 * (5 - i))).await;
                        log.lock().unwrap().push(format!("end {i}"));
                        i
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), Some(i as u64));
        }

        let log = log.lock().unwrap();
        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start {i}"), format!("end {i}")])
            .collect();
        assert_eq!(*log, expected);
        assert!(!scheduler.is_busy(1));
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block_each_other() {
        let scheduler = Scheduler::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocked = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .schedule(1, async move {
                        let _ = release_rx.await;
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        assert_eq!(scheduler.schedule(2, async { 7 }).await, Some(7));
        assert!(scheduler.is_busy(1));

        release_tx.send(()).unwrap();
        assert_eq!(blocked.await.unwrap(), Some(()));
    }
}
