//! Request scheduler
//!
//! Serializes, prioritizes, and deduplicates remote calls:
//! - Two classes: FOREGROUND (user-blocking) and BACKGROUND (sync,
//!   prefetch). At least one worker slot is reserved for foreground;
//!   background callers yield between calls, never mid-call.
//! - Concurrent requests for the same `(method, resource)` share one
//!   remote call; later callers attach to the in-flight result.
//! - Cancellation is reference-counted: the underlying call is cancelled
//!   only when every attached caller has cancelled.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use driftfs_core::domain::DriftError;

/// Request priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// A user is blocked on the answer
    Foreground,
    /// Sync and prefetch work
    Background,
}

/// Dedup key: one remote call per distinct key at a time
pub type RequestKey = (&'static str, String);

struct Inflight<V> {
    result: watch::Receiver<Option<Result<V, DriftError>>>,
    callers: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl<V> Clone for Inflight<V> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            callers: self.callers.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Decrements the caller count on drop; the last caller out cancels the
/// underlying call
struct CallerGuard {
    callers: Arc<AtomicUsize>,
    cancel: CancellationToken,
    finished: bool,
}

impl Drop for CallerGuard {
    fn drop(&mut self) {
        if !self.finished && self.callers.fetch_sub(1, Ordering::SeqCst) == 1 {
            trace!("Last caller gone, cancelling underlying request");
            self.cancel.cancel();
        }
    }
}

/// Prioritized, deduplicating scheduler for remote calls
///
/// `V` is the shared result type; attached callers receive clones.
pub struct RequestScheduler<V: Clone + Send + Sync + 'static> {
    /// All worker slots; foreground draws from here directly
    total: Arc<Semaphore>,
    /// Background slots; one fewer than total, reserving a foreground slot
    background: Arc<Semaphore>,
    inflight: Arc<DashMap<RequestKey, Inflight<V>>>,
}

impl<V: Clone + Send + Sync + 'static> RequestScheduler<V> {
    /// Creates a scheduler with `workers` total slots (min 2, so one can
    /// always be reserved for foreground)
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(2);
        Self {
            total: Arc::new(Semaphore::new(workers)),
            background: Arc::new(Semaphore::new(workers - 1)),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Runs `work` under the scheduler, or attaches to an identical
    /// in-flight call
    ///
    /// `caller_cancel` is this caller's own signal; the shared underlying
    /// call sees cancellation only when all callers have cancelled.
    pub async fn request<F, Fut>(
        &self,
        priority: Priority,
        key: RequestKey,
        caller_cancel: CancellationToken,
        work: F,
    ) -> Result<V, DriftError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<V, DriftError>> + Send + 'static,
    {
        // Attach or become the owner, atomically per key.
        let (entry, is_owner) = {
            match self.inflight.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(occupied) => {
                    let entry = occupied.get().clone();
                    entry.callers.fetch_add(1, Ordering::SeqCst);
                    (entry, false)
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(None);
                    let entry = Inflight {
                        result: rx,
                        callers: Arc::new(AtomicUsize::new(1)),
                        cancel: CancellationToken::new(),
                    };
                    vacant.insert(entry.clone());

                    self.spawn_owner(priority, key.clone(), entry.cancel.clone(), tx, work);
                    (entry, true)
                }
            }
        };

        if !is_owner {
            debug!(method = key.0, resource = %key.1, "Attached to in-flight request");
        }

        let mut guard = CallerGuard {
            callers: entry.callers.clone(),
            cancel: entry.cancel.clone(),
            finished: false,
        };

        let mut result_rx = entry.result.clone();
        let outcome = loop {
            if let Some(result) = result_rx.borrow().clone() {
                break result;
            }
            tokio::select! {
                changed = result_rx.changed() => {
                    if changed.is_err() {
                        break Err(DriftError::Cancelled);
                    }
                }
                _ = caller_cancel.cancelled() => {
                    // The guard's drop decides whether the underlying call
                    // dies with us.
                    return Err(DriftError::Cancelled);
                }
            }
        };

        guard.finished = true;
        // Balance the attach; no cancellation once a result exists.
        entry.callers.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn spawn_owner<F, Fut>(
        &self,
        priority: Priority,
        key: RequestKey,
        cancel: CancellationToken,
        tx: watch::Sender<Option<Result<V, DriftError>>>,
        work: F,
    ) where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<V, DriftError>> + Send + 'static,
    {
        let total = self.total.clone();
        let background = self.background.clone();
        let inflight = self.inflight.clone();
        let fut = work(cancel.clone());

        tokio::spawn(async move {
            // Background holds a background slot first, so one total slot
            // always stays reachable for foreground callers.
            let _bg_permit = match priority {
                Priority::Background => match background.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                Priority::Foreground => None,
            };
            let _permit = match total.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            // Completed work beats the cancellation signal when both are
            // ready, so a result that arrived in time is never thrown away.
            let result = tokio::select! {
                biased;
                result = fut => result,
                _ = cancel.cancelled() => Err(DriftError::Cancelled),
            };

            inflight.remove(&key);
            let _ = tx.send(Some(result));
        });
    }

    /// Number of requests currently in flight (diagnostics)
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn key(resource: &str) -> RequestKey {
        ("GET", resource.to_string())
    }

    #[tokio::test]
    async fn test_basic_request() {
        let scheduler: RequestScheduler<u32> = RequestScheduler::new(4);
        let result = scheduler
            .request(Priority::Foreground, key("/a"), CancellationToken::new(), |_| async {
                Ok(7)
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(scheduler.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_same_key_runs_once() {
        let scheduler: Arc<RequestScheduler<u32>> = Arc::new(RequestScheduler::new(4));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let scheduler = scheduler.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .request(
                        Priority::Foreground,
                        key("/shared"),
                        CancellationToken::new(),
                        move |_| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(99)
                        },
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 99);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_run_independently() {
        let scheduler: Arc<RequestScheduler<String>> = Arc::new(RequestScheduler::new(4));

        let a = scheduler.request(
            Priority::Foreground,
            key("/a"),
            CancellationToken::new(),
            |_| async { Ok("a".to_string()) },
        );
        let b = scheduler.request(
            Priority::Background,
            key("/b"),
            CancellationToken::new(),
            |_| async { Ok("b".to_string()) },
        );

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_partial_cancellation_keeps_request_alive() {
        let scheduler: Arc<RequestScheduler<u32>> = Arc::new(RequestScheduler::new(4));
        let cancelled_seen = Arc::new(AtomicU32::new(0));

        let quitting = CancellationToken::new();
        let staying = CancellationToken::new();

        let first = {
            let scheduler = scheduler.clone();
            let quitting = quitting.clone();
            let seen = cancelled_seen.clone();
            tokio::spawn(async move {
                scheduler
                    .request(Priority::Foreground, key("/slow"), quitting, move |cancel| {
                        let seen = seen.clone();
                        async move {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            if cancel.is_cancelled() {
                                seen.fetch_add(1, Ordering::SeqCst);
                                return Err(DriftError::Cancelled);
                            }
                            Ok(5)
                        }
                    })
                    .await
            })
        };

        // Give the first caller time to own the request, then attach.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let scheduler = scheduler.clone();
            let staying = staying.clone();
            tokio::spawn(async move {
                scheduler
                    .request(Priority::Foreground, key("/slow"), staying, |_| async {
                        unreachable!("second caller attaches, never runs work")
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        quitting.cancel();

        // The quitter gets Cancelled, the stayer gets the result.
        assert!(matches!(
            first.await.unwrap(),
            Err(DriftError::Cancelled)
        ));
        assert_eq!(second.await.unwrap().unwrap(), 5);
        assert_eq!(cancelled_seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_callers_cancelling_cancels_underlying() {
        let scheduler: Arc<RequestScheduler<u32>> = Arc::new(RequestScheduler::new(4));
        let underlying_cancelled = Arc::new(AtomicU32::new(0));

        let token = CancellationToken::new();
        let task = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            let flag = underlying_cancelled.clone();
            tokio::spawn(async move {
                scheduler
                    .request(Priority::Background, key("/doomed"), token, move |cancel| {
                        let flag = flag.clone();
                        async move {
                            cancel.cancelled().await;
                            flag.fetch_add(1, Ordering::SeqCst);
                            Err(DriftError::Cancelled)
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        assert!(matches!(task.await.unwrap(), Err(DriftError::Cancelled)));
        // The sole caller left, so the underlying future saw cancellation.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(underlying_cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_results_are_shared() {
        let scheduler: RequestScheduler<u32> = RequestScheduler::new(4);
        let result = scheduler
            .request(Priority::Foreground, key("/404"), CancellationToken::new(), |_| async {
                Err(DriftError::NotFound("missing".into()))
            })
            .await;
        assert!(matches!(result, Err(DriftError::NotFound(_))));
    }
}
