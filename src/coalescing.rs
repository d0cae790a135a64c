use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::oneshot;
use tracing::debug;

use crate::models::BackendResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceOutcome {
    Leader,
    Joined,
}

type Waiters = Vec<oneshot::Sender<Vec<BackendResponse>>>;

/// Collapses concurrent identical rounds into one computation.
#[derive(Debug, Default)]
pub struct RoundCoalescer {
    inflight: Mutex<HashMap<String, Waiters>>,
}

impl RoundCoalescer {
    /// Runs `compute` unless a round for `key` is already in flight, in which case its result is
    /// shared. If that leader is cancelled, the joiner computes on its own.
    pub async fn execute_or_join<F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> (Vec<BackendResponse>, CoalesceOutcome)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Vec<BackendResponse>>,
    {
        let receiver = {
            let mut inflight = self.lock();
            if let Some(waiters) = inflight.get_mut(key) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                inflight.insert(key.to_owned(), Vec::new());
                None
            }
        };

        if let Some(receiver) = receiver {
            debug!(fingerprint = %key, "joined inflight round");
            return match receiver.await {
                Ok(responses) => (responses, CoalesceOutcome::Joined),
                Err(_) => {
                    debug!(fingerprint = %key, "leader dropped before completion, running round");
                    (compute().await, CoalesceOutcome::Leader)
                }
            };
        }

        debug!(fingerprint = %key, "leader executing round");
        let lease = LeaderLease {
            coalescer: self,
            key,
            released: false,
        };
        let responses = compute().await;

        for waiter in lease.release() {
            let _ = waiter.send(responses.clone());
        }

        (responses, CoalesceOutcome::Leader)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Waiters>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the in-flight slot even when the leader future is dropped mid-round.
struct LeaderLease<'a> {
    coalescer: &'a RoundCoalescer,
    key: &'a str,
    released: bool,
}

impl LeaderLease<'_> {
    fn release(mut self) -> Waiters {
        self.released = true;
        self.coalescer.lock().remove(self.key).unwrap_or_default()
    }
}

impl Drop for LeaderLease<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.coalescer.lock().remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use tokio::time::sleep;

    use super::{CoalesceOutcome, RoundCoalescer};
    use crate::models::BackendResponse;

    #[tokio::test]
    async fn coalesces_identical_concurrent_rounds() {
        let coalescer = Arc::new(RoundCoalescer::default());
        let computed = Arc::new(AtomicUsize::new(0));

        let run = |coalescer: Arc<RoundCoalescer>, computed: Arc<AtomicUsize>| {
            tokio::spawn(async move {
                coalescer
                    .execute_or_join("same", || async {
                        computed.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        vec![BackendResponse::success("grok", "hi")]
                    })
                    .await
            })
        };

        let first = run(coalescer.clone(), computed.clone());
        let second = run(coalescer.clone(), computed.clone());

        let first = first.await.expect("first task should run");
        let second = second.await.expect("second task should run");

        assert_eq!(computed.load(Ordering::SeqCst), 1);
        assert_ne!(first.1, second.1);
        assert!(first.1 == CoalesceOutcome::Joined || second.1 == CoalesceOutcome::Joined);
        assert_eq!(first.0, second.0);
    }

    #[tokio::test]
    async fn cancelled_leader_frees_the_slot() {
        let coalescer = Arc::new(RoundCoalescer::default());

        let leader = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .execute_or_join("key", || async {
                        sleep(Duration::from_secs(30)).await;
                        Vec::new()
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(20)).await;

        let joiner = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                coalescer
                    .execute_or_join("key", || async {
                        vec![BackendResponse::success("kimi", "own round")]
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(20)).await;
        leader.abort();

        let (responses, outcome) = joiner.await.expect("joiner should finish");
        assert_eq!(outcome, CoalesceOutcome::Leader);
        assert_eq!(responses[0].content, "own round");
        assert!(coalescer.lock().is_empty());
    }
}
