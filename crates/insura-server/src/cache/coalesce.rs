//! In-process request coalescing.
//!
//! Concurrent callers asking for the same key share one underlying load. The
//! load runs on its own task, so callers that give up do not cancel it for
//! the ones still waiting.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

/// The shared load task panicked or was cancelled before producing a value.
#[derive(Debug, Clone, thiserror::Error)]
#[error("coalesced load for {key} aborted: {reason}")]
pub struct LoadAborted {
    pub key: String,
    pub reason: String,
}

struct InFlight<T, E> {
    generation: u64,
    future: Shared<BoxFuture<'static, Result<T, E>>>,
}

/// Collapses concurrent identical loads into one.
pub struct Coalescer<T, E> {
    inflight: Arc<DashMap<String, InFlight<T, E>>>,
    generation: AtomicU64,
}

impl<T, E> Default for Coalescer<T, E> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }
}

impl<T, E> std::fmt::Debug for Coalescer<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}

impl<T, E> Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<LoadAborted> + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Run `load` for `key`, or join the load already running for it.
    ///
    /// `load` is only called when this caller starts a new load.
    pub async fn run<F, Fut>(&self, key: &str, load: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let future = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(running) => {
                debug!(key = %key, "joining in-flight load");
                running.get().future.clone()
            }
            Entry::Vacant(slot) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let inflight = Arc::clone(&self.inflight);
                let owned_key = key.to_string();
                let fut = load();
                let task = tokio::spawn(async move {
                    let result = fut.await;
                    // Later callers start a fresh load.
                    inflight.remove_if(&owned_key, |_, entry| entry.generation == generation);
                    result
                });

                let abort_key = key.to_string();
                let future = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => {
                            error!(key = %abort_key, error = %e, "coalesced load aborted");
                            Err(E::from(LoadAborted {
                                key: abort_key,
                                reason: e.to_string(),
                            }))
                        }
                    }
                }
                .boxed()
                .shared();

                slot.insert(InFlight {
                    generation,
                    future: future.clone(),
                });
                future
            }
        };
        future.await
    }
}
