//! In-process implementation of [`SyncService`] using Tokio channels.

use crate::error::EnvError;
use crate::sync::{Barrier, Subscription, SyncService};
use crate::types::StateName;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Sync service living inside one process.
///
/// Every node of the run gets its own [`LocalSyncClient`] from
/// [`LocalSyncService::client`]; all clients share the same states and
/// topics. Topic history is retained for the lifetime of the service and
/// replayed to late subscribers.
#[derive(Clone, Default)]
pub struct LocalSyncService {
    inner: Arc<Mutex<ServiceState>>,
}

#[derive(Default)]
struct ServiceState {
    /// Per-state entry counters
    states: HashMap<StateName, StateCounter>,

    /// Per-topic retained payloads and live subscribers
    topics: HashMap<String, TopicLog>,

    /// Set once the service has been shut down
    shutdown: Option<String>,
}

struct StateCounter {
    count: watch::Sender<u64>,

    /// Target of the first barrier created for this state
    target: Option<u64>,
}

impl StateCounter {
    fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count, target: None }
    }
}

#[derive(Default)]
struct TopicLog {
    entries: Vec<Vec<u8>>,
    subscribers: Vec<mpsc::UnboundedSender<Result<Vec<u8>, EnvError>>>,
}

fn lock(inner: &Mutex<ServiceState>) -> MutexGuard<'_, ServiceState> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServiceState {
    fn ensure_running(&self) -> Result<(), EnvError> {
        match &self.shutdown {
            Some(reason) => Err(EnvError::ServiceUnavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

impl LocalSyncService {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new client handle bound to this service.
    pub fn client(&self) -> LocalSyncClient {
        LocalSyncClient {
            service: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns how many times `state` has been signalled.
    pub fn count(&self, state: &StateName) -> u64 {
        lock(&self.inner)
            .states
            .get(state)
            .map(|counter| *counter.count.borrow())
            .unwrap_or(0)
    }

    /// Waits until `state` has been signalled at least `count` times.
    ///
    /// Observes the counter without registering a barrier target.
    pub async fn wait_count(&self, state: &StateName, count: u64) -> Result<(), EnvError> {
        let mut rx = {
            let mut service = lock(&self.inner);
            service.ensure_running()?;
            service
                .states
                .entry(state.clone())
                .or_insert_with(StateCounter::new)
                .count
                .subscribe()
        };
        let result = match rx.wait_for(|value| *value >= count).await {
            Ok(_) => Ok(()),
            Err(_) => Err(EnvError::ServiceUnavailable(format!(
                "state {:?} torn down",
                state.as_str()
            ))),
        };
        result
    }

    /// Number of live waiters on `state`.
    #[cfg(test)]
    fn waiters(&self, state: &StateName) -> usize {
        lock(&self.inner)
            .states
            .get(state)
            .map_or(0, |counter| counter.count.receiver_count())
    }

    /// Simulates the service going away.
    ///
    /// Pending barriers and subscriptions fail with `ServiceUnavailable`;
    /// every later call fails the same way.
    pub fn shutdown(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = lock(&self.inner);
        warn!("sync service shutting down: {}", reason);

        // Dropping the watch senders fails every pending barrier
        state.states.clear();
        for (_, topic) in state.topics.drain() {
            for subscriber in topic.subscribers {
                let _ = subscriber.send(Err(EnvError::ServiceUnavailable(reason.clone())));
            }
        }
        state.shutdown = Some(reason);
    }
}

/// One node's handle to a [`LocalSyncService`].
pub struct LocalSyncClient {
    service: Arc<Mutex<ServiceState>>,
    closed: AtomicBool,
}

impl LocalSyncClient {
    fn ensure_open(&self) -> Result<(), EnvError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnvError::ClientClosed);
        }
        Ok(())
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SyncService for LocalSyncClient {
    async fn signal_entry(&self, state: &StateName) -> Result<u64, EnvError> {
        self.ensure_open()?;
        let mut service = lock(&self.service);
        service.ensure_running()?;

        let counter = service
            .states
            .entry(state.clone())
            .or_insert_with(StateCounter::new);
        let mut value = 0;
        counter.count.send_modify(|count| {
            *count += 1;
            value = *count;
        });
        debug!(state = %state, count = value, "signalled entry");
        Ok(value)
    }

    async fn barrier(&self, state: &StateName, target: u64) -> Result<Barrier, EnvError> {
        self.ensure_open()?;
        let mut rx = {
            let mut service = lock(&self.service);
            service.ensure_running()?;

            let counter = service
                .states
                .entry(state.clone())
                .or_insert_with(StateCounter::new);
            match counter.target {
                Some(existing) if existing != target => {
                    warn!(state = %state, existing, target, "barrier target differs between callers");
                }
                Some(_) => {}
                None => counter.target = Some(target),
            }
            counter.count.subscribe()
        };

        let (mut tx, done) = oneshot::channel();
        let name = state.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    debug!(state = %name, target, "barrier wait abandoned");
                }
                released = rx.wait_for(|count| *count >= target) => {
                    let result = match released {
                        Ok(_) => Ok(()),
                        Err(_) => Err(EnvError::ServiceUnavailable(format!(
                            "barrier {:?} torn down",
                            name.as_str()
                        ))),
                    };
                    let _ = tx.send(result);
                }
            }
        });

        Ok(Barrier::new(state.clone(), target, done))
    }

    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<u64, EnvError> {
        self.ensure_open()?;
        let mut service = lock(&self.service);
        service.ensure_running()?;

        let log = service.topics.entry(topic.to_string()).or_default();
        log.subscribers
            .retain(|subscriber| subscriber.send(Ok(payload.clone())).is_ok());
        log.entries.push(payload);
        Ok(log.entries.len() as u64)
    }

    async fn subscribe_raw(&self, topic: &str) -> Result<Subscription, EnvError> {
        self.ensure_open()?;
        let mut service = lock(&self.service);
        service.ensure_running()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let log = service.topics.entry(topic.to_string()).or_default();
        for entry in &log.entries {
            // Receiver is alive, send cannot fail here
            let _ = tx.send(Ok(entry.clone()));
        }
        log.subscribers.push(tx);
        Ok(Subscription::new(topic, rx))
    }

    async fn close(&self) -> Result<(), EnvError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(EnvError::ClientClosed);
        }
        Ok(())
    }
}
