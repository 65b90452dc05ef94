//! Synchronization service abstraction: counting barriers and broadcast topics.

use crate::error::EnvError;
use crate::types::StateName;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;
use std::marker::PhantomData;
use tokio::sync::{mpsc, oneshot};

/// The out-of-band channel every node of a run shares.
///
/// Two primitives are offered:
///
/// - **States/barriers**: `signal_entry` increments a counter shared by every
///   node for the same state name; `barrier` returns a handle that resolves
///   once that counter reaches a target.
/// - **Topics**: `publish_raw` broadcasts a small payload to all
///   subscribers of a topic name, at least once.
///
/// # Implementations
///
/// - **In-process**: [`crate::LocalSyncClient`], backed by tokio channels
/// - **Remote**: a client of an external service (not part of this crate)
///
/// # Invariants callers must uphold
///
/// Every caller of `barrier` for a given state must pass the same target.
/// The service does not check this.
#[async_trait]
pub trait SyncService: Send + Sync + 'static {
    /// Signals entry into a state and returns the counter value after the
    /// increment (1-based).
    async fn signal_entry(&self, state: &StateName) -> Result<u64, EnvError>;

    /// Returns a handle resolving once `state` has been signalled `target` times.
    async fn barrier(&self, state: &StateName, target: u64) -> Result<Barrier, EnvError>;

    /// Publishes a raw payload and returns its position in the topic.
    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<u64, EnvError>;

    /// Subscribes to a topic.
    async fn subscribe_raw(&self, topic: &str) -> Result<Subscription, EnvError>;

    /// Closes this client handle. Any further call fails with `ClientClosed`.
    async fn close(&self) -> Result<(), EnvError>;

    /// Signals entry and waits until `target` entries have been recorded.
    async fn signal_and_wait(&self, state: &StateName, target: u64) -> Result<u64, EnvError> {
        let seq = self.signal_entry(state).await?;
        self.barrier(state, target).await?.wait().await?;
        Ok(seq)
    }
}

/// Wait handle for a counting barrier.
#[derive(Debug)]
pub struct Barrier {
    state: StateName,
    target: u64,
    rx: oneshot::Receiver<Result<(), EnvError>>,
}

impl Barrier {
    /// Creates a handle that resolves with whatever is sent on `rx`.
    pub fn new(state: StateName, target: u64, rx: oneshot::Receiver<Result<(), EnvError>>) -> Self {
        Self { state, target, rx }
    }

    pub fn state(&self) -> &StateName {
        &self.state
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Blocks until the barrier is released.
    ///
    /// A dropped resolver is reported as the service having gone away.
    pub async fn wait(self) -> Result<(), EnvError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(EnvError::ServiceUnavailable(format!(
                "barrier {:?} abandoned",
                self.state.as_str()
            ))),
        }
    }
}

/// Stream of raw payloads published on one topic.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>, EnvError>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<Result<Vec<u8>, EnvError>>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receives the next payload.
    ///
    /// The end of the stream is an error: subscriptions only end when the
    /// service fails or this client is closed.
    pub async fn next(&mut self) -> Result<Vec<u8>, EnvError> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(EnvError::SubscriptionClosed(self.topic.clone())),
        }
    }
}

/// A topic name bound to the record type carried on it.
#[derive(Debug, Clone)]
pub struct Topic<T> {
    name: Cow<'static, str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Topic<T> {
    /// Creates a typed topic usable in `const` items.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _marker: PhantomData,
        }
    }

    /// Creates a typed topic with a runtime-computed name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Subscription that decodes each payload as `T`.
#[derive(Debug)]
pub struct TypedSubscription<T> {
    inner: Subscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TypedSubscription<T> {
    pub async fn next(&mut self) -> Result<T, EnvError> {
        let payload = self.inner.next().await?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

/// Typed publish/subscribe on top of any [`SyncService`].
///
/// Payloads travel as JSON.
#[async_trait]
pub trait SyncServiceExt {
    async fn publish<T>(&self, topic: &Topic<T>, value: &T) -> Result<u64, EnvError>
    where
        T: Serialize + Sync;

    async fn subscribe<T>(&self, topic: &Topic<T>) -> Result<TypedSubscription<T>, EnvError>
    where
        T: DeserializeOwned;
}

#[async_trait]
impl<S: SyncService + ?Sized> SyncServiceExt for S {
    async fn publish<T>(&self, topic: &Topic<T>, value: &T) -> Result<u64, EnvError>
    where
        T: Serialize + Sync,
    {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(topic.name(), payload).await
    }

    async fn subscribe<T>(&self, topic: &Topic<T>) -> Result<TypedSubscription<T>, EnvError>
    where
        T: DeserializeOwned,
    {
        let inner = self.subscribe_raw(topic.name()).await?;
        Ok(TypedSubscription {
            inner,
            _marker: PhantomData,
        })
    }
}
