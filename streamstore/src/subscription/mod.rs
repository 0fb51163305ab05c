//! Subscription drivers turn a tail pointer, a [`crate::notifier::Notifier`]
//! and a reader into an ordered, checkpointable stream of callbacks, with
//! cancellation and orderly shutdown.

mod all_driver;
mod stream_driver;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::notifier::TickReceiver;
use crate::types::{PersistedMessage, Position, ReadAllResult, ReadStreamResult, StreamId};

pub use all_driver::AllSubscriptionOptions;
pub use stream_driver::StreamSubscriptionOptions;

/// Opaque identifier for a live subscription, unique within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Default)]
pub(crate) struct SubscriptionIdGen(AtomicU64);

impl SubscriptionIdGen {
    pub(crate) fn next(&self) -> SubscriptionId {
        SubscriptionId(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

/// A caller-supplied processor callback. Resolving advances the
/// subscription's tail; rejecting drops the subscription unconditionally.
pub type Processor = Arc<dyn Fn(PersistedMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Reason a subscription tore down without being explicitly disposed.
#[derive(Debug)]
pub enum DropReason {
    /// The processor callback rejected.
    Processor(anyhow::Error),
    /// A terminal, unclassified storage error.
    Storage(anyhow::Error),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Processor(e) => write!(f, "processor rejected: {e}"),
            DropReason::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

pub type OnEstablished = Arc<dyn Fn() + Send + Sync>;
pub type OnDropped = Arc<dyn Fn(DropReason) + Send + Sync>;
pub type OnCaughtUp = Arc<dyn Fn() + Send + Sync>;
pub type OnDispose = Arc<dyn Fn() + Send + Sync>;

/// The read + notify surface a subscription driver needs from the Stream
/// Store. Expressed as a trait object so subscription tasks do not carry
/// the store's `StorageDriver` generic parameter.
#[async_trait]
pub(crate) trait SubscriptionSource: Send + Sync {
    async fn read_stream_page(
        &self,
        stream_id: &StreamId,
        from_inclusive: u64,
        count: u64,
    ) -> Result<ReadStreamResult, Error>;

    async fn read_all_page(&self, from_position: Position, count: u64) -> Result<ReadAllResult, Error>;

    async fn read_head_position(&self) -> Result<Position, Error>;

    fn subscribe_ticks(&self) -> TickReceiver;
}

/// Backoff policy for a subscription's `processMessage` callback: how many
/// times (and with what delay) to retry a rejected callback before tearing
/// the subscription down via `onDropped`. Defaults to no retries, matching
/// the store's original unconditional-drop behavior.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionBackoff {
    pub max_retries: u32,
    pub initial_delay: std::time::Duration,
    pub max_delay: std::time::Duration,
}

impl Default for SubscriptionBackoff {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: std::time::Duration::from_millis(50),
            max_delay: std::time::Duration::from_secs(5),
        }
    }
}

impl SubscriptionBackoff {
    pub(crate) fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let scaled = self.initial_delay.saturating_mul(1 << attempt.min(16));
        scaled.min(self.max_delay)
    }
}

pub(crate) struct SharedTaskState {
    cancel: CancellationToken,
    join: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a live subscription. Dropping this handle does **not** cancel
/// the subscription — call [`Subscription::dispose`] explicitly, or dispose
/// the owning store, which tears down every tracked subscription.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    shared: Arc<SharedTaskState>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Cancels any in-flight wait, awaits the current `processMessage`
    /// invocation to completion (it is never cancelled mid-flight), then
    /// returns once the subscription's configured `dispose` callback has
    /// run. Safe to call more than once; the second call returns as soon
    /// as it observes the first call already took ownership of the join.
    pub async fn dispose(&self) {
        self.shared.cancel.cancel();

        let handle = self.shared.join.lock().await.take();

        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Registry of live subscriptions kept by the store. `dispose()` drains and
/// tears every one of them down, in parallel.
#[derive(Default)]
pub(crate) struct Registry {
    entries: std::sync::Mutex<std::collections::HashMap<SubscriptionId, Arc<SharedTaskState>>>,
}

impl Registry {
    pub(crate) fn track(&self, id: SubscriptionId, shared: Arc<SharedTaskState>) {
        self.entries.lock().unwrap().insert(id, shared);
    }

    pub(crate) async fn dispose_all(&self) {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock().unwrap();
            std::mem::take(&mut *entries).into_values().collect()
        };

        futures::future::join_all(drained.into_iter().map(|shared| async move {
            shared.cancel.cancel();
            let handle = shared.join.lock().await.take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }))
        .await;
    }
}

/// Invokes `processor` on `message`, retrying a rejected callback up to
/// `backoff.max_retries` times with backoff delays before giving up.
pub(crate) async fn process_with_retries(
    processor: &Processor,
    message: &PersistedMessage,
    backoff: &SubscriptionBackoff,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut attempt = 0u32;
    loop {
        match processor(message.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < backoff.max_retries => {
                let delay = backoff.delay_for(attempt);
                attempt += 1;
                #[cfg(feature = "tracing")]
                tracing::debug!(attempt, ?delay, "retrying processor after rejection");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(err),
                    _ = tokio::time::sleep(delay) => continue,
                }
            },
            Err(err) => return Err(err),
        }
    }
}

fn new_shared() -> Arc<SharedTaskState> {
    Arc::new(SharedTaskState {
        cancel: CancellationToken::new(),
        join: tokio::sync::Mutex::new(None),
    })
}

pub(crate) use all_driver::spawn as spawn_all;
pub(crate) use stream_driver::spawn as spawn_stream;
