//! Single-stream subscription driver: catches up from a starting version,
//! then switches to waiting on notifier ticks once it reaches the tail.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{
    new_shared, process_with_retries, DropReason, OnCaughtUp, OnDispose, OnDropped, OnEstablished,
    Processor, SharedTaskState, Subscription, SubscriptionBackoff, SubscriptionId,
    SubscriptionSource,
};
use crate::types::StreamId;

/// Configuration for [`crate::StreamStore::subscribe_to_stream`].
#[derive(Clone)]
pub struct StreamSubscriptionOptions {
    pub after_version: Option<u64>,
    pub max_count_per_read: u64,
    pub retry_backoff: SubscriptionBackoff,
    pub on_established: Option<OnEstablished>,
    pub on_dropped: Option<OnDropped>,
    pub on_caught_up: Option<OnCaughtUp>,
    pub on_dispose: Option<OnDispose>,
}

impl Default for StreamSubscriptionOptions {
    fn default() -> Self {
        Self {
            after_version: None,
            max_count_per_read: 100,
            retry_backoff: SubscriptionBackoff::default(),
            on_established: None,
            on_dropped: None,
            on_caught_up: None,
            on_dispose: None,
        }
    }
}

enum Phase {
    CatchingUp,
    Live,
}

pub(crate) fn spawn<S: SubscriptionSource + 'static>(
    source: Arc<S>,
    id: SubscriptionId,
    stream_id: StreamId,
    options: StreamSubscriptionOptions,
    processor: Processor,
) -> (Subscription, Arc<SharedTaskState>) {
    let shared = new_shared();
    let cancel = shared.cancel.clone();

    let handle = tokio::spawn(async move {
        run(source, stream_id, options, processor, cancel).await;
    });

    // Can't race a dispose() call made before this point: the caller only
    // obtains `Subscription` after `spawn` returns.
    *shared.join.try_lock().expect("freshly created lock") = Some(handle);

    (
        Subscription {
            id,
            shared: Arc::clone(&shared),
        },
        shared,
    )
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(stream_id = %stream_id.as_str())))]
async fn run<S: SubscriptionSource>(
    source: Arc<S>,
    stream_id: StreamId,
    options: StreamSubscriptionOptions,
    processor: Processor,
    cancel: CancellationToken,
) {
    // Initializing: resolve the starting version.
    let mut next_version = match options.after_version {
        Some(v) => v + 1,
        None => {
            match source.read_stream_page(&stream_id, 0, 1).await {
                Ok(page) => page.stream_version + if page.messages.is_empty() { 0 } else { 1 },
                Err(err) => {
                    if let Some(on_dropped) = &options.on_dropped {
                        on_dropped(DropReason::Storage(err.into()));
                    }
                    if let Some(on_dispose) = &options.on_dispose {
                        on_dispose();
                    }
                    return;
                },
            }
        },
    };

    if let Some(on_established) = &options.on_established {
        on_established();
    }

    let mut ticks = source.subscribe_ticks();
    let mut phase = Phase::CatchingUp;
    let mut caught_up_fired = false;

    loop {
        match phase {
            Phase::CatchingUp => {
                let page = tokio::select! {
                    _ = cancel.cancelled() => break,
                    page = source.read_stream_page(&stream_id, next_version, options.max_count_per_read) => page,
                };

                let page = match page {
                    Ok(page) => page,
                    Err(_err) => {
                        // Transient read errors are swallowed with a short
                        // backoff and retried.
                        if sleep_or_cancel(&cancel, std::time::Duration::from_millis(200)).await {
                            break;
                        }
                        continue;
                    },
                };

                for message in page.messages {
                    if cancel.is_cancelled() {
                        break;
                    }

                    match process_with_retries(&processor, &message, &options.retry_backoff, &cancel).await {
                        Ok(()) => next_version = message.stream_version + 1,
                        Err(err) => {
                            if let Some(on_dropped) = &options.on_dropped {
                                on_dropped(DropReason::Processor(err));
                            }
                            if let Some(on_dispose) = &options.on_dispose {
                                on_dispose();
                            }
                            return;
                        },
                    }
                }

                if cancel.is_cancelled() {
                    break;
                }

                if page.is_end {
                    if !caught_up_fired {
                        caught_up_fired = true;
                        if let Some(on_caught_up) = &options.on_caught_up {
                            on_caught_up();
                        }
                    }
                    phase = Phase::Live;
                }
            },
            Phase::Live => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = ticks.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        caught_up_fired = false;
                        phase = Phase::CatchingUp;
                    }
                }
            },
        }

        if matches!(phase, Phase::CatchingUp) {
            // Coalesce any ticks that arrived while we were catching up so
            // the next Live wait doesn't fire immediately on a stale tick.
            let _ = ticks.has_changed();
        }
    }

    if let Some(on_dispose) = &options.on_dispose {
        on_dispose();
    }
}

/// Sleeps for `duration`, or returns `true` early if cancelled.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: std::time::Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
