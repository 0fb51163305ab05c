//! All-stream subscription driver. Same state machine as the single-stream
//! driver, anchored on a global [`Position`] instead of a per-stream
//! version, reading through the gap-detecting all-reader via
//! [`SubscriptionSource::read_all_page`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{
    new_shared, process_with_retries, DropReason, OnCaughtUp, OnDispose, OnDropped, OnEstablished,
    Processor, SharedTaskState, Subscription, SubscriptionBackoff, SubscriptionId,
    SubscriptionSource,
};
use crate::types::Position;

/// Configuration for [`crate::StreamStore::subscribe_to_all`].
#[derive(Clone)]
pub struct AllSubscriptionOptions {
    pub after_position: Option<Position>,
    pub max_count_per_read: u64,
    pub retry_backoff: SubscriptionBackoff,
    pub on_established: Option<OnEstablished>,
    pub on_dropped: Option<OnDropped>,
    pub on_caught_up: Option<OnCaughtUp>,
    pub on_dispose: Option<OnDispose>,
}

impl Default for AllSubscriptionOptions {
    fn default() -> Self {
        Self {
            after_position: None,
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
    options: AllSubscriptionOptions,
    processor: Processor,
) -> (Subscription, Arc<SharedTaskState>) {
    let shared = new_shared();
    let cancel = shared.cancel.clone();

    let handle = tokio::spawn(async move {
        run(source, options, processor, cancel).await;
    });

    *shared.join.try_lock().expect("freshly created lock") = Some(handle);

    (
        Subscription {
            id,
            shared: Arc::clone(&shared),
        },
        shared,
    )
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
async fn run<S: SubscriptionSource>(
    source: Arc<S>,
    options: AllSubscriptionOptions,
    processor: Processor,
    cancel: CancellationToken,
) {
    let mut next_position = match options.after_position {
        Some(p) => p.next_forward(),
        None => match source.read_head_position().await {
            Ok(head) => head.next_forward(),
            Err(err) => {
                if let Some(on_dropped) = &options.on_dropped {
                    on_dropped(DropReason::Storage(err.into()));
                }
                if let Some(on_dispose) = &options.on_dispose {
                    on_dispose();
                }
                return;
            },
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
                    page = source.read_all_page(next_position, options.max_count_per_read) => page,
                };

                let page = match page {
                    Ok(page) => page,
                    Err(_err) => {
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
                        Ok(()) => next_position = message.position.next_forward(),
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
            let _ = ticks.has_changed();
        }
    }

    if let Some(on_dispose) = &options.on_dispose {
        on_dispose();
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, duration: std::time::Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
