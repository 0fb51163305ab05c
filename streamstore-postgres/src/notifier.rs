//! `LISTEN`/`NOTIFY`-backed [`Notifier`]. Ticks arrive pushed from Postgres
//! instead of being discovered by polling `readHeadPosition()`; the trigger
//! installed by the initial migration emits one `NOTIFY streamstore_messages`
//! per committed append.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::poll_fn;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_postgres::config::Config;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{AsyncMessage, Socket};

use streamstore::notifier::{Notifier, TickReceiver};

const CHANNEL: &str = "streamstore_messages";

/// Backoff applied between reconnect attempts after the `LISTEN` connection
/// drops. Doubles up to a ceiling, same shape as `RetryPolicy` but simpler:
/// this is reconnect jitter, not a conflict-retry budget.
struct Reconnect {
    delay: Duration,
    max_delay: Duration,
}

impl Reconnect {
    fn new() -> Self {
        Self { delay: Duration::from_millis(100), max_delay: Duration::from_secs(10) }
    }

    fn next(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay * 2).min(self.max_delay);
        current
    }

    fn reset(&mut self) {
        self.delay = Duration::from_millis(100);
    }
}

/// A [`Notifier`] that listens for `NOTIFY` messages on a dedicated
/// connection rather than polling the head position.
pub struct PgNotifyNotifier {
    tx: watch::Sender<u64>,
    generation: AtomicU64,
    cancel: tokio_util::sync::CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PgNotifyNotifier {
    /// Spawns the listener against a fresh connection built from `config`,
    /// reconnecting with backoff if the connection drops. `keepalive_interval`
    /// paces a `SELECT 1` ping on the same connection, so a half-open socket
    /// that never surfaces as a `poll_message` error still gets noticed and
    /// reconnected.
    pub fn spawn<Tls>(config: Config, tls: Tls, keepalive_interval: Duration) -> Arc<Self>
    where
        Tls: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
        <Tls as MakeTlsConnect<Socket>>::Stream: Send,
        <Tls as MakeTlsConnect<Socket>>::TlsConnect: Send,
        <<Tls as MakeTlsConnect<Socket>>::TlsConnect as TlsConnect<Socket>>::Future: Send,
    {
        let (tx, _rx) = watch::channel(0u64);
        let cancel = tokio_util::sync::CancellationToken::new();

        let this = Arc::new(Self {
            tx,
            generation: AtomicU64::new(0),
            cancel: cancel.clone(),
            task: std::sync::Mutex::new(None),
        });

        let loop_this = Arc::clone(&this);

        let handle = tokio::spawn(async move {
            let mut backoff = Reconnect::new();

            loop {
                if cancel.is_cancelled() {
                    return;
                }

                match config.connect(tls.clone()).await {
                    Ok((client, mut connection)) => {
                        backoff.reset();

                        if client.batch_execute(&format!("LISTEN {CHANNEL}")).await.is_err() {
                            #[cfg(feature = "with-tracing")]
                            tracing::warn!("failed to issue LISTEN, reconnecting");
                            continue;
                        }

                        // The connection is driven from its own task so `client`
                        // stays free to run the keepalive ping concurrently;
                        // nothing else polls the socket while a query is in flight.
                        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
                        let conn_task = tokio::spawn(async move {
                            loop {
                                match poll_fn(|cx| connection.poll_message(cx)).await {
                                    Some(msg) => {
                                        if msg_tx.send(msg).is_err() {
                                            return;
                                        }
                                    },
                                    None => return,
                                }
                            }
                        });

                        let mut keepalive = tokio::time::interval(keepalive_interval);
                        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                        keepalive.tick().await;

                        loop {
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    conn_task.abort();
                                    return;
                                },
                                _ = keepalive.tick() => {
                                    if client.batch_execute("SELECT 1").await.is_err() {
                                        #[cfg(feature = "with-tracing")]
                                        tracing::warn!("keepalive ping failed, reconnecting");
                                        conn_task.abort();
                                        break;
                                    }
                                },
                                message = msg_rx.recv() => {
                                    match message {
                                        Some(Ok(AsyncMessage::Notification(_))) => {
                                            let generation = loop_this.generation.fetch_add(1, Ordering::SeqCst) + 1;
                                            let _ = loop_this.tx.send(generation);
                                        },
                                        Some(Ok(_)) => {},
                                        Some(Err(_err)) => {
                                            #[cfg(feature = "with-tracing")]
                                            tracing::warn!(error = ?_err, "listen connection ended, reconnecting");
                                            conn_task.abort();
                                            break;
                                        },
                                        None => {
                                            #[cfg(feature = "with-tracing")]
                                            tracing::warn!("listen connection ended, reconnecting");
                                            conn_task.abort();
                                            break;
                                        },
                                    }
                                },
                            }
                        }
                    },
                    Err(_err) => {
                        #[cfg(feature = "with-tracing")]
                        tracing::warn!(error = %_err, "failed to open listen connection, retrying");
                    },
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff.next()) => {},
                }
            }
        });

        *this.task.lock().unwrap() = Some(handle);
        this
    }
}

#[async_trait]
impl Notifier for PgNotifyNotifier {
    fn subscribe(&self) -> TickReceiver {
        self.tx.subscribe()
    }

    async fn dispose(&self) {
        self.cancel.cancel();

        let handle = self.task.lock().unwrap().take();

        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
