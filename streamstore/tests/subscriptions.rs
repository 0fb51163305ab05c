use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::FutureExt;
use serde_json::json;
use streamstore::inmemory::InMemoryDriver;
use streamstore::notifier::PollingNotifier;
use streamstore::types::{ExpectedVersion, NewMessage, PersistedMessage};
use streamstore::{AllSubscriptionOptions, Processor, StreamSubscriptionOptions, StreamStore};
use uuid::Uuid;

fn messages(n: usize) -> Vec<NewMessage> {
    (0..n).map(|_| NewMessage::new(Uuid::new_v4(), "ItemAdded", json!({}))).collect()
}

fn new_store() -> StreamStore<InMemoryDriver> {
    let driver = Arc::new(InMemoryDriver::new());
    let notifier = PollingNotifier::spawn(Arc::clone(&driver), Duration::from_millis(10));
    StreamStore::new(driver, notifier)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn stream_subscription_delivers_existing_messages_in_order_then_fires_caught_up() {
    let store = new_store();
    store.append_to_stream("S1", ExpectedVersion::Empty, messages(5)).await.expect("seed append");

    let received = Arc::new(Mutex::new(Vec::new()));
    let caught_up = Arc::new(AtomicBool::new(false));

    let received_for_processor = Arc::clone(&received);
    let processor: Processor = Arc::new(move |message: PersistedMessage| {
        let received = Arc::clone(&received_for_processor);
        async move {
            received.lock().unwrap().push(message.stream_version);
            Ok(())
        }
        .boxed()
    });

    let caught_up_for_callback = Arc::clone(&caught_up);
    let options = StreamSubscriptionOptions {
        on_caught_up: Some(Arc::new(move || {
            caught_up_for_callback.store(true, Ordering::SeqCst);
        })),
        ..Default::default()
    };

    let subscription = store.subscribe_to_stream("S1", processor, options);

    wait_until(|| caught_up.load(Ordering::SeqCst)).await;
    assert_eq!(*received.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    subscription.dispose().await;
    store.dispose().await;
}

#[tokio::test]
async fn stream_subscription_picks_up_live_appends_after_catching_up() {
    let store = new_store();
    store.append_to_stream("S2", ExpectedVersion::Empty, messages(1)).await.expect("seed append");

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_for_processor = Arc::clone(&received);
    let processor: Processor = Arc::new(move |message: PersistedMessage| {
        let received = Arc::clone(&received_for_processor);
        async move {
            received.lock().unwrap().push(message.stream_version);
            Ok(())
        }
        .boxed()
    });

    let subscription = store.subscribe_to_stream("S2", processor, StreamSubscriptionOptions::default());

    wait_until(|| received.lock().unwrap().len() == 1).await;

    store.append_to_stream("S2", ExpectedVersion::Exact(0), messages(2)).await.expect("live append");

    wait_until(|| received.lock().unwrap().len() == 3).await;
    assert_eq!(*received.lock().unwrap(), vec![0, 1, 2]);

    subscription.dispose().await;
    store.dispose().await;
}

#[tokio::test]
async fn all_subscription_with_no_after_position_starts_at_the_current_head() {
    let store = new_store();
    store.append_to_stream("S3", ExpectedVersion::Empty, messages(3)).await.expect("seed append");

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_for_processor = Arc::clone(&received);
    let processor: Processor = Arc::new(move |message: PersistedMessage| {
        let received = Arc::clone(&received_for_processor);
        async move {
            received.lock().unwrap().push(message.position.get());
            Ok(())
        }
        .boxed()
    });

    let established = Arc::new(AtomicBool::new(false));
    let established_for_callback = Arc::clone(&established);
    let options = AllSubscriptionOptions {
        on_established: Some(Arc::new(move || {
            established_for_callback.store(true, Ordering::SeqCst);
        })),
        ..Default::default()
    };

    let subscription = store.subscribe_to_all(processor, options);

    // `on_established` fires only once the starting position has been
    // resolved against the head, so the live append below is guaranteed to
    // land after it rather than racing the subscription's startup read.
    wait_until(|| established.load(Ordering::SeqCst)).await;

    store.append_to_stream("S3", ExpectedVersion::Exact(2), messages(1)).await.expect("live append");

    wait_until(|| !received.lock().unwrap().is_empty()).await;

    // Only the post-subscribe append should be delivered; the three seeded
    // messages must not be replayed since no `afterPosition` was given.
    assert_eq!(received.lock().unwrap().len(), 1);

    subscription.dispose().await;
    store.dispose().await;
}

#[tokio::test]
async fn on_established_fires_before_any_message_is_delivered() {
    let store = new_store();
    store.append_to_stream("S4", ExpectedVersion::Empty, messages(2)).await.expect("seed append");

    let established = Arc::new(AtomicBool::new(false));
    let established_for_callback = Arc::clone(&established);

    let processor: Processor = Arc::new(move |_message: PersistedMessage| async move { Ok(()) }.boxed());

    let options = StreamSubscriptionOptions {
        on_established: Some(Arc::new(move || {
            established_for_callback.store(true, Ordering::SeqCst);
        })),
        ..Default::default()
    };

    let subscription = store.subscribe_to_stream("S4", processor, options);
    wait_until(|| established.load(Ordering::SeqCst)).await;

    subscription.dispose().await;
    store.dispose().await;
}

#[tokio::test]
async fn a_rejected_processor_drops_the_subscription_and_runs_on_dispose() {
    let store = new_store();
    store.append_to_stream("S5", ExpectedVersion::Empty, messages(1)).await.expect("seed append");

    let dropped = Arc::new(AtomicBool::new(false));
    let disposed = Arc::new(AtomicBool::new(false));
    let dropped_for_callback = Arc::clone(&dropped);
    let disposed_for_callback = Arc::clone(&disposed);

    let processor: Processor =
        Arc::new(move |_message: PersistedMessage| async move { Err(anyhow::anyhow!("boom")) }.boxed());

    let options = StreamSubscriptionOptions {
        on_dropped: Some(Arc::new(move |_reason| {
            dropped_for_callback.store(true, Ordering::SeqCst);
        })),
        on_dispose: Some(Arc::new(move || {
            disposed_for_callback.store(true, Ordering::SeqCst);
        })),
        ..Default::default()
    };

    let _subscription = store.subscribe_to_stream("S5", processor, options);

    wait_until(|| dropped.load(Ordering::SeqCst) && disposed.load(Ordering::SeqCst)).await;

    store.dispose().await;
}

#[tokio::test]
async fn dispose_waits_for_the_in_flight_callback_before_returning() {
    let store = new_store();
    store.append_to_stream("S6", ExpectedVersion::Empty, messages(1)).await.expect("seed append");

    let call_count = Arc::new(AtomicUsize::new(0));
    let call_count_for_processor = Arc::clone(&call_count);
    let processor: Processor = Arc::new(move |_message: PersistedMessage| {
        let call_count = Arc::clone(&call_count_for_processor);
        async move {
            call_count.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
        .boxed()
    });

    let subscription = store.subscribe_to_stream("S6", processor, StreamSubscriptionOptions::default());

    wait_until(|| call_count.load(Ordering::SeqCst) > 0).await;
    subscription.dispose().await;

    store.dispose().await;
}
