//! Full consume-loop tests against the in-memory bus: real topology
//! provisioning, durable pull consumers, worker tasks, redelivery, and
//! dead-lettering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use relay_adapters::MemoryBusClient;
use relay_domain::errors::HandlerError;
use relay_domain::RelayConfig;
use relay_ports::{BusClient, ConsumerSpec};
use relay_runtime::{consumer::durable_name, EventRuntime, PublishOptions, Subscriber};

fn config() -> RelayConfig {
    RelayConfig {
        env: "test".to_string(),
        app_name: "svc-a".to_string(),
        concurrency: 2,
        ..Default::default()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn consume_loop_delivers_and_acks() {
    let bus = Arc::new(MemoryBusClient::new());
    let runtime = EventRuntime::builder(config(), bus.clone()).build().unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let handled_inner = handled.clone();
    runtime
        .subscribe(
            Subscriber::builder("orders")
                .pattern("test.svc-a.orders.*")
                .handler(move |message, ctx| {
                    let handled = handled_inner.clone();
                    async move {
                        assert_eq!(message["id"], "o-1");
                        assert_eq!(ctx.topic, "orders.created");
                        handled.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    runtime.start().await.unwrap();

    // Main stream exists. The default dead-letter subject sits under the
    // main stream's `test.events.>` space, so the overlap guard skips
    // creating a separate DLQ stream.
    assert!(bus.stream_info("test-events").await.unwrap().is_some());
    assert!(bus.stream_info("test-events-dlq").await.unwrap().is_none());

    let result = runtime
        .publisher()
        .publish("orders.created", json!({"id": "o-1"}), PublishOptions::default())
        .await
        .unwrap();
    assert!(result.is_success());

    let done = wait_until(|| handled.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await;
    assert!(done, "handler never ran");

    // Acked: the durable has nothing pending or in flight.
    let mut drained = false;
    for _ in 0..100 {
        let lags = bus.consumer_lag("test-events").await.unwrap();
        if lags.iter().all(|lag| lag.pending == 0 && lag.ack_pending == 0) {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(drained, "message was not acked");

    runtime.stop().await;
}

#[tokio::test]
async fn transient_failure_redelivers_until_success() {
    let bus = Arc::new(MemoryBusClient::new());
    let runtime = EventRuntime::builder(config(), bus.clone()).build().unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_inner = attempts.clone();
    runtime
        .subscribe(
            Subscriber::builder("flaky")
                .pattern("test.svc-a.orders.*")
                .handler(move |_message, _ctx| {
                    let attempts = attempts_inner.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(HandlerError::transient("first attempt times out"))
                        } else {
                            Ok(())
                        }
                    }
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    runtime.start().await.unwrap();
    runtime
        .publisher()
        .publish("orders.created", json!({"id": "o-1"}), PublishOptions::default())
        .await
        .unwrap();

    // First delivery naks with ~1s transient backoff, then succeeds.
    let done = wait_until(
        || attempts.load(Ordering::SeqCst) >= 2,
        Duration::from_secs(10),
    )
    .await;
    assert!(done, "redelivery never happened");

    runtime.stop().await;
}

#[tokio::test]
async fn poisoned_message_lands_on_dlq_stream() {
    let bus = Arc::new(MemoryBusClient::new());
    let runtime = EventRuntime::builder(
        RelayConfig {
            max_deliver: 2,
            ..config()
        },
        bus.clone(),
    )
    .build()
    .unwrap();

    runtime
        .subscribe(
            Subscriber::builder("poisoned")
                .pattern("test.svc-a.orders.*")
                .handler(|_message, _ctx| async {
                    Err(HandlerError::transient("always fails"))
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    runtime.start().await.unwrap();
    runtime
        .publisher()
        .publish("orders.created", json!({"id": "o-1"}), PublishOptions::default())
        .await
        .unwrap();

    // Delivery 1 naks (1s transient backoff); delivery 2 hits the limit and
    // dead-letters. The dead-letter subject is retained by the main stream.
    let bus_check = bus.clone();
    let dead_lettered = wait_until(
        move || {
            bus_check
                .messages("test-events")
                .iter()
                .any(|(subject, _, _)| subject == "test.events.dlq")
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(dead_lettered, "message never reached the DLQ subject");

    let dlq_messages: Vec<_> = bus
        .messages("test-events")
        .into_iter()
        .filter(|(subject, _, _)| subject == "test.events.dlq")
        .collect();
    assert_eq!(dlq_messages.len(), 1);
    assert_eq!(dlq_messages[0].1["x-dlq-reason"], "max_deliver_exceeded");

    runtime.stop().await;
}

#[tokio::test]
async fn mismatched_durable_is_recreated() {
    let bus = Arc::new(MemoryBusClient::new());
    let config = config();
    let runtime = EventRuntime::builder(config.clone(), bus.clone())
        .build()
        .unwrap();

    runtime
        .subscribe(
            Subscriber::builder("orders")
                .pattern("test.svc-a.orders.*")
                .handler(|_m, _c| async { Ok(()) })
                .build()
                .unwrap(),
        )
        .unwrap();

    // Pre-provision the stream and plant a durable with a stale ack wait.
    runtime.topology().provision().await.unwrap();
    let durable = durable_name("svc-a", "test.svc-a.orders.*");
    bus.create_consumer(&ConsumerSpec {
        stream: "test-events".to_string(),
        durable_name: durable.clone(),
        filter_subject: "test.svc-a.orders.*".to_string(),
        max_deliver: 99,
        ack_wait: Duration::from_secs(1),
        backoff: Vec::new(),
    })
    .await
    .unwrap();

    runtime.start().await.unwrap();

    let spec = bus
        .consumer_info("test-events", &durable)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(spec.max_deliver, config.max_deliver as i64);
    assert_eq!(spec.ack_wait, config.ack_wait());

    runtime.stop().await;
}
