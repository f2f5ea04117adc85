//! End-to-end daemon tests: poll, dispatch, acknowledge and drain against the
//! in-memory queue and a mock application.

use async_trait::async_trait;
use indexmap::IndexMap;
use sqsd_common::{Counter, Counters};
use sqsd_config::SqsdConfig;
use sqsd_dedup::{DedupBackend, MemoryDedupBackend};
use sqsd_engine::{Daemon, EngineError, Scheduler};
use sqsd_queue::MemoryQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const QUEUE_URL: &str = "https://sqs.us-east-1.amazonaws.com/123456789012/work-queue";

fn config(server: &MockServer) -> SqsdConfig {
    SqsdConfig {
        queue_url: QUEUE_URL.to_string(),
        http_url: "http://127.0.0.1".to_string(),
        http_port: server.address().port(),
        http_connections: 4,
        threads: 8,
        poll_timer: 0.01,
        batch_delete_timer: 0.05,
        drain_check_interval: 0.02,
        sqs_wait_time_seconds: 0,
        sqs_max_wait_time_seconds: 0,
        ..SqsdConfig::default()
    }
}

async fn wait_for(counters: &Counters, counter: Counter, value: i64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while counters.get(counter) < value {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {}", counter.name(), value));
}

#[derive(Default)]
struct RecordingScheduler {
    started: AtomicBool,
    stopped: AtomicBool,
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_messages_flow_through_and_are_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
    for i in 0..3 {
        queue.push(format!("{{\"n\":{}}}", i), IndexMap::new());
    }

    let daemon = Daemon::new(config(&server), queue.clone(), None, None).unwrap();
    let counters = daemon.counters();
    daemon.start().await.unwrap();
    wait_for(&counters, Counter::OkCount, 3).await;

    let report = daemon.drain().await;
    assert!(!report.timed_out);
    assert_eq!(report.outstanding, 0);
    assert_eq!(report.counters.messages_received, 3);
    assert_eq!(report.counters.ok_count, 3);
    assert!(queue.is_empty());
    assert_eq!(queue.deleted_ids().len(), 3);
}

#[tokio::test]
async fn test_drain_waits_for_in_flight_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
    queue.push("{}", IndexMap::new());

    let daemon = Daemon::new(config(&server), queue.clone(), None, None).unwrap();
    let counters = daemon.counters();
    daemon.start().await.unwrap();
    wait_for(&counters, Counter::MessagesReceived, 1).await;

    let report = daemon.drain().await;
    assert!(!report.timed_out);
    assert_eq!(report.counters.ok_count, 1);
    assert_eq!(queue.deleted_ids().len(), 1);
}

#[tokio::test]
async fn test_drain_gives_up_after_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
    queue.push("{}", IndexMap::new());

    let config = SqsdConfig {
        drain_timeout: 0.2,
        ..config(&server)
    };
    let daemon = Daemon::new(config, queue.clone(), None, None).unwrap();
    let counters = daemon.counters();
    daemon.start().await.unwrap();
    wait_for(&counters, Counter::MessagesReceived, 1).await;

    let started = std::time::Instant::now();
    let report = daemon.drain().await;
    assert!(report.timed_out);
    assert_eq!(report.outstanding, 1);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(queue.deleted_ids().is_empty());
}

#[tokio::test]
async fn test_failed_dispatch_is_not_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
    queue.push("{}", IndexMap::new());
    let backend = Arc::new(MemoryDedupBackend::new());

    let config = SqsdConfig {
        dedup: true,
        dedup_table: Some("sqsd-dedup".to_string()),
        ..config(&server)
    };
    let daemon = Daemon::new(
        config,
        queue.clone(),
        Some(backend.clone() as Arc<dyn DedupBackend>),
        None,
    )
    .unwrap();
    let counters = daemon.counters();
    daemon.start().await.unwrap();
    wait_for(&counters, Counter::ErrorCount, 1).await;

    let report = daemon.drain().await;
    assert_eq!(report.counters.error_count, 1);
    assert_eq!(report.counters.ok_count, 0);
    assert!(queue.deleted_ids().is_empty());
    assert_eq!(queue.len(), 1);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn test_scheduler_hook_follows_lifecycle() {
    let server = MockServer::start().await;
    let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
    let scheduler = Arc::new(RecordingScheduler::default());

    let daemon = Daemon::new(
        config(&server),
        queue,
        None,
        Some(scheduler.clone() as Arc<dyn Scheduler>),
    )
    .unwrap();

    let report = daemon
        .run_until(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        })
        .await
        .unwrap();

    assert!(scheduler.started.load(Ordering::SeqCst));
    assert!(scheduler.stopped.load(Ordering::SeqCst));
    assert!(!report.timed_out);
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let server = MockServer::start().await;
    let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
    let daemon = Daemon::new(config(&server), queue, None, None).unwrap();

    daemon.start().await.unwrap();
    assert!(matches!(daemon.start().await, Err(EngineError::AlreadyStarted)));
    daemon.drain().await;
}

#[tokio::test]
async fn test_dedup_without_backend_is_a_config_error() {
    let server = MockServer::start().await;
    let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
    let config = SqsdConfig {
        dedup: true,
        dedup_table: Some("sqsd-dedup".to_string()),
        ..config(&server)
    };
    assert!(matches!(
        Daemon::new(config, queue, None, None),
        Err(EngineError::Config(_))
    ));
}

#[tokio::test]
async fn test_failed_receives_count_as_empty_and_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
    queue.set_fail_receives(true);
    queue.push("{}", IndexMap::new());

    let daemon = Daemon::new(config(&server), queue.clone(), None, None).unwrap();
    let counters = daemon.counters();
    daemon.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.receive_calls() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("receive never retried");
    assert_eq!(counters.get(Counter::MessagesReceived), 0);

    queue.set_fail_receives(false);
    wait_for(&counters, Counter::OkCount, 1).await;

    let report = daemon.drain().await;
    assert!(!report.timed_out);
    assert_eq!(report.counters.messages_received, 1);
    assert_eq!(counters.get(Counter::ConcurrentSqsQueries), 0);
    assert_eq!(queue.deleted_ids().len(), 1);
}

#[tokio::test]
async fn test_tick_respects_in_flight_receive_ceiling() {
    let server = MockServer::start().await;
    let queue = Arc::new(MemoryQueue::new(QUEUE_URL));
    let daemon = Daemon::new(config(&server), queue.clone(), None, None).unwrap();
    let counters = daemon.counters();
    let poller = daemon.poller();

    let pollers = poller.state().pollers as i64;
    assert!(pollers >= 1);

    // Every poller slot is taken by a receive already in flight.
    counters.increase_by(Counter::ConcurrentSqsQueries, pollers);
    let plan = poller.tick();
    assert!(plan.delta > 0);
    assert!(plan.calls.is_empty());
    assert_eq!(queue.receive_calls(), 0);

    counters.decrease(Counter::ConcurrentSqsQueries);
    let plan = poller.tick();
    assert_eq!(plan.calls.len(), 1);

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.receive_calls() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("receive never issued");
}
