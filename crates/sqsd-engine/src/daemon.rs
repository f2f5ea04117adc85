//! Daemon lifecycle: wiring, start and drain.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use sqsd_common::{Counters, CountersSnapshot};
use sqsd_config::SqsdConfig;
use sqsd_dedup::{DedupBackend, DedupSettings, DedupStore};
use sqsd_queue::{QueueClient, TimedQueue};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ack::{AckBuffer, AckSettings};
use crate::dispatcher::{DispatchSettings, MessageDispatcher};
use crate::error::EngineError;
use crate::http::{HttpConnection, HttpSettings};
use crate::latency::LatencyWindow;
use crate::poller::{PollController, PollSettings};
use crate::pool::ConnectionPool;
use crate::workers::WorkerPool;
use crate::Result;

/// Start/stop hook for the scheduled-job collaborator.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
}

/// Result of a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub timed_out: bool,
    /// Messages received but not completed when the drain ended.
    pub outstanding: i64,
    pub counters: CountersSnapshot,
}

pub struct Daemon {
    config: SqsdConfig,
    counters: Arc<Counters>,
    workers: WorkerPool,
    acks: AckBuffer,
    pool: Arc<ConnectionPool<HttpConnection>>,
    poller: Arc<PollController>,
    scheduler: Option<Arc<dyn Scheduler>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Daemon {
    /// Build every component. Connections are opened eagerly.
    pub fn new(
        config: SqsdConfig,
        queue: Arc<dyn QueueClient>,
        dedup_backend: Option<Arc<dyn DedupBackend>>,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Result<Self> {
        if config.dedup && dedup_backend.is_none() {
            return Err(EngineError::Config(
                "dedup is enabled but no dedup store was supplied".to_string(),
            ));
        }
        let queue: Arc<dyn QueueClient> =
            Arc::new(TimedQueue::new(queue, config.queue_call_timeout()));
        let counters = Arc::new(Counters::new());
        let workers = WorkerPool::new(config.threads);

        let http = HttpSettings {
            connect_timeout: config.connect_timeout(),
            inactivity_timeout: config.inactivity_timeout(),
            keepalive: config.keepalive,
        };
        let pool = Arc::new(ConnectionPool::new(config.http_connections, move || {
            HttpConnection::new(&http)
        })?);

        let latency = Arc::new(LatencyWindow::new(config.slowest_threshold()));
        let acks = AckBuffer::new(
            queue.clone(),
            workers.clone(),
            AckSettings {
                batch_size: config.sqs_batch_delete_size,
                batching: config.sqs_batch_delete,
                flush_interval: config.batch_delete_interval(),
            },
        );

        let dedup = dedup_backend.map(|backend| {
            Arc::new(DedupStore::new(
                backend,
                Arc::new(acks.clone()),
                counters.clone(),
                DedupSettings {
                    visibility_timeout: config.visibility(),
                    retention: config.retention(),
                    attempt_timeout: config.store_attempt_timeout(),
                },
            ))
        });

        let dispatcher = Arc::new(MessageDispatcher::new(
            DispatchSettings::from_config(&config),
            pool.clone(),
            dedup,
            acks.clone(),
            queue.clone(),
            counters.clone(),
            latency.clone(),
            workers.clone(),
        ));

        let poller = Arc::new(PollController::new(
            PollSettings::from_config(&config),
            queue,
            dispatcher,
            pool.clone(),
            counters.clone(),
            latency,
            acks.clone(),
            workers.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            counters,
            workers,
            acks,
            pool,
            poller,
            scheduler,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    pub fn poller(&self) -> Arc<PollController> {
        self.poller.clone()
    }

    /// Start the ack timer, the poll loop and the scheduler.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        {
            let mut tasks = self.tasks.lock();
            tasks.push(self.acks.start_timer(self.shutdown_tx.subscribe()));
            tasks.push(self.poller.start(self.shutdown_tx.subscribe()));
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.start().await;
        }

        info!(
            queue = %self.config.queue_url,
            target = %self.config.http_base_url(),
            http_connections = self.pool.capacity(),
            threads = self.workers.size(),
            dedup = self.config.dedup,
            version = sqsd_common::VERSION,
            "Worker daemon started"
        );
        Ok(())
    }

    /// Start, wait for `signal`, then drain.
    pub async fn run_until<F>(&self, signal: F) -> Result<DrainReport>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        info!("Shutdown requested, draining");
        Ok(self.drain().await)
    }

    /// Stop polling and wait, up to `drain_timeout`, for in-flight work.
    pub async fn drain(&self) -> DrainReport {
        let _ = self.shutdown_tx.send(());
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop().await;
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let deadline = Instant::now() + self.config.drain_deadline();
        let check = self.config.drain_check();
        let mut timed_out = false;
        loop {
            let outstanding = self.counters.outstanding();
            if outstanding <= 0 && self.workers.is_idle() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    outstanding,
                    background_tasks = self.workers.active(),
                    "Drain timeout elapsed with work still in flight"
                );
                timed_out = true;
                break;
            }
            debug!(
                outstanding,
                background_tasks = self.workers.active(),
                "Waiting for in-flight work"
            );
            tokio::time::sleep(check.min(deadline - now)).await;
        }

        self.acks.flush_all().await;
        if !timed_out {
            self.workers.wait_idle().await;
        }

        let counters = self.counters.snapshot();
        info!(
            timed_out,
            received = counters.messages_received,
            completed = counters.message_count,
            ok = counters.ok_count,
            errors = counters.error_count,
            duplicates = counters.dup_count,
            replaced_connections = self.pool.replaced(),
            "Drain finished"
        );
        DrainReport {
            timed_out,
            outstanding: self.counters.outstanding(),
            counters,
        }
    }
}
