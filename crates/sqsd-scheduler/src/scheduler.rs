//! Trigger injection loop.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use sqsd_common::message::{PATH_ATTRIBUTE, SCHEDULED_TIME_ATTRIBUTE, TASK_NAME_ATTRIBUTE};
use sqsd_common::AttributeValue;
use sqsd_engine::Scheduler;
use sqsd_queue::{OutgoingMessage, QueueClient};
use sqsd_standby::Leadership;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::schedule::{JobSchedule, ScheduledJob};

/// Body of every trigger message. The application only sees the headers.
pub const TRIGGER_BODY: &str = "elasticbeanstalk scheduled job";

/// Build the queue message announcing that `job` is due at `scheduled_at`.
pub fn trigger_message(job: &ScheduledJob, scheduled_at: DateTime<Utc>) -> OutgoingMessage {
    let mut attributes = IndexMap::new();
    attributes.insert(
        PATH_ATTRIBUTE.to_string(),
        AttributeValue::String(job.path.clone()),
    );
    attributes.insert(
        TASK_NAME_ATTRIBUTE.to_string(),
        AttributeValue::String(job.name.clone()),
    );
    attributes.insert(
        SCHEDULED_TIME_ATTRIBUTE.to_string(),
        AttributeValue::String(scheduled_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    OutgoingMessage {
        body: TRIGGER_BODY.to_string(),
        attributes,
    }
}

/// Sends a trigger message for every due task while this instance leads.
pub struct CronScheduler {
    runner: Arc<Runner>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Runner {
    schedule: JobSchedule,
    queue: Arc<dyn QueueClient>,
    leadership: Arc<dyn Leadership>,
    sent: AtomicU64,
}

impl CronScheduler {
    pub fn new(
        schedule: JobSchedule,
        queue: Arc<dyn QueueClient>,
        leadership: Arc<dyn Leadership>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            runner: Arc::new(Runner {
                schedule,
                queue,
                leadership,
                sent: AtomicU64::new(0),
            }),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Triggers published so far.
    pub fn sent(&self) -> u64 {
        self.runner.sent.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

#[async_trait]
impl Scheduler for CronScheduler {
    async fn start(&self) {
        if self.runner.schedule.is_empty() {
            info!("No scheduled tasks, scheduler not started");
            return;
        }
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("Scheduler already running");
            return;
        }
        info!(tasks = self.runner.schedule.len(), "Starting scheduler");
        let runner = self.runner.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move { runner.run(shutdown_rx).await }));
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler task ended abnormally");
            }
        }
        self.runner.leadership.shutdown().await;
        info!(sent = self.sent(), "Scheduler stopped");
    }
}

impl Runner {
    async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut last_fired: Option<DateTime<Utc>> = None;
        loop {
            tokio::select! {
                _ = self.leadership.wait_for_leadership() => {}
                _ = shutdown_rx.recv() => break,
            }

            // Never fire the same slot twice, even if the wall clock lags the timer.
            let now = Utc::now();
            let after = last_fired.map_or(now, |fired| fired.max(now));
            let Some((due_at, jobs)) = self.schedule.next_due(after) else {
                warn!("No scheduled task will ever fire again, scheduler exiting");
                break;
            };
            let wait = (due_at - now).to_std().unwrap_or_default();
            debug!(
                next_at = %due_at,
                wait_secs = wait.as_secs(),
                tasks = jobs.len(),
                "Waiting for next scheduled task"
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.recv() => break,
            }
            last_fired = Some(due_at);

            if !self.leadership.is_leader() {
                debug!(scheduled_at = %due_at, "Lost leadership before tasks were due");
                continue;
            }
            for job in jobs {
                if let Err(e) = self.send_trigger(job, due_at).await {
                    error!(
                        category = "scheduler",
                        task = %job.name,
                        error = %e,
                        "Failed to send scheduled task, giving up leadership"
                    );
                    self.leadership.relinquish().await;
                    break;
                }
            }
        }
        debug!("Scheduler loop exited");
    }

    async fn send_trigger(&self, job: &ScheduledJob, scheduled_at: DateTime<Utc>) -> Result<()> {
        let message_id = self
            .queue
            .send(trigger_message(job, scheduled_at))
            .await?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        info!(
            category = "scheduler",
            task = %job.name,
            path = %job.path,
            scheduled_at = %scheduled_at,
            message_id = %message_id,
            "Sent scheduled task"
        );
        Ok(())
    }
}
