//! Adaptive poll controller.
//!
//! Every tick compares the local backlog with its target and issues enough
//! receive calls to close the gap. The target, the poller fan-out, the long
//! poll wait and delete batching are retuned from observed latency and idle
//! time, at most once per `poll_mode_switch_interval`.

use parking_lot::Mutex;
use sqsd_common::{Counter, Counters};
use sqsd_config::SqsdConfig;
use sqsd_queue::{QueueClient, ReceiveRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ack::AckBuffer;
use crate::dispatcher::MessageDispatcher;
use crate::http::HttpConnection;
use crate::latency::LatencyWindow;
use crate::pool::ConnectionPool;
use crate::workers::WorkerPool;

/// Backlog target above which a collapsed poller set expands again.
const EXPAND_BACKLOG_THRESHOLD: usize = 10;

/// How long before boot the last receive is assumed to have happened.
const BOOT_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub configured_pollers: usize,
    /// Whether the poller count was set explicitly and must not be autotuned.
    pub pollers_explicit: bool,
    pub max_batch: usize,
    pub http_connections: usize,
    pub backlog_size: Option<usize>,
    pub batch_delete: bool,
    pub batch_delete_size: usize,
    pub idle_delay: Duration,
    pub mode_switch_interval: Duration,
    pub slow: Duration,
    pub slowest: Duration,
    pub short_wait: u32,
    pub max_wait: u32,
    pub visibility_timeout: u64,
    pub poll_interval: Duration,
}

impl PollSettings {
    pub fn from_config(config: &SqsdConfig) -> Self {
        Self {
            configured_pollers: config.effective_concurrent_sqs_polls(),
            pollers_explicit: config.concurrent_sqs_polls.is_some(),
            max_batch: config.sqs_max_batch_size,
            http_connections: config.http_connections,
            backlog_size: config.backlog_size,
            batch_delete: config.sqs_batch_delete,
            batch_delete_size: config.sqs_batch_delete_size,
            idle_delay: config.idle_delay(),
            mode_switch_interval: config.mode_switch_interval(),
            slow: config.slow_threshold(),
            slowest: config.slowest_threshold(),
            short_wait: config.sqs_wait_time_seconds,
            max_wait: config.sqs_max_wait_time_seconds,
            visibility_timeout: config.visibility_timeout,
            poll_interval: config.poll_interval(),
        }
    }
}

/// Tunable controller state.
#[derive(Debug, Clone)]
pub struct PollState {
    pub pollers: usize,
    /// Last computed gap, bounding the per-call batch size during autotuning.
    pub batch_ceiling: usize,
    pub backlog_target: usize,
    pub autotuning: bool,
    pub ack_batching: bool,
    pub wait_time: u32,
    pub last_switch: Instant,
    pub last_received: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSwitch {
    /// No messages for a while: one poller, long waits.
    Collapse,
    /// Messages are flowing again: full poller set, short waits.
    Expand,
    StartAutotuning,
    StopAutotuning,
}

/// Observations the plan is computed from.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickInputs {
    /// Dispatches waiting for a free connection.
    pub waiting: usize,
    pub concurrent_http: usize,
    pub concurrent_queries: usize,
    pub avg_latency: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickPlan {
    /// Batch size of every receive call to issue.
    pub calls: Vec<usize>,
    pub switch: Option<ModeSwitch>,
    pub delta: i64,
}

impl PollState {
    /// Boot state: full poller set, then autotuning as if the application
    /// were as slow as `avg_latency` says.
    pub fn boot(settings: &PollSettings, avg_latency: Duration, now: Instant) -> Self {
        let pollers = settings.configured_pollers.max(1);
        let mut state = Self {
            pollers,
            batch_ceiling: settings.max_batch,
            backlog_target: settings
                .backlog_size
                .unwrap_or(pollers * settings.max_batch),
            autotuning: false,
            ack_batching: settings.batch_delete,
            wait_time: settings.short_wait,
            last_switch: now,
            last_received: now.checked_sub(BOOT_IDLE).unwrap_or(now),
        };
        state.start_autotuning(settings, avg_latency);
        state
    }

    fn start_autotuning(&mut self, settings: &PollSettings, avg_latency: Duration) {
        if settings.backlog_size.is_none() {
            self.backlog_target = if avg_latency < settings.slowest {
                settings.http_connections
            } else {
                0
            };
        }
        if !settings.pollers_explicit {
            let per_call = self.batch_ceiling.min(settings.max_batch);
            self.pollers = if per_call < settings.max_batch {
                1
            } else {
                self.backlog_target
                    .max(settings.http_connections)
                    .div_ceil(per_call)
                    .max(1)
            };
        }
        self.redetermine_batching(settings);
        self.autotuning = true;
    }

    fn stop_autotuning(&mut self, settings: &PollSettings) {
        self.pollers = settings.configured_pollers.max(1);
        self.batch_ceiling = settings.max_batch;
        self.backlog_target = settings
            .backlog_size
            .unwrap_or(self.pollers * settings.max_batch);
        self.redetermine_batching(settings);
        self.autotuning = false;
    }

    fn redetermine_batching(&mut self, settings: &PollSettings) {
        if settings.batch_delete {
            self.ack_batching = self.backlog_target >= settings.batch_delete_size;
        }
    }

    /// Apply at most one mode switch, rate limited by the switch interval.
    fn switch_mode(&mut self, settings: &PollSettings, inputs: &TickInputs, now: Instant) -> Option<ModeSwitch> {
        if now.duration_since(self.last_switch) <= settings.mode_switch_interval {
            return None;
        }
        let idle = now.duration_since(self.last_received);

        let switch = if idle > settings.idle_delay && self.pollers != 1 {
            self.pollers = 1;
            self.wait_time = settings.max_wait;
            ModeSwitch::Collapse
        } else if idle <= settings.idle_delay
            && self.pollers == 1
            && self.backlog_target > EXPAND_BACKLOG_THRESHOLD
        {
            self.pollers = settings.configured_pollers.max(1);
            self.wait_time = settings.short_wait;
            ModeSwitch::Expand
        } else if inputs.avg_latency > settings.slow {
            self.start_autotuning(settings, inputs.avg_latency);
            ModeSwitch::StartAutotuning
        } else if self.autotuning {
            self.stop_autotuning(settings);
            ModeSwitch::StopAutotuning
        } else {
            return None;
        };

        self.last_switch = now;
        Some(switch)
    }

    /// Decide this tick's receive calls.
    pub fn plan_tick(&mut self, settings: &PollSettings, inputs: TickInputs, now: Instant) -> TickPlan {
        let switch = self.switch_mode(settings, &inputs, now);

        let delta = if self.backlog_target == 0 {
            settings.http_connections as i64 - inputs.concurrent_http as i64
        } else {
            self.backlog_target as i64 - inputs.waiting as i64
        };
        self.batch_ceiling = delta.max(0) as usize;

        let mut plan = TickPlan {
            calls: Vec::new(),
            switch,
            delta,
        };
        if delta <= 0 {
            return plan;
        }

        let refill_fraction = if self.autotuning { 0.5 } else { 0.2 };
        if (delta as f64) < self.backlog_target as f64 * refill_fraction {
            return plan;
        }

        let max_batch = settings.max_batch.max(1);
        let wanted = (delta as usize).div_ceil(max_batch).max(1);
        let mut remaining = delta as usize;
        for _ in 0..wanted {
            if inputs.concurrent_queries + plan.calls.len() >= self.pollers {
                debug!(
                    pollers = self.pollers,
                    in_flight = inputs.concurrent_queries + plan.calls.len(),
                    "Poller ceiling reached, skipping remaining receive calls"
                );
                break;
            }
            let size = remaining.min(max_batch);
            plan.calls.push(size);
            remaining -= size;
        }
        plan
    }
}

pub struct PollController {
    settings: PollSettings,
    state: Mutex<PollState>,
    queue: Arc<dyn QueueClient>,
    dispatcher: Arc<MessageDispatcher>,
    pool: Arc<ConnectionPool<HttpConnection>>,
    counters: Arc<Counters>,
    latency: Arc<LatencyWindow>,
    acks: AckBuffer,
    workers: WorkerPool,
}

impl PollController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: PollSettings,
        queue: Arc<dyn QueueClient>,
        dispatcher: Arc<MessageDispatcher>,
        pool: Arc<ConnectionPool<HttpConnection>>,
        counters: Arc<Counters>,
        latency: Arc<LatencyWindow>,
        acks: AckBuffer,
        workers: WorkerPool,
    ) -> Self {
        let state = PollState::boot(&settings, latency.average(), Instant::now());
        acks.set_batching(state.ack_batching);
        info!(
            pollers = state.pollers,
            backlog_target = state.backlog_target,
            ack_batching = state.ack_batching,
            "Poll controller started in autotuning mode"
        );
        Self {
            settings,
            state: Mutex::new(state),
            queue,
            dispatcher,
            pool,
            counters,
            latency,
            acks,
            workers,
        }
    }

    pub fn state(&self) -> PollState {
        self.state.lock().clone()
    }

    /// Run one control step and start the receive calls it asks for.
    pub fn tick(self: &Arc<Self>) -> TickPlan {
        let inputs = TickInputs {
            waiting: self.pool.waiting(),
            concurrent_http: self.counters.get(Counter::ConcurrentHttpRequests).max(0) as usize,
            concurrent_queries: self.counters.get(Counter::ConcurrentSqsQueries).max(0) as usize,
            avg_latency: self.latency.average(),
        };

        let (plan, wait_time, ack_batching) = {
            let mut state = self.state.lock();
            let plan = state.plan_tick(&self.settings, inputs, Instant::now());
            if let Some(switch) = plan.switch {
                info!(
                    switch = ?switch,
                    pollers = state.pollers,
                    backlog_target = state.backlog_target,
                    wait_time = state.wait_time,
                    avg_latency_ms = inputs.avg_latency.as_millis() as u64,
                    "Poll mode switched"
                );
            }
            (plan, state.wait_time, state.ack_batching)
        };

        if plan.switch.is_some() {
            self.acks.set_batching(ack_batching);
        }
        if !plan.calls.is_empty() {
            debug!(
                delta = plan.delta,
                calls = plan.calls.len(),
                waiting = inputs.waiting,
                in_flight_queries = inputs.concurrent_queries,
                "Issuing receive calls"
            );
        }

        for &size in &plan.calls {
            self.counters.increase(Counter::ConcurrentSqsQueries);
            let controller = self.clone();
            let request = ReceiveRequest {
                max_messages: size,
                wait_time_seconds: wait_time,
                visibility_timeout: self.settings.visibility_timeout,
            };
            self.workers
                .spawn(async move { controller.receive(request).await });
        }
        plan
    }

    async fn receive(self: Arc<Self>, request: ReceiveRequest) {
        let messages = match self.queue.receive(request).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(category = "sqs-err", error = %e, "Receive call failed");
                Vec::new()
            }
        };
        self.counters.decrease(Counter::ConcurrentSqsQueries);

        if messages.is_empty() {
            return;
        }
        self.counters
            .increase_by(Counter::MessagesReceived, messages.len() as i64);
        self.state.lock().last_received = Instant::now();

        for message in messages {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(message).await;
            });
        }
    }

    /// Spawn the tick loop. It stops issuing receives once shutdown is signalled.
    pub fn start(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.settings.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        controller.tick();
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Polling stopped");
                        break;
                    }
                }
            }
        })
    }
}
