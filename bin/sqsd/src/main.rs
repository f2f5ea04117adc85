//! sqsd worker daemon
//!
//! Long-polls an SQS queue and POSTs every message to a local HTTP
//! application, deleting it once the application answers 200.
//!
//! ## Usage
//!
//! ```text
//! sqsd [CONFIG_FILE]
//! ```
//!
//! Without an argument the config is looked up through `SQSD_CONFIG` and the
//! standard search paths. `SQSD_*` environment variables override file values.
//!
//! Optional features:
//! - **Deduplication**: `dedup = true` with a DynamoDB `dedup_table`
//! - **Scheduled tasks**: `schedule_file` pointing at a `cron.yaml`. Set
//!   `leader_redis_url` when several daemons share the queue so that only one
//!   of them publishes triggers.

use anyhow::{Context, Result};
use sqsd_common::logging::{init_logging, Verbosity};
use sqsd_config::{ConfigLoader, SqsdConfig};
use sqsd_dedup::dynamodb::DynamoDbDedupBackend;
use sqsd_dedup::DedupBackend;
use sqsd_engine::{Daemon, Scheduler};
use sqsd_queue::sqs::SqsQueueClient;
use sqsd_queue::{QueueClient, TimedQueue};
use sqsd_scheduler::{CronScheduler, JobSchedule};
use sqsd_standby::{AlwaysLeader, LeaseConfig, Leadership, RedisLease};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            init_logging("sqsd", Verbosity::Normal);
            error!(error = %e, "Invalid configuration");
            return Err(e);
        }
    };
    init_logging(
        "sqsd",
        Verbosity::from_flags(config.quiet, config.verbose, config.debug),
    );

    if let Err(e) = run(config).await {
        error!(error = format!("{:#}", e), "Worker daemon failed");
        return Err(e);
    }
    Ok(())
}

fn load_config() -> Result<SqsdConfig> {
    let loader = match std::env::args().nth(1) {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;
    config.validate()?;
    Ok(config)
}

async fn run(config: SqsdConfig) -> Result<()> {
    info!(
        version = sqsd_common::VERSION,
        queue = %config.queue_url,
        "Starting worker daemon"
    );

    let region = config.region()?;
    let mut aws = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.clone()));
    if let Some(endpoint) = config.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
        info!(endpoint = %endpoint, "Using custom AWS endpoint");
        aws = aws.endpoint_url(endpoint);
    }
    let aws = aws.load().await;
    info!(region = %region, "AWS configuration loaded");

    let queue: Arc<dyn QueueClient> = Arc::new(SqsQueueClient::new(
        aws_sdk_sqs::Client::new(&aws),
        config.queue_url.clone(),
    ));

    let dedup = match (config.dedup, config.dedup_table.as_deref()) {
        (true, Some(table)) => {
            let backend = DynamoDbDedupBackend::new(aws_sdk_dynamodb::Client::new(&aws), table);
            backend
                .ensure_table_exists()
                .await
                .with_context(|| format!("dedup table {} is not usable", table))?;
            Some(Arc::new(backend) as Arc<dyn DedupBackend>)
        }
        _ => None,
    };

    let scheduler = build_scheduler(
        &config,
        Arc::new(TimedQueue::new(queue.clone(), config.queue_call_timeout())),
    )
    .await?;

    let daemon = Daemon::new(config, queue, dedup, scheduler)?;
    let report = daemon.run_until(shutdown_signal()).await?;
    if report.timed_out {
        warn!(
            outstanding = report.outstanding,
            "Exiting with messages still in flight; they will be redelivered"
        );
    }
    info!("Worker daemon stopped");
    Ok(())
}

async fn build_scheduler(
    config: &SqsdConfig,
    queue: Arc<dyn QueueClient>,
) -> Result<Option<Arc<dyn Scheduler>>> {
    let Some(path) = config.schedule_file.as_deref() else {
        return Ok(None);
    };
    let Some(schedule) = JobSchedule::load(path)? else {
        return Ok(None);
    };
    if schedule.is_empty() {
        info!("Schedule file has no tasks, scheduler disabled");
        return Ok(None);
    }

    let leadership: Arc<dyn Leadership> = match config.leader_redis_url.as_deref() {
        Some(url) if !url.is_empty() => {
            let lease = Arc::new(
                RedisLease::connect(LeaseConfig::new(
                    url,
                    config.leader_lock_key.clone(),
                    config.leader_ttl,
                ))
                .await
                .context("failed to connect to the scheduler leadership store")?,
            );
            lease.start()?;
            lease as Arc<dyn Leadership>
        }
        _ => {
            info!("No leadership store configured, this instance always schedules");
            Arc::new(AlwaysLeader)
        }
    };

    Ok(Some(Arc::new(CronScheduler::new(schedule, queue, leadership))))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
