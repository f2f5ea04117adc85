//! Redis-backed leadership lease.
//!
//! `SET key instance NX EX ttl` acquires the lease; a compare-and-expire
//! script renews it every third of the TTL. After relinquishing, an instance
//! sits out one full TTL before competing again.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, StandbyError};
use crate::Leadership;

const RENEW_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("EXPIRE", KEYS[1], ARGV[2])
        return 1
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("DEL", KEYS[1])
        return 1
    else
        return 0
    end
"#;

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub redis_url: String,
    pub lock_key: String,
    pub ttl_seconds: u64,
    pub instance_id: String,
}

impl LeaseConfig {
    pub fn new(redis_url: impl Into<String>, lock_key: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            redis_url: redis_url.into(),
            lock_key: lock_key.into(),
            ttl_seconds: ttl_seconds.max(3),
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Renewal cadence: a third of the TTL so two renewals can fail before expiry.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs((self.ttl_seconds / 3).max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipStatus {
    Leader,
    Follower,
    Unknown,
}

pub struct RedisLease {
    config: LeaseConfig,
    conn: ConnectionManager,
    is_leader: AtomicBool,
    running: AtomicBool,
    cooldown: Cooldown,
    shutdown_tx: broadcast::Sender<()>,
    status_tx: watch::Sender<LeadershipStatus>,
}

impl RedisLease {
    pub async fn connect(config: LeaseConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| StandbyError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let (status_tx, _) = watch::channel(LeadershipStatus::Unknown);

        Ok(Self {
            config,
            conn,
            is_leader: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cooldown: Cooldown::default(),
            shutdown_tx,
            status_tx,
        })
    }

    /// Spawn the acquire/renew loop.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StandbyError::AlreadyRunning);
        }
        info!(
            instance_id = %self.config.instance_id,
            lock_key = %self.config.lock_key,
            "Starting scheduler leadership lease"
        );

        let lease = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(lease.config.renew_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => lease.tick().await,
                    _ = shutdown_rx.recv() => {
                        lease.release().await;
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    pub fn status(&self) -> LeadershipStatus {
        *self.status_tx.borrow()
    }

    async fn tick(&self) {
        let mut conn = self.conn.clone();
        if self.is_leader() {
            match self.renew(&mut conn).await {
                Ok(true) => debug!(instance_id = %self.config.instance_id, "Renewed leadership lease"),
                Ok(false) => self.set_status(LeadershipStatus::Follower),
                Err(e) => {
                    error!(error = %e, "Failed to renew leadership lease");
                    self.set_status(LeadershipStatus::Follower);
                }
            }
            return;
        }

        if self.cooldown.active() {
            return;
        }
        match self.try_acquire(&mut conn).await {
            Ok(true) => self.set_status(LeadershipStatus::Leader),
            Ok(false) => self.set_status(LeadershipStatus::Follower),
            Err(e) => {
                warn!(error = %e, "Failed to acquire leadership lease");
                self.set_status(LeadershipStatus::Unknown);
            }
        }
    }

    async fn try_acquire(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.config.ttl_seconds)
            .query_async(conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn renew(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let renewed: i32 = redis::Script::new(RENEW_SCRIPT)
            .key(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .arg(self.config.ttl_seconds)
            .invoke_async(conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self) {
        if !self.is_leader() {
            return;
        }
        let mut conn = self.conn.clone();
        match redis::Script::new(RELEASE_SCRIPT)
            .key(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .invoke_async::<i32>(&mut conn)
            .await
        {
            Ok(1) => info!(instance_id = %self.config.instance_id, "Released leadership lease"),
            Ok(_) => debug!(instance_id = %self.config.instance_id, "Lease already gone"),
            Err(e) => error!(error = %e, "Failed to release leadership lease"),
        }
        self.set_status(LeadershipStatus::Follower);
    }

    fn set_status(&self, status: LeadershipStatus) {
        let now_leader = status == LeadershipStatus::Leader;
        let was_leader = self.is_leader.swap(now_leader, Ordering::SeqCst);
        self.status_tx.send_replace(status);

        if was_leader != now_leader {
            if now_leader {
                info!(instance_id = %self.config.instance_id, "Became scheduler leader");
            } else {
                info!(instance_id = %self.config.instance_id, "No longer scheduler leader");
            }
        }
    }
}

#[async_trait]
impl Leadership for RedisLease {
    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    async fn wait_for_leadership(&self) {
        let mut rx = self.status_tx.subscribe();
        while *rx.borrow_and_update() != LeadershipStatus::Leader {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn relinquish(&self) {
        self.cooldown
            .start(Duration::from_secs(self.config.ttl_seconds));
        self.release().await;
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

/// Leadership for a single instance: always the leader.
#[derive(Debug, Default)]
pub struct AlwaysLeader;

#[async_trait]
impl Leadership for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }

    async fn wait_for_leadership(&self) {}

    async fn relinquish(&self) {
        warn!("Single-instance scheduler cannot hand leadership over");
    }

    async fn shutdown(&self) {}
}

/// A deadline before which lease acquisition is skipped.
#[derive(Debug, Default)]
struct Cooldown(Mutex<Option<Instant>>);

impl Cooldown {
    fn start(&self, length: Duration) {
        *self.0.lock() = Some(Instant::now() + length);
    }

    fn active(&self) -> bool {
        self.0.lock().map_or(false, |until| Instant::now() < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renew_interval_is_a_third_of_ttl() {
        let config = LeaseConfig::new("redis://localhost:6379", "sqsd:leader", 30);
        assert_eq!(config.renew_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_ttl_floor() {
        let config = LeaseConfig::new("redis://localhost:6379", "sqsd:leader", 1);
        assert_eq!(config.ttl_seconds, 3);
        assert_eq!(config.renew_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_instances_get_distinct_ids() {
        let a = LeaseConfig::new("redis://a", "k", 30);
        let b = LeaseConfig::new("redis://a", "k", 30);
        assert_ne!(a.instance_id, b.instance_id);
    }

    #[tokio::test]
    async fn test_always_leader() {
        let leader = AlwaysLeader;
        leader.wait_for_leadership().await;
        assert!(leader.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_expires() {
        let cooldown = Cooldown::default();
        assert!(!cooldown.active());
        cooldown.start(Duration::from_secs(5));
        assert!(cooldown.active());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!cooldown.active());
    }
}
