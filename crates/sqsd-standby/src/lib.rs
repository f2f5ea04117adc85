//! Scheduler leadership.
//!
//! Only one daemon in a fleet should inject scheduled-job triggers. The
//! [`Leadership`] trait gates that work; [`RedisLease`] implements it with a
//! renewable Redis lock and [`AlwaysLeader`] serves single-instance setups.

use async_trait::async_trait;

mod error;
mod lease;

pub use error::{Result, StandbyError};
pub use lease::{AlwaysLeader, LeaseConfig, LeadershipStatus, RedisLease};

#[async_trait]
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Resolves once this instance holds leadership.
    async fn wait_for_leadership(&self);

    /// Give leadership up, e.g. after failing to publish a trigger, so that
    /// another instance can take over.
    async fn relinquish(&self);

    /// Stop renewing and release any held lease.
    async fn shutdown(&self);
}
