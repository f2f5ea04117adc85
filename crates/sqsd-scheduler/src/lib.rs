//! Scheduled-job triggers for the sqsd worker daemon.
//!
//! - [`schedule`]: `cron.yaml` loading and validation
//! - [`scheduler`]: the [`CronScheduler`] that publishes trigger messages to
//!   the work queue while this instance holds leadership
//!
//! Triggers travel through the same queue as ordinary work, so they are
//! dispatched, retried and deduplicated like any other message.

pub mod error;
pub mod schedule;
pub mod scheduler;

pub use error::{Result, ScheduleError};
pub use schedule::{JobSchedule, ScheduledJob};
pub use scheduler::{trigger_message, CronScheduler, TRIGGER_BODY};
