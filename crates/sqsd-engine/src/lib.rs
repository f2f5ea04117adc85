//! Adaptive dispatch engine for the sqsd worker daemon.
//!
//! - [`poller`]: tick-driven receive planning with latency autotuning
//! - [`dispatcher`]: the per-message expiry, dedup and HTTP delivery pipeline
//! - [`ack`]: batched acknowledgment buffer with a flush timer
//! - [`pool`]: fixed-capacity connection pool with replacement on failure
//! - [`workers`]: bounded pool for queue and store calls
//! - [`daemon`]: lifecycle and drain

pub mod ack;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod latency;
pub mod poller;
pub mod pool;
pub mod workers;

pub use ack::{AckBuffer, AckSettings};
pub use daemon::{Daemon, DrainReport, Scheduler};
pub use dispatcher::{
    build_headers, DispatchOutcome, DispatchSettings, FailureKind, MessageDispatcher,
    SkippedAttribute,
};
pub use error::EngineError;
pub use http::{HttpConnection, HttpError, HttpSettings};
pub use latency::LatencyWindow;
pub use poller::{ModeSwitch, PollController, PollSettings, PollState, TickInputs, TickPlan};
pub use pool::{ConnectionFailure, ConnectionPool};
pub use workers::WorkerPool;

pub type Result<T> = std::result::Result<T, EngineError>;
