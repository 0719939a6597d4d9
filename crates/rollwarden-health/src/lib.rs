//! rollwarden-health — readiness verification for rolled-out replicas.
//!
//! The verifier polls the workload control API until the replicas of the
//! current plan step are ready, a replica is found crash-looping, or a
//! deadline elapses.
//!
//! # Architecture
//!
//! ```text
//! HealthVerifier::wait_ready()
//!   ├── retry_call(get_workload_state)   stage-level retry on blips
//!   ├── assess() → Assessment            pure, per snapshot
//!   └── CancelToken::sleep(interval)     cancellable wait between polls
//! ```
//!
//! A crash-looping replica ends polling early as `Unhealthy`: waiting
//! out the deadline cannot help it.

pub mod checker;
pub mod verifier;

pub use checker::{Assessment, HealthTarget, assess};
pub use verifier::{HealthError, HealthOutcome, HealthSettings, HealthVerifier};
