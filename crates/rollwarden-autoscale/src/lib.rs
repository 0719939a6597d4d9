//! rollwarden-autoscale — confirms the autoscaler settles after a rollout.
//!
//! The orchestrator does not reimplement autoscaling. It samples what the
//! autoscaler reports and checks that utilization stabilizes below the
//! scale-up threshold with the replica count inside its bounds.
//!
//! # Sampling
//!
//! ```text
//! every sample_interval, until window elapses:
//!     metrics missing      → tolerated until metrics_grace, then MetricsUnavailable
//!     util < threshold and
//!     min <= replicas <= max → counts toward stable_samples, then Stable
//!     otherwise            → Elevated at window end, with the projected
//!                            replica count ceil(current × util / threshold)
//! ```
//!
//! `MetricsUnavailable` is a soft verdict: the caller reports it as a
//! warning, never as a failure.

pub mod assess;
pub mod monitor;

pub use assess::{Sample, classify, projected_replicas};
pub use monitor::{AutoscaleError, AutoscaleMonitor, AutoscaleSettings, AutoscaleVerdict};
