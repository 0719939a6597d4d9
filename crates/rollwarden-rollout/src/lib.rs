//! rollwarden-rollout — deciding whether to roll, and rolling.
//!
//! # Components
//!
//! - **`detector`** — pure change detection over (desired spec, observed state)
//! - **`plan`** — rollout plan derivation under the surge/unavailable budgets
//! - **`controller`** — executes a plan step by step, gated on readiness

pub mod controller;
pub mod detector;
pub mod plan;

pub use controller::{
    Rollout, RolloutController, RolloutError, RolloutOutcome, RolloutPhase, RolloutSettings,
    StallCause,
};
pub use detector::{ChangeReason, Decision, detect};
pub use plan::{RolloutPlan, RolloutStep};
