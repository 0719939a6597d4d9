//! rollwarden-registry — turn a requested image reference into an
//! immutable, digest-pinned one.
//!
//! # Components
//!
//! - **`client`** — OCI distribution API client (`HEAD` manifest → digest)
//! - **`resolver`** — validation, pinning, and stage-level retry on top of
//!   any [`Registry`](rollwarden_core::Registry)

pub mod client;
pub mod resolver;

pub use client::{BearerChallenge, HttpRegistry, parse_bearer_challenge};
pub use resolver::{ImageResolver, ResolveError};
