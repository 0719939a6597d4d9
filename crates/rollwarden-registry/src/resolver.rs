//! Image reference resolution.
//!
//! A tag is mutable; the rest of an orchestration run needs to know
//! exactly which artifact it deploys. The resolver validates the
//! reference, asks the registry for the digest behind the tag, and
//! returns the reference pinned to that digest. References that already
//! carry a digest are returned without touching the registry.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use rollwarden_core::{
    CancelToken, ImageReference, PollTracker, ReferenceError, Registry, RegistryError, RetryError,
    retry_call,
};

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Invalid(#[from] ReferenceError),

    #[error("image not found: {0}")]
    NotFound(String),

    #[error("registry access denied: {0}")]
    Denied(String),

    /// The registry stayed unreachable through every stage-level retry.
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    #[error("registry protocol error: {0}")]
    Protocol(String),

    #[error("resolution cancelled")]
    Cancelled,
}

impl From<RegistryError> for ResolveError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(s) => ResolveError::NotFound(s),
            RegistryError::Unauthorized(s) => ResolveError::Denied(s),
            RegistryError::Unreachable(s) => ResolveError::Unreachable(s),
            RegistryError::Protocol(s) => ResolveError::Protocol(s),
        }
    }
}

/// Resolves requested references to digest-pinned ones.
pub struct ImageResolver {
    registry: Arc<dyn Registry>,
    poll_retries: u32,
    poll_backoff: Duration,
}

impl ImageResolver {
    pub fn new(registry: Arc<dyn Registry>, poll_retries: u32, poll_backoff: Duration) -> Self {
        Self {
            registry,
            poll_retries,
            poll_backoff,
        }
    }

    /// Parse `requested` and pin it to a digest.
    pub async fn resolve(
        &self,
        requested: &str,
        cancel: &mut CancelToken,
    ) -> Result<ImageReference, ResolveError> {
        let reference = ImageReference::parse(requested)?;
        self.pin(&reference, cancel).await
    }

    /// Pin an already parsed reference.
    pub async fn pin(
        &self,
        reference: &ImageReference,
        cancel: &mut CancelToken,
    ) -> Result<ImageReference, ResolveError> {
        if reference.is_pinned() {
            debug!(reference = %reference, "reference already pinned");
            return Ok(reference.clone());
        }

        let mut tracker = PollTracker::new(self.poll_retries, self.poll_backoff);
        let registry = &self.registry;
        let digest = retry_call(&mut tracker, cancel, RegistryError::is_transient, || {
            registry.resolve_reference(reference)
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted(e) => ResolveError::from(e),
            RetryError::Cancelled => ResolveError::Cancelled,
        })?;

        info!(reference = %reference, digest = %digest.short(), "resolved image");
        Ok(reference.pinned(digest))
    }
}
