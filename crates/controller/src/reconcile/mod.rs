//! Reconciler boundary
//!
//! The business logic of a controller lives behind the [`Reconciler`]
//! trait: one async function from a key and the latest cached snapshot
//! (absent means deleted) to success or a transient error. The controller
//! guarantees it is never called concurrently for the same key, and may
//! call it repeatedly with the same or stale state — implementations must
//! be idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::stream::{Resource, ResourceKey};

/// Error type for reconcile failures
///
/// Every reconcile error is transient from the controller's point of view:
/// it is retried with backoff up to the configured threshold and then
/// dropped, never escalated to a process failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileError {
    /// Error message
    pub message: String,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ReconcileError {
    /// Create an error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ReconcileError {}

impl From<anyhow::Error> for ReconcileError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Drives one resource toward its desired state
///
/// # Example
///
/// ```ignore
/// use keel_controller::prelude::*;
///
/// struct EndpointReconciler {
///     backend: BackendClient,
/// }
///
/// #[async_trait]
/// impl Reconciler<Endpoint> for EndpointReconciler {
///     async fn reconcile(
///         &self,
///         key: &ResourceKey,
///         endpoint: Option<Arc<Endpoint>>,
///     ) -> Result<(), ReconcileError> {
///         match endpoint {
///             Some(ep) => self.backend.ensure_registered(key, &ep).await?,
///             None => self.backend.deregister(key).await?,
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Reconciler<R: Resource>: Send + Sync + 'static {
    /// Converge the resource named by `key` toward `resource`
    ///
    /// `None` means the resource was deleted; implementations tear down
    /// whatever they own for the key.
    async fn reconcile(
        &self,
        key: &ResourceKey,
        resource: Option<Arc<R>>,
    ) -> Result<(), ReconcileError>;
}

/// Plain async functions and closures are reconcilers
#[async_trait]
impl<R, F, Fut> Reconciler<R> for F
where
    R: Resource,
    F: Fn(ResourceKey, Option<Arc<R>>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), ReconcileError>> + Send,
{
    async fn reconcile(
        &self,
        key: &ResourceKey,
        resource: Option<Arc<R>>,
    ) -> Result<(), ReconcileError> {
        self(key.clone(), resource).await
    }
}
