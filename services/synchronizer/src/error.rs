//! Error types for the synchronizer.

use amsync_id::{AddressPoolId, ServiceId, ServiceInstanceId};
use amsync_networking::NetworkError;
use amsync_reconcile::{Classify, Disposition};
use thiserror::Error;

/// Result type for model store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the model store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("service instance {0} not found")]
    ServiceInstanceNotFound(ServiceInstanceId),

    #[error("service {0} not found")]
    ServiceNotFound(ServiceId),

    #[error("address pool {0} not found")]
    AddressPoolNotFound(AddressPoolId),

    #[error("address manager {service} unable to find addresspool {name}")]
    AddressPoolNameNotFound { service: ServiceId, name: String },

    #[error("record has no address pool")]
    MissingAddressPool,

    #[error("record has never been saved")]
    Unsaved,

    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl StoreError {
    /// Returns true if the address pool had nothing left to hand out.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, StoreError::Network(e) if e.is_exhausted())
    }
}

/// Errors raised while syncing a record to the fabric controller.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No controller to sync against.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The record does not resolve to any compute instance.
    #[error("map_tenant_to_route returned no data for {0}")]
    Mapping(String),

    /// A prerequisite is not in place yet; retry later.
    #[error("{0}")]
    Deferred(String),

    /// The node's data-plane tag holds something that is not an address.
    #[error("node {node} has invalid {tag} tag '{value}'")]
    InvalidTag {
        node: String,
        tag: &'static str,
        value: String,
    },

    /// The controller answered with a non-success status.
    #[error("controller returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Returns true if the error is retryable without counting as a failure.
    pub fn is_deferred(&self) -> bool {
        matches!(self, SyncError::Deferred(_))
    }
}

impl Classify for SyncError {
    fn disposition(&self) -> Disposition {
        match self {
            SyncError::Deferred(_) => Disposition::Deferred,
            SyncError::Configuration(_) => Disposition::PassFatal,
            _ => Disposition::ItemFailed,
        }
    }
}
