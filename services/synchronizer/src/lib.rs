//! Address-manager synchronizer.
//!
//! Hands out public addresses from address pools to service instances and
//! pushes a host route for each one to the fabric's ONOS controller.
//!
//! ## Architecture
//!
//! - **Store**: model records, address pools and sync bookkeeping
//!   ([`store::MemoryStore`] behind the [`store::ModelAccessor`] and
//!   [`store::ModelWriter`] traits)
//! - **Policy**: deletes records whose last provided link went away
//! - **Sync step**: filters eligible records, maps each to a route and posts
//!   it to ONOS
//! - **Worker**: runs the step on a fixed interval

pub mod config;
pub mod eligibility;
pub mod error;
pub mod mapper;
pub mod model_file;
pub mod models;
pub mod onos;
pub mod policy;
pub mod provisioning;
pub mod resolver;
pub mod step;
pub mod store;
pub mod worker;

pub use error::{StoreError, SyncError};
pub use models::AddressManagerServiceInstance;
pub use step::SyncAddressManagerServiceInstance;
pub use store::{MemoryStore, ModelAccessor, ModelEvent, ModelWriter};
pub use worker::SyncWorker;
