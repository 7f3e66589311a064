//! Records the synchronizer reads from and writes to the model store.
//!
//! These are snapshots: the store hands out owned copies and takes them
//! back on save. Pool-derived fields on [`AddressManagerServiceInstance`]
//! are filled in by the store at read time.

use std::net::Ipv4Addr;

use amsync_id::{AddressPoolId, InstanceId, LinkId, NodeId, ServiceId, ServiceInstanceId};
use amsync_networking::{Ipv4Prefix, MacAddress};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Tag on a node carrying the IP used for data-plane traffic.
pub const DATAPLANE_IP_TAG: &str = "dataPlaneIp";

/// Attribute key of the legacy compute-instance linkage.
pub const TENANT_FOR_INSTANCE_ID: &str = "tenant_for_instance_id";

// =============================================================================
// Services
// =============================================================================

/// A service registered in the model store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub kind: ServiceKind,
}

/// Concrete service variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    /// The network fabric; `autoconfig` gates route pushing.
    Fabric { autoconfig: bool },

    /// An ONOS controller exposing a REST API.
    Onos(OnosService),

    /// The address manager owning pools and address service instances.
    AddressManager,

    /// Any other service, by kind name.
    Other { kind: String },
}

/// Fabric service singleton, as seen by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FabricService {
    pub id: ServiceId,
    pub autoconfig: bool,
}

/// REST coordinates and credentials of an ONOS controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnosService {
    pub rest_scheme: String,
    pub rest_hostname: String,
    pub rest_port: u16,
    pub rest_username: String,
    pub rest_password: String,
}

impl OnosService {
    /// Base URL of the REST API (`http://host:port`).
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.rest_scheme, self.rest_hostname, self.rest_port
        )
    }
}

// =============================================================================
// Service Instances
// =============================================================================

/// Gateway and addressing facts copied from a record's address pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub id: AddressPoolId,
    pub name: String,
    pub service: ServiceId,
    pub cidr: Option<Ipv4Prefix>,
    pub gateway_ip: Option<Ipv4Addr>,
    pub gateway_mac: Option<MacAddress>,
}

/// Gateway entry reported by an address manager service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gateway {
    pub gateway_ip: Option<Ipv4Addr>,
    pub gateway_mac: Option<MacAddress>,
}

/// Backend status code of a synced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendCode {
    /// Not enacted yet, or deferred.
    #[default]
    Pending = 0,

    /// Last attempt succeeded.
    Ok = 1,

    /// Last attempt failed.
    Error = 2,
}

/// Synchronization bookkeeping kept alongside each record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    /// Last time the record's desired state changed.
    pub updated: DateTime<Utc>,

    /// `updated` as of the last successful sync.
    pub enacted: Option<DateTime<Utc>>,

    pub backend_status: String,
    pub backend_code: BackendCode,

    /// Consecutive failed attempts.
    pub backoff_exponent: u32,

    /// Earliest time the record is eligible again after a failure.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Soft-delete marker; the delete pass purges the record.
    pub deleted: bool,
}

impl SyncStatus {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            updated: now,
            enacted: None,
            backend_status: String::new(),
            backend_code: BackendCode::Pending,
            backoff_exponent: 0,
            next_retry_at: None,
            deleted: false,
        }
    }

    /// True if the desired state has not been enacted since it last changed.
    pub fn needs_sync(&self) -> bool {
        self.enacted.map_or(true, |enacted| enacted < self.updated)
    }

    /// True if backoff allows another attempt at `now`.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// An address-manager service instance: one public IP/MAC pair bound to a
/// subscriber or a compute instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressManagerServiceInstance {
    /// Store-assigned identity; `None` until first persisted.
    pub id: Option<ServiceInstanceId>,
    pub owner: ServiceId,
    pub address_pool: Option<AddressPoolId>,
    pub public_ip: Option<Ipv4Addr>,
    pub public_mac: Option<MacAddress>,
    pub link_deleted_count: u32,

    /// Legacy linkage to a compute instance, used when no subscriber link
    /// exists.
    pub tenant_for_instance_id: Option<InstanceId>,

    /// Pool facts, filled in by the store when the record is read.
    pub pool: Option<PoolInfo>,

    pub sync: SyncStatus,
}

impl AddressManagerServiceInstance {
    /// A new, unsaved record drawing its address from `address_pool`.
    pub fn new(owner: ServiceId, address_pool: AddressPoolId) -> Self {
        Self {
            id: None,
            owner,
            address_pool: Some(address_pool),
            public_ip: None,
            public_mac: None,
            link_deleted_count: 0,
            tenant_for_instance_id: None,
            pool: None,
            sync: SyncStatus::new(Utc::now()),
        }
    }

    pub fn with_tenant_for_instance_id(mut self, instance: InstanceId) -> Self {
        self.tenant_for_instance_id = Some(instance);
        self
    }

    pub fn gateway_ip(&self) -> Option<Ipv4Addr> {
        self.pool.as_ref().and_then(|pool| pool.gateway_ip)
    }

    pub fn gateway_mac(&self) -> Option<MacAddress> {
        self.pool.as_ref().and_then(|pool| pool.gateway_mac)
    }

    pub fn cidr(&self) -> Option<Ipv4Prefix> {
        self.pool.as_ref().and_then(|pool| pool.cidr)
    }

    /// Number of bits in the network portion of the pool's CIDR.
    pub fn netbits(&self) -> Option<u8> {
        self.cidr().map(|cidr| cidr.prefix_len)
    }
}

impl std::fmt::Display for AddressManagerServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id {
            Some(id) => write!(f, "AddressManagerServiceInstance {}", id),
            None => write!(f, "AddressManagerServiceInstance <unsaved>"),
        }
    }
}

/// A service instance that consumes other instances and may run on a
/// compute instance (for example a vSG tenant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInstance {
    pub id: ServiceInstanceId,
    pub owner: ServiceId,
    pub instance: Option<InstanceId>,
}

/// The most specific variant behind a generic service-instance reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafModel {
    AddressManager(AddressManagerServiceInstance),
    Subscriber(SubscriberInstance),

    /// A service instance with no fields the synchronizer cares about
    /// (for example an ONOS app).
    Plain {
        id: ServiceInstanceId,
        owner: ServiceId,
        kind: String,
    },
}

impl LeafModel {
    pub fn owner(&self) -> ServiceId {
        match self {
            LeafModel::AddressManager(si) => si.owner,
            LeafModel::Subscriber(si) => si.owner,
            LeafModel::Plain { owner, .. } => *owner,
        }
    }

    /// Compute instance the leaf runs on, for variants that have one.
    pub fn instance(&self) -> Option<InstanceId> {
        match self {
            LeafModel::Subscriber(si) => si.instance,
            _ => None,
        }
    }
}

/// Dependency edge between two service instances: the provider serves the
/// subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstanceLink {
    pub id: LinkId,
    pub provider_service_instance: ServiceInstanceId,
    pub subscriber_service_instance: Option<ServiceInstanceId>,
    pub subscriber_service: Option<ServiceId>,
}

// =============================================================================
// Compute
// =============================================================================

/// A compute instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub instance_name: Option<String>,
    pub node: NodeId,
}

/// A compute node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
