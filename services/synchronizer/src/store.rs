//! Model store interfaces and the in-memory store.
//!
//! The synchronizer core only talks to [`ModelAccessor`] (reads) and
//! [`ModelWriter`] (writes). [`MemoryStore`] implements both and is what the
//! binary and the tests run against.
//!
//! Every address-pool mutation happens under the store's write lock, so
//! allocation and release are atomic per pool no matter how many callers
//! create records concurrently.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use amsync_id::{AddressPoolId, InstanceId, LinkId, NodeId, ServiceId, ServiceInstanceId};
use amsync_networking::{derive_mac, AddressPool, MacAddress};
use amsync_reconcile::{Backoff, Outcome, OutcomeSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::models::{
    AddressManagerServiceInstance, BackendCode, FabricService, Instance, LeafModel, Node,
    PoolInfo, Service, ServiceInstanceLink, ServiceKind, SubscriberInstance, SyncStatus,
    TENANT_FOR_INSTANCE_ID,
};

/// Commit notifications for address-manager service instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelEvent {
    Created(ServiceInstanceId),
    Updated(ServiceInstanceId),
    Deleted(ServiceInstanceId),
}

/// Read side of the model store.
#[async_trait]
pub trait ModelAccessor: Send + Sync {
    /// The fabric service singleton (the first one registered).
    async fn fabric_service(&self) -> StoreResult<Option<FabricService>>;

    async fn service(&self, id: ServiceId) -> StoreResult<Option<Service>>;

    /// Links whose subscriber side is `service`.
    async fn subscribed_links(&self, service: ServiceId) -> StoreResult<Vec<ServiceInstanceLink>>;

    /// Links whose provider side is `provider`.
    async fn provided_links(
        &self,
        provider: ServiceInstanceId,
    ) -> StoreResult<Vec<ServiceInstanceLink>>;

    /// Concrete variant behind a service-instance reference.
    async fn leaf_model(&self, id: ServiceInstanceId) -> StoreResult<Option<LeafModel>>;

    /// A live (not deleted) address-manager service instance.
    async fn service_instance(
        &self,
        id: ServiceInstanceId,
    ) -> StoreResult<Option<AddressManagerServiceInstance>>;

    /// Pools owned by `service`.
    async fn address_pools(&self, service: ServiceId) -> StoreResult<Vec<PoolInfo>>;

    async fn instance(&self, id: InstanceId) -> StoreResult<Option<Instance>>;

    async fn node(&self, id: NodeId) -> StoreResult<Option<Node>>;

    /// Value of the tag `name` on `node`.
    async fn node_tag(&self, node: NodeId, name: &str) -> StoreResult<Option<String>>;

    /// Address-manager records awaiting sync, or awaiting purge when
    /// `deleted`. Records still in failure backoff are left out.
    async fn fetch_pending(
        &self,
        deleted: bool,
    ) -> StoreResult<Vec<AddressManagerServiceInstance>>;
}

/// Write side of the model store.
#[async_trait]
pub trait ModelWriter: Send + Sync {
    /// Persist a record. A record with no identity and no address is given
    /// one from its pool first; if the pool is empty nothing is persisted.
    async fn save_service_instance(
        &self,
        record: AddressManagerServiceInstance,
    ) -> StoreResult<AddressManagerServiceInstance>;

    /// Delete a service instance. Address-manager records return their
    /// address to the pool and stay behind, marked deleted, until the delete
    /// pass purges them. Deleting an already deleted record is a no-op.
    async fn delete_service_instance(&self, id: ServiceInstanceId) -> StoreResult<()>;

    /// Remove a link, counting it against the provider.
    async fn delete_link(&self, id: LinkId) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
struct PoolRow {
    id: AddressPoolId,
    service: ServiceId,
    pool: AddressPool,
}

impl PoolRow {
    fn info(&self) -> PoolInfo {
        PoolInfo {
            id: self.id,
            name: self.pool.name().to_string(),
            service: self.service,
            cidr: self.pool.cidr(),
            gateway_ip: self.pool.gateway_ip(),
            gateway_mac: self.pool.gateway_mac(),
        }
    }
}

#[derive(Debug, Clone)]
enum RowKind {
    AddressManager {
        address_pool: Option<AddressPoolId>,
        public_ip: Option<Ipv4Addr>,
        public_mac: Option<MacAddress>,
    },
    Subscriber {
        instance: Option<InstanceId>,
    },
    Plain {
        kind: String,
    },
}

#[derive(Debug, Clone)]
struct ServiceInstanceRow {
    id: ServiceInstanceId,
    owner: ServiceId,
    link_deleted_count: u32,
    /// Free-form service-specific attributes.
    attributes: Map<String, Value>,
    kind: RowKind,
    sync: SyncStatus,
}

impl ServiceInstanceRow {
    fn is_address_manager(&self) -> bool {
        matches!(self.kind, RowKind::AddressManager { .. })
    }
}

#[derive(Debug, Clone)]
struct Tag {
    node: NodeId,
    name: String,
    value: String,
}

#[derive(Debug)]
struct Inner {
    next_service: ServiceId,
    next_pool: AddressPoolId,
    next_service_instance: ServiceInstanceId,
    next_link: LinkId,
    next_instance: InstanceId,
    next_node: NodeId,

    services: BTreeMap<ServiceId, Service>,
    pools: BTreeMap<AddressPoolId, PoolRow>,
    service_instances: BTreeMap<ServiceInstanceId, ServiceInstanceRow>,
    links: BTreeMap<LinkId, ServiceInstanceLink>,
    instances: BTreeMap<InstanceId, Instance>,
    nodes: BTreeMap<NodeId, Node>,
    tags: Vec<Tag>,
}

impl Inner {
    fn new() -> Self {
        Self {
            next_service: ServiceId::FIRST,
            next_pool: AddressPoolId::FIRST,
            next_service_instance: ServiceInstanceId::FIRST,
            next_link: LinkId::FIRST,
            next_instance: InstanceId::FIRST,
            next_node: NodeId::FIRST,
            services: BTreeMap::new(),
            pools: BTreeMap::new(),
            service_instances: BTreeMap::new(),
            links: BTreeMap::new(),
            instances: BTreeMap::new(),
            nodes: BTreeMap::new(),
            tags: Vec::new(),
        }
    }

    fn allocate_service_instance_id(&mut self) -> ServiceInstanceId {
        let id = self.next_service_instance;
        self.next_service_instance = id.next();
        id
    }

    /// Snapshot of an address-manager row with its pool facts attached.
    fn address_record(&self, row: &ServiceInstanceRow) -> Option<AddressManagerServiceInstance> {
        let RowKind::AddressManager {
            address_pool,
            public_ip,
            public_mac,
        } = &row.kind
        else {
            return None;
        };

        Some(AddressManagerServiceInstance {
            id: Some(row.id),
            owner: row.owner,
            address_pool: *address_pool,
            public_ip: *public_ip,
            public_mac: *public_mac,
            link_deleted_count: row.link_deleted_count,
            tenant_for_instance_id: tenant_for_instance_id(&row.attributes),
            pool: address_pool
                .and_then(|pool_id| self.pools.get(&pool_id))
                .map(PoolRow::info),
            sync: row.sync.clone(),
        })
    }

    /// Remove a link; if its provider is still live, count the loss
    /// against it and return the provider.
    fn remove_link(&mut self, id: LinkId, now: DateTime<Utc>) -> Option<ServiceInstanceId> {
        let link = self.links.remove(&id)?;
        let provider = self
            .service_instances
            .get_mut(&link.provider_service_instance)
            .filter(|row| !row.sync.deleted)?;

        provider.link_deleted_count += 1;
        provider.sync.updated = now;
        Some(provider.id)
    }
}

/// Reads the legacy instance linkage out of the attribute map.
fn tenant_for_instance_id(attributes: &Map<String, Value>) -> Option<InstanceId> {
    match attributes.get(TENANT_FOR_INSTANCE_ID)? {
        Value::Number(n) => n.as_i64().and_then(|n| InstanceId::new(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn set_tenant_for_instance_id(attributes: &mut Map<String, Value>, id: Option<InstanceId>) {
    match id {
        Some(id) => {
            attributes.insert(TENANT_FOR_INSTANCE_ID.to_string(), Value::from(id.value()));
        }
        None => {
            attributes.remove(TENANT_FOR_INSTANCE_ID);
        }
    }
}

fn retry_at(now: DateTime<Utc>, delay: std::time::Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
}

/// In-memory model store.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    events: mpsc::UnboundedSender<ModelEvent>,
    backoff: Backoff,
}

impl MemoryStore {
    /// Create an empty store. Commit events for address-manager records are
    /// delivered on the returned receiver.
    pub fn new(backoff: Backoff) -> (Self, mpsc::UnboundedReceiver<ModelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let store = Self {
            inner: RwLock::new(Inner::new()),
            events,
            backoff,
        };
        (store, rx)
    }

    fn emit(&self, event: ModelEvent) {
        // Nobody listening is fine; the policy runner is optional.
        let _ = self.events.send(event);
    }

    pub async fn add_service(&self, name: impl Into<String>, kind: ServiceKind) -> ServiceId {
        let mut inner = self.inner.write().await;
        let id = inner.next_service;
        inner.next_service = id.next();
        inner.services.insert(
            id,
            Service {
                id,
                name: name.into(),
                kind,
            },
        );
        id
    }

    pub async fn add_address_pool(
        &self,
        service: ServiceId,
        pool: AddressPool,
    ) -> StoreResult<AddressPoolId> {
        let mut inner = self.inner.write().await;
        if !inner.services.contains_key(&service) {
            return Err(StoreError::ServiceNotFound(service));
        }

        let id = inner.next_pool;
        inner.next_pool = id.next();
        info!(
            pool_id = %id,
            pool = %pool.name(),
            service = %service,
            addresses = pool.remaining(),
            "Address pool registered"
        );
        inner.pools.insert(id, PoolRow { id, service, pool });
        Ok(id)
    }

    pub async fn add_node(&self, name: impl Into<String>) -> NodeId {
        let mut inner = self.inner.write().await;
        let id = inner.next_node;
        inner.next_node = id.next();
        inner.nodes.insert(
            id,
            Node {
                id,
                name: name.into(),
            },
        );
        id
    }

    /// Set (or replace) a tag on a node.
    pub async fn set_node_tag(&self, node: NodeId, name: &str, value: impl Into<String>) {
        let mut inner = self.inner.write().await;
        let value = value.into();
        match inner
            .tags
            .iter_mut()
            .find(|tag| tag.node == node && tag.name == name)
        {
            Some(tag) => tag.value = value,
            None => inner.tags.push(Tag {
                node,
                name: name.to_string(),
                value,
            }),
        }
    }

    pub async fn add_instance(&self, instance_name: Option<String>, node: NodeId) -> InstanceId {
        let mut inner = self.inner.write().await;
        let id = inner.next_instance;
        inner.next_instance = id.next();
        inner.instances.insert(
            id,
            Instance {
                id,
                instance_name,
                node,
            },
        );
        id
    }

    /// Remove a compute instance (service instances pointing at it keep the
    /// dangling reference).
    pub async fn remove_instance(&self, id: InstanceId) -> bool {
        self.inner.write().await.instances.remove(&id).is_some()
    }

    /// Register a subscriber service instance.
    pub async fn add_subscriber_instance(
        &self,
        owner: ServiceId,
        instance: Option<InstanceId>,
    ) -> ServiceInstanceId {
        self.add_row(owner, RowKind::Subscriber { instance }).await
    }

    /// Register a service instance the synchronizer only needs to traverse.
    pub async fn add_plain_instance(
        &self,
        owner: ServiceId,
        kind: impl Into<String>,
    ) -> ServiceInstanceId {
        self.add_row(owner, RowKind::Plain { kind: kind.into() })
            .await
    }

    async fn add_row(&self, owner: ServiceId, kind: RowKind) -> ServiceInstanceId {
        let mut inner = self.inner.write().await;
        let id = inner.allocate_service_instance_id();
        inner.service_instances.insert(
            id,
            ServiceInstanceRow {
                id,
                owner,
                link_deleted_count: 0,
                attributes: Map::new(),
                kind,
                sync: SyncStatus::new(Utc::now()),
            },
        );
        id
    }

    pub async fn add_link(
        &self,
        provider: ServiceInstanceId,
        subscriber_service_instance: Option<ServiceInstanceId>,
        subscriber_service: Option<ServiceId>,
    ) -> StoreResult<LinkId> {
        let mut inner = self.inner.write().await;
        if !inner.service_instances.contains_key(&provider) {
            return Err(StoreError::ServiceInstanceNotFound(provider));
        }

        let id = inner.next_link;
        inner.next_link = id.next();
        inner.links.insert(
            id,
            ServiceInstanceLink {
                id,
                provider_service_instance: provider,
                subscriber_service_instance,
                subscriber_service,
            },
        );
        Ok(id)
    }

    /// Snapshot of a pool.
    pub async fn address_pool(&self, id: AddressPoolId) -> Option<AddressPool> {
        self.inner
            .read()
            .await
            .pools
            .get(&id)
            .map(|row| row.pool.clone())
    }

    /// True if the store still holds the service instance in any state.
    pub async fn contains_service_instance(&self, id: ServiceInstanceId) -> bool {
        self.inner.read().await.service_instances.contains_key(&id)
    }
}

#[async_trait]
impl ModelAccessor for MemoryStore {
    async fn fabric_service(&self) -> StoreResult<Option<FabricService>> {
        let inner = self.inner.read().await;
        Ok(inner.services.values().find_map(|service| match service.kind {
            ServiceKind::Fabric { autoconfig } => Some(FabricService {
                id: service.id,
                autoconfig,
            }),
            _ => None,
        }))
    }

    async fn service(&self, id: ServiceId) -> StoreResult<Option<Service>> {
        Ok(self.inner.read().await.services.get(&id).cloned())
    }

    async fn subscribed_links(&self, service: ServiceId) -> StoreResult<Vec<ServiceInstanceLink>> {
        let inner = self.inner.read().await;
        Ok(inner
            .links
            .values()
            .filter(|link| link.subscriber_service == Some(service))
            .cloned()
            .collect())
    }

    async fn provided_links(
        &self,
        provider: ServiceInstanceId,
    ) -> StoreResult<Vec<ServiceInstanceLink>> {
        let inner = self.inner.read().await;
        Ok(inner
            .links
            .values()
            .filter(|link| link.provider_service_instance == provider)
            .cloned()
            .collect())
    }

    async fn leaf_model(&self, id: ServiceInstanceId) -> StoreResult<Option<LeafModel>> {
        let inner = self.inner.read().await;
        let Some(row) = inner
            .service_instances
            .get(&id)
            .filter(|row| !row.sync.deleted)
        else {
            return Ok(None);
        };

        Ok(match &row.kind {
            RowKind::AddressManager { .. } => {
                inner.address_record(row).map(LeafModel::AddressManager)
            }
            RowKind::Subscriber { instance } => Some(LeafModel::Subscriber(SubscriberInstance {
                id: row.id,
                owner: row.owner,
                instance: *instance,
            })),
            RowKind::Plain { kind } => Some(LeafModel::Plain {
                id: row.id,
                owner: row.owner,
                kind: kind.clone(),
            }),
        })
    }

    async fn service_instance(
        &self,
        id: ServiceInstanceId,
    ) -> StoreResult<Option<AddressManagerServiceInstance>> {
        let inner = self.inner.read().await;
        Ok(inner
            .service_instances
            .get(&id)
            .filter(|row| !row.sync.deleted)
            .and_then(|row| inner.address_record(row)))
    }

    async fn address_pools(&self, service: ServiceId) -> StoreResult<Vec<PoolInfo>> {
        let inner = self.inner.read().await;
        Ok(inner
            .pools
            .values()
            .filter(|row| row.service == service)
            .map(PoolRow::info)
            .collect())
    }

    async fn instance(&self, id: InstanceId) -> StoreResult<Option<Instance>> {
        Ok(self.inner.read().await.instances.get(&id).cloned())
    }

    async fn node(&self, id: NodeId) -> StoreResult<Option<Node>> {
        Ok(self.inner.read().await.nodes.get(&id).cloned())
    }

    async fn node_tag(&self, node: NodeId, name: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tags
            .iter()
            .find(|tag| tag.node == node && tag.name == name)
            .map(|tag| tag.value.clone()))
    }

    async fn fetch_pending(
        &self,
        deleted: bool,
    ) -> StoreResult<Vec<AddressManagerServiceInstance>> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        Ok(inner
            .service_instances
            .values()
            .filter(|row| row.is_address_manager())
            .filter(|row| row.sync.deleted == deleted)
            .filter(|row| deleted || row.sync.needs_sync())
            .filter(|row| row.sync.retry_due(now))
            .filter_map(|row| inner.address_record(row))
            .collect())
    }
}

#[async_trait]
impl ModelWriter for MemoryStore {
    async fn save_service_instance(
        &self,
        record: AddressManagerServiceInstance,
    ) -> StoreResult<AddressManagerServiceInstance> {
        let now = Utc::now();
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let (id, event) = match record.id {
            None => {
                let pool_id = record.address_pool.ok_or(StoreError::MissingAddressPool)?;
                let pool_row = inner
                    .pools
                    .get_mut(&pool_id)
                    .ok_or(StoreError::AddressPoolNotFound(pool_id))?;

                let (ip, mac) = match record.public_ip {
                    None => {
                        let ip = pool_row.pool.get_address()?;
                        (ip, derive_mac(ip))
                    }
                    Some(ip) => {
                        pool_row.pool.claim_address(ip)?;
                        (ip, record.public_mac.unwrap_or_else(|| derive_mac(ip)))
                    }
                };

                let id = inner.allocate_service_instance_id();
                let mut attributes = Map::new();
                set_tenant_for_instance_id(&mut attributes, record.tenant_for_instance_id);

                inner.service_instances.insert(
                    id,
                    ServiceInstanceRow {
                        id,
                        owner: record.owner,
                        link_deleted_count: record.link_deleted_count,
                        attributes,
                        kind: RowKind::AddressManager {
                            address_pool: Some(pool_id),
                            public_ip: Some(ip),
                            public_mac: Some(mac),
                        },
                        sync: SyncStatus::new(now),
                    },
                );

                info!(
                    service_instance_id = %id,
                    pool_id = %pool_id,
                    public_ip = %ip,
                    public_mac = %mac,
                    "Allocated address for new service instance"
                );
                (id, ModelEvent::Created(id))
            }
            Some(id) => {
                let row = inner
                    .service_instances
                    .get_mut(&id)
                    .filter(|row| row.is_address_manager() && !row.sync.deleted)
                    .ok_or(StoreError::ServiceInstanceNotFound(id))?;

                // Address, MAC and pool are fixed for the record's lifetime.
                // The link-deleted counter belongs to the store and only moves
                // in `remove_link`.
                set_tenant_for_instance_id(&mut row.attributes, record.tenant_for_instance_id);
                row.sync.updated = now;

                debug!(service_instance_id = %id, "Service instance updated");
                (id, ModelEvent::Updated(id))
            }
        };

        let saved = inner
            .service_instances
            .get(&id)
            .and_then(|row| inner.address_record(row))
            .ok_or(StoreError::ServiceInstanceNotFound(id))?;
        drop(guard);

        self.emit(event);
        Ok(saved)
    }

    async fn delete_service_instance(&self, id: ServiceInstanceId) -> StoreResult<()> {
        let now = Utc::now();
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let row = inner
            .service_instances
            .get_mut(&id)
            .ok_or(StoreError::ServiceInstanceNotFound(id))?;
        if row.sync.deleted {
            return Ok(());
        }

        let address_manager = match &mut row.kind {
            RowKind::AddressManager {
                address_pool,
                public_ip,
                ..
            } => {
                if let (Some(pool_id), Some(ip)) = (*address_pool, *public_ip) {
                    match inner.pools.get_mut(&pool_id) {
                        Some(pool_row) => {
                            if let Err(e) = pool_row.pool.put_address(ip) {
                                warn!(
                                    service_instance_id = %id,
                                    pool_id = %pool_id,
                                    error = %e,
                                    "Could not return address to pool"
                                );
                            } else {
                                info!(
                                    service_instance_id = %id,
                                    pool_id = %pool_id,
                                    public_ip = %ip,
                                    "Returned address to pool"
                                );
                            }
                        }
                        None => warn!(
                            service_instance_id = %id,
                            pool_id = %pool_id,
                            "Address pool is gone; address not returned"
                        ),
                    }
                }
                *public_ip = None;
                row.sync.deleted = true;
                row.sync.updated = now;
                true
            }
            _ => false,
        };

        if !address_manager {
            inner.service_instances.remove(&id);
        }

        let dependent_links: Vec<LinkId> = inner
            .links
            .values()
            .filter(|link| {
                link.provider_service_instance == id
                    || link.subscriber_service_instance == Some(id)
            })
            .map(|link| link.id)
            .collect();

        let mut touched = Vec::new();
        for link_id in dependent_links {
            if let Some(provider) = inner.remove_link(link_id, now) {
                touched.push(provider);
            }
        }
        drop(guard);

        if address_manager {
            self.emit(ModelEvent::Deleted(id));
        }
        for provider in touched {
            self.emit(ModelEvent::Updated(provider));
        }
        Ok(())
    }

    async fn delete_link(&self, id: LinkId) -> StoreResult<()> {
        let now = Utc::now();
        let provider = {
            let mut inner = self.inner.write().await;
            inner.remove_link(id, now)
        };

        if let Some(provider) = provider {
            debug!(link_id = %id, provider = %provider, "Provided link removed");
            self.emit(ModelEvent::Updated(provider));
        }
        Ok(())
    }
}

#[async_trait]
impl OutcomeSink<AddressManagerServiceInstance> for MemoryStore {
    type Error = StoreError;

    async fn report_outcome(
        &self,
        item: &AddressManagerServiceInstance,
        deleted: bool,
        outcome: &Outcome,
    ) -> StoreResult<()> {
        let id = item.id.ok_or(StoreError::Unsaved)?;
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        if deleted && outcome.is_synced() {
            inner.service_instances.remove(&id);
            info!(service_instance_id = %id, "Purged deleted service instance");
            return Ok(());
        }

        let row = inner
            .service_instances
            .get_mut(&id)
            .ok_or(StoreError::ServiceInstanceNotFound(id))?;

        match outcome {
            Outcome::Synced => {
                row.sync.enacted = Some(item.sync.updated);
                row.sync.backend_code = BackendCode::Ok;
                row.sync.backend_status = "OK".to_string();
                row.sync.backoff_exponent = 0;
                row.sync.next_retry_at = None;
            }
            Outcome::Deferred(reason) => {
                row.sync.backend_code = BackendCode::Pending;
                row.sync.backend_status = reason.clone();
            }
            Outcome::Failed(message) => {
                row.sync.backend_code = BackendCode::Error;
                row.sync.backend_status = message.clone();
                row.sync.backoff_exponent += 1;
                row.sync.next_retry_at =
                    retry_at(now, self.backoff.delay(row.sync.backoff_exponent));
            }
            Outcome::Aborted(message) => {
                row.sync.backend_code = BackendCode::Error;
                row.sync.backend_status = message.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    async fn store_with_pool(
        addresses: &[&str],
    ) -> (
        MemoryStore,
        mpsc::UnboundedReceiver<ModelEvent>,
        ServiceId,
        AddressPoolId,
    ) {
        let (store, rx) = MemoryStore::new(Backoff::default());
        let service = store
            .add_service("addressmanager", ServiceKind::AddressManager)
            .await;
        let pool = AddressPool::new("public", addresses.iter().map(|a| ip(a)))
            .with_gateway(ip("10.0.0.254"), Some("a4:23:05:00:00:01".parse().unwrap()));
        let pool_id = store.add_address_pool(service, pool).await.unwrap();
        (store, rx, service, pool_id)
    }

    #[tokio::test]
    async fn test_first_save_allocates_once() {
        let (store, mut rx, service, pool_id) = store_with_pool(&["10.0.0.1", "10.0.0.2"]).await;

        let saved = store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool_id))
            .await
            .unwrap();
        let id = saved.id.unwrap();
        assert_eq!(saved.public_ip, Some(ip("10.0.0.1")));
        assert_eq!(
            saved.public_mac.map(|m| m.to_string()).as_deref(),
            Some("02:42:0a:00:00:01")
        );
        assert_eq!(saved.gateway_ip(), Some(ip("10.0.0.254")));
        assert_eq!(rx.recv().await, Some(ModelEvent::Created(id)));

        let resaved = store.save_service_instance(saved.clone()).await.unwrap();
        assert_eq!(resaved.public_ip, saved.public_ip);
        assert_eq!(rx.recv().await, Some(ModelEvent::Updated(id)));

        let pool = store.address_pool(pool_id).await.unwrap();
        assert_eq!(pool.remaining(), 1);
    }

    #[tokio::test]
    async fn test_update_cannot_reassign_address() {
        let (store, _rx, service, pool_id) = store_with_pool(&["10.0.0.1", "10.0.0.2"]).await;
        let mut saved = store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool_id))
            .await
            .unwrap();

        saved.public_ip = Some(ip("10.0.0.2"));
        let resaved = store.save_service_instance(saved).await.unwrap();
        assert_eq!(resaved.public_ip, Some(ip("10.0.0.1")));
    }

    #[tokio::test]
    async fn test_update_keeps_stored_link_deleted_count() {
        let (store, _rx, service, pool_id) = store_with_pool(&["10.0.0.1"]).await;
        let saved = store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool_id))
            .await
            .unwrap();
        let id = saved.id.unwrap();

        let subscriber = store.add_subscriber_instance(service, None).await;
        let link = store.add_link(id, Some(subscriber), None).await.unwrap();
        store.delete_link(link).await.unwrap();

        let mut edited = store.service_instance(id).await.unwrap().unwrap();
        assert_eq!(edited.link_deleted_count, 1);
        edited.link_deleted_count = 7;
        let resaved = store.save_service_instance(edited).await.unwrap();
        assert_eq!(resaved.link_deleted_count, 1);

        // A copy read before the link went away cannot reset the counter.
        let resaved = store.save_service_instance(saved).await.unwrap();
        assert_eq!(resaved.link_deleted_count, 1);
        assert_eq!(resaved.public_ip, Some(ip("10.0.0.1")));
    }

    #[tokio::test]
    async fn test_exhausted_pool_persists_nothing() {
        let (store, _rx, service, pool_id) = store_with_pool(&[]).await;

        let err = store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool_id))
            .await
            .unwrap_err();
        assert!(err.is_pool_exhausted());
        assert!(store.fetch_pending(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preassigned_address_is_claimed() {
        let (store, _rx, service, pool_id) = store_with_pool(&["10.0.0.1", "10.0.0.2"]).await;

        let mut record = AddressManagerServiceInstance::new(service, pool_id);
        record.public_ip = Some(ip("10.0.0.2"));
        store.save_service_instance(record.clone()).await.unwrap();

        let err = store.save_service_instance(record).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Network(amsync_networking::NetworkError::AddressInUse { .. })
        ));

        let next = store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool_id))
            .await
            .unwrap();
        assert_eq!(next.public_ip, Some(ip("10.0.0.1")));
    }

    #[tokio::test]
    async fn test_delete_releases_address_and_is_idempotent() {
        let (store, _rx, service, pool_id) = store_with_pool(&["10.0.0.1"]).await;
        let saved = store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool_id))
            .await
            .unwrap();
        let id = saved.id.unwrap();

        store.delete_service_instance(id).await.unwrap();
        store.delete_service_instance(id).await.unwrap();

        let pool = store.address_pool(pool_id).await.unwrap();
        assert_eq!(pool.available().collect::<Vec<_>>(), vec![ip("10.0.0.1")]);
        assert!(store.service_instance(id).await.unwrap().is_none());

        let pending_delete = store.fetch_pending(true).await.unwrap();
        assert_eq!(pending_delete.len(), 1);
        assert_eq!(pending_delete[0].public_ip, None);
    }

    #[tokio::test]
    async fn test_tenant_for_instance_id_roundtrip() {
        let (store, _rx, service, pool_id) = store_with_pool(&["10.0.0.1"]).await;
        let node = store.add_node("compute-1").await;
        let instance = store.add_instance(Some("vm-1".into()), node).await;

        let saved = store
            .save_service_instance(
                AddressManagerServiceInstance::new(service, pool_id)
                    .with_tenant_for_instance_id(instance),
            )
            .await
            .unwrap();
        assert_eq!(saved.tenant_for_instance_id, Some(instance));

        let mut cleared = saved.clone();
        cleared.tenant_for_instance_id = None;
        let cleared = store.save_service_instance(cleared).await.unwrap();
        assert_eq!(cleared.tenant_for_instance_id, None);
    }

    #[test]
    fn test_tenant_attribute_accepts_strings_and_numbers() {
        let mut attributes = Map::new();
        attributes.insert(TENANT_FOR_INSTANCE_ID.into(), Value::from(7));
        assert_eq!(tenant_for_instance_id(&attributes), InstanceId::new(7).ok());

        attributes.insert(TENANT_FOR_INSTANCE_ID.into(), Value::from("inst_8"));
        assert_eq!(tenant_for_instance_id(&attributes), InstanceId::new(8).ok());

        attributes.insert(TENANT_FOR_INSTANCE_ID.into(), Value::from("bogus"));
        assert_eq!(tenant_for_instance_id(&attributes), None);
    }

    #[tokio::test]
    async fn test_delete_link_counts_against_provider() {
        let (store, mut rx, service, pool_id) = store_with_pool(&["10.0.0.1"]).await;
        let saved = store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool_id))
            .await
            .unwrap();
        let id = saved.id.unwrap();
        let _ = rx.recv().await;

        let subscriber = store.add_subscriber_instance(service, None).await;
        let link = store.add_link(id, Some(subscriber), None).await.unwrap();

        store.delete_link(link).await.unwrap();
        assert_eq!(rx.recv().await, Some(ModelEvent::Updated(id)));

        let record = store.service_instance(id).await.unwrap().unwrap();
        assert_eq!(record.link_deleted_count, 1);
        assert!(store.provided_links(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_subscriber_cascades_links() {
        let (store, mut rx, service, pool_id) = store_with_pool(&["10.0.0.1"]).await;
        let saved = store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool_id))
            .await
            .unwrap();
        let id = saved.id.unwrap();
        let _ = rx.recv().await;

        let subscriber = store.add_subscriber_instance(service, None).await;
        store.add_link(id, Some(subscriber), None).await.unwrap();

        store.delete_service_instance(subscriber).await.unwrap();
        assert_eq!(rx.recv().await, Some(ModelEvent::Updated(id)));
        assert!(!store.contains_service_instance(subscriber).await);
        assert_eq!(
            store
                .service_instance(id)
                .await
                .unwrap()
                .unwrap()
                .link_deleted_count,
            1
        );
    }

    #[tokio::test]
    async fn test_outcome_bookkeeping() {
        let (store, _rx, service, pool_id) = store_with_pool(&["10.0.0.1"]).await;
        store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool_id))
            .await
            .unwrap();

        let pending = store.fetch_pending(false).await.unwrap();
        assert_eq!(pending.len(), 1);
        let record = &pending[0];

        store
            .report_outcome(record, false, &Outcome::Deferred("no tag".into()))
            .await
            .unwrap();
        let pending = store.fetch_pending(false).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sync.backend_status, "no tag");
        assert_eq!(pending[0].sync.backoff_exponent, 0);

        store
            .report_outcome(record, false, &Outcome::Failed("boom".into()))
            .await
            .unwrap();
        assert!(store.fetch_pending(false).await.unwrap().is_empty());

        let id = record.id.unwrap();
        let failed = store.service_instance(id).await.unwrap().unwrap();
        assert_eq!(failed.sync.backend_code, BackendCode::Error);
        assert_eq!(failed.sync.backoff_exponent, 1);

        store
            .report_outcome(record, false, &Outcome::Synced)
            .await
            .unwrap();
        let synced = store.service_instance(id).await.unwrap().unwrap();
        assert_eq!(synced.sync.backend_code, BackendCode::Ok);
        assert_eq!(synced.sync.enacted, Some(record.sync.updated));
        assert!(!synced.sync.needs_sync());
        assert!(store.fetch_pending(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aborted_outcome_does_not_back_off() {
        let (store, _rx, service, pool_id) = store_with_pool(&["10.0.0.1"]).await;
        store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool_id))
            .await
            .unwrap();

        let record = store.fetch_pending(false).await.unwrap().remove(0);
        store
            .report_outcome(&record, false, &Outcome::Aborted("no onos".into()))
            .await
            .unwrap();

        let pending = store.fetch_pending(false).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sync.backend_code, BackendCode::Error);
        assert_eq!(pending[0].sync.backend_status, "no onos");
        assert_eq!(pending[0].sync.backoff_exponent, 0);
        assert_eq!(pending[0].sync.next_retry_at, None);
    }

    #[tokio::test]
    async fn test_zero_backoff_keeps_failed_records_pending() {
        let (store, _rx) = MemoryStore::new(Backoff {
            base: Duration::ZERO,
            max: Duration::ZERO,
        });
        let service = store
            .add_service("addressmanager", ServiceKind::AddressManager)
            .await;
        let pool_id = store
            .add_address_pool(service, AddressPool::new("public", [ip("10.0.0.1")]))
            .await
            .unwrap();
        store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool_id))
            .await
            .unwrap();

        let record = store.fetch_pending(false).await.unwrap().remove(0);
        store
            .report_outcome(&record, false, &Outcome::Failed("boom".into()))
            .await
            .unwrap();
        assert_eq!(store.fetch_pending(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fabric_service_is_first_registered() {
        let (store, _rx) = MemoryStore::new(Backoff::default());
        assert!(store.fabric_service().await.unwrap().is_none());

        store
            .add_service("other", ServiceKind::Other { kind: "vsg".into() })
            .await;
        let first = store
            .add_service("fabric", ServiceKind::Fabric { autoconfig: true })
            .await;
        store
            .add_service("fabric-2", ServiceKind::Fabric { autoconfig: false })
            .await;

        let fabric = store.fabric_service().await.unwrap().unwrap();
        assert_eq!(fabric.id, first);
        assert!(fabric.autoconfig);
    }

    #[tokio::test]
    async fn test_node_tags() {
        let (store, _rx) = MemoryStore::new(Backoff::default());
        let node = store.add_node("compute-1").await;
        assert_eq!(store.node_tag(node, "dataPlaneIp").await.unwrap(), None);

        store.set_node_tag(node, "dataPlaneIp", "10.6.1.2/24").await;
        store.set_node_tag(node, "dataPlaneIp", "10.6.1.3/24").await;
        assert_eq!(
            store.node_tag(node, "dataPlaneIp").await.unwrap().as_deref(),
            Some("10.6.1.3/24")
        );
    }
}
