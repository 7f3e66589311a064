#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use amsync_id::{AddressPoolId, InstanceId, NodeId, ServiceId, ServiceInstanceId};
use amsync_networking::AddressPool;
use amsync_reconcile::Backoff;
use amsync_synchronizer::models::{OnosService, ServiceKind, DATAPLANE_IP_TAG};
use amsync_synchronizer::onos::OnosClient;
use amsync_synchronizer::provisioning::{AddressManagerService, ServiceInstanceRequest};
use amsync_synchronizer::{
    AddressManagerServiceInstance, MemoryStore, ModelEvent, SyncAddressManagerServiceInstance,
    SyncWorker,
};
use tokio::sync::mpsc;

pub type Worker = SyncWorker<SyncAddressManagerServiceInstance<MemoryStore>, MemoryStore>;

/// A fabric with autoconfig on, an ONOS service reachable at `onos_port`,
/// one address manager with a public pool and one tagged compute node.
pub struct Fabric {
    pub store: Arc<MemoryStore>,
    pub events: Option<mpsc::UnboundedReceiver<ModelEvent>>,
    pub fabric: ServiceId,
    pub address_manager: ServiceId,
    pub vsg: ServiceId,
    pub pool: AddressPoolId,
    pub node: NodeId,
}

pub fn onos_service(host: &str, port: u16) -> OnosService {
    OnosService {
        rest_scheme: "http".into(),
        rest_hostname: host.into(),
        rest_port: port,
        rest_username: "onos".into(),
        rest_password: "rocks".into(),
    }
}

impl Fabric {
    pub async fn new(onos: Option<OnosService>, pool: AddressPool, backoff: Backoff) -> Self {
        Self::with_autoconfig(true, onos, pool, backoff).await
    }

    pub async fn with_autoconfig(
        autoconfig: bool,
        onos: Option<OnosService>,
        pool: AddressPool,
        backoff: Backoff,
    ) -> Self {
        let (store, events) = MemoryStore::new(backoff);

        let fabric = store
            .add_service("fabric", ServiceKind::Fabric { autoconfig })
            .await;
        if let Some(onos) = onos {
            let onos_service = store.add_service("onos-fabric", ServiceKind::Onos(onos)).await;
            let app = store.add_plain_instance(onos_service, "ONOSApp").await;
            store.add_link(app, None, Some(fabric)).await.unwrap();
        }

        let address_manager = store
            .add_service("addressmanager", ServiceKind::AddressManager)
            .await;
        let vsg = store
            .add_service(
                "vsg",
                ServiceKind::Other {
                    kind: "VSGService".into(),
                },
            )
            .await;
        let pool = store.add_address_pool(address_manager, pool).await.unwrap();

        let node = store.add_node("compute-1").await;
        store.set_node_tag(node, DATAPLANE_IP_TAG, "10.6.1.2/24").await;

        Self {
            store: Arc::new(store),
            events: Some(events),
            fabric,
            address_manager,
            vsg,
            pool,
            node,
        }
    }

    pub fn address_manager(&self) -> AddressManagerService<'_, MemoryStore> {
        AddressManagerService::new(self.store.as_ref(), self.address_manager)
    }

    pub async fn instance(&self, name: &str) -> InstanceId {
        self.store.add_instance(Some(name.into()), self.node).await
    }

    /// A compute instance on a node that has no data-plane tag.
    pub async fn untagged_instance(&self, name: &str) -> InstanceId {
        let node = self.store.add_node(format!("{name}-host")).await;
        self.store.add_instance(Some(name.into()), node).await
    }

    /// Provision an address for a vSG subscriber running on a new instance.
    pub async fn subscribed_record(
        &self,
        name: &str,
    ) -> (AddressManagerServiceInstance, ServiceInstanceId) {
        let instance = self.instance(name).await;
        let subscriber = self.store.add_subscriber_instance(self.vsg, Some(instance)).await;
        let record = self
            .address_manager()
            .get_service_instance(ServiceInstanceRequest::new("public"))
            .await
            .unwrap();
        self.store
            .add_link(record.id.unwrap(), Some(subscriber), None)
            .await
            .unwrap();
        (record, subscriber)
    }

    /// Provision an address bound to a compute instance by the legacy linkage.
    pub async fn instance_record(&self, name: &str) -> AddressManagerServiceInstance {
        let instance = self.instance(name).await;
        self.address_manager()
            .get_service_instance(ServiceInstanceRequest::new("public").for_instance(instance))
            .await
            .unwrap()
    }

    pub fn worker(&self) -> Worker {
        let step = SyncAddressManagerServiceInstance::new(
            Arc::clone(&self.store),
            OnosClient::new(Duration::from_secs(2)).unwrap(),
        );
        SyncWorker::new(step, Arc::clone(&self.store), Duration::from_secs(30))
    }
}

pub fn pool_of(addresses: &[&str]) -> AddressPool {
    AddressPool::new("public", addresses.iter().map(|a| a.parse::<std::net::Ipv4Addr>().unwrap()))
        .with_gateway("10.0.0.254".parse().unwrap(), Some("a4:23:05:00:00:01".parse().unwrap()))
}
