//! Maps an address service instance to a fabric route.

use std::net::Ipv4Addr;

use amsync_networking::strip_prefix_len;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncError;
use crate::models::{AddressManagerServiceInstance, DATAPLANE_IP_TAG};
use crate::resolver::resolve_target;
use crate::store::ModelAccessor;

/// A host route as the ONOS route service expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    #[serde(rename = "nextHop")]
    pub next_hop: Ipv4Addr,
}

impl Route {
    /// A /32 route to `address` via `next_hop`.
    pub fn host(address: Ipv4Addr, next_hop: Ipv4Addr) -> Self {
        Self {
            prefix: format!("{}/32", address),
            next_hop,
        }
    }
}

/// Route for one record: its public address via the data-plane IP of the
/// node running its compute instance.
///
/// Returns `Ok(None)` when the record resolves to no compute instance or has
/// no address. A node that is missing or not tagged yet is
/// [`SyncError::Deferred`].
pub async fn map_tenant_to_route<S>(
    store: &S,
    record: &AddressManagerServiceInstance,
) -> Result<Option<Route>, SyncError>
where
    S: ModelAccessor + ?Sized,
{
    let target = resolve_target(store, record).await?;
    let (Some(instance), Some(public_ip)) = (target.instance(), record.public_ip) else {
        return Ok(None);
    };

    let Some(node) = store.node(instance.node).await? else {
        return Err(SyncError::Deferred(format!(
            "No node {} found for instance {} tenant {} -- skipping",
            instance.node, instance.id, record
        )));
    };

    let Some(tag) = store.node_tag(node.id, DATAPLANE_IP_TAG).await? else {
        return Err(SyncError::Deferred(format!(
            "No IP found for node {} tenant {} -- skipping",
            node, record
        )));
    };

    let next_hop: Ipv4Addr = strip_prefix_len(&tag)
        .parse()
        .map_err(|_| SyncError::InvalidTag {
            node: node.to_string(),
            tag: DATAPLANE_IP_TAG,
            value: tag.clone(),
        })?;

    let route = Route::host(public_ip, next_hop);
    debug!(record = %record, prefix = %route.prefix, next_hop = %route.next_hop, "Mapped route");
    Ok(Some(route))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServiceKind;
    use crate::store::{MemoryStore, ModelWriter};
    use amsync_id::NodeId;
    use amsync_networking::AddressPool;
    use amsync_reconcile::Backoff;

    async fn setup() -> (MemoryStore, AddressManagerServiceInstance, NodeId) {
        let (store, _rx) = MemoryStore::new(Backoff::default());
        let service = store
            .add_service("addressmanager", ServiceKind::AddressManager)
            .await;
        let pool = store
            .add_address_pool(
                service,
                AddressPool::new("public", ["10.0.0.5".parse::<Ipv4Addr>().unwrap()]),
            )
            .await
            .unwrap();
        let node = store.add_node("compute-1").await;
        let vm = store.add_instance(Some("vm-1".into()), node).await;
        let record = store
            .save_service_instance(
                AddressManagerServiceInstance::new(service, pool).with_tenant_for_instance_id(vm),
            )
            .await
            .unwrap();
        (store, record, node)
    }

    #[test]
    fn test_route_wire_shape() {
        let route = Route::host("10.0.0.5".parse().unwrap(), "10.6.1.2".parse().unwrap());
        assert_eq!(
            serde_json::to_value(&route).unwrap(),
            serde_json::json!({"prefix": "10.0.0.5/32", "nextHop": "10.6.1.2"})
        );
    }

    #[tokio::test]
    async fn test_maps_public_ip_to_node_dataplane_ip() {
        let (store, record, node) = setup().await;
        store.set_node_tag(node, DATAPLANE_IP_TAG, "10.6.1.2/24").await;

        let route = map_tenant_to_route(&store, &record).await.unwrap().unwrap();
        assert_eq!(route.prefix, "10.0.0.5/32");
        assert_eq!(route.next_hop, "10.6.1.2".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_missing_tag_is_deferred() {
        let (store, record, _node) = setup().await;
        let err = map_tenant_to_route(&store, &record).await.unwrap_err();
        assert!(err.is_deferred());
    }

    #[tokio::test]
    async fn test_invalid_tag() {
        let (store, record, node) = setup().await;
        store.set_node_tag(node, DATAPLANE_IP_TAG, "not-an-ip").await;
        let err = map_tenant_to_route(&store, &record).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTag { .. }));
    }

    #[tokio::test]
    async fn test_no_instance_is_no_data() {
        let (store, mut record, _node) = setup().await;
        record.tenant_for_instance_id = None;
        assert_eq!(map_tenant_to_route(&store, &record).await.unwrap(), None);
    }
}
