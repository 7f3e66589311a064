//! Resolves which compute instance an address service instance serves.
//!
//! Both the eligibility filter and the route mapper go through
//! [`resolve_target`], so they always agree on the target.

use amsync_id::InstanceId;

use crate::error::StoreResult;
use crate::models::{AddressManagerServiceInstance, Instance, LeafModel};
use crate::store::ModelAccessor;

/// Where an address service instance points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Linked to a subscriber; `instance` is the subscriber's compute
    /// instance if it has a live one.
    Subscriber {
        subscriber: LeafModel,
        instance: Option<Instance>,
    },

    /// No subscriber; the legacy instance linkage names `instance_id`.
    /// `instance` is `None` if that instance no longer exists.
    Legacy {
        instance_id: InstanceId,
        instance: Option<Instance>,
    },

    /// Neither a subscriber nor a legacy linkage.
    Unlinked,
}

impl Target {
    /// The compute instance, if one resolved.
    pub fn instance(&self) -> Option<&Instance> {
        match self {
            Target::Subscriber { instance, .. } | Target::Legacy { instance, .. } => {
                instance.as_ref()
            }
            Target::Unlinked => None,
        }
    }
}

/// The subscriber behind the first provided link whose subscriber side
/// still resolves.
pub async fn get_subscriber<S>(
    store: &S,
    record: &AddressManagerServiceInstance,
) -> StoreResult<Option<LeafModel>>
where
    S: ModelAccessor + ?Sized,
{
    let Some(id) = record.id else {
        return Ok(None);
    };

    for link in store.provided_links(id).await? {
        let Some(subscriber_id) = link.subscriber_service_instance else {
            continue;
        };
        if let Some(leaf) = store.leaf_model(subscriber_id).await? {
            return Ok(Some(leaf));
        }
    }
    Ok(None)
}

pub async fn resolve_target<S>(
    store: &S,
    record: &AddressManagerServiceInstance,
) -> StoreResult<Target>
where
    S: ModelAccessor + ?Sized,
{
    if let Some(subscriber) = get_subscriber(store, record).await? {
        let instance = match subscriber.instance() {
            Some(id) => store.instance(id).await?,
            None => None,
        };
        return Ok(Target::Subscriber {
            subscriber,
            instance,
        });
    }

    match record.tenant_for_instance_id {
        Some(instance_id) => Ok(Target::Legacy {
            instance_id,
            instance: store.instance(instance_id).await?,
        }),
        None => Ok(Target::Unlinked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServiceKind;
    use crate::store::{MemoryStore, ModelWriter};
    use amsync_networking::AddressPool;
    use amsync_reconcile::Backoff;

    async fn setup() -> (MemoryStore, AddressManagerServiceInstance) {
        let (store, _rx) = MemoryStore::new(Backoff::default());
        let service = store
            .add_service("addressmanager", ServiceKind::AddressManager)
            .await;
        let pool = store
            .add_address_pool(
                service,
                AddressPool::new("public", ["10.0.0.1".parse::<std::net::Ipv4Addr>().unwrap()]),
            )
            .await
            .unwrap();
        let record = store
            .save_service_instance(AddressManagerServiceInstance::new(service, pool))
            .await
            .unwrap();
        (store, record)
    }

    #[tokio::test]
    async fn test_unlinked() {
        let (store, record) = setup().await;
        assert_eq!(resolve_target(&store, &record).await.unwrap(), Target::Unlinked);
    }

    #[tokio::test]
    async fn test_subscriber_wins_over_legacy_linkage() {
        let (store, mut record) = setup().await;
        let node = store.add_node("compute-1").await;
        let vsg_vm = store.add_instance(Some("vsg-1".into()), node).await;
        let legacy_vm = store.add_instance(Some("legacy".into()), node).await;
        let subscriber = store
            .add_subscriber_instance(record.owner, Some(vsg_vm))
            .await;

        let id = record.id.unwrap();
        // A link with no subscriber side is skipped.
        store.add_link(id, None, None).await.unwrap();
        store.add_link(id, Some(subscriber), None).await.unwrap();
        record.tenant_for_instance_id = Some(legacy_vm);

        let target = resolve_target(&store, &record).await.unwrap();
        assert!(matches!(target, Target::Subscriber { .. }));
        assert_eq!(target.instance().map(|i| i.id), Some(vsg_vm));
    }

    #[tokio::test]
    async fn test_subscriber_without_instance() {
        let (store, record) = setup().await;
        let subscriber = store.add_plain_instance(record.owner, "ONOSApp").await;
        store
            .add_link(record.id.unwrap(), Some(subscriber), None)
            .await
            .unwrap();

        let target = resolve_target(&store, &record).await.unwrap();
        assert!(matches!(
            target,
            Target::Subscriber { instance: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_legacy_dead_instance() {
        let (store, record) = setup().await;
        let node = store.add_node("compute-1").await;
        let vm = store.add_instance(None, node).await;
        store.remove_instance(vm).await;

        let record = record.with_tenant_for_instance_id(vm);
        assert_eq!(
            resolve_target(&store, &record).await.unwrap(),
            Target::Legacy {
                instance_id: vm,
                instance: None
            }
        );
    }
}
