//! Sync step pushing address service instances to the fabric as routes.

use std::sync::Arc;

use amsync_reconcile::SyncStep;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::eligibility::filter_eligible;
use crate::error::SyncError;
use crate::mapper::map_tenant_to_route;
use crate::models::{AddressManagerServiceInstance, OnosService, ServiceKind};
use crate::onos::OnosClient;
use crate::store::ModelAccessor;

/// Syncs [`AddressManagerServiceInstance`] records to the fabric ONOS.
pub struct SyncAddressManagerServiceInstance<S> {
    store: Arc<S>,
    onos: OnosClient,
}

impl<S> SyncAddressManagerServiceInstance<S>
where
    S: ModelAccessor,
{
    pub fn new(store: Arc<S>, onos: OnosClient) -> Self {
        Self { store, onos }
    }

    /// The ONOS service that owns the app the fabric subscribes to.
    ///
    /// Links whose provider is not backed by an ONOS service are skipped.
    pub async fn get_fabric_onos_service(&self) -> Result<OnosService, SyncError> {
        let not_found = || SyncError::Configuration("Fabric ONOS service not found".to_string());

        let fabric = self.store.fabric_service().await?.ok_or_else(not_found)?;
        for link in self.store.subscribed_links(fabric.id).await? {
            let Some(provider) = self
                .store
                .leaf_model(link.provider_service_instance)
                .await?
            else {
                continue;
            };

            match self.store.service(provider.owner()).await? {
                Some(service) => match service.kind {
                    ServiceKind::Onos(onos) => return Ok(onos),
                    _ => debug!(
                        link_id = %link.id,
                        service = %service.name,
                        "Fabric link provider is not an ONOS service"
                    ),
                },
                None => debug!(link_id = %link.id, "Fabric link provider has no owner"),
            }
        }

        Err(not_found())
    }
}

#[async_trait]
impl<S> SyncStep for SyncAddressManagerServiceInstance<S>
where
    S: ModelAccessor + 'static,
{
    type Item = AddressManagerServiceInstance;
    type Error = SyncError;

    fn name(&self) -> &'static str {
        "sync_addressmanagerserviceinstance"
    }

    async fn fetch_pending(
        &self,
        deleted: bool,
    ) -> Result<Vec<AddressManagerServiceInstance>, SyncError> {
        let pending = self.store.fetch_pending(deleted).await?;
        if deleted {
            return Ok(pending);
        }
        Ok(filter_eligible(self.store.as_ref(), pending).await?)
    }

    async fn sync_record(&self, record: &AddressManagerServiceInstance) -> Result<(), SyncError> {
        let onos = self.get_fabric_onos_service().await?;

        let route = map_tenant_to_route(self.store.as_ref(), record)
            .await?
            .ok_or_else(|| SyncError::Mapping(record.to_string()))?;

        let response = self.onos.post_route(&onos, &route).await?;
        info!(
            record = %record,
            status = response.status,
            body = %response.body,
            "Posted route"
        );
        Ok(())
    }

    async fn delete_record(&self, record: &AddressManagerServiceInstance) -> Result<(), SyncError> {
        // Route withdrawal stays off until records carry feedback state.
        debug!(record = %record, "Route withdrawal disabled; nothing to retract");
        Ok(())
    }
}
