//! Address-manager service operations used by other services to obtain
//! addresses.

use amsync_id::{InstanceId, ServiceId};
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::models::{AddressManagerServiceInstance, Gateway, PoolInfo};
use crate::store::{ModelAccessor, ModelWriter};

/// Parameters for [`AddressManagerService::get_service_instance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstanceRequest {
    /// Name of the pool to draw the address from.
    pub address_pool_name: String,

    /// Compute instance the address is for, when no subscriber link will
    /// be created.
    pub tenant_for_instance_id: Option<InstanceId>,
}

impl ServiceInstanceRequest {
    pub fn new(address_pool_name: impl Into<String>) -> Self {
        Self {
            address_pool_name: address_pool_name.into(),
            tenant_for_instance_id: None,
        }
    }

    pub fn for_instance(mut self, instance: InstanceId) -> Self {
        self.tenant_for_instance_id = Some(instance);
        self
    }
}

/// Handle on one address-manager service in the store.
pub struct AddressManagerService<'a, S> {
    store: &'a S,
    id: ServiceId,
}

impl<'a, S> AddressManagerService<'a, S>
where
    S: ModelAccessor + ModelWriter,
{
    pub fn new(store: &'a S, id: ServiceId) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// Look up one of this service's pools by name.
    pub async fn get_address_pool(&self, name: &str) -> StoreResult<PoolInfo> {
        self.store
            .address_pools(self.id)
            .await?
            .into_iter()
            .find(|pool| pool.name == name)
            .ok_or_else(|| StoreError::AddressPoolNameNotFound {
                service: self.id,
                name: name.to_string(),
            })
    }

    /// Gateway of every pool this service owns.
    pub async fn get_gateways(&self) -> StoreResult<Vec<Gateway>> {
        Ok(self
            .store
            .address_pools(self.id)
            .await?
            .into_iter()
            .map(|pool| Gateway {
                gateway_ip: pool.gateway_ip,
                gateway_mac: pool.gateway_mac,
            })
            .collect())
    }

    /// Create and persist a service instance bound to the named pool. The
    /// address is allocated as part of the save.
    pub async fn get_service_instance(
        &self,
        request: ServiceInstanceRequest,
    ) -> StoreResult<AddressManagerServiceInstance> {
        let pool = self.get_address_pool(&request.address_pool_name).await?;

        let mut record = AddressManagerServiceInstance::new(self.id, pool.id);
        record.tenant_for_instance_id = request.tenant_for_instance_id;

        let saved = self.store.save_service_instance(record).await?;
        info!(
            service = %self.id,
            pool = %pool.name,
            record = %saved,
            "Provisioned address service instance"
        );
        Ok(saved)
    }
}
