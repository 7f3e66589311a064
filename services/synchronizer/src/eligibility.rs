//! Selects which pending records a sync pass may work on.

use tracing::{error, info};

use crate::error::StoreResult;
use crate::models::AddressManagerServiceInstance;
use crate::resolver::{resolve_target, Target};
use crate::store::ModelAccessor;

/// Filter the raw pending set of a sync pass.
///
/// Nothing is eligible unless the fabric service exists with autoconfig on.
/// Otherwise a record stays if its target resolves to a usable compute
/// instance. Input order is preserved.
pub async fn filter_eligible<S>(
    store: &S,
    pending: Vec<AddressManagerServiceInstance>,
) -> StoreResult<Vec<AddressManagerServiceInstance>>
where
    S: ModelAccessor + ?Sized,
{
    match store.fabric_service().await? {
        Some(fabric) if fabric.autoconfig => {}
        _ => {
            info!("No fabric service or autoconfig disabled; nothing to sync");
            return Ok(Vec::new());
        }
    }

    let mut eligible = Vec::with_capacity(pending.len());
    for record in pending {
        if is_eligible(store, &record).await? {
            eligible.push(record);
        }
    }
    Ok(eligible)
}

async fn is_eligible<S>(store: &S, record: &AddressManagerServiceInstance) -> StoreResult<bool>
where
    S: ModelAccessor + ?Sized,
{
    match resolve_target(store, record).await? {
        Target::Subscriber { instance: None, .. } => {
            info!(record = %record, "Skipping record because its subscriber has no instance");
            Ok(false)
        }
        Target::Subscriber { .. } => Ok(true),
        Target::Unlinked => {
            info!(record = %record, "Skipping record because it has no tenant_for_instance_id");
            Ok(false)
        }
        Target::Legacy {
            instance_id,
            instance: None,
        } => {
            error!(
                record = %record,
                instance_id = %instance_id,
                "Skipping record because it appears to be linked to a dead instance"
            );
            Ok(false)
        }
        Target::Legacy {
            instance: Some(instance),
            ..
        } => {
            if instance.instance_name.is_none() {
                info!(
                    record = %record,
                    instance_id = %instance.id,
                    "Skipping record because its instance has no instance_name"
                );
                return Ok(false);
            }
            Ok(true)
        }
    }
}
