//! Orphan policy for address-manager service instances.
//!
//! A record that has lost its last provided link deletes itself, which
//! returns its address to the pool. A record that was never linked is left
//! alone: the link-deleted counter must have moved first.

use std::sync::Arc;

use amsync_id::ServiceInstanceId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::error::StoreResult;
use crate::models::AddressManagerServiceInstance;
use crate::store::{ModelAccessor, ModelEvent, ModelWriter};

/// What the policy did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    None,
    Deleted,
}

/// Evaluates the orphan rule after every create and update commit.
pub struct ServiceInstancePolicy<S> {
    store: Arc<S>,
}

impl<S> ServiceInstancePolicy<S>
where
    S: ModelAccessor + ModelWriter,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn handle_create(
        &self,
        record: &AddressManagerServiceInstance,
    ) -> StoreResult<PolicyAction> {
        self.handle_update(record).await
    }

    pub async fn handle_update(
        &self,
        record: &AddressManagerServiceInstance,
    ) -> StoreResult<PolicyAction> {
        let Some(id) = record.id else {
            return Ok(PolicyAction::None);
        };

        if record.link_deleted_count == 0 {
            return Ok(PolicyAction::None);
        }
        if !self.store.provided_links(id).await?.is_empty() {
            return Ok(PolicyAction::None);
        }

        info!(record = %record, "The last provided link has been deleted; self-destructing");
        self.store.delete_service_instance(id).await?;
        Ok(PolicyAction::Deleted)
    }

    /// Dispatch one commit event.
    pub async fn handle_event(&self, event: ModelEvent) -> StoreResult<PolicyAction> {
        let (id, created) = match event {
            ModelEvent::Created(id) => (id, true),
            ModelEvent::Updated(id) => (id, false),
            ModelEvent::Deleted(_) => return Ok(PolicyAction::None),
        };

        let Some(record) = self.current(id).await? else {
            debug!(service_instance_id = %id, "Record gone before policy ran");
            return Ok(PolicyAction::None);
        };

        if created {
            self.handle_create(&record).await
        } else {
            self.handle_update(&record).await
        }
    }

    async fn current(
        &self,
        id: ServiceInstanceId,
    ) -> StoreResult<Option<AddressManagerServiceInstance>> {
        self.store.service_instance(id).await
    }
}

/// Feeds store commit events to the policy until shutdown.
pub struct PolicyRunner<S> {
    policy: ServiceInstancePolicy<S>,
    events: mpsc::UnboundedReceiver<ModelEvent>,
}

impl<S> PolicyRunner<S>
where
    S: ModelAccessor + ModelWriter,
{
    pub fn new(store: Arc<S>, events: mpsc::UnboundedReceiver<ModelEvent>) -> Self {
        Self {
            policy: ServiceInstancePolicy::new(store),
            events,
        }
    }

    /// Handle every event already queued. Returns how many records were
    /// deleted.
    pub async fn drain(&mut self) -> usize {
        let mut deleted = 0;
        while let Ok(event) = self.events.try_recv() {
            if self.dispatch(event).await == PolicyAction::Deleted {
                deleted += 1;
            }
        }
        deleted
    }

    /// Run until shutdown or until the store goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting policy runner");

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => {
                            self.dispatch(event).await;
                        }
                        None => {
                            info!("Event channel closed; policy runner exiting");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Policy runner shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, event: ModelEvent) -> PolicyAction {
        match self.policy.handle_event(event).await {
            Ok(action) => action,
            Err(e) => {
                error!(event = ?event, error = %e, "Policy evaluation failed");
                PolicyAction::None
            }
        }
    }
}
