//! Dispatch from an operation record to the entity-specific reconciler.
//!
//! Reconcilers are the boundary to the point-of-sale field mapping code:
//! they perform the network calls and report classified failures. Every
//! reconciler must be idempotent, because the queue delivers at least once.

mod conflict;
mod error;

use std::sync::Arc;

use crate::queue::record::{Direction, EntityType, OperationKind, OperationRecord};

pub use self::conflict::{last_write_wins, EntityVersions, Resolution};
pub use self::error::{ErrorClass, ReconcileError};

/// One entity family's sync routines against the external system.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    /// Write the local state of `op.entity_id` outward (idempotent upsert).
    async fn push(&self, op: &OperationRecord) -> Result<(), ReconcileError>;

    /// Write the external state of `op.entity_id` inward.
    async fn pull(&self, op: &OperationRecord) -> Result<(), ReconcileError>;

    /// Modification times of both copies, for bidirectional sync.
    async fn versions(&self, op: &OperationRecord) -> Result<EntityVersions, ReconcileError>;

    fn supports_remote_delete(&self) -> bool {
        false
    }

    async fn delete_remote(&self, op: &OperationRecord) -> Result<(), ReconcileError> {
        Err(ReconcileError::NotImplemented {
            operation: OperationKind::Delete,
            entity_type: op.entity_type,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerKind {
    Catalog,
    Staff,
    Cost,
}

impl From<EntityType> for ReconcilerKind {
    fn from(entity_type: EntityType) -> Self {
        match entity_type {
            EntityType::CatalogItem => ReconcilerKind::Catalog,
            EntityType::Employee => ReconcilerKind::Staff,
            EntityType::RecipeCost | EntityType::IngredientCost => ReconcilerKind::Cost,
        }
    }
}

/// What a successful dispatch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Pushed,
    Pulled,
    InSync,
    DeletedRemote,
}

pub struct ReconcilerRouter {
    catalog: Arc<dyn Reconciler>,
    staff: Arc<dyn Reconciler>,
    cost: Arc<dyn Reconciler>,
}

impl ReconcilerRouter {
    pub fn new(
        catalog: Arc<dyn Reconciler>,
        staff: Arc<dyn Reconciler>,
        cost: Arc<dyn Reconciler>,
    ) -> Self {
        Self {
            catalog,
            staff,
            cost,
        }
    }

    pub fn reconciler_for(&self, entity_type: EntityType) -> &Arc<dyn Reconciler> {
        match ReconcilerKind::from(entity_type) {
            ReconcilerKind::Catalog => &self.catalog,
            ReconcilerKind::Staff => &self.staff,
            ReconcilerKind::Cost => &self.cost,
        }
    }

    /// Run the routine matching the record's entity type, kind and direction.
    pub async fn dispatch(&self, op: &OperationRecord) -> Result<DispatchOutcome, ReconcileError> {
        let reconciler = self.reconciler_for(op.entity_type);

        match (op.operation_kind, op.direction) {
            (OperationKind::Delete, Direction::PullFromExternal) => {
                reconciler.pull(op).await?;
                Ok(DispatchOutcome::Pulled)
            }
            (OperationKind::Delete, _) => {
                if !reconciler.supports_remote_delete() {
                    return Err(ReconcileError::NotImplemented {
                        operation: OperationKind::Delete,
                        entity_type: op.entity_type,
                    });
                }
                reconciler.delete_remote(op).await?;
                Ok(DispatchOutcome::DeletedRemote)
            }
            (_, Direction::PushToExternal) => {
                reconciler.push(op).await?;
                Ok(DispatchOutcome::Pushed)
            }
            (_, Direction::PullFromExternal) => {
                reconciler.pull(op).await?;
                Ok(DispatchOutcome::Pulled)
            }
            (_, Direction::Bidirectional) => {
                let versions = reconciler.versions(op).await?;
                match last_write_wins(&op.entity_id, versions)? {
                    Resolution::Push => {
                        reconciler.push(op).await?;
                        Ok(DispatchOutcome::Pushed)
                    }
                    Resolution::Pull => {
                        reconciler.pull(op).await?;
                        Ok(DispatchOutcome::Pulled)
                    }
                    Resolution::InSync => Ok(DispatchOutcome::InSync),
                }
            }
        }
    }
}
