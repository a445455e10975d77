use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type OperationId = u64;

/// Category of local data kept in step with the point-of-sale system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    CatalogItem,
    Employee,
    RecipeCost,
    IngredientCost,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::CatalogItem,
        EntityType::Employee,
        EntityType::RecipeCost,
        EntityType::IngredientCost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::CatalogItem => "catalog_item",
            EntityType::Employee => "employee",
            EntityType::RecipeCost => "recipe_cost",
            EntityType::IngredientCost => "ingredient_cost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// Which side is authoritative for one sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    PushToExternal,
    PullFromExternal,
    Bidirectional,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::PushToExternal => "push_to_external",
            Direction::PullFromExternal => "pull_from_external",
            Direction::Bidirectional => "bidirectional",
        }
    }
}

/// Queue ordering only. Never consulted for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Tier index, 0 drains first.
    pub fn rank(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// What caused the operation to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// An entity mutation hook.
    Mutation,
    /// An explicit "sync now" request.
    Manual,
}

impl Trigger {
    /// Value written to the sync log's `operation_type` column.
    pub fn operation_type(&self) -> &'static str {
        match self {
            Trigger::Mutation => "auto_sync",
            Trigger::Manual => "manual_sync",
        }
    }
}

macro_rules! impl_str_enum {
    ($ty:ty, $label:literal, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_ascii_lowercase();
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == wanted)
                    .ok_or_else(|| format!("unknown {}: {}", $label, s))
            }
        }
    };
}

impl_str_enum!(EntityType, "entity type", [
    EntityType::CatalogItem,
    EntityType::Employee,
    EntityType::RecipeCost,
    EntityType::IngredientCost,
]);
impl_str_enum!(OperationKind, "operation kind", [
    OperationKind::Create,
    OperationKind::Update,
    OperationKind::Delete,
]);
impl_str_enum!(Direction, "direction", [
    Direction::PushToExternal,
    Direction::PullFromExternal,
    Direction::Bidirectional,
]);
impl_str_enum!(Priority, "priority", [Priority::High, Priority::Normal, Priority::Low]);

/// Identity of "what changed": one local record of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub owner_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
}

/// One unit of sync work.
///
/// Only `retry_count` changes after enqueue (and `metadata`, when a duplicate
/// request is coalesced into a record that has not started yet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub owner_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation_kind: OperationKind,
    pub direction: Direction,
    pub priority: Priority,
    pub retry_count: u32,
    /// Milliseconds since UNIX_EPOCH of the original enqueue.
    pub created_at_ms: u64,
    pub trigger: Trigger,
    pub metadata: BTreeMap<String, String>,
}

impl OperationRecord {
    pub fn entity_key(&self) -> EntityKey {
        EntityKey {
            owner_id: self.owner_id.clone(),
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
        }
    }

    pub(crate) fn same_intent(&self, req: &EnqueueRequest) -> bool {
        self.operation_kind == req.operation_kind
            && self.direction == req.direction
            && self.priority == req.priority
    }
}

/// Caller-side description of a sync request; the queue assigns id,
/// retry count and creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub owner_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation_kind: OperationKind,
    pub direction: Direction,
    pub priority: Priority,
    pub trigger: Trigger,
    pub metadata: BTreeMap<String, String>,
}

impl EnqueueRequest {
    pub fn new(
        owner_id: impl Into<String>,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation_kind: OperationKind,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            entity_type,
            entity_id: entity_id.into(),
            operation_kind,
            direction: Direction::PushToExternal,
            priority: Priority::Normal,
            trigger: Trigger::Mutation,
            metadata: BTreeMap::new(),
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey {
            owner_id: self.owner_id.clone(),
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
        }
    }

    pub(crate) fn into_record(self, id: OperationId, created_at_ms: u64) -> OperationRecord {
        OperationRecord {
            id,
            owner_id: self.owner_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            operation_kind: self.operation_kind,
            direction: self.direction,
            priority: self.priority,
            retry_count: 0,
            created_at_ms,
            trigger: self.trigger,
            metadata: self.metadata,
        }
    }
}
