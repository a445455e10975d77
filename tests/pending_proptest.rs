use std::collections::{BTreeMap, HashMap, HashSet};

use kitchen_sync::queue::{
    Direction, EntityType, OperationKind, OperationRecord, PendingSet, Priority, Trigger,
};
use proptest::prelude::*;

fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::High), Just(Priority::Normal), Just(Priority::Low)]
}

fn record(id: u64, entity: u8, priority: Priority) -> OperationRecord {
    OperationRecord {
        id,
        owner_id: "kitchen-1".into(),
        entity_type: EntityType::CatalogItem,
        entity_id: format!("dish-{entity}"),
        operation_kind: OperationKind::Update,
        direction: Direction::PushToExternal,
        priority,
        retry_count: 0,
        created_at_ms: 0,
        trigger: Trigger::Mutation,
        metadata: BTreeMap::new(),
    }
}

fn drain_all(set: &mut PendingSet, batch_size: usize) -> Vec<Vec<OperationRecord>> {
    let mut batches = Vec::new();
    loop {
        let batch = set.take_batch(batch_size);
        if batch.is_empty() {
            return batches;
        }
        batches.push(batch);
    }
}

proptest! {
    #[test]
    fn distinct_entities_drain_by_priority_then_arrival(
        priorities in prop::collection::vec(priority_strategy(), 1..60),
        batch_size in 1usize..12,
    ) {
        let mut set = PendingSet::new();
        let mut expected = Vec::new();
        for (i, p) in priorities.iter().enumerate() {
            let r = record(i as u64 + 1, i as u8, *p);
            expected.push((p.rank(), r.id));
            set.push(r);
        }
        expected.sort();

        let batches = drain_all(&mut set, batch_size);
        for batch in &batches {
            prop_assert!(batch.len() <= batch_size);
        }

        let order: Vec<u64> = batches.into_iter().flatten().map(|r| r.id).collect();
        let want: Vec<u64> = expected.into_iter().map(|(_, id)| id).collect();
        prop_assert_eq!(order, want);
        prop_assert!(set.is_idle());
    }

    #[test]
    fn shared_entities_keep_per_entity_order_and_never_share_a_batch(
        ops in prop::collection::vec((0u8..5, priority_strategy()), 1..60),
        batch_size in 1usize..8,
    ) {
        let mut set = PendingSet::new();
        for (i, (entity, p)) in ops.iter().enumerate() {
            set.push(record(i as u64 + 1, *entity, *p));
        }

        let batches = drain_all(&mut set, batch_size);

        let mut seen = HashSet::new();
        for batch in &batches {
            prop_assert!(batch.len() <= batch_size);
            let mut entities = HashSet::new();
            for r in batch {
                prop_assert!(entities.insert(r.entity_id.clone()), "entity twice in one batch");
                prop_assert!(seen.insert(r.id), "record dispatched twice");
            }
        }
        prop_assert_eq!(seen.len(), ops.len());

        // Same-priority records of one entity keep arrival order.
        let mut last: HashMap<(String, usize), u64> = HashMap::new();
        for r in batches.iter().flatten() {
            let key = (r.entity_id.clone(), r.priority.rank());
            if let Some(prev) = last.insert(key, r.id) {
                prop_assert!(prev < r.id);
            }
        }
    }
}
