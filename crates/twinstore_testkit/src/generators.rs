//! Property-based test generators using proptest.
//!
//! Generates master/replica contents that disagree in every way the
//! reconciliation engine must heal.

use crate::fixtures::{item, seed, seed_both, Twin};
use proptest::prelude::*;
use std::sync::Arc;
use twinstore_storage::{Context, Schema, Storage, Value};

/// How one key is laid out across master and replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Present on both sides with equal properties.
    Agreeing,
    /// Present on both sides with different properties.
    Differing,
    /// Present on the master only.
    MasterOnly,
    /// Present on the replica only.
    ReplicaOnly,
    /// Present on both sides, replica row undecodable but key recoverable.
    CorruptReplica,
}

/// One generated `Item` row and where it lives.
#[derive(Debug, Clone)]
pub struct RowPlan {
    /// Primary key.
    pub id: i64,
    /// Name on the master.
    pub name: String,
    /// Quantity on the master.
    pub qty: i64,
    /// Placement across the two sides.
    pub placement: Placement,
}

/// Strategy for generating placements.
pub fn placement_strategy() -> impl Strategy<Value = Placement> {
    prop_oneof![
        3 => Just(Placement::Agreeing),
        2 => Just(Placement::Differing),
        2 => Just(Placement::MasterOnly),
        2 => Just(Placement::ReplicaOnly),
        1 => Just(Placement::CorruptReplica),
    ]
}

/// Strategy for generating short names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,12}").expect("Invalid regex")
}

/// Strategy for generating up to `max_rows` rows with distinct keys.
pub fn row_plans(max_rows: usize) -> impl Strategy<Value = Vec<RowPlan>> {
    prop::collection::btree_map(0i64..1000, (name_strategy(), 0i64..100, placement_strategy()), 0..max_rows)
        .prop_map(|rows| {
            rows.into_iter()
                .map(|(id, (name, qty, placement))| RowPlan {
                    id,
                    name,
                    qty,
                    placement,
                })
                .collect()
        })
}

/// Lays `plans` out across the two sides of `twin` for the `Item` type.
pub fn apply_plans(twin: &Twin, schema: &Arc<Schema>, plans: &[RowPlan]) {
    let master = twin.master_storage(schema);
    let replica = twin.replica_storage(schema);
    let cx = Context::new().suspended();
    for plan in plans {
        let record = item(master.as_ref(), plan.id, &plan.name, plan.qty);
        match plan.placement {
            Placement::Agreeing => seed_both(twin, schema, &record),
            Placement::Differing => {
                seed_both(twin, schema, &record);
                let mut stale = item(replica.as_ref(), plan.id, &format!("{}~", plan.name), plan.qty + 1);
                replica.update(&cx, &mut stale).expect("Failed to skew replica");
            }
            Placement::MasterOnly => seed(master.as_ref(), &mut record.clone()),
            Placement::ReplicaOnly => {
                let mut orphan = item(replica.as_ref(), plan.id, &plan.name, plan.qty)
                    .with("version", 1)
                    .expect("Invalid version");
                seed(replica.as_ref(), &mut orphan);
            }
            Placement::CorruptReplica => {
                seed_both(twin, schema, &record);
                twin.replica
                    .corrupt_row(schema, &[Value::Integer(plan.id)], true)
                    .expect("Failed to corrupt row");
            }
        }
    }
}
