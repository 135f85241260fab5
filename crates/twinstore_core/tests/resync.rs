//! Bulk resynchronization sweeps.

use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use twinstore_core::{CancelToken, OrderPreference, ReplicationConfig, ResyncOptions, WorkerOptions};
use twinstore_storage::memory::MemoryRepository;
use twinstore_storage::{
    CompareOp, Context, Filter, PersistResult, Record, Repository, RepositoryError, Schema, Storage, Trigger,
    TriggerState, Value,
};
use twinstore_testkit::prelude::*;

fn name_of(storage: &dyn Storage, id: i64) -> Option<String> {
    load(storage, id).and_then(|r| r.get("name").and_then(Value::as_text).map(str::to_string))
}

/// Updates the master row `id` directly, bumping its version.
fn touch_master(twin: &Twin, schema: &Arc<Schema>, id: i64, name: &str) {
    let master = twin.master_storage(schema);
    let mut row = load(master.as_ref(), id).expect("master row missing");
    row.set("name", name).expect("Invalid name");
    master
        .update(&Context::new().suspended(), &mut row)
        .expect("Failed to update master");
}

fn seed_items(twin: &Twin, schema: &Arc<Schema>, ids: impl IntoIterator<Item = i64>) {
    let master = twin.master_storage(schema);
    for id in ids {
        seed_both(twin, schema, &item(master.as_ref(), id, &format!("item-{id}"), id));
    }
}

#[test]
fn resync_refreshes_stale_replica_row() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_both(&twin, &schema, &item(twin.master_storage(&schema).as_ref(), 2, "x", 1));
    for _ in 0..4 {
        touch_master(&twin, &schema, 2, "x");
    }
    align_replica(&twin, &schema, 2);
    assert_eq!(load(twin.replica_storage(&schema).as_ref(), 2).unwrap().version(), Some(5));

    touch_master(&twin, &schema, 2, "y");
    let report = twin.repo.resync(&schema, 1.0, None).unwrap();

    assert_eq!(report.replaced, 1);
    assert_eq!(report.divergent, 1);
    let replica = twin.replica_storage(&schema);
    assert_eq!(name_of(replica.as_ref(), 2).as_deref(), Some("y"));
    assert_eq!(load(replica.as_ref(), 2).unwrap().version(), Some(6));
    assert_converged(&twin, &schema);
}

#[test]
fn resync_clears_property_the_master_never_set() {
    let twin = Twin::new();
    let schema = item_schema();
    let master = twin.master_storage(&schema);
    let replica = twin.replica_storage(&schema);
    let mut on_master = master.prepare().with("id", 1).unwrap().with("qty", 3).unwrap();
    seed(master.as_ref(), &mut on_master);
    let mut on_replica = item(replica.as_ref(), 1, "tampered", 3);
    on_replica.set("version", 1).unwrap();
    seed(replica.as_ref(), &mut on_replica);

    let first = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert_eq!(first.divergent, 1);
    assert_eq!(first.replaced, 1);
    assert_eq!(load(replica.as_ref(), 1).unwrap().get("name"), Some(&Value::Null));
    assert_converged(&twin, &schema);

    let second = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert!(second.is_clean(), "second sweep found work: {second:?}");
}

/// Copies the master row `id` over the replica row so both agree again.
fn align_replica(twin: &Twin, schema: &Arc<Schema>, id: i64) {
    let master_row = load(twin.master_storage(schema).as_ref(), id).expect("master row missing");
    let replica = twin.replica_storage(schema);
    let mut row = replica.prepare();
    master_row.copy_all_properties(&mut row);
    row.mark_all_properties_dirty();
    replica
        .update(&Context::new().suspended(), &mut row)
        .expect("Failed to align replica");
}

#[test]
fn resync_deletes_replica_orphan() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, [1, 2]);
    let replica = twin.replica_storage(&schema);
    let mut orphan = item(replica.as_ref(), 3, "orphan", 0);
    seed(replica.as_ref(), &mut orphan);

    let report = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(ids(replica.as_ref()), vec![1, 2]);
    assert_converged(&twin, &schema);
}

#[test]
fn resync_inserts_missing_rows() {
    let twin = Twin::new();
    let schema = item_schema();
    let master = twin.master_storage(&schema);
    for id in [5, 1, 3] {
        let mut row = item(master.as_ref(), id, "m", id);
        seed(master.as_ref(), &mut row);
    }
    let report = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert_eq!(report.inserted, 3);
    assert_eq!(report.scanned_master, 3);
    assert_eq!(report.scanned_replica, 0);
    assert_converged(&twin, &schema);
}

#[test]
fn recoverable_corrupt_row_is_replaced() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, 1..=5);
    touch_master(&twin, &schema, 2, "changed");
    touch_master(&twin, &schema, 4, "changed");
    assert!(twin.replica.corrupt_row(&schema, &[Value::Integer(3)], true).unwrap());

    let report = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert_eq!(report.corrupt_deleted, 1);
    assert_eq!(report.replaced, 2);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.failed, 0);
    assert_converged(&twin, &schema);
}

#[test]
fn unrecoverable_corrupt_row_is_skipped() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, 1..=5);
    touch_master(&twin, &schema, 2, "changed");
    touch_master(&twin, &schema, 4, "changed");
    assert!(twin.replica.corrupt_row(&schema, &[Value::Integer(3)], false).unwrap());

    let report = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert_eq!(report.corrupt_skipped, 1);
    assert_eq!(report.replaced, 2);
    let replica = twin.replica_storage(&schema);
    assert_eq!(name_of(replica.as_ref(), 2).as_deref(), Some("changed"));
    assert_eq!(name_of(replica.as_ref(), 4).as_deref(), Some("changed"));
    assert_eq!(name_of(replica.as_ref(), 5).as_deref(), Some("item-5"));
    // The master copy of row 3 displaces the undecodable one.
    assert_converged(&twin, &schema);
}

#[test]
fn consecutive_corrupt_rows_are_all_handled() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, 1..=8);
    for (id, recoverable) in [(3, false), (4, false), (6, true), (8, false)] {
        assert!(twin.replica.corrupt_row(&schema, &[Value::Integer(id)], recoverable).unwrap());
    }

    let report = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert_eq!(report.corrupt_skipped, 3);
    assert_eq!(report.corrupt_deleted, 1);
    assert_converged(&twin, &schema);
}

#[test]
fn resync_is_idempotent() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, 1..=6);
    touch_master(&twin, &schema, 2, "changed");
    let master = twin.master_storage(&schema);
    let mut extra = item(master.as_ref(), 9, "new", 0);
    seed(master.as_ref(), &mut extra);

    let first = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert_eq!(first.repaired(), 2);
    let second = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert!(second.is_clean(), "second sweep found work: {second:?}");
    assert_eq!(second.repaired(), 0);
}

#[test]
fn dry_run_changes_nothing() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, 1..=3);
    touch_master(&twin, &schema, 1, "changed");
    let replica = twin.replica_storage(&schema);
    let mut orphan = item(replica.as_ref(), 7, "orphan", 0);
    seed(replica.as_ref(), &mut orphan);
    assert!(twin.replica.corrupt_row(&schema, &[Value::Integer(2)], true).unwrap());
    let before = replica.row_count();

    let options = ResyncOptions::new().with_dry_run(true);
    let report = twin.repo.resync_with(&schema, &options).unwrap();
    assert!(report.dry_run);
    assert_eq!(report.divergent, 3);
    assert_eq!(report.repaired(), 0);
    assert_eq!(report.corrupt_skipped, 1);
    assert_eq!(report.corrupt_deleted, 0);
    assert_eq!(replica.row_count(), before);
    assert_eq!(name_of(replica.as_ref(), 1).as_deref(), Some("item-1"));
}

#[test]
fn filter_limits_the_sweep() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, 1..=20);
    for id in [5, 15] {
        touch_master(&twin, &schema, id, "changed");
    }

    let filter = Filter::compare("id", CompareOp::Ge, 10);
    let report = twin.repo.resync(&schema, 1.0, Some(&filter)).unwrap();
    assert_eq!(report.replaced, 1);
    assert_eq!(report.scanned_master, 11);
    let replica = twin.replica_storage(&schema);
    assert_eq!(name_of(replica.as_ref(), 15).as_deref(), Some("changed"));
    assert_eq!(name_of(replica.as_ref(), 5).as_deref(), Some("item-5"));
}

#[test]
fn filtered_sweep_leaves_corrupt_rows_outside_the_filter() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, 1..=12);
    assert!(twin.replica.corrupt_row(&schema, &[Value::Integer(3)], true).unwrap());
    assert!(twin.replica.corrupt_row(&schema, &[Value::Integer(11)], true).unwrap());

    let filter = Filter::compare("id", CompareOp::Ge, 10);
    let report = twin.repo.resync(&schema, 1.0, Some(&filter)).unwrap();
    assert_eq!(report.corrupt_deleted, 1);
    assert_eq!(report.corrupt_skipped, 1);
    assert_eq!(report.inserted, 1);
    let replica = twin.replica_storage(&schema);
    assert_eq!(replica.row_count(), 12);
    assert_eq!(name_of(replica.as_ref(), 11).as_deref(), Some("item-11"));

    // A key alone cannot tell whether the row matches a non-key filter, so
    // the row is skipped and displaced by the master copy instead.
    let by_quantity = Filter::compare("qty", CompareOp::Le, 5);
    let report = twin.repo.resync(&schema, 1.0, Some(&by_quantity)).unwrap();
    assert_eq!(report.corrupt_deleted, 0);
    assert_eq!(report.corrupt_skipped, 1);
    assert_eq!(report.inserted, 1);
    assert_eq!(replica.row_count(), 12);
    assert_converged(&twin, &schema);
}

#[test]
fn filter_parameters_are_bound() {
    let twin = Twin::new();
    let schema = item_schema();
    let master = twin.master_storage(&schema);
    for id in 1..=6 {
        let mut row = item(master.as_ref(), id, "m", id);
        seed(master.as_ref(), &mut row);
    }
    let options = ResyncOptions::new()
        .with_filter(Filter::param("qty", CompareOp::Le, 0))
        .with_params(vec![Value::Integer(2)]);
    let report = twin.repo.resync_with(&schema, &options).unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(ids(twin.replica_storage(&schema).as_ref()), vec![1, 2]);
}

#[test]
fn unbound_filter_parameter_is_rejected() {
    let twin = Twin::new();
    let options = ResyncOptions::new().with_filter(Filter::param("qty", CompareOp::Le, 0));
    assert!(twin.repo.resync_with(&item_schema(), &options).is_err());
}

#[test]
fn worker_mode_converges() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, 1..=10);
    let master = twin.master_storage(&schema);
    for id in 11..=30 {
        let mut row = item(master.as_ref(), id, "m", id);
        seed(master.as_ref(), &mut row);
    }
    for id in [2, 4, 6] {
        touch_master(&twin, &schema, id, "changed");
    }

    let options = ResyncOptions::new().with_worker(WorkerOptions::default());
    let report = twin.repo.resync_with(&schema, &options).unwrap();
    assert_eq!(report.inserted, 20);
    assert_eq!(report.replaced, 3);
    assert_eq!(report.failed, 0);
    assert_converged(&twin, &schema);
}

/// Holds every replica insert for a while, keeping the resync worker busy.
struct Stall(Duration);

impl Trigger for Stall {
    fn before_insert(&self, _cx: &Context, _record: &mut Record) -> PersistResult<TriggerState> {
        thread::sleep(self.0);
        Ok(None)
    }
}

#[test]
fn saturated_worker_queue_aborts_the_sweep() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, [1]);
    let master = twin.master_storage(&schema);
    for id in 2..=6 {
        let mut row = item(master.as_ref(), id, "m", id);
        seed(master.as_ref(), &mut row);
    }
    let replica = twin.replica_storage(&schema);
    assert!(twin.replica.corrupt_row(&schema, &[Value::Integer(1)], true).unwrap());
    let stall = replica.add_trigger(Arc::new(Stall(Duration::from_millis(150))));

    let worker = WorkerOptions {
        capacity: 1,
        offer_timeout: Duration::from_millis(5),
        ..WorkerOptions::default()
    };
    let options = ResyncOptions::new().with_worker(worker);
    let err = twin.repo.resync_with(&schema, &options).unwrap_err();
    assert!(
        matches!(err, RepositoryError::QueueTimeout { waited } if waited == Duration::from_millis(5)),
        "unexpected error: {err}"
    );

    // The corrupt row deletion was rolled back with the sweep transaction.
    assert!(replica.remove_trigger(stall));
    let report = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert_eq!(report.corrupt_deleted, 1);
    assert_converged(&twin, &schema);
}

#[test]
fn slow_worker_drain_times_out() {
    let twin = Twin::new();
    let schema = item_schema();
    let master = twin.master_storage(&schema);
    for id in 1..=4 {
        let mut row = item(master.as_ref(), id, "m", id);
        seed(master.as_ref(), &mut row);
    }
    let replica = twin.replica_storage(&schema);
    let stall = replica.add_trigger(Arc::new(Stall(Duration::from_millis(100))));

    let worker = WorkerOptions {
        drain_timeout: Duration::from_millis(10),
        ..WorkerOptions::default()
    };
    let options = ResyncOptions::new().with_worker(worker);
    let err = twin.repo.resync_with(&schema, &options).unwrap_err();
    assert!(
        matches!(err, RepositoryError::QueueTimeout { waited } if waited == Duration::from_millis(10)),
        "unexpected error: {err}"
    );
    assert!(replica.row_count() < 4, "queued repairs were not abandoned");

    assert!(replica.remove_trigger(stall));
    let report = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert!(report.inserted >= 1);
    assert_converged(&twin, &schema);
}

#[test]
fn commits_follow_the_interval() {
    let twin = Twin::new();
    let schema = item_schema();
    let master = twin.master_storage(&schema);
    for id in 1..=10 {
        let mut row = item(master.as_ref(), id, "m", id);
        seed(master.as_ref(), &mut row);
    }
    let options = ResyncOptions::new().with_commit_interval(2);
    let report = twin.repo.resync_with(&schema, &options).unwrap();
    assert!(report.commits >= 5, "only {} commits", report.commits);
    assert_converged(&twin, &schema);
}

#[test]
fn commits_follow_the_repair_limit() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, 1..=8);
    for id in [1, 3, 5, 7] {
        touch_master(&twin, &schema, id, "changed");
    }
    let options = ResyncOptions::new().with_max_repairs_per_commit(1);
    let report = twin.repo.resync_with(&schema, &options).unwrap();
    assert_eq!(report.replaced, 4);
    assert!(report.commits >= 4, "only {} commits", report.commits);
    assert_converged(&twin, &schema);
}

#[test]
fn cancelled_sweep_stops() {
    let twin = Twin::new();
    let schema = item_schema();
    let master = twin.master_storage(&schema);
    for id in 1..=5 {
        let mut row = item(master.as_ref(), id, "m", id);
        seed(master.as_ref(), &mut row);
    }
    let cancel = CancelToken::new();
    cancel.cancel();
    let options = ResyncOptions::new().with_cancel(cancel);
    let err = twin.repo.resync_with(&schema, &options).unwrap_err();
    assert!(matches!(err, RepositoryError::Interrupted), "unexpected error: {err}");
    assert_eq!(twin.replica_storage(&schema).row_count(), 0);
}

#[test]
fn throttled_sweep_still_converges() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, 1..=5);
    touch_master(&twin, &schema, 3, "changed");
    let report = twin.repo.resync(&schema, 0.5, None).unwrap();
    assert_eq!(report.replaced, 1);
    assert_converged(&twin, &schema);
}

#[test]
fn unreachable_master_fails_the_sweep() {
    let twin = Twin::new();
    let schema = item_schema();
    seed_items(&twin, &schema, 1..=3);
    twin.repo.storage_for(&schema).unwrap();
    twin.master.set_online(false);
    let err = twin.repo.resync(&schema, 1.0, None).unwrap_err();
    assert!(err.is_unavailable(), "unexpected error: {err}");
}

#[test]
fn master_without_the_type_is_unsupported() {
    let twin = Twin::build(
        MemoryRepository::builder("master").master(true).unsupported_type("Draft"),
        MemoryRepository::builder("replica"),
        ReplicationConfig::default(),
    );
    let err = twin.repo.resync(&draft_schema(), 1.0, None).unwrap_err();
    assert!(err.is_unsupported());
}

fn shipment(storage: &dyn Storage, order_id: i64, line: i64, carrier: &str) -> twinstore_storage::Record {
    storage
        .prepare()
        .with("order_id", order_id)
        .and_then(|r| r.with("line", line))
        .and_then(|r| r.with("carrier", carrier))
        .expect("Invalid shipment")
}

#[test]
fn natural_order_of_the_replica_is_followed() {
    let twin = Twin::build(
        MemoryRepository::builder("master")
            .master(true)
            .natural_order("Shipment", &["line"]),
        MemoryRepository::builder("replica").natural_order("Shipment", &["line"]),
        ReplicationConfig::default().with_order_preference(OrderPreference::MasterFirst),
    );
    let schema = shipment_schema();
    let master = twin.master_storage(&schema);
    let replica = twin.replica_storage(&schema);
    for (order_id, line) in [(1, 1), (1, 2), (2, 1), (3, 3)] {
        let mut row = shipment(master.as_ref(), order_id, line, "post");
        seed(master.as_ref(), &mut row);
    }
    for (order_id, line) in [(1, 2), (2, 2)] {
        let mut row = shipment(replica.as_ref(), order_id, line, "courier");
        seed(replica.as_ref(), &mut row);
    }

    let report = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert_eq!(report.inserted, 3);
    assert_eq!(report.replaced, 1);
    assert_eq!(report.deleted, 1);
    assert_converged(&twin, &schema);
}

#[test]
fn explicit_order_must_use_key_properties() {
    let twin = Twin::new();
    let schema = shipment_schema();
    let options = ResyncOptions::new().with_order(&["carrier"]);
    let err = twin.repo.resync_with(&schema, &options).unwrap_err();
    assert!(matches!(err, RepositoryError::Config(_)));

    let master = twin.master_storage(&schema);
    let mut row = shipment(master.as_ref(), 4, 1, "post");
    seed(master.as_ref(), &mut row);
    let options = ResyncOptions::new().with_order(&["line"]);
    let report = twin.repo.resync_with(&schema, &options).unwrap();
    assert_eq!(report.inserted, 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn sweep_converges_any_layout(plans in row_plans(24)) {
        let twin = Twin::new();
        let schema = item_schema();
        apply_plans(&twin, &schema, &plans);

        let report = twin.repo.resync(&schema, 1.0, None).unwrap();
        prop_assert_eq!(report.failed, 0);
        prop_assert!(converged(
            twin.master_storage(&schema).as_ref(),
            twin.replica_storage(&schema).as_ref()
        ));

        let again = twin.repo.resync(&schema, 1.0, None).unwrap();
        prop_assert!(again.is_clean(), "second sweep found work: {:?}", again);
    }

    #[test]
    fn worker_sweep_converges_any_layout(plans in row_plans(16), interval in 1u64..6) {
        let twin = Twin::new();
        let schema = item_schema();
        apply_plans(&twin, &schema, &plans);

        let options = ResyncOptions::new()
            .with_worker(WorkerOptions::default())
            .with_commit_interval(interval);
        let report = twin.repo.resync_with(&schema, &options).unwrap();
        prop_assert_eq!(report.failed, 0);
        prop_assert!(converged(
            twin.master_storage(&schema).as_ref(),
            twin.replica_storage(&schema).as_ref()
        ));
    }
}
