//! Large-object writes mirrored to the master.

use std::io::Write;
use std::sync::Arc;
use twinstore_core::{ReplicatedLob, ReplicationConfig};
use twinstore_storage::memory::MemoryRepository;
use twinstore_storage::{Context, LobRef, PersistError, Record, Schema, Storage, Value};
use twinstore_testkit::prelude::*;

fn document(storage: &dyn Storage, id: i64, body: &str, attachment: &[u8]) -> Record {
    storage
        .prepare()
        .with("id", id)
        .and_then(|r| r.with("title", format!("doc-{id}")))
        .and_then(|r| r.with("body", Value::Clob(LobRef::clob(body))))
        .and_then(|r| r.with("attachment", Value::Blob(LobRef::blob(attachment.to_vec()))))
        .expect("Invalid document")
}

fn lob(record: &Record, property: &str) -> LobRef {
    record
        .get(property)
        .and_then(Value::as_lob)
        .cloned()
        .expect("large object missing")
}

fn text(storage: &dyn Storage, id: i64, property: &str) -> String {
    let row = load(storage, id).expect("row missing");
    lob(&row, property).read_to_string().expect("unreadable large object")
}

fn insert_document(twin: &Twin, schema: &Arc<Schema>, id: i64) -> Record {
    let storage = twin.storage(schema);
    let mut doc = document(storage.as_ref(), id, "first draft", b"\x00\x01");
    storage.insert(&Context::new(), &mut doc).unwrap();
    doc
}

#[test]
fn inserted_handles_are_wrapped() {
    let twin = Twin::new();
    let schema = document_schema();
    let doc = insert_document(&twin, &schema, 1);

    assert!(lob(&doc, "body").handle().as_any().is::<ReplicatedLob>());
    assert!(lob(&doc, "attachment").handle().as_any().is::<ReplicatedLob>());
    assert_eq!(twin.replica_storage(&schema).triggers().len(), 3);
    assert_eq!(text(twin.master_storage(&schema).as_ref(), 1, "body"), "first draft");
    assert_eq!(text(twin.replica_storage(&schema).as_ref(), 1, "body"), "first draft");
}

#[test]
fn replacing_content_reaches_both_sides() {
    let twin = Twin::new();
    let schema = document_schema();
    let doc = insert_document(&twin, &schema, 1);

    lob(&doc, "body").replace(b"second draft").unwrap();
    assert_eq!(text(twin.master_storage(&schema).as_ref(), 1, "body"), "second draft");
    assert_eq!(text(twin.replica_storage(&schema).as_ref(), 1, "body"), "second draft");
    assert_converged(&twin, &schema);
}

#[test]
fn loaded_handles_mirror_streamed_writes() {
    let twin = Twin::new();
    let schema = document_schema();
    insert_document(&twin, &schema, 1);

    let storage = twin.storage(&schema);
    let mut doc = key(storage.as_ref(), 1);
    assert!(storage.load(&Context::new(), &mut doc).unwrap());
    let attachment = lob(&doc, "attachment");
    {
        let mut writer = attachment.handle().open_write(2).unwrap();
        writer.write_all(b"\x02\x03").unwrap();
        writer.flush().unwrap();
    }

    let on_master = load(twin.master_storage(&schema).as_ref(), 1).unwrap();
    assert_eq!(lob(&on_master, "attachment").read_to_vec().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(attachment.read_to_vec().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn suspended_loads_are_not_wrapped() {
    let twin = Twin::new();
    let schema = document_schema();
    insert_document(&twin, &schema, 1);

    let storage = twin.storage(&schema);
    let doc = load(storage.as_ref(), 1).unwrap();
    assert!(!lob(&doc, "body").handle().as_any().is::<ReplicatedLob>());
}

#[test]
fn write_fails_when_master_row_is_gone() {
    let twin = Twin::new();
    let schema = document_schema();
    let doc = insert_document(&twin, &schema, 1);

    let master = twin.master_storage(&schema);
    let mut gone = key(master.as_ref(), 1);
    master.delete(&Context::new().suspended(), &mut gone).unwrap();

    let err = lob(&doc, "body").replace(b"lost").unwrap_err();
    assert!(err.is_no_such_record(), "unexpected error: {err}");
    assert_eq!(text(twin.replica_storage(&schema).as_ref(), 1, "body"), "first draft");
}

#[test]
fn write_fails_while_master_is_offline() {
    let twin = Twin::new();
    let schema = document_schema();
    let doc = insert_document(&twin, &schema, 1);

    twin.master.set_online(false);
    let err = lob(&doc, "body").replace(b"offline").unwrap_err();
    assert!(matches!(err, PersistError::MasterUnavailable(_)), "unexpected error: {err}");
}

#[test]
fn property_master_cannot_hold_is_written_locally() {
    let twin = Twin::build(
        MemoryRepository::builder("master")
            .master(true)
            .unsupported_property("Document", "attachment"),
        MemoryRepository::builder("replica"),
        ReplicationConfig::default(),
    );
    let schema = document_schema();
    let doc = insert_document(&twin, &schema, 1);

    lob(&doc, "attachment").replace(b"local only").unwrap();
    assert_eq!(
        lob(&load(twin.replica_storage(&schema).as_ref(), 1).unwrap(), "attachment")
            .read_to_vec()
            .unwrap(),
        b"local only".to_vec()
    );
    let on_master = load(twin.master_storage(&schema).as_ref(), 1).unwrap();
    assert!(on_master.get("attachment").and_then(Value::as_lob).is_none());
}

#[test]
fn wrapping_can_be_disabled() {
    let twin = Twin::with_config(ReplicationConfig::default().with_lob_replication(false));
    let schema = document_schema();
    let doc = insert_document(&twin, &schema, 1);

    assert!(!lob(&doc, "body").handle().as_any().is::<ReplicatedLob>());
    assert_eq!(twin.replica_storage(&schema).triggers().len(), 1);
}

#[test]
fn resync_repairs_divergent_content() {
    let twin = Twin::new();
    let schema = document_schema();
    insert_document(&twin, &schema, 1);
    insert_document(&twin, &schema, 2);

    let replica = twin.replica_storage(&schema);
    let stale = load(replica.as_ref(), 2).unwrap();
    lob(&stale, "body").replace(b"drifted").unwrap();
    assert_eq!(text(replica.as_ref(), 2, "body"), "drifted");

    let report = twin.repo.resync(&schema, 1.0, None).unwrap();
    assert_eq!(report.replaced, 1);
    assert_eq!(text(replica.as_ref(), 2, "body"), "first draft");
    assert_converged(&twin, &schema);
}
