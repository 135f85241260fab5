//! JSON snapshots of one record type.
//!
//! A schema file describes the type:
//!
//! ```json
//! {
//!   "name": "Item",
//!   "properties": [
//!     { "name": "id", "kind": "integer", "key": true },
//!     { "name": "name", "kind": "text" },
//!     { "name": "version", "kind": "integer", "version": true }
//!   ]
//! }
//! ```
//!
//! A snapshot file is a JSON array of row objects keyed by property name.
//! Clobs are strings; blobs and bytes are arrays of byte values.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use twinstore_core::{ReplicatedRepository, ResyncReport};
use twinstore_storage::memory::{MemoryRepository, MemoryStorage};
use twinstore_storage::{
    collect, Context, FetchError, Filter, LobRef, PersistError, PropertyKind, Query, Record,
    RepositoryError, Schema, SchemaError, Storage, Value,
};

/// Errors raised while reading or writing snapshots.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A file could not be read or written.
    #[error("{path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// A file is not valid JSON of the expected shape.
    #[error("{path}: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying failure.
        source: serde_json::Error,
    },

    /// The schema file describes an invalid type.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A row does not fit the type.
    #[error("row {row}: {message}")]
    Row {
        /// Zero-based row position.
        row: usize,
        /// What is wrong with it.
        message: String,
    },

    /// A `--filter` argument could not be parsed.
    #[error("invalid filter {0:?}, expected property=value")]
    Filter(String),

    /// The repositories refused an operation.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// A row could not be written.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// A row could not be read.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum KindName {
    Bool,
    Integer,
    Text,
    Bytes,
    Blob,
    Clob,
}

impl From<KindName> for PropertyKind {
    fn from(kind: KindName) -> Self {
        match kind {
            KindName::Bool => Self::Bool,
            KindName::Integer => Self::Integer,
            KindName::Text => Self::Text,
            KindName::Bytes => Self::Bytes,
            KindName::Blob => Self::Blob,
            KindName::Clob => Self::Clob,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PropertyFile {
    name: String,
    kind: KindName,
    #[serde(default)]
    key: bool,
    #[serde(default)]
    version: bool,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    independent: bool,
}

#[derive(Debug, Deserialize)]
struct AlternateKeyFile {
    name: String,
    properties: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    name: String,
    properties: Vec<PropertyFile>,
    #[serde(default)]
    alternate_keys: Vec<AlternateKeyFile>,
    #[serde(default)]
    independent: bool,
}

fn read(path: &Path) -> Result<String, SnapshotError> {
    fs::read_to_string(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, SnapshotError> {
    serde_json::from_str(&read(path)?).map_err(|source| SnapshotError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a schema file.
pub fn load_schema(path: &Path) -> Result<Arc<Schema>, SnapshotError> {
    let file: SchemaFile = parse(path)?;
    let mut builder = Schema::builder(file.name);
    for p in file.properties {
        let kind = PropertyKind::from(p.kind);
        builder = if p.key {
            builder.key(&p.name, kind)
        } else if p.version {
            builder.version(&p.name)
        } else if p.required {
            builder.required(&p.name, kind)
        } else if p.independent {
            builder.independent_property(&p.name, kind)
        } else {
            builder.property(&p.name, kind)
        };
    }
    for key in &file.alternate_keys {
        let properties: Vec<&str> = key.properties.iter().map(String::as_str).collect();
        builder = builder.alternate_key(&key.name, &properties);
    }
    if file.independent {
        builder = builder.independent();
    }
    Ok(builder.build()?)
}

fn byte_array(json: &serde_json::Value) -> Option<Vec<u8>> {
    json.as_array()?
        .iter()
        .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect()
}

fn to_value(kind: PropertyKind, json: &serde_json::Value) -> Option<Value> {
    if json.is_null() {
        return Some(Value::Null);
    }
    Some(match kind {
        PropertyKind::Bool => Value::Bool(json.as_bool()?),
        PropertyKind::Integer => Value::Integer(json.as_i64()?),
        PropertyKind::Text => Value::Text(json.as_str()?.to_string()),
        PropertyKind::Bytes => Value::Bytes(byte_array(json)?),
        PropertyKind::Blob => Value::Blob(LobRef::blob(byte_array(json)?)),
        PropertyKind::Clob => Value::Clob(LobRef::clob(json.as_str()?)),
    })
}

fn to_json(value: &Value) -> Result<serde_json::Value, FetchError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(n) => serde_json::Value::from(*n),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::from(b.clone()),
        Value::Blob(lob) => serde_json::Value::from(lob.read_to_vec()?),
        Value::Clob(lob) => serde_json::Value::String(lob.read_to_string()?),
    })
}

/// Converts one JSON row object into a record of `storage`.
fn to_record(storage: &dyn Storage, row: usize, json: &serde_json::Value) -> Result<Record, SnapshotError> {
    let bad = |message: String| SnapshotError::Row { row, message };
    let object = json
        .as_object()
        .ok_or_else(|| bad("expected a JSON object".into()))?;
    let mut record = storage.prepare();
    let schema = Arc::clone(record.schema());
    for (name, field) in object {
        let index = schema
            .index_of(name)
            .ok_or_else(|| bad(format!("unknown property {name}")))?;
        let kind = schema.property(index).kind;
        let value = to_value(kind, field).ok_or_else(|| bad(format!("{name} is not a valid {kind:?}")))?;
        record
            .set(name, value)
            .map_err(|e| bad(format!("{name}: {e}")))?;
    }
    Ok(record)
}

/// Loads the rows of `path` into `storage` with replication suspended.
pub fn load_rows(storage: &dyn Storage, path: &Path) -> Result<usize, SnapshotError> {
    let rows: Vec<serde_json::Value> = parse(path)?;
    let cx = Context::new().suspended();
    for (n, row) in rows.iter().enumerate() {
        let mut record = to_record(storage, n, row)?;
        storage.insert(&cx, &mut record)?;
    }
    debug!(path = %path.display(), rows = rows.len(), "snapshot loaded");
    Ok(rows.len())
}

/// Renders every row of `storage` as a JSON array, in key order.
pub fn dump_rows(storage: &dyn Storage) -> Result<serde_json::Value, SnapshotError> {
    let cursor = storage.query(&Context::new().suspended(), &Query::all())?;
    let records = collect(cursor)?;
    let schema = storage.schema();
    let mut rows = Vec::with_capacity(records.len());
    for record in &records {
        let mut object = serde_json::Map::new();
        for (i, property) in schema.properties().iter().enumerate() {
            if !record.layout().is_supported(i) || record.value(i).is_null() {
                continue;
            }
            object.insert(property.name.clone(), to_json(record.value(i))?);
        }
        rows.push(serde_json::Value::Object(object));
    }
    Ok(serde_json::Value::Array(rows))
}

/// Writes the rows of `storage` to `path` as pretty-printed JSON.
pub fn write_rows(storage: &dyn Storage, path: &Path) -> Result<(), SnapshotError> {
    let rows = dump_rows(storage)?;
    let text = serde_json::to_string_pretty(&rows).map_err(|source| SnapshotError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses `property=value` into an equality filter typed by `schema`.
pub fn parse_filter(schema: &Schema, arg: &str) -> Result<Filter, SnapshotError> {
    let invalid = || SnapshotError::Filter(arg.to_string());
    let (name, raw) = arg.split_once('=').ok_or_else(invalid)?;
    let name = name.trim();
    let index = schema.index_of(name).ok_or_else(invalid)?;
    let value = match schema.property(index).kind {
        PropertyKind::Integer => Value::Integer(raw.trim().parse().map_err(|_| invalid())?),
        PropertyKind::Bool => Value::Bool(raw.trim().parse().map_err(|_| invalid())?),
        PropertyKind::Text => Value::Text(raw.to_string()),
        _ => return Err(invalid()),
    };
    Ok(Filter::equal(name, value))
}

/// Paths of the files describing one master/replica pair.
#[derive(Debug, Clone)]
pub struct Sources {
    /// Schema file.
    pub schema: PathBuf,
    /// Master snapshot.
    pub master: PathBuf,
    /// Replica snapshot.
    pub replica: PathBuf,
}

/// A master/replica pair loaded from snapshots.
pub struct LoadedPair {
    /// The record type.
    pub schema: Arc<Schema>,
    /// The replicated repository over both sides.
    pub repo: ReplicatedRepository,
    replica: MemoryRepository,
}

impl LoadedPair {
    /// Loads both snapshots into fresh in-memory repositories.
    pub fn open(sources: &Sources) -> Result<Self, SnapshotError> {
        let schema = load_schema(&sources.schema)?;
        let master = MemoryRepository::builder("master").master(true).build();
        let replica = MemoryRepository::builder("replica").build();

        let master_rows = load_rows(master.memory_storage(&schema)?.as_ref(), &sources.master)?;
        let replica_rows = load_rows(replica.memory_storage(&schema)?.as_ref(), &sources.replica)?;
        debug!(
            schema = schema.name(),
            master_rows, replica_rows, "snapshots loaded"
        );

        let repo = ReplicatedRepository::builder("snapshot")
            .master(Arc::new(master))
            .replica(Arc::new(replica.clone()))
            .build()?;
        Ok(Self { schema, repo, replica })
    }

    /// Returns the replica's own storage.
    pub fn replica_storage(&self) -> Result<Arc<MemoryStorage>, SnapshotError> {
        Ok(self.replica.memory_storage(&self.schema)?)
    }
}

/// Prints `report` as text or JSON.
pub fn print_report(report: &ResyncReport, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("Type: {}", report.schema);
    println!(
        "Scanned: {} master rows, {} replica rows",
        report.scanned_master, report.scanned_replica
    );
    println!("Divergent: {}", report.divergent);
    if !report.dry_run {
        println!(
            "Repaired: {} inserted, {} deleted, {} replaced, {} updated in place",
            report.inserted, report.deleted, report.replaced, report.updated_in_place
        );
        println!("Failed: {}", report.failed);
    }
    if report.corrupt_deleted + report.corrupt_skipped > 0 {
        println!(
            "Corrupt rows: {} deleted, {} skipped",
            report.corrupt_deleted, report.corrupt_skipped
        );
    }
    println!("Elapsed: {} ms", report.elapsed_ms);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) const ITEM_SCHEMA: &str = r#"{
        "name": "Item",
        "properties": [
            { "name": "id", "kind": "integer", "key": true },
            { "name": "name", "kind": "text" },
            { "name": "notes", "kind": "clob" },
            { "name": "version", "kind": "integer", "version": true }
        ]
    }"#;

    /// Writes a schema and two snapshots into a fresh directory.
    pub(crate) fn write_sources(master: &str, replica: &str) -> (TempDir, Sources) {
        let dir = TempDir::new().unwrap();
        let sources = Sources {
            schema: dir.path().join("schema.json"),
            master: dir.path().join("master.json"),
            replica: dir.path().join("replica.json"),
        };
        fs::write(&sources.schema, ITEM_SCHEMA).unwrap();
        fs::write(&sources.master, master).unwrap();
        fs::write(&sources.replica, replica).unwrap();
        (dir, sources)
    }

    #[test]
    fn schema_file_is_parsed() {
        let (_dir, sources) = write_sources("[]", "[]");
        let schema = load_schema(&sources.schema).unwrap();
        assert_eq!(schema.name(), "Item");
        assert_eq!(schema.len(), 4);
        assert_eq!(schema.primary_key(), &[0]);
        assert_eq!(schema.version(), Some(3));
    }

    #[test]
    fn rows_survive_load_and_dump() {
        let rows = r#"[
            { "id": 2, "name": "b", "notes": "long text", "version": 3 },
            { "id": 1, "name": "a", "version": 1 }
        ]"#;
        let (_dir, sources) = write_sources(rows, "[]");
        let pair = LoadedPair::open(&sources).unwrap();
        let master = pair.repo.master().storage_for(&pair.schema).unwrap();

        let dumped = dump_rows(master.as_ref()).unwrap();
        let expected: serde_json::Value = serde_json::json!([
            { "id": 1, "name": "a", "version": 1 },
            { "id": 2, "name": "b", "notes": "long text", "version": 3 }
        ]);
        assert_eq!(dumped, expected);
    }

    #[test]
    fn unknown_property_is_reported_with_its_row() {
        let (_dir, sources) = write_sources(r#"[{ "id": 1 }, { "id": 2, "colour": "red" }]"#, "[]");
        let err = LoadedPair::open(&sources).err().unwrap();
        assert!(matches!(err, SnapshotError::Row { row: 1, .. }), "unexpected error: {err}");
    }

    #[test]
    fn mistyped_value_is_rejected() {
        let (_dir, sources) = write_sources(r#"[{ "id": "one" }]"#, "[]");
        assert!(matches!(
            LoadedPair::open(&sources).err().unwrap(),
            SnapshotError::Row { row: 0, .. }
        ));
    }

    #[test]
    fn malformed_json_names_the_file() {
        let (_dir, sources) = write_sources("[", "[]");
        let err = LoadedPair::open(&sources).err().unwrap();
        assert!(err.to_string().contains("master.json"), "unexpected error: {err}");
    }

    #[test]
    fn filters_are_typed_by_schema() {
        let (_dir, sources) = write_sources("[]", "[]");
        let schema = load_schema(&sources.schema).unwrap();
        assert_eq!(parse_filter(&schema, "id=4").unwrap(), Filter::equal("id", 4));
        assert_eq!(parse_filter(&schema, "name=a=b").unwrap(), Filter::equal("name", "a=b"));
        assert!(parse_filter(&schema, "id=four").is_err());
        assert!(parse_filter(&schema, "colour=red").is_err());
        assert!(parse_filter(&schema, "id").is_err());
    }
}
