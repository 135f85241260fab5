//! Large-object replication.
//!
//! Large objects are written through streams after the owning record has
//! been stored, so the record-level trigger never sees those writes. For
//! every type with blob or clob properties a [`LobReplicationTrigger`]
//! wraps the replica handles of loaded and written records in a
//! [`ReplicatedLob`], which sends writes to the matching master object
//! first and then to the replica object.

use crate::trigger::{key_record, master_failure, ReplicationTrigger};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{trace, warn};
use twinstore_storage::{
    Context, FetchResult, Lob, LobIdentity, LobKind, LobRef, PersistError, PersistResult, Record,
    Trigger, TriggerState,
};

/// Wraps the large-object properties of one kind in [`ReplicatedLob`]s.
pub struct LobReplicationTrigger {
    kind: LobKind,
    properties: Vec<usize>,
    trigger: Arc<ReplicationTrigger>,
}

impl LobReplicationTrigger {
    /// Creates the trigger for `kind`, or `None` if the type has no
    /// properties of that kind.
    #[must_use]
    pub fn for_kind(kind: LobKind, trigger: &Arc<ReplicationTrigger>) -> Option<Self> {
        let properties = trigger.schema().lob_properties(kind);
        if properties.is_empty() {
            return None;
        }
        Some(Self {
            kind,
            properties,
            trigger: Arc::clone(trigger),
        })
    }

    /// Returns the kind of object this trigger wraps.
    #[must_use]
    pub fn kind(&self) -> LobKind {
        self.kind
    }

    fn wrap(&self, cx: &Context, record: &mut Record) {
        if cx.is_suspended() {
            return;
        }
        for &index in &self.properties {
            if !record.layout().is_supported(index) {
                continue;
            }
            let Some(lob) = record.value(index).as_lob() else {
                continue;
            };
            if lob.handle().as_any().is::<ReplicatedLob>() {
                continue;
            }
            let key = key_record(self.trigger.replica().as_ref(), record);
            let wrapped = ReplicatedLob::new(lob.clone(), key, index, Arc::clone(&self.trigger));
            record.replace_lob(index, LobRef::new(wrapped));
        }
    }
}

impl Trigger for LobReplicationTrigger {
    fn after_insert(&self, cx: &Context, record: &mut Record, _state: TriggerState) -> PersistResult<()> {
        self.wrap(cx, record);
        Ok(())
    }

    fn after_update(&self, cx: &Context, record: &mut Record, _state: TriggerState) -> PersistResult<()> {
        self.wrap(cx, record);
        Ok(())
    }

    fn after_load(&self, cx: &Context, record: &mut Record) -> FetchResult<()> {
        self.wrap(cx, record);
        Ok(())
    }
}

impl fmt::Debug for LobReplicationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LobReplicationTrigger")
            .field("kind", &self.kind)
            .field("properties", &self.properties)
            .finish()
    }
}

enum MasterLob {
    Present(LobRef),
    Missing,
    Unsupported,
}

/// A replica large object whose writes are mirrored to the master.
///
/// Reads go to the replica object. The master object is looked up on the
/// first write by loading the master record by key; the outcome is cached
/// for the life of the wrapper. When the master cannot hold the property,
/// writes go to the replica alone.
pub struct ReplicatedLob {
    replica: LobRef,
    key: Record,
    property: usize,
    trigger: Arc<ReplicationTrigger>,
    master: Mutex<Option<MasterLob>>,
}

impl ReplicatedLob {
    /// Wraps `replica`, the object held by property `property` of the
    /// record whose key is `key`.
    #[must_use]
    pub fn new(replica: LobRef, key: Record, property: usize, trigger: Arc<ReplicationTrigger>) -> Self {
        Self {
            replica,
            key,
            property,
            trigger,
            master: Mutex::new(None),
        }
    }

    /// Returns the wrapped replica object.
    #[must_use]
    pub fn replica(&self) -> &LobRef {
        &self.replica
    }

    fn property_name(&self) -> &str {
        &self.key.schema().property(self.property).name
    }

    fn label(&self) -> String {
        format!("{}.{}", self.key.to_string_key_only(), self.property_name())
    }

    /// Returns the master object, `None` if writes go to the replica only.
    fn master_lob(&self) -> PersistResult<Option<LobRef>> {
        let mut cached = self.master.lock();
        if cached.is_none() {
            *cached = Some(self.resolve_master()?);
        }
        match cached.as_ref() {
            Some(MasterLob::Present(lob)) => Ok(Some(lob.clone())),
            Some(MasterLob::Missing) => Err(PersistError::no_such_record(self.label())),
            Some(MasterLob::Unsupported) | None => Ok(None),
        }
    }

    fn resolve_master(&self) -> PersistResult<MasterLob> {
        let Some(master) = self.trigger.master_storage()? else {
            return Ok(MasterLob::Unsupported);
        };
        if !master.layout().is_supported(self.property) {
            return Ok(MasterLob::Unsupported);
        }
        let mut entry = key_record(master.as_ref(), &self.key);
        let cx = Context::new().suspended();
        let found = master
            .load(&cx, &mut entry)
            .map_err(|e| master_failure(e.into()))?;
        let resolved = match entry.value(self.property).as_lob() {
            Some(lob) if found => MasterLob::Present(lob.clone()),
            _ => MasterLob::Missing,
        };
        trace!(lob = %self.label(), found, "master large object resolved");
        Ok(resolved)
    }
}

impl Lob for ReplicatedLob {
    fn kind(&self) -> LobKind {
        self.replica.kind()
    }

    fn identity(&self) -> LobIdentity {
        LobIdentity {
            scope: Some(self.trigger.scope()),
            ..self.replica.identity()
        }
    }

    fn len(&self) -> FetchResult<u64> {
        self.replica.handle().len()
    }

    fn open_read(&self, pos: u64) -> FetchResult<Box<dyn Read + Send>> {
        self.replica.handle().open_read(pos)
    }

    fn open_write(&self, pos: u64) -> PersistResult<Box<dyn Write + Send>> {
        match self.master_lob()? {
            Some(master) => {
                let primary = master.handle().open_write(pos).map_err(master_failure)?;
                let secondary = self.replica.handle().open_write(pos)?;
                Ok(Box::new(TeeWriter::new(primary, secondary, self.label())))
            }
            None => self.replica.handle().open_write(pos),
        }
    }

    fn set_len(&self, len: u64) -> PersistResult<()> {
        if let Some(master) = self.master_lob()? {
            master.handle().set_len(len).map_err(master_failure)?;
        }
        self.replica.handle().set_len(len)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for ReplicatedLob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedLob")
            .field("lob", &self.label())
            .field("replica", &self.replica)
            .finish()
    }
}

/// Writes every byte to a primary stream and then a secondary one.
///
/// Failures of either stream surface from the write that hit them, the
/// primary's first. Flush failures while dropping are logged.
pub struct TeeWriter {
    primary: Box<dyn Write + Send>,
    secondary: Box<dyn Write + Send>,
    label: String,
}

impl TeeWriter {
    /// Creates a tee over two streams.
    pub fn new(primary: Box<dyn Write + Send>, secondary: Box<dyn Write + Send>, label: impl Into<String>) -> Self {
        Self {
            primary,
            secondary,
            label: label.into(),
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.primary.write(buf)?;
        self.secondary.write_all(&buf[..n])?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let primary = self.primary.flush();
        let secondary = self.secondary.flush();
        primary.and(secondary)
    }
}

impl Drop for TeeWriter {
    fn drop(&mut self) {
        if let Err(e) = self.primary.flush() {
            warn!(lob = %self.label, error = %e, "cannot flush master large object");
        }
        if let Err(e) = self.secondary.flush() {
            warn!(lob = %self.label, error = %e, "cannot flush replica large object");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl Write for Failing {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    #[test]
    fn tee_writes_both_streams() {
        let primary = twinstore_storage::LobBuffer::new(Vec::new());
        let secondary = twinstore_storage::LobBuffer::new(Vec::new());
        {
            let mut tee = TeeWriter::new(primary.writer(0), secondary.writer(0), "t");
            tee.write_all(b"mirrored").unwrap();
            tee.flush().unwrap();
        }
        assert_eq!(primary.snapshot(), b"mirrored");
        assert_eq!(secondary.snapshot(), b"mirrored");
    }

    #[test]
    fn tee_surfaces_primary_failure_first() {
        let secondary = twinstore_storage::LobBuffer::new(Vec::new());
        let mut tee = TeeWriter::new(Box::new(Failing), secondary.writer(0), "t");
        let err = tee.write(b"x").unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(secondary.snapshot().is_empty());
    }

    #[test]
    fn tee_surfaces_secondary_failure() {
        let primary = twinstore_storage::LobBuffer::new(Vec::new());
        let mut tee = TeeWriter::new(primary.writer(0), Box::new(Failing), "t");
        assert!(tee.write_all(b"x").is_err());
        assert_eq!(primary.snapshot(), b"x");
    }
}
