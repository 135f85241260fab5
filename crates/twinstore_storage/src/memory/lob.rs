//! Large objects owned by an in-memory table.

use super::EngineState;
use crate::error::{FetchResult, PersistError, PersistResult};
use crate::lob::{Lob, LobBuffer, LobIdentity, LobKind};
use std::any::Any;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use uuid::Uuid;

/// A large object stored in a [`MemoryStorage`](super::MemoryStorage)
/// table. Access fails while the owning repository is offline.
pub struct MemoryLob {
    engine: Arc<EngineState>,
    store: Uuid,
    locator: u64,
    kind: LobKind,
    buffer: Arc<LobBuffer>,
}

impl MemoryLob {
    pub(crate) fn new(
        engine: Arc<EngineState>,
        store: Uuid,
        locator: u64,
        kind: LobKind,
        buffer: Arc<LobBuffer>,
    ) -> Self {
        Self {
            engine,
            store,
            locator,
            kind,
            buffer,
        }
    }

    fn check_fetch(&self) -> FetchResult<()> {
        self.engine.check_available()
    }

    fn check_persist(&self) -> PersistResult<()> {
        self.engine.check_available().map_err(PersistError::from)
    }
}

impl fmt::Debug for MemoryLob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLob")
            .field("repository", &self.engine.name)
            .field("locator", &self.locator)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Lob for MemoryLob {
    fn kind(&self) -> LobKind {
        self.kind
    }

    fn identity(&self) -> LobIdentity {
        LobIdentity {
            store: self.store,
            locator: self.locator,
            scope: None,
        }
    }

    fn len(&self) -> FetchResult<u64> {
        self.check_fetch()?;
        Ok(self.buffer.len())
    }

    fn open_read(&self, pos: u64) -> FetchResult<Box<dyn Read + Send>> {
        self.check_fetch()?;
        Ok(self.buffer.reader(pos))
    }

    fn open_write(&self, pos: u64) -> PersistResult<Box<dyn Write + Send>> {
        self.check_persist()?;
        Ok(self.buffer.writer(pos))
    }

    fn set_len(&self, len: u64) -> PersistResult<()> {
        self.check_persist()?;
        self.buffer.set_len(len);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
