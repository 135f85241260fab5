//! Large-object handles.
//!
//! LOB properties hold a [`LobRef`] instead of inline data. The handle is a
//! locator into a separate byte store: reading and writing go through
//! streams, and two handles are equal only when they name the same object.

use crate::error::{FetchError, FetchResult, PersistError, PersistResult};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Flavour of a large object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LobKind {
    /// Binary content (blob).
    Binary,
    /// UTF-8 character content (clob). Positions are byte offsets.
    Character,
}

/// Identity of a large object.
///
/// `store` names the owner of the byte store, `locator` the object within
/// it. `scope` is set by decorators so that wrappers created by different
/// owners never compare equal to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LobIdentity {
    /// Owning store.
    pub store: Uuid,
    /// Object locator within the store.
    pub locator: u64,
    /// Decorator scope, if wrapped.
    pub scope: Option<Uuid>,
}

/// A large-object handle.
pub trait Lob: Send + Sync + fmt::Debug {
    /// Returns the flavour of this object.
    fn kind(&self) -> LobKind;

    /// Returns the identity used for equality and hashing.
    fn identity(&self) -> LobIdentity;

    /// Returns the content length in bytes.
    fn len(&self) -> FetchResult<u64>;

    /// Opens a reader starting at `pos`.
    fn open_read(&self, pos: u64) -> FetchResult<Box<dyn Read + Send>>;

    /// Opens a writer starting at `pos`. Writes overwrite existing content
    /// and extend it as needed.
    fn open_write(&self, pos: u64) -> PersistResult<Box<dyn Write + Send>>;

    /// Truncates or zero-extends the content to `len` bytes.
    fn set_len(&self, len: u64) -> PersistResult<()>;

    /// Returns `self` for downcasting by stores that own the object.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a large object, as stored in record values.
#[derive(Clone)]
pub struct LobRef(Arc<dyn Lob>);

impl LobRef {
    /// Wraps a handle.
    pub fn new(lob: impl Lob + 'static) -> Self {
        Self(Arc::new(lob))
    }

    /// Wraps an already shared handle.
    pub fn from_arc(lob: Arc<dyn Lob>) -> Self {
        Self(lob)
    }

    /// Creates a detached blob holding `data`, not owned by any store.
    ///
    /// Stores copy the content of detached objects when a record carrying
    /// one is written.
    pub fn blob(data: impl Into<Vec<u8>>) -> Self {
        Self::new(DetachedLob::new(LobKind::Binary, data.into()))
    }

    /// Creates a detached clob holding `text`.
    pub fn clob(text: impl Into<String>) -> Self {
        Self::new(DetachedLob::new(LobKind::Character, text.into().into_bytes()))
    }

    /// Returns the underlying handle.
    pub fn handle(&self) -> &dyn Lob {
        self.0.as_ref()
    }

    /// Returns the flavour of the object.
    pub fn kind(&self) -> LobKind {
        self.0.kind()
    }

    /// Returns the identity of the object.
    pub fn identity(&self) -> LobIdentity {
        self.0.identity()
    }

    /// Reads the whole content.
    pub fn read_to_vec(&self) -> FetchResult<Vec<u8>> {
        let mut reader = self.0.open_read(0)?;
        let mut out = Vec::new();
        reader
            .read_to_end(&mut out)
            .map_err(|e| FetchError::io_with("read large object", e))?;
        Ok(out)
    }

    /// Reads the whole content as text.
    pub fn read_to_string(&self) -> FetchResult<String> {
        let bytes = self.read_to_vec()?;
        String::from_utf8(bytes).map_err(|e| FetchError::corrupt(e.to_string(), None))
    }

    /// Replaces the whole content with `data`.
    pub fn replace(&self, data: &[u8]) -> PersistResult<()> {
        self.0.set_len(0)?;
        let mut writer = self.0.open_write(0)?;
        writer
            .write_all(data)
            .and_then(|()| writer.flush())
            .map_err(|e| PersistError::io_with("write large object", e))
    }

    /// Compares content rather than identity. Unreadable objects compare
    /// unequal.
    pub fn content_eq(&self, other: &LobRef) -> bool {
        if self == other {
            return true;
        }
        match (self.read_to_vec(), other.read_to_vec()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for LobRef {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for LobRef {}

impl Hash for LobRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Debug for LobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.identity();
        write!(f, "LobRef({:?}, {}#{})", self.kind(), id.store, id.locator)
    }
}

static NEXT_DETACHED: AtomicU64 = AtomicU64::new(1);

/// Shared byte buffer backing in-process large objects.
#[derive(Debug, Default)]
pub struct LobBuffer {
    data: RwLock<Vec<u8>>,
}

impl LobBuffer {
    /// Creates a buffer with initial content.
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(data),
        })
    }

    /// Returns a copy of the content.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Returns the content length.
    pub fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    /// Truncates or zero-extends to `len`.
    pub fn set_len(&self, len: u64) {
        self.data.write().resize(len as usize, 0);
    }

    /// Opens a reader at `pos`.
    pub fn reader(&self, pos: u64) -> Box<dyn Read + Send> {
        let data = self.data.read();
        let start = (pos as usize).min(data.len());
        Box::new(io::Cursor::new(data[start..].to_vec()))
    }

    /// Opens a writer at `pos` that splices bytes directly into the buffer.
    pub fn writer(self: &Arc<Self>, pos: u64) -> Box<dyn Write + Send> {
        Box::new(BufferWriter {
            buffer: Arc::clone(self),
            pos: pos as usize,
        })
    }
}

struct BufferWriter {
    buffer: Arc<LobBuffer>,
    pos: usize,
}

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.buffer.data.write();
        let end = self.pos + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A large object not owned by any store.
#[derive(Debug)]
pub struct DetachedLob {
    kind: LobKind,
    locator: u64,
    buffer: Arc<LobBuffer>,
}

impl DetachedLob {
    /// Creates a detached object with initial content.
    pub fn new(kind: LobKind, data: Vec<u8>) -> Self {
        Self {
            kind,
            locator: NEXT_DETACHED.fetch_add(1, Ordering::Relaxed),
            buffer: LobBuffer::new(data),
        }
    }
}

impl Lob for DetachedLob {
    fn kind(&self) -> LobKind {
        self.kind
    }

    fn identity(&self) -> LobIdentity {
        LobIdentity {
            store: Uuid::nil(),
            locator: self.locator,
            scope: None,
        }
    }

    fn len(&self) -> FetchResult<u64> {
        Ok(self.buffer.len())
    }

    fn open_read(&self, pos: u64) -> FetchResult<Box<dyn Read + Send>> {
        Ok(self.buffer.reader(pos))
    }

    fn open_write(&self, pos: u64) -> PersistResult<Box<dyn Write + Send>> {
        Ok(self.buffer.writer(pos))
    }

    fn set_len(&self, len: u64) -> PersistResult<()> {
        self.buffer.set_len(len);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
