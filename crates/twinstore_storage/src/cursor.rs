//! Forward-only query cursors.

use crate::error::{FetchError, FetchResult};
use crate::record::Record;

/// A forward-only cursor over query results.
///
/// A row whose stored encoding cannot be decoded surfaces from
/// [`next`](Cursor::next) as [`FetchError::CorruptEncoding`]. After such a
/// failure the cursor position is unspecified; callers reopen the query
/// after the last good key instead of continuing.
pub trait Cursor: Send {
    /// Returns true if another row is available.
    fn has_next(&mut self) -> FetchResult<bool>;

    /// Returns the next row.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::NoSuchRecord`] when exhausted.
    fn next(&mut self) -> FetchResult<Record>;

    /// Skips up to `n` rows without decoding them and returns how many were
    /// skipped.
    fn skip_next(&mut self, n: usize) -> FetchResult<usize>;

    /// Releases the cursor. Further calls behave as if exhausted.
    fn close(&mut self) -> FetchResult<()>;
}

/// Drains a cursor into a vector, closing it afterwards.
pub fn collect(mut cursor: Box<dyn Cursor>) -> FetchResult<Vec<Record>> {
    let mut out = Vec::new();
    let result = drain_into(cursor.as_mut(), &mut out);
    let closed = cursor.close();
    result?;
    closed?;
    Ok(out)
}

fn drain_into(cursor: &mut dyn Cursor, out: &mut Vec<Record>) -> FetchResult<()> {
    while cursor.has_next()? {
        out.push(cursor.next()?);
    }
    Ok(())
}

/// A cursor over an already materialized list of records.
#[derive(Debug, Default)]
pub struct VecCursor {
    rows: std::vec::IntoIter<Record>,
}

impl VecCursor {
    /// Creates a cursor yielding `rows` in order.
    #[must_use]
    pub fn new(rows: Vec<Record>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl Cursor for VecCursor {
    fn has_next(&mut self) -> FetchResult<bool> {
        Ok(!self.rows.as_slice().is_empty())
    }

    fn next(&mut self) -> FetchResult<Record> {
        self.rows
            .next()
            .ok_or_else(|| FetchError::no_such_record("cursor exhausted"))
    }

    fn skip_next(&mut self, n: usize) -> FetchResult<usize> {
        let mut skipped = 0;
        while skipped < n && self.rows.next().is_some() {
            skipped += 1;
        }
        Ok(skipped)
    }

    fn close(&mut self) -> FetchResult<()> {
        self.rows = Vec::new().into_iter();
        Ok(())
    }
}
