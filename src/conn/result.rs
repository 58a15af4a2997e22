//! Command tags, field descriptions and the result readers.

use std::ops::Range;

use crate::error::{Error, PgError, Result};
use crate::protocol::backend::query::Field;
use crate::protocol::types::{FormatCode, Oid};

use super::Conn;
use crate::cancel::CancelToken;

/// Completed-command tag, e.g. `"SELECT 3"` or `"INSERT 0 5"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTag(String);

impl CommandTag {
    pub fn new(tag: &str) -> Self {
        Self(tag.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The command name (first token), `""` for an empty tag.
    pub fn command(&self) -> &str {
        self.0.split_whitespace().next().unwrap_or_default()
    }

    /// Rows affected: the last whitespace-separated token parsed as a
    /// signed integer; tags without a numeric tail yield 0.
    pub fn rows_affected(&self) -> i64 {
        self.0
            .split_whitespace()
            .next_back()
            .and_then(|token| token.parse().ok())
            .unwrap_or(0)
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owned description of one result column.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    /// Column name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: Oid,
    /// Column attribute number (0 if not a table column)
    pub column_attr: i16,
    /// Data type OID
    pub type_oid: Oid,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: i16,
    /// Type modifier (type-specific)
    pub type_modifier: i32,
    /// Wire format code of the values
    pub format: FormatCode,
}

impl FieldDescription {
    pub(crate) fn from_wire(field: &Field<'_>) -> Self {
        Self {
            name: field.name.to_string(),
            table_oid: field.table_oid,
            column_attr: field.column_attr,
            type_oid: field.type_oid,
            type_size: field.type_size,
            type_modifier: field.type_modifier,
            format: field.format,
        }
    }
}

/// Description of a prepared statement returned by [`Conn::prepare`].
#[derive(Debug, Clone)]
pub struct StatementDescription {
    /// Statement name as known to the server
    pub name: String,
    /// Parameter type OIDs, as inferred or declared
    pub param_oids: Vec<Oid>,
    /// Result columns; empty for statements returning no rows
    pub fields: Vec<FieldDescription>,
}

/// Per-operation bookkeeping owned by the connection; the public readers
/// are thin borrows over this.
pub(crate) struct OpState {
    pub(crate) token: Option<CancelToken>,
    /// ReadyForQuery consumed; the wire is drained.
    pub(crate) finished: bool,
    /// First server error of the operation.
    pub(crate) op_error: Option<PgError>,
    pub(crate) res: ResultState,
}

impl OpState {
    pub(crate) fn idle() -> Self {
        Self {
            token: None,
            finished: true,
            op_error: None,
            res: ResultState::default(),
        }
    }

    pub(crate) fn new(token: CancelToken) -> Self {
        Self {
            token: Some(token),
            finished: false,
            op_error: None,
            res: ResultState::default(),
        }
    }
}

/// State of the current result group.
#[derive(Default)]
pub(crate) struct ResultState {
    /// A result group is open (fields known or rowless completion seen).
    pub(crate) active: bool,
    /// The group's terminator has been consumed.
    pub(crate) complete: bool,
    pub(crate) fields: Vec<FieldDescription>,
    pub(crate) row_buf: Vec<u8>,
    pub(crate) row_ranges: Vec<Option<Range<usize>>>,
    pub(crate) row_valid: bool,
    pub(crate) tag: Option<CommandTag>,
    pub(crate) err: Option<PgError>,
}

impl ResultState {
    /// Reset for a new result group, keeping buffer capacity.
    pub(crate) fn begin(&mut self) {
        self.active = true;
        self.complete = false;
        self.fields.clear();
        self.row_buf.clear();
        self.row_ranges.clear();
        self.row_valid = false;
        self.tag = None;
        self.err = None;
    }
}

/// Lazy single-consumer cursor over the rows of one result.
///
/// Created by [`Conn::exec_params`] / [`Conn::exec_prepared`] (standalone,
/// owning the whole operation) or by [`MultiResultReader::reader`] (one
/// group of a multi-result stream).
pub struct ResultReader<'c> {
    pub(crate) conn: &'c mut Conn,
    pub(crate) standalone: bool,
}

impl std::fmt::Debug for ResultReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultReader")
            .field("standalone", &self.standalone)
            .finish()
    }
}

impl ResultReader<'_> {
    /// Column descriptions, fixed once the reader exists.
    pub fn field_descriptions(&self) -> &[FieldDescription] {
        &self.conn.op.res.fields
    }

    /// Advance to the next row. `false` means end of result; the command
    /// tag or error is then available through [`close`](Self::close).
    pub fn next_row(&mut self) -> Result<bool> {
        self.conn.advance_row()
    }

    /// The current row's values; `None` is NULL. Empty before the first
    /// [`next_row`](Self::next_row) and after the last.
    pub fn values(&self) -> Vec<Option<&[u8]>> {
        let res = &self.conn.op.res;
        if !res.row_valid {
            return Vec::new();
        }
        res.row_ranges
            .iter()
            .map(|range| range.as_ref().map(|r| &res.row_buf[r.clone()]))
            .collect()
    }

    /// Drain remaining rows and return the command tag, or the error that
    /// ended the result.
    pub fn close(mut self) -> Result<CommandTag> {
        let standalone = self.standalone;
        self.conn.finish_result(standalone)
    }
}

impl Drop for ResultReader<'_> {
    fn drop(&mut self) {
        if self.standalone {
            let _ = self.conn.drain_operation();
        } else {
            // Leave the connection positioned after this group so the
            // multi-reader can continue.
            while self.conn.op.res.active && !self.conn.op.res.complete {
                if self.conn.advance_row().is_err() {
                    break;
                }
            }
        }
    }
}

/// Cursor over the result groups of a simple-query or batch submission.
pub struct MultiResultReader<'c> {
    pub(crate) conn: &'c mut Conn,
}

impl std::fmt::Debug for MultiResultReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiResultReader").finish()
    }
}

impl<'c> MultiResultReader<'c> {
    pub(crate) fn new(conn: &'c mut Conn) -> Self {
        Self { conn }
    }

    /// Advance to the next result group, closing the previous one. `false`
    /// means the response stream is drained and busy-status released.
    pub fn next_result(&mut self) -> Result<bool> {
        self.conn.next_result()
    }

    /// Reader over the current result group.
    pub fn reader(&mut self) -> ResultReader<'_> {
        ResultReader {
            conn: &mut *self.conn,
            standalone: false,
        }
    }

    /// Drain all remaining results to ReadyForQuery and report the first
    /// statement-level error, if any.
    pub fn close(mut self) -> Result<()> {
        while self.conn.next_result()? {}
        match self.conn.op.op_error.take() {
            Some(pg) => Err(Error::Server(pg)),
            None => Ok(()),
        }
    }
}

impl Drop for MultiResultReader<'_> {
    fn drop(&mut self) {
        let _ = self.conn.drain_operation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_affected_is_last_numeric_token() {
        for (tag, expected) in [
            ("SELECT 3", 3),
            ("INSERT 0 5", 5),
            ("UPDATE 2", 2),
            ("DELETE 0", 0),
            ("COPY 1234567", 1234567),
            ("CREATE TABLE", 0),
            ("LISTEN", 0),
            ("", 0),
            ("FETCH -1", -1),
        ] {
            assert_eq!(CommandTag::new(tag).rows_affected(), expected, "{tag:?}");
        }
    }

    #[test]
    fn command_is_first_token() {
        assert_eq!(CommandTag::new("INSERT 0 5").command(), "INSERT");
        assert_eq!(CommandTag::new("CREATE TABLE").command(), "CREATE");
        assert_eq!(CommandTag::new("").command(), "");
    }
}
