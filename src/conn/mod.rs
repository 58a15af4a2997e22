//! The connection core: busy-status state machine, response pump, and the
//! query/COPY/notification operations.
//!
//! A [`Conn`] is strictly single-owner. Each operation acquires
//! busy-status, writes its complete request, and hands back a reader that
//! drains the response stream; closing the reader restores busy-status.
//! Errors that provably sent no bytes carry the no-bytes-sent marker
//! ([`Error::is_safe_to_retry`]); transport errors close the connection.

mod batch;
mod connect;
mod copy;
mod result;

pub use batch::Batch;
pub use result::{
    CommandTag, FieldDescription, MultiResultReader, ResultReader, StatementDescription,
};

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::buffer::PooledBufferSet;
use crate::cancel::{CancelCause, CancelToken, CancelWatcher};
use crate::config::{Config, DialFn, NoticeFn, NotificationFn};
use crate::error::{Error, Result};
use crate::protocol::backend::{self, msg_type};
use crate::protocol::frontend;
use crate::protocol::types::{FormatCode, Oid, TransactionStatus};
use crate::stream::{Stream, is_timeout};

use result::OpState;

const STATUS_IDLE: u8 = 0;
const STATUS_BUSY: u8 = 1;
const STATUS_CLOSED: u8 = 2;

/// Requests larger than this are flushed with interleaved reads so a full
/// kernel send buffer cannot deadlock against unread responses.
const INTERLEAVE_THRESHOLD: usize = 64 * 1024;
const WRITE_CHUNK: usize = 8 * 1024;

/// Asynchronous notification from LISTEN/NOTIFY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// PID of the notifying backend
    pub pid: u32,
    /// Channel name
    pub channel: String,
    /// Notification payload
    pub payload: String,
}

#[derive(Debug, Clone)]
pub(crate) enum RemoteAddr {
    Tcp(String, u16),
    Unix(String),
}

/// One authenticated session with a PostgreSQL server.
pub struct Conn {
    stream: Stream,
    bufs: PooledBufferSet,
    status: AtomicU8,
    tx_status: TransactionStatus,
    backend_key: Option<(u32, u32)>,
    server_params: Vec<(String, String)>,
    on_notice: Option<Arc<NoticeFn>>,
    on_notification: Option<Arc<NotificationFn>>,
    watcher: CancelWatcher,
    /// Messages drained opportunistically while flushing a large request.
    pending: VecDeque<(u8, Vec<u8>)>,
    pub(crate) op: OpState,
    remote: RemoteAddr,
    dial: Option<Arc<DialFn>>,
    connect_timeout: Option<Duration>,
}

impl Conn {
    /// Establish a session: dial, negotiate TLS, authenticate, run
    /// validators, trying fallback endpoints in order.
    pub fn connect(config: &Config) -> Result<Self> {
        connect::connect(config)
    }

    // === Observable state ===

    fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.status() == STATUS_CLOSED
    }

    pub fn is_busy(&self) -> bool {
        self.status() == STATUS_BUSY
    }

    /// Transaction status from the last ReadyForQuery.
    pub fn tx_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// Current value of a frontend-visible server parameter.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Backend process ID, 0 if the server sent no BackendKeyData.
    pub fn pid(&self) -> u32 {
        self.backend_key.map_or(0, |(pid, _)| pid)
    }

    /// Backend secret key for CancelRequest, 0 if none.
    pub fn secret_key(&self) -> u32 {
        self.backend_key.map_or(0, |(_, key)| key)
    }

    // === Busy-status state machine ===

    fn lock(&self) -> Result<()> {
        match self.status.compare_exchange(
            STATUS_IDLE,
            STATUS_BUSY,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(STATUS_BUSY) => Err(Error::Lock),
            Err(_) => Err(Error::Closed),
        }
    }

    fn unlock(&self) {
        let _ = self.status.compare_exchange(
            STATUS_BUSY,
            STATUS_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn mark_closed(&self) {
        self.status.store(STATUS_CLOSED, Ordering::Release);
    }

    /// Operation preamble: acquire busy-status, fail fast on a fired token
    /// (no bytes sent, connection still valid), then arm the cancel watcher
    /// and the I/O deadline.
    fn begin_op(&mut self, token: &CancelToken) -> Result<()> {
        self.lock()?;
        if let Some(cause) = token.cause() {
            self.unlock();
            return Err(Error::AlreadyCanceled(cause));
        }
        let handle = match self.stream.abort_handle() {
            Ok(handle) => handle,
            Err(e) => {
                self.unlock();
                return Err(Error::Io(e));
            }
        };
        self.stream.set_deadline(token.deadline());
        self.watcher.watch(token, move || handle.abort(), || {});
        self.op = OpState::new(token.clone());
        Ok(())
    }

    /// Release after the response stream is drained.
    pub(crate) fn end_op(&mut self) {
        self.watcher.unwatch();
        self.stream.set_deadline(None);
        self.unlock();
    }

    /// Transition to closed; the error is handed back for propagation.
    pub(crate) fn fatal(&mut self, err: Error) -> Error {
        self.watcher.unwatch();
        self.stream.set_deadline(None);
        self.mark_closed();
        self.stream.shutdown();
        tracing::debug!(error = %err, "connection closed on error");
        err
    }

    /// Classify a read failure: a fired token wins, then deadline expiry,
    /// then the raw transport error. All of them close the connection.
    pub(crate) fn fatal_io(&mut self, err: std::io::Error) -> Error {
        let cause = self.op.token.as_ref().and_then(|t| t.cause());
        let mapped = match cause {
            Some(c) => Error::Canceled(c),
            None if is_timeout(&err) => Error::Canceled(CancelCause::DeadlineExceeded),
            None => Error::Io(err),
        };
        self.fatal(mapped)
    }

    fn fatal_write(&mut self, err: std::io::Error) -> Error {
        let cause = self.op.token.as_ref().and_then(|t| t.cause());
        let mapped = match cause {
            Some(c) => Error::Canceled(c),
            None if is_timeout(&err) => Error::Canceled(CancelCause::DeadlineExceeded),
            None => Error::Write(err),
        };
        self.fatal(mapped)
    }

    // === Write path ===

    /// Flush the pending request. Either every byte reaches the transport
    /// or the connection is closed.
    pub(crate) fn flush_request(&mut self) -> Result<()> {
        if self.bufs.write_buffer.len() > INTERLEAVE_THRESHOLD {
            return self.flush_interleaved();
        }
        if let Err(e) = self.stream.write_all(&self.bufs.write_buffer) {
            return Err(self.fatal_write(e));
        }
        if let Err(e) = self.stream.flush() {
            return Err(self.fatal_write(e));
        }
        Ok(())
    }

    /// Bounded-chunk flush that drains server messages between chunks, so a
    /// request larger than the kernel buffers cannot deadlock against the
    /// server's own blocked writes.
    fn flush_interleaved(&mut self) -> Result<()> {
        let total = self.bufs.write_buffer.len();
        let mut off = 0;
        while off < total {
            let end = usize::min(off + WRITE_CHUNK, total);
            if let Err(e) = self.stream.write_all(&self.bufs.write_buffer[off..end]) {
                return Err(self.fatal_write(e));
            }
            off = end;
            if off < total {
                loop {
                    match self.stream.poll_message(&mut self.bufs) {
                        Ok(true) => {
                            let msg = (self.bufs.type_byte, self.bufs.read_buffer.clone());
                            self.pending.push_back(msg);
                        }
                        Ok(false) => break,
                        Err(e) => return Err(self.fatal_io(e)),
                    }
                }
            }
        }
        if let Err(e) = self.stream.flush() {
            return Err(self.fatal_write(e));
        }
        Ok(())
    }

    // === Response pump ===

    /// Read the next raw message, preferring messages buffered during an
    /// interleaved flush.
    fn next_message(&mut self) -> Result<u8> {
        if let Some((tag, payload)) = self.pending.pop_front() {
            self.bufs.type_byte = tag;
            self.bufs.read_buffer.clear();
            self.bufs.read_buffer.extend_from_slice(&payload);
            return Ok(tag);
        }
        match self.stream.read_message(&mut self.bufs) {
            Ok(()) => Ok(self.bufs.type_byte),
            Err(e) => Err(self.fatal_io(e)),
        }
    }

    /// The single decode point: reads messages, transparently dispatching
    /// the side channel (parameter statuses, notices, notifications), and
    /// returns the first message the current operation must handle itself.
    pub(crate) fn pump_message(&mut self) -> Result<u8> {
        loop {
            let tag = self.next_message()?;
            let handled = match tag {
                msg_type::PARAMETER_STATUS => self.apply_parameter_status(),
                msg_type::NOTICE_RESPONSE => self.dispatch_notice(),
                msg_type::NOTIFICATION_RESPONSE => self.dispatch_notification().map(|_| ()),
                _ => return Ok(tag),
            };
            if let Err(e) = handled {
                return Err(self.fatal(e));
            }
        }
    }

    fn apply_parameter_status(&mut self) -> Result<()> {
        let (name, value) = {
            let p = backend::ParameterStatus::parse(&self.bufs.read_buffer)?;
            (p.name.to_string(), p.value.to_string())
        };
        match self.server_params.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.server_params.push((name, value)),
        }
        Ok(())
    }

    fn dispatch_notice(&mut self) -> Result<()> {
        let notice = backend::parse_notice(&self.bufs.read_buffer)?;
        if let Some(cb) = &self.on_notice {
            cb(&notice);
        }
        Ok(())
    }

    fn dispatch_notification(&mut self) -> Result<Notification> {
        let notification = {
            let raw = backend::NotificationResponse::parse(&self.bufs.read_buffer)?;
            Notification {
                pid: raw.pid,
                channel: raw.channel.to_string(),
                payload: raw.payload.to_string(),
            }
        };
        if let Some(cb) = &self.on_notification {
            cb(&notification);
        }
        Ok(notification)
    }

    /// Consume a ReadyForQuery payload: transaction status + end of op.
    pub(crate) fn apply_ready(&mut self) -> Result<()> {
        let status = match backend::ReadyForQuery::parse(&self.bufs.read_buffer) {
            Ok(ready) => ready.tx_status,
            Err(e) => return Err(self.fatal(e)),
        };
        self.tx_status = status;
        self.op.finished = true;
        Ok(())
    }

    /// Record an ErrorResponse. Statement-level errors attach to the open
    /// result group and the operation; FATAL/PANIC close the connection.
    pub(crate) fn ingest_error_response(&mut self) -> Result<()> {
        let pg = match backend::parse_error(&self.bufs.read_buffer) {
            Ok(fields) => fields,
            Err(e) => return Err(self.fatal(e)),
        };
        if pg.is_fatal() {
            return Err(self.fatal(Error::Server(pg)));
        }
        if self.op.res.active && !self.op.res.complete {
            self.op.res.err = Some(pg.clone());
            self.op.res.complete = true;
            self.op.res.row_valid = false;
        }
        if self.op.op_error.is_none() {
            self.op.op_error = Some(pg);
        }
        Ok(())
    }

    fn ingest_row_description(&mut self) -> Result<()> {
        let fields = match backend::RowDescription::parse(&self.bufs.read_buffer) {
            Ok(desc) => desc.fields.iter().map(FieldDescription::from_wire).collect(),
            Err(e) => return Err(self.fatal(e)),
        };
        self.op.res.fields = fields;
        Ok(())
    }

    fn ingest_command_complete(&mut self) -> Result<()> {
        let tag = match backend::CommandComplete::parse(&self.bufs.read_buffer) {
            Ok(complete) => CommandTag::new(complete.tag),
            Err(e) => return Err(self.fatal(e)),
        };
        self.op.res.tag = Some(tag);
        self.op.res.complete = true;
        self.op.res.row_valid = false;
        Ok(())
    }

    fn ingest_data_row(&mut self) -> Result<()> {
        let mut ranges = std::mem::take(&mut self.op.res.row_ranges);
        match parse_row_ranges(&self.bufs.read_buffer, &mut ranges) {
            Ok(()) => {
                self.op.res.row_buf.clear();
                self.op.res.row_buf.extend_from_slice(&self.bufs.read_buffer);
                self.op.res.row_ranges = ranges;
                self.op.res.row_valid = true;
                Ok(())
            }
            Err(msg) => Err(self.fatal(Error::Protocol(msg))),
        }
    }

    // === Result stream advancement (used by the readers) ===

    /// Advance within the open result group. `Ok(false)` means the group is
    /// complete (tag, suspension, or error recorded in the result state).
    pub(crate) fn advance_row(&mut self) -> Result<bool> {
        if self.op.res.complete || !self.op.res.active {
            return Ok(false);
        }
        loop {
            let tag = self.pump_message()?;
            match tag {
                msg_type::DATA_ROW => {
                    self.ingest_data_row()?;
                    return Ok(true);
                }
                msg_type::COMMAND_COMPLETE => {
                    self.ingest_command_complete()?;
                    return Ok(false);
                }
                msg_type::PORTAL_SUSPENDED | msg_type::EMPTY_QUERY_RESPONSE => {
                    self.op.res.complete = true;
                    self.op.res.row_valid = false;
                    return Ok(false);
                }
                msg_type::ERROR_RESPONSE => {
                    self.ingest_error_response()?;
                    return Ok(false);
                }
                msg_type::READY_FOR_QUERY => {
                    // Can only happen after an error was recorded.
                    self.apply_ready()?;
                    self.op.res.complete = true;
                    self.op.res.row_valid = false;
                    self.end_op();
                    return Ok(false);
                }
                other => {
                    return Err(self.fatal(Error::Protocol(format!(
                        "unexpected message '{}' in result rows",
                        other as char
                    ))));
                }
            }
        }
    }

    /// Advance to the next result group. `Ok(false)` means ReadyForQuery
    /// was consumed and busy-status released.
    pub(crate) fn next_result(&mut self) -> Result<bool> {
        while self.op.res.active && !self.op.res.complete {
            self.advance_row()?;
        }
        if self.op.finished {
            return Ok(false);
        }
        loop {
            let tag = self.pump_message()?;
            match tag {
                msg_type::ROW_DESCRIPTION => {
                    self.op.res.begin();
                    self.ingest_row_description()?;
                    return Ok(true);
                }
                msg_type::COMMAND_COMPLETE => {
                    // Rowless statement (INSERT, CREATE, ...).
                    self.op.res.begin();
                    self.ingest_command_complete()?;
                    return Ok(true);
                }
                msg_type::EMPTY_QUERY_RESPONSE => {
                    // Contributes no result group.
                }
                msg_type::ERROR_RESPONSE => {
                    self.ingest_error_response()?;
                }
                msg_type::PARSE_COMPLETE
                | msg_type::BIND_COMPLETE
                | msg_type::NO_DATA
                | msg_type::PARAMETER_DESCRIPTION
                | msg_type::PORTAL_SUSPENDED => {
                    // Extended-protocol bookkeeping between batch steps.
                }
                msg_type::READY_FOR_QUERY => {
                    self.apply_ready()?;
                    self.end_op();
                    return Ok(false);
                }
                other => {
                    return Err(self.fatal(Error::Protocol(format!(
                        "unexpected message '{}' between results",
                        other as char
                    ))));
                }
            }
        }
    }

    /// Drain the current result and, for a standalone reader, the rest of
    /// the operation. Returns the tag or the recorded error.
    pub(crate) fn finish_result(&mut self, standalone: bool) -> Result<CommandTag> {
        while self.op.res.active && !self.op.res.complete {
            self.advance_row()?;
        }
        if standalone {
            self.drain_operation()?;
        }
        self.op.res.active = false;
        if let Some(pg) = self.op.res.err.take() {
            return Err(Error::Server(pg));
        }
        Ok(self.op.res.tag.take().unwrap_or_default())
    }

    /// Consume unread messages until ReadyForQuery, then release
    /// busy-status. The recovery path for early close and abandonment.
    pub(crate) fn drain_operation(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if self.op.finished {
            self.end_op();
            return Ok(());
        }
        loop {
            let tag = self.pump_message()?;
            match tag {
                msg_type::READY_FOR_QUERY => {
                    self.apply_ready()?;
                    self.end_op();
                    return Ok(());
                }
                msg_type::ERROR_RESPONSE => self.ingest_error_response()?,
                _ => {}
            }
        }
    }

    // === Simple query ===

    /// Submit a simple query (one or more semicolon-separated statements)
    /// and return a reader over its result groups.
    pub fn exec<'c>(&'c mut self, token: &CancelToken, sql: &str) -> Result<MultiResultReader<'c>> {
        self.begin_op(token)?;
        self.bufs.write_buffer.clear();
        frontend::write_query(&mut self.bufs.write_buffer, sql);
        self.flush_request()?;
        Ok(MultiResultReader::new(self))
    }

    // === Extended query ===

    /// One-shot parameterized query through the unnamed statement:
    /// Parse/Bind/Describe/Execute/Sync, single result.
    #[allow(clippy::too_many_arguments)]
    pub fn exec_params<'c>(
        &'c mut self,
        token: &CancelToken,
        sql: &str,
        param_values: &[Option<&[u8]>],
        param_oids: &[Oid],
        param_formats: &[FormatCode],
        result_formats: &[FormatCode],
    ) -> Result<ResultReader<'c>> {
        if param_values.len() > 65535 {
            return Err(Error::TooManyParams);
        }
        self.begin_op(token)?;
        self.bufs.write_buffer.clear();
        {
            let buf = &mut self.bufs.write_buffer;
            frontend::write_parse(buf, "", sql, param_oids);
            frontend::write_bind(buf, "", "", param_formats, param_values, result_formats);
            frontend::write_describe_portal(buf, "");
            frontend::write_execute(buf, "", 0);
            frontend::write_sync(buf);
        }
        self.flush_request()?;
        self.read_until_row_description()?;
        Ok(ResultReader {
            conn: self,
            standalone: true,
        })
    }

    /// Execute a previously prepared statement. Single result.
    pub fn exec_prepared<'c>(
        &'c mut self,
        token: &CancelToken,
        name: &str,
        param_values: &[Option<&[u8]>],
        param_formats: &[FormatCode],
        result_formats: &[FormatCode],
    ) -> Result<ResultReader<'c>> {
        if param_values.len() > 65535 {
            return Err(Error::TooManyParams);
        }
        self.begin_op(token)?;
        self.bufs.write_buffer.clear();
        {
            let buf = &mut self.bufs.write_buffer;
            frontend::write_bind(buf, "", name, param_formats, param_values, result_formats);
            frontend::write_describe_portal(buf, "");
            frontend::write_execute(buf, "", 0);
            frontend::write_sync(buf);
        }
        self.flush_request()?;
        self.read_until_row_description()?;
        Ok(ResultReader {
            conn: self,
            standalone: true,
        })
    }

    /// Create a named prepared statement and return its description.
    pub fn prepare(
        &mut self,
        token: &CancelToken,
        name: &str,
        sql: &str,
        param_oids: &[Oid],
    ) -> Result<StatementDescription> {
        if param_oids.len() > 65535 {
            return Err(Error::TooManyParams);
        }
        self.begin_op(token)?;
        self.bufs.write_buffer.clear();
        {
            let buf = &mut self.bufs.write_buffer;
            frontend::write_parse(buf, name, sql, param_oids);
            frontend::write_describe_statement(buf, name);
            frontend::write_sync(buf);
        }
        self.flush_request()?;

        let mut desc = StatementDescription {
            name: name.to_string(),
            param_oids: Vec::new(),
            fields: Vec::new(),
        };
        while !self.op.finished {
            let tag = self.pump_message()?;
            match tag {
                msg_type::PARSE_COMPLETE | msg_type::NO_DATA => {}
                msg_type::PARAMETER_DESCRIPTION => {
                    let oids = match backend::ParameterDescription::parse(&self.bufs.read_buffer) {
                        Ok(p) => p.param_oids,
                        Err(e) => return Err(self.fatal(e)),
                    };
                    desc.param_oids = oids;
                }
                msg_type::ROW_DESCRIPTION => {
                    self.ingest_row_description()?;
                    desc.fields = std::mem::take(&mut self.op.res.fields);
                }
                msg_type::ERROR_RESPONSE => self.ingest_error_response()?,
                msg_type::READY_FOR_QUERY => self.apply_ready()?,
                other => {
                    return Err(self.fatal(Error::Protocol(format!(
                        "unexpected message '{}' in prepare",
                        other as char
                    ))));
                }
            }
        }
        self.end_op();
        match self.op.op_error.take() {
            Some(pg) => Err(Error::Server(pg)),
            None => Ok(desc),
        }
    }

    /// Release a named prepared statement on the server.
    pub fn close_statement(&mut self, token: &CancelToken, name: &str) -> Result<()> {
        self.begin_op(token)?;
        self.bufs.write_buffer.clear();
        {
            let buf = &mut self.bufs.write_buffer;
            frontend::write_close_statement(buf, name);
            frontend::write_sync(buf);
        }
        self.flush_request()?;

        while !self.op.finished {
            let tag = self.pump_message()?;
            match tag {
                msg_type::CLOSE_COMPLETE => {}
                msg_type::ERROR_RESPONSE => self.ingest_error_response()?,
                msg_type::READY_FOR_QUERY => self.apply_ready()?,
                other => {
                    return Err(self.fatal(Error::Protocol(format!(
                        "unexpected message '{}' in close",
                        other as char
                    ))));
                }
            }
        }
        self.end_op();
        match self.op.op_error.take() {
            Some(pg) => Err(Error::Server(pg)),
            None => Ok(()),
        }
    }

    /// Pump the extended-protocol preamble until the result's shape is
    /// known (RowDescription, NoData, or an early error).
    fn read_until_row_description(&mut self) -> Result<()> {
        self.op.res.begin();
        loop {
            let tag = self.pump_message()?;
            match tag {
                msg_type::PARSE_COMPLETE
                | msg_type::BIND_COMPLETE
                | msg_type::PARAMETER_DESCRIPTION => {}
                msg_type::NO_DATA => return Ok(()),
                msg_type::ROW_DESCRIPTION => {
                    self.ingest_row_description()?;
                    return Ok(());
                }
                msg_type::ERROR_RESPONSE => {
                    self.ingest_error_response()?;
                    return Ok(());
                }
                msg_type::READY_FOR_QUERY => {
                    self.apply_ready()?;
                    self.op.res.complete = true;
                    return Ok(());
                }
                other => {
                    return Err(self.fatal(Error::Protocol(format!(
                        "unexpected message '{}' before result",
                        other as char
                    ))));
                }
            }
        }
    }

    // === Notifications ===

    /// Block until a NotificationResponse arrives, dispatching the side
    /// channel as usual. The registered callback runs before this returns.
    pub fn wait_for_notification(&mut self, token: &CancelToken) -> Result<Notification> {
        self.begin_op(token)?;
        loop {
            let tag = self.next_message()?;
            match tag {
                msg_type::NOTIFICATION_RESPONSE => match self.dispatch_notification() {
                    Ok(n) => {
                        self.op.finished = true;
                        self.end_op();
                        return Ok(n);
                    }
                    Err(e) => return Err(self.fatal(e)),
                },
                msg_type::PARAMETER_STATUS => {
                    if let Err(e) = self.apply_parameter_status() {
                        return Err(self.fatal(e));
                    }
                }
                msg_type::NOTICE_RESPONSE => {
                    if let Err(e) = self.dispatch_notice() {
                        return Err(self.fatal(e));
                    }
                }
                other => {
                    return Err(self.fatal(Error::Protocol(format!(
                        "unexpected message '{}' while waiting for notification",
                        other as char
                    ))));
                }
            }
        }
    }

    // === Low-level escape hatch ===

    /// Write raw bytes to the wire. The caller is responsible for correct
    /// framing; busy-status is held only for the duration of the write.
    pub fn send_bytes(&mut self, token: &CancelToken, bytes: &[u8]) -> Result<()> {
        self.begin_op(token)?;
        self.bufs.write_buffer.clear();
        self.bufs.write_buffer.extend_from_slice(bytes);
        self.flush_request()?;
        self.op.finished = true;
        self.end_op();
        Ok(())
    }

    /// Read and decode the next backend message, applying side effects
    /// (parameter statuses, callbacks, transaction status) before returning
    /// it raw.
    pub fn receive_message(&mut self, token: &CancelToken) -> Result<(u8, Vec<u8>)> {
        self.begin_op(token)?;
        let tag = match self.next_message() {
            Ok(tag) => tag,
            Err(e) => return Err(e),
        };
        let side_effect = match tag {
            msg_type::PARAMETER_STATUS => self.apply_parameter_status(),
            msg_type::NOTICE_RESPONSE => self.dispatch_notice(),
            msg_type::NOTIFICATION_RESPONSE => self.dispatch_notification().map(|_| ()),
            msg_type::READY_FOR_QUERY => {
                match backend::ReadyForQuery::parse(&self.bufs.read_buffer) {
                    Ok(ready) => {
                        self.tx_status = ready.tx_status;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            _ => Ok(()),
        };
        if let Err(e) = side_effect {
            return Err(self.fatal(e));
        }
        let payload = self.bufs.read_buffer.clone();
        self.op.finished = true;
        self.end_op();
        Ok((tag, payload))
    }

    // === Cancellation and teardown ===

    /// Best-effort out-of-band cancellation: a second transport carrying a
    /// CancelRequest with the stored backend PID and secret key. The
    /// primary connection is untouched; a canceled query surfaces there as
    /// a PgError with SQLSTATE 57014.
    pub fn cancel_request(&self) -> Result<()> {
        self.cancel_handle().send()
    }

    /// Owned snapshot for issuing CancelRequests from another thread while
    /// this connection is blocked in an operation.
    pub fn cancel_handle(&self) -> CancelRequestHandle {
        CancelRequestHandle {
            remote: self.remote.clone(),
            dial: self.dial.clone(),
            timeout: self.connect_timeout,
            key: self.backend_key,
        }
    }

    /// Round-trip an empty query to verify the connection is alive.
    pub fn ping(&mut self, token: &CancelToken) -> Result<()> {
        self.exec(token, "")?.close()
    }

    /// Close gracefully: send Terminate and shut the stream down.
    pub fn close(mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.bufs.write_buffer.clear();
        frontend::write_terminate(&mut self.bufs.write_buffer);
        let written = self.stream.write_all(&self.bufs.write_buffer);
        let flushed = self.stream.flush();
        self.mark_closed();
        self.stream.shutdown();
        written.map_err(Error::Write)?;
        flushed.map_err(Error::Write)?;
        Ok(())
    }
}

/// Owned ingredients of an out-of-band CancelRequest, detachable from the
/// connection so another thread can fire it mid-operation.
#[derive(Clone)]
pub struct CancelRequestHandle {
    remote: RemoteAddr,
    dial: Option<Arc<DialFn>>,
    timeout: Option<Duration>,
    key: Option<(u32, u32)>,
}

impl CancelRequestHandle {
    /// Open a second transport, send the CancelRequest frame, and close.
    pub fn send(&self) -> Result<()> {
        let (pid, secret) = self
            .key
            .ok_or_else(|| Error::InvalidUsage("no BackendKeyData received".into()))?;
        connect::send_cancel_request(&self.remote, self.dial.as_deref(), self.timeout, pid, secret)
    }
}

/// Walk a DataRow payload into per-column ranges; `None` encodes NULL.
fn parse_row_ranges(
    payload: &[u8],
    ranges: &mut Vec<Option<std::ops::Range<usize>>>,
) -> std::result::Result<(), String> {
    ranges.clear();
    if payload.len() < 2 {
        return Err("DataRow: missing column count".into());
    }
    let count = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut off = 2;
    for _ in 0..count {
        let Some(len_bytes) = payload.get(off..off + 4) else {
            return Err("DataRow: truncated column length".into());
        };
        let len = i32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        off += 4;
        if len < 0 {
            ranges.push(None);
        } else {
            let end = off + len as usize;
            if end > payload.len() {
                return Err("DataRow: truncated column value".into());
            }
            ranges.push(Some(off..end));
            off = end;
        }
    }
    Ok(())
}

/// Escape a string for inclusion in a single-quoted SQL literal: every `'`
/// is doubled. Strings with embedded NUL are rejected.
pub fn escape_string(s: &str) -> Result<String> {
    if s.contains('\0') {
        return Err(Error::InvalidUsage("string contains embedded NUL".into()));
    }
    Ok(s.replace('\'', "''"))
}

/// Built-in `validate_connect` for read-write sessions: runs
/// `SHOW transaction_read_only` and rejects servers answering "on".
pub fn validate_connect_target_session_attrs_read_write(conn: &mut Conn) -> Result<()> {
    let token = CancelToken::never();
    let mut results = conn.exec(&token, "SHOW transaction_read_only")?;
    let mut value: Option<Vec<u8>> = None;
    while results.next_result()? {
        let mut reader = results.reader();
        while reader.next_row()? {
            if let Some(Some(bytes)) = reader.values().first() {
                value = Some(bytes.to_vec());
            }
        }
    }
    results.close()?;
    if value.as_deref() == Some(b"on") {
        return Err(Error::Unsupported("target session is read-only".into()));
    }
    Ok(())
}
