//! COPY sub-protocol: bulk data out of and into the server.

use std::io::{Read, Write};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::protocol::backend::msg_type;
use crate::protocol::frontend;

use super::{CommandTag, Conn};

/// Chunk size for reading the caller's COPY-in source.
const COPY_CHUNK: usize = 64 * 1024;

enum CopyPoll {
    Quiet,
    Errored,
}

impl Conn {
    /// Run `COPY ... TO STDOUT`, streaming every CopyData payload into
    /// `dest`. Returns the command tag once the stream drains to
    /// ReadyForQuery.
    ///
    /// A server error before CopyOutResponse surfaces normally with no
    /// bytes written to `dest`.
    pub fn copy_to(
        &mut self,
        token: &CancelToken,
        sql: &str,
        dest: &mut dyn Write,
    ) -> Result<CommandTag> {
        self.begin_op(token)?;
        self.bufs.write_buffer.clear();
        frontend::write_query(&mut self.bufs.write_buffer, sql);
        self.flush_request()?;

        let mut tag = CommandTag::default();
        let mut sink_err: Option<std::io::Error> = None;

        while !self.op.finished {
            let t = self.pump_message()?;
            match t {
                msg_type::COPY_OUT_RESPONSE | msg_type::COPY_DONE => {}
                msg_type::COPY_DATA => {
                    if sink_err.is_none()
                        && let Err(e) = dest.write_all(&self.bufs.read_buffer)
                    {
                        // Keep draining; the stream must reach ReadyForQuery.
                        sink_err = Some(e);
                    }
                }
                msg_type::COMMAND_COMPLETE => {
                    tag = match crate::protocol::backend::CommandComplete::parse(
                        &self.bufs.read_buffer,
                    ) {
                        Ok(complete) => CommandTag::new(complete.tag),
                        Err(e) => return Err(self.fatal(e)),
                    };
                }
                msg_type::ERROR_RESPONSE => self.ingest_error_response()?,
                msg_type::READY_FOR_QUERY => self.apply_ready()?,
                other => {
                    return Err(self.fatal(Error::Protocol(format!(
                        "unexpected message '{}' during COPY TO",
                        other as char
                    ))));
                }
            }
        }
        self.end_op();

        if let Some(pg) = self.op.op_error.take() {
            return Err(Error::Server(pg));
        }
        if let Some(e) = sink_err {
            return Err(Error::Io(e));
        }
        Ok(tag)
    }

    /// Run `COPY ... FROM STDIN`, streaming `source` to the server as
    /// CopyData messages followed by CopyDone.
    ///
    /// The server is polled between chunks so a mid-stream ErrorResponse
    /// (a rejected row, a constraint violation) aborts the transfer
    /// promptly instead of after the source is exhausted. On failure the
    /// client sends CopyFail and drains to ReadyForQuery.
    pub fn copy_from(
        &mut self,
        token: &CancelToken,
        sql: &str,
        source: &mut dyn Read,
    ) -> Result<CommandTag> {
        self.begin_op(token)?;
        self.bufs.write_buffer.clear();
        frontend::write_query(&mut self.bufs.write_buffer, sql);
        self.flush_request()?;

        // Wait for the server to open the COPY-in channel.
        loop {
            let tag = self.pump_message()?;
            match tag {
                msg_type::COPY_IN_RESPONSE => break,
                msg_type::ERROR_RESPONSE => {
                    self.ingest_error_response()?;
                    return self.finish_copy(None);
                }
                msg_type::READY_FOR_QUERY => {
                    self.apply_ready()?;
                    return self.finish_copy(None);
                }
                other => {
                    return Err(self.fatal(Error::Protocol(format!(
                        "expected CopyInResponse, got '{}'",
                        other as char
                    ))));
                }
            }
        }

        let mut server_failed = false;
        let mut source_err: Option<std::io::Error> = None;
        let mut chunk = vec![0u8; COPY_CHUNK];

        loop {
            match self.poll_copy_in()? {
                CopyPoll::Errored => {
                    server_failed = true;
                    break;
                }
                CopyPoll::Quiet => {}
            }
            let n = match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    source_err = Some(e);
                    break;
                }
            };
            self.bufs.write_buffer.clear();
            frontend::write_copy_data(&mut self.bufs.write_buffer, &chunk[..n]);
            self.flush_request()?;
        }

        self.bufs.write_buffer.clear();
        if server_failed {
            frontend::write_copy_fail(&mut self.bufs.write_buffer, "server aborted COPY");
        } else if let Some(e) = &source_err {
            frontend::write_copy_fail(
                &mut self.bufs.write_buffer,
                &format!("copy source failed: {e}"),
            );
        } else {
            frontend::write_copy_done(&mut self.bufs.write_buffer);
        }
        self.flush_request()?;

        self.finish_copy(source_err)
    }

    /// Drain a COPY operation to ReadyForQuery and report the outcome.
    fn finish_copy(&mut self, source_err: Option<std::io::Error>) -> Result<CommandTag> {
        let mut tag = CommandTag::default();
        while !self.op.finished {
            let t = self.pump_message()?;
            match t {
                msg_type::COMMAND_COMPLETE => {
                    tag = match crate::protocol::backend::CommandComplete::parse(
                        &self.bufs.read_buffer,
                    ) {
                        Ok(complete) => CommandTag::new(complete.tag),
                        Err(e) => return Err(self.fatal(e)),
                    };
                }
                msg_type::ERROR_RESPONSE => self.ingest_error_response()?,
                msg_type::READY_FOR_QUERY => self.apply_ready()?,
                msg_type::COPY_IN_RESPONSE
                | msg_type::COPY_OUT_RESPONSE
                | msg_type::COPY_DATA
                | msg_type::COPY_DONE => {}
                other => {
                    return Err(self.fatal(Error::Protocol(format!(
                        "unexpected message '{}' finishing COPY",
                        other as char
                    ))));
                }
            }
        }
        self.end_op();

        if let Some(pg) = self.op.op_error.take() {
            return Err(Error::Server(pg));
        }
        if let Some(e) = source_err {
            return Err(Error::Io(e));
        }
        Ok(tag)
    }

    /// Opportunistically drain server traffic during COPY-in. Reports
    /// whether an ErrorResponse arrived; side-channel messages are
    /// dispatched, anything else is queued for `finish_copy`.
    fn poll_copy_in(&mut self) -> Result<CopyPoll> {
        loop {
            let got = match self.stream.poll_message(&mut self.bufs) {
                Ok(got) => got,
                Err(e) => return Err(self.fatal_io(e)),
            };
            if !got {
                return Ok(CopyPoll::Quiet);
            }
            match self.bufs.type_byte {
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
                msg_type::NOTIFICATION_RESPONSE => {
                    if let Err(e) = self.dispatch_notification() {
                        return Err(self.fatal(e));
                    }
                }
                msg_type::ERROR_RESPONSE => {
                    self.ingest_error_response()?;
                    return Ok(CopyPoll::Errored);
                }
                tag => {
                    let msg = (tag, self.bufs.read_buffer.clone());
                    self.pending.push_back(msg);
                }
            }
        }
    }
}
