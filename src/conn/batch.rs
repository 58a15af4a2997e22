//! Queued extended-query batches submitted under a single Sync.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::protocol::frontend;
use crate::protocol::types::{FormatCode, Oid};

use super::{Conn, MultiResultReader};

/// A list of extended-query steps encoded into one byte stream and
/// terminated by a single Sync, so the whole batch runs as one implicit
/// transaction: an error aborts the remaining steps and rolls everything
/// back.
#[derive(Default)]
pub struct Batch {
    buf: Vec<u8>,
    steps: usize,
    oversize: bool,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot parameterized statement
    /// (Parse/Bind/Describe/Execute through the unnamed statement).
    pub fn queue_params(
        &mut self,
        sql: &str,
        param_values: &[Option<&[u8]>],
        param_oids: &[Oid],
        param_formats: &[FormatCode],
        result_formats: &[FormatCode],
    ) -> Result<()> {
        if param_values.len() > 65535 {
            self.oversize = true;
            return Err(Error::TooManyParams);
        }
        frontend::write_parse(&mut self.buf, "", sql, param_oids);
        frontend::write_bind(
            &mut self.buf,
            "",
            "",
            param_formats,
            param_values,
            result_formats,
        );
        frontend::write_describe_portal(&mut self.buf, "");
        frontend::write_execute(&mut self.buf, "", 0);
        self.steps += 1;
        Ok(())
    }

    /// Queue an execution of a previously prepared statement
    /// (Bind/Describe/Execute).
    pub fn queue_prepared(
        &mut self,
        name: &str,
        param_values: &[Option<&[u8]>],
        param_formats: &[FormatCode],
        result_formats: &[FormatCode],
    ) -> Result<()> {
        if param_values.len() > 65535 {
            self.oversize = true;
            return Err(Error::TooManyParams);
        }
        frontend::write_bind(
            &mut self.buf,
            "",
            name,
            param_formats,
            param_values,
            result_formats,
        );
        frontend::write_describe_portal(&mut self.buf, "");
        frontend::write_execute(&mut self.buf, "", 0);
        self.steps += 1;
        Ok(())
    }

    /// Number of queued steps.
    pub fn len(&self) -> usize {
        self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }
}

impl Conn {
    /// Submit a batch. The returned reader yields one result group per
    /// queued step, in order; a failed step reports its error on the
    /// corresponding group and the server discards the rest until Sync.
    ///
    /// The whole request is written before any result is read; requests
    /// exceeding the interleave threshold are flushed with opportunistic
    /// reads so arbitrarily large batches make progress whenever the
    /// server does.
    pub fn exec_batch<'c>(
        &'c mut self,
        token: &CancelToken,
        batch: &Batch,
    ) -> Result<MultiResultReader<'c>> {
        if batch.oversize {
            return Err(Error::TooManyParams);
        }
        self.begin_op(token)?;
        self.bufs.write_buffer.clear();
        self.bufs.write_buffer.extend_from_slice(&batch.buf);
        frontend::write_sync(&mut self.bufs.write_buffer);
        self.flush_request()?;
        Ok(MultiResultReader::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_tags(mut buf: &[u8]) -> Vec<u8> {
        let mut tags = Vec::new();
        while !buf.is_empty() {
            let tag = buf[0];
            let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            tags.push(tag);
            buf = &buf[1 + len..];
        }
        tags
    }

    #[test]
    fn queue_encodes_steps() {
        let mut batch = Batch::new();
        batch
            .queue_params("SELECT $1::int", &[Some(b"1")], &[23], &[], &[])
            .unwrap();
        batch
            .queue_prepared("stmt", &[Some(b"2")], &[], &[])
            .unwrap();

        assert_eq!(batch.len(), 2);
        // Parse only for the SQL step; no Sync until submission.
        assert_eq!(
            frame_tags(&batch.buf),
            vec![b'P', b'B', b'D', b'E', b'B', b'D', b'E']
        );
    }

    #[test]
    fn oversized_step_is_rejected_at_queue_time() {
        let mut batch = Batch::new();
        let values: Vec<Option<&[u8]>> = vec![Some(b"x"); 65536];
        let err = batch
            .queue_params("SELECT 1", &values, &[], &[], &[])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "extended protocol limited to 65535 parameters"
        );
        assert!(err.is_safe_to_retry());
        assert!(batch.oversize);
    }

    #[test]
    fn exact_limit_is_accepted() {
        let mut batch = Batch::new();
        let values: Vec<Option<&[u8]>> = vec![Some(b"x"); 65535];
        batch
            .queue_params("SELECT 1", &values, &[], &[], &[])
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(!batch.oversize);
    }
}
