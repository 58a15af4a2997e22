//! Extended query protocol messages.
//!
//! Parameter values are raw wire bytes (`None` = NULL); interpreting them
//! according to their type OIDs is the caller's concern.

use crate::protocol::codec::{put_i16, put_i32, put_message, put_str0};
use crate::protocol::types::{FormatCode, Oid};

/// Write a Parse message.
///
/// - `name`: statement name ("" for the unnamed statement)
/// - `query`: SQL with $1, $2, ... placeholders
/// - `param_oids`: parameter type OIDs (0 lets the server infer)
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str, param_oids: &[Oid]) {
    put_message(buf, super::msg_type::PARSE, |body| {
        put_str0(body, name);
        put_str0(body, query);
        put_i16(body, param_oids.len() as i16);
        for &oid in param_oids {
            put_i32(body, oid as i32);
        }
    });
}

/// Write a Bind message.
///
/// - `portal` / `statement`: names ("" for unnamed)
/// - `param_formats`: zero entries (all text), one (uniform), or one per value
/// - `params`: raw parameter bytes, `None` encoding NULL (-1 length)
/// - `result_formats`: same 0/1/n convention for result columns
pub fn write_bind(
    buf: &mut Vec<u8>,
    portal: &str,
    statement: &str,
    param_formats: &[FormatCode],
    params: &[Option<&[u8]>],
    result_formats: &[FormatCode],
) {
    put_message(buf, super::msg_type::BIND, |body| {
        put_str0(body, portal);
        put_str0(body, statement);

        put_i16(body, param_formats.len() as i16);
        for &format in param_formats {
            put_i16(body, format as i16);
        }

        put_i16(body, params.len() as i16);
        for param in params {
            match param {
                Some(value) => {
                    put_i32(body, value.len() as i32);
                    body.extend_from_slice(value);
                }
                None => put_i32(body, -1),
            }
        }

        put_i16(body, result_formats.len() as i16);
        for &format in result_formats {
            put_i16(body, format as i16);
        }
    });
}

/// Write an Execute message.
///
/// `max_rows` of 0 means unlimited; a positive limit may end the result
/// with PortalSuspended instead of CommandComplete.
pub fn write_execute(buf: &mut Vec<u8>, portal: &str, max_rows: u32) {
    put_message(buf, super::msg_type::EXECUTE, |body| {
        put_str0(body, portal);
        put_i32(body, max_rows as i32);
    });
}

fn write_describe(buf: &mut Vec<u8>, kind: u8, name: &str) {
    put_message(buf, super::msg_type::DESCRIBE, |body| {
        body.push(kind);
        put_str0(body, name);
    });
}

/// Write a Describe message for a prepared statement.
pub fn write_describe_statement(buf: &mut Vec<u8>, name: &str) {
    write_describe(buf, b'S', name);
}

/// Write a Describe message for a portal.
pub fn write_describe_portal(buf: &mut Vec<u8>, name: &str) {
    write_describe(buf, b'P', name);
}

fn write_close(buf: &mut Vec<u8>, kind: u8, name: &str) {
    put_message(buf, super::msg_type::CLOSE, |body| {
        body.push(kind);
        put_str0(body, name);
    });
}

/// Write a Close message for a prepared statement.
pub fn write_close_statement(buf: &mut Vec<u8>, name: &str) {
    write_close(buf, b'S', name);
}

/// Write a Close message for a portal.
pub fn write_close_portal(buf: &mut Vec<u8>, name: &str) {
    write_close(buf, b'P', name);
}

/// Write a Sync message, ending an extended query sequence.
///
/// The server commits or rolls back the implicit transaction and answers
/// with ReadyForQuery.
pub fn write_sync(buf: &mut Vec<u8>) {
    put_message(buf, super::msg_type::SYNC, |_| {});
}

/// Write a Flush message, forcing pending responses without ending the
/// extended query sequence.
pub fn write_flush(buf: &mut Vec<u8>) {
    put_message(buf, super::msg_type::FLUSH, |_| {});
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_layout() {
        let mut buf = Vec::new();
        write_parse(&mut buf, "stmt1", "SELECT $1::int", &[23]);

        assert_eq!(buf[0], b'P');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn bind_encodes_null_as_negative_length() {
        let mut buf = Vec::new();
        write_bind(
            &mut buf,
            "",
            "",
            &[FormatCode::Text],
            &[None, Some(b"42")],
            &[],
        );

        assert_eq!(buf[0], b'B');
        // portal "", statement "", 1 format code, 2 params
        let body = &buf[5..];
        assert_eq!(&body[0..2], &[0, 0]); // two empty strings
        assert_eq!(&body[2..4], &1_i16.to_be_bytes());
        assert_eq!(&body[4..6], &(FormatCode::Text as i16).to_be_bytes());
        assert_eq!(&body[6..8], &2_i16.to_be_bytes());
        assert_eq!(&body[8..12], &(-1_i32).to_be_bytes());
        assert_eq!(&body[12..16], &2_i32.to_be_bytes());
        assert_eq!(&body[16..18], b"42");
    }

    #[test]
    fn sync_and_flush_layout() {
        let mut buf = Vec::new();
        write_sync(&mut buf);
        write_flush(&mut buf);

        assert_eq!(buf.len(), 10);
        assert_eq!(buf[0], b'S');
        assert_eq!(buf[5], b'H');
    }

    #[test]
    fn execute_layout() {
        let mut buf = Vec::new();
        write_execute(&mut buf, "", 0);

        assert_eq!(buf[0], b'E');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len, 9);
    }

    #[test]
    fn describe_and_close_kinds() {
        let mut buf = Vec::new();
        write_describe_statement(&mut buf, "s1");
        assert_eq!(buf[0], b'D');
        assert_eq!(buf[5], b'S');

        buf.clear();
        write_close_portal(&mut buf, "p1");
        assert_eq!(buf[0], b'C');
        assert_eq!(buf[5], b'P');
    }
}
