//! Simple query protocol messages.

use crate::protocol::codec::{put_message, put_str0};

/// Write a Query message (simple query protocol).
///
/// The string may contain multiple statements separated by semicolons; the
/// server runs them in one implicit transaction and answers with one result
/// group per statement.
pub fn write_query(buf: &mut Vec<u8>, query: &str) {
    put_message(buf, super::msg_type::QUERY, |body| put_str0(body, query));
}
