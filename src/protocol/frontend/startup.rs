//! Startup, cancellation and termination messages.

use crate::protocol::codec::{put_i32, put_message, put_str0, put_untagged_message};

/// Protocol version 3.0 (0x00030000)
pub const PROTOCOL_VERSION_3_0: i32 = 196608;

/// SSL request code
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Cancel request code
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Write an SSLRequest message.
///
/// Sent before StartupMessage to request TLS. The server answers with a
/// single byte: 'S' (proceed with the handshake) or 'N' (refused).
pub fn write_ssl_request(buf: &mut Vec<u8>) {
    put_untagged_message(buf, |body| put_i32(body, SSL_REQUEST_CODE));
}

/// Write a StartupMessage with protocol 3.0.
///
/// `params` is a list of (name, value) pairs; "user" is required by the
/// server, "database" and arbitrary run-time parameters are optional.
pub fn write_startup(buf: &mut Vec<u8>, params: &[(&str, &str)]) {
    put_untagged_message(buf, |body| {
        put_i32(body, PROTOCOL_VERSION_3_0);
        for (name, value) in params {
            put_str0(body, name);
            put_str0(body, value);
        }
        body.push(0);
    });
}

/// Write a CancelRequest message.
///
/// Sent on a NEW connection to cancel a query running on another one.
/// The server closes the connection without responding.
pub fn write_cancel_request(buf: &mut Vec<u8>, pid: u32, secret_key: u32) {
    put_untagged_message(buf, |body| {
        put_i32(body, CANCEL_REQUEST_CODE);
        put_i32(body, pid as i32);
        put_i32(body, secret_key as i32);
    });
}

/// Write a Terminate message for a clean close.
pub fn write_terminate(buf: &mut Vec<u8>) {
    put_message(buf, super::msg_type::TERMINATE, |_| {});
}
