//! COPY sub-protocol frontend messages.

use crate::protocol::codec::{put_message, put_str0};

/// Write a CopyData message.
pub fn write_copy_data(buf: &mut Vec<u8>, data: &[u8]) {
    put_message(buf, super::msg_type::COPY_DATA, |body| {
        body.extend_from_slice(data);
    });
}

/// Write a CopyDone message.
pub fn write_copy_done(buf: &mut Vec<u8>) {
    put_message(buf, super::msg_type::COPY_DONE, |_| {});
}

/// Write a CopyFail message, aborting a COPY-in from the client side.
pub fn write_copy_fail(buf: &mut Vec<u8>, error_message: &str) {
    put_message(buf, super::msg_type::COPY_FAIL, |body| {
        put_str0(body, error_message);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_data_layout() {
        let mut buf = Vec::new();
        write_copy_data(&mut buf, b"hello\tworld\n");

        assert_eq!(buf[0], b'd');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn copy_done_layout() {
        let mut buf = Vec::new();
        write_copy_done(&mut buf);
        assert_eq!(buf, [b'c', 0, 0, 0, 4]);
    }

    #[test]
    fn copy_fail_carries_message() {
        let mut buf = Vec::new();
        write_copy_fail(&mut buf, "input aborted");

        assert_eq!(buf[0], b'f');
        assert!(buf.ends_with(b"input aborted\0"));
    }
}
