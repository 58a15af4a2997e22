//! Scripted in-process PostgreSQL server for wire-level tests.
//!
//! Each test starts a [`MockServer`] with a closure playing the backend
//! side of protocol v3 over a loopback TCP socket. Backend messages are
//! hand-framed here; frontend messages are read raw and asserted on.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;

use direct_postgres::{Config, TlsMode};

pub struct MockServer {
    pub port: u16,
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Accept one connection and run `script` against it.
    pub fn start(script: impl FnOnce(&mut ServerConn) + Send + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();
        let handle = std::thread::spawn(move || {
            let (sock, _) = listener.accept().expect("accept");
            let mut conn = ServerConn { sock };
            script(&mut conn);
        });
        Self {
            port,
            handle: Some(handle),
        }
    }

    /// Config pointing at this server, TLS disabled.
    pub fn config(&self) -> Config {
        Config {
            host: "127.0.0.1".into(),
            port: self.port,
            user: "tester".into(),
            database: Some("testdb".into()),
            tls_mode: TlsMode::Disable,
            ..Config::default()
        }
    }

    /// Propagate any assertion failure from the script thread.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("mock server script failed");
        }
    }
}

pub struct ServerConn {
    sock: TcpStream,
}

impl ServerConn {
    // === Reading frontend traffic ===

    fn read_exact(&mut self, buf: &mut [u8]) {
        self.sock.read_exact(buf).expect("mock read");
    }

    /// Read the startup message (no type byte) and return its payload.
    pub fn read_startup(&mut self) -> Vec<u8> {
        let mut len = [0u8; 4];
        self.read_exact(&mut len);
        let len = u32::from_be_bytes(len) as usize;
        let mut payload = vec![0u8; len - 4];
        self.read_exact(&mut payload);
        payload
    }

    /// Read one tagged frontend message.
    pub fn read_message(&mut self) -> (u8, Vec<u8>) {
        let mut tag = [0u8; 1];
        self.read_exact(&mut tag);
        let mut len = [0u8; 4];
        self.read_exact(&mut len);
        let len = u32::from_be_bytes(len) as usize;
        let mut payload = vec![0u8; len - 4];
        self.read_exact(&mut payload);
        (tag[0], payload)
    }

    /// Read one message and assert its tag.
    pub fn expect(&mut self, expected: u8) -> Vec<u8> {
        let (tag, payload) = self.read_message();
        assert_eq!(
            tag as char, expected as char,
            "expected frontend message '{}', got '{}'",
            expected as char, tag as char
        );
        payload
    }

    /// Read a Query message and return its SQL text.
    pub fn expect_query(&mut self) -> String {
        let payload = self.expect(b'Q');
        let text = payload.strip_suffix(&[0]).expect("query not terminated");
        String::from_utf8(text.to_vec()).expect("query not UTF-8")
    }

    /// Read messages until Sync, returning their tags in order.
    pub fn read_until_sync(&mut self) -> Vec<u8> {
        let mut tags = Vec::new();
        loop {
            let (tag, _) = self.read_message();
            tags.push(tag);
            if tag == b'S' {
                return tags;
            }
        }
    }

    /// Run the standard startup exchange: consume the startup message and
    /// authenticate trivially.
    pub fn accept_startup(&mut self) {
        let startup = self.read_startup();
        assert_eq!(&startup[0..4], &196608_i32.to_be_bytes(), "protocol 3.0");
        assert!(
            startup.windows(7).any(|w| w == b"tester\0"),
            "startup carries the user"
        );
        self.send_auth_ok();
        self.send_parameter_status("server_version", "17.0");
        self.send_backend_key(42, 4242);
        self.send_ready(b'I');
    }

    // === Writing backend traffic ===

    pub fn send(&mut self, tag: u8, payload: &[u8]) {
        let mut frame = vec![tag];
        frame.extend_from_slice(&((payload.len() as i32 + 4).to_be_bytes()));
        frame.extend_from_slice(payload);
        self.sock.write_all(&frame).expect("mock write");
    }

    pub fn send_auth_ok(&mut self) {
        self.send(b'R', &0_i32.to_be_bytes());
    }

    pub fn send_parameter_status(&mut self, name: &str, value: &str) {
        let mut payload = Vec::new();
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.send(b'S', &payload);
    }

    pub fn send_backend_key(&mut self, pid: u32, secret: u32) {
        let mut payload = pid.to_be_bytes().to_vec();
        payload.extend_from_slice(&secret.to_be_bytes());
        self.send(b'K', &payload);
    }

    pub fn send_ready(&mut self, status: u8) {
        self.send(b'Z', &[status]);
    }

    /// RowDescription with text-format columns of type `text`.
    pub fn send_row_description(&mut self, columns: &[&str]) {
        let mut payload = (columns.len() as u16).to_be_bytes().to_vec();
        for name in columns {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&0_u32.to_be_bytes()); // table oid
            payload.extend_from_slice(&0_i16.to_be_bytes()); // column attr
            payload.extend_from_slice(&25_u32.to_be_bytes()); // type oid: text
            payload.extend_from_slice(&(-1_i16).to_be_bytes()); // type size
            payload.extend_from_slice(&(-1_i32).to_be_bytes()); // type modifier
            payload.extend_from_slice(&0_u16.to_be_bytes()); // format: text
        }
        self.send(b'T', &payload);
    }

    pub fn send_data_row(&mut self, values: &[Option<&[u8]>]) {
        let mut payload = (values.len() as u16).to_be_bytes().to_vec();
        for value in values {
            match value {
                Some(bytes) => {
                    payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    payload.extend_from_slice(bytes);
                }
                None => payload.extend_from_slice(&(-1_i32).to_be_bytes()),
            }
        }
        self.send(b'D', &payload);
    }

    pub fn send_command_complete(&mut self, tag: &str) {
        let mut payload = tag.as_bytes().to_vec();
        payload.push(0);
        self.send(b'C', &payload);
    }

    pub fn send_empty_query_response(&mut self) {
        self.send(b'I', &[]);
    }

    pub fn send_parse_complete(&mut self) {
        self.send(b'1', &[]);
    }

    pub fn send_bind_complete(&mut self) {
        self.send(b'2', &[]);
    }

    pub fn send_close_complete(&mut self) {
        self.send(b'3', &[]);
    }

    pub fn send_no_data(&mut self) {
        self.send(b'n', &[]);
    }

    pub fn send_parameter_description(&mut self, oids: &[u32]) {
        let mut payload = (oids.len() as i16).to_be_bytes().to_vec();
        for oid in oids {
            payload.extend_from_slice(&(*oid as i32).to_be_bytes());
        }
        self.send(b't', &payload);
    }

    fn error_fields(severity: &str, code: &str, message: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        for (tag, value) in [
            (b'S', severity),
            (b'V', severity),
            (b'C', code),
            (b'M', message),
        ] {
            payload.push(tag);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        payload
    }

    pub fn send_error(&mut self, code: &str, message: &str) {
        let payload = Self::error_fields("ERROR", code, message);
        self.send(b'E', &payload);
    }

    pub fn send_notice(&mut self, code: &str, message: &str) {
        let payload = Self::error_fields("NOTICE", code, message);
        self.send(b'N', &payload);
    }

    pub fn send_notification(&mut self, pid: u32, channel: &str, payload_text: &str) {
        let mut payload = pid.to_be_bytes().to_vec();
        payload.extend_from_slice(channel.as_bytes());
        payload.push(0);
        payload.extend_from_slice(payload_text.as_bytes());
        payload.push(0);
        self.send(b'A', &payload);
    }

    pub fn send_copy_out_response(&mut self, columns: u16) {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&columns.to_be_bytes());
        for _ in 0..columns {
            payload.extend_from_slice(&0_u16.to_be_bytes());
        }
        self.send(b'H', &payload);
    }

    pub fn send_copy_in_response(&mut self, columns: u16) {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&columns.to_be_bytes());
        for _ in 0..columns {
            payload.extend_from_slice(&0_u16.to_be_bytes());
        }
        self.send(b'G', &payload);
    }

    pub fn send_copy_data(&mut self, data: &[u8]) {
        self.send(b'd', data);
    }

    pub fn send_copy_done(&mut self) {
        self.send(b'c', &[]);
    }
}
