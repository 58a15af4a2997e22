//! Blocking byte-stream transport with deadline mutators.
//!
//! Wraps a TCP, TLS-over-TCP or Unix socket behind a `BufReader` and frames
//! PostgreSQL messages over it. Cancellation integrates at this layer: a
//! per-operation deadline is translated into socket timeouts before every
//! syscall, and an [`AbortHandle`] (a `try_clone`d socket) lets another
//! thread shut the stream down to abort an in-flight blocking call.

use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use native_tls::{TlsConnector, TlsStream};

use crate::buffer::BufferSet;
use crate::error::{Error, Result};

/// Poll granularity for opportunistic reads.
const POLL_TIMEOUT: Duration = Duration::from_millis(1);

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn deadline_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "I/O deadline exceeded")
}

enum Inner {
    Tcp(BufReader<TcpStream>),
    Tls(BufReader<TlsStream<TcpStream>>),
    Unix(BufReader<UnixStream>),
}

impl Inner {
    fn tcp_socket(&self) -> Option<&TcpStream> {
        match self {
            Inner::Tcp(r) => Some(r.get_ref()),
            Inner::Tls(r) => Some(r.get_ref().get_ref()),
            Inner::Unix(_) => None,
        }
    }
}

/// A socket handle able to abort the stream's blocking calls from another
/// thread. Aborting is one-way: the connection is unusable afterwards.
pub struct AbortHandle {
    sock: AbortSock,
}

enum AbortSock {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AbortHandle {
    /// Shut the socket down in both directions, failing any blocked or
    /// future read/write with an error. Best-effort.
    pub fn abort(&self) {
        match &self.sock {
            AbortSock::Tcp(s) => {
                let _ = s.set_read_timeout(Some(POLL_TIMEOUT));
                let _ = s.shutdown(Shutdown::Both);
            }
            AbortSock::Unix(s) => {
                let _ = s.set_read_timeout(Some(POLL_TIMEOUT));
                let _ = s.shutdown(Shutdown::Both);
            }
        }
    }
}

/// Framed byte-stream transport, plain or TLS-wrapped.
pub struct Stream {
    inner: Inner,
    deadline: Option<Instant>,
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> Self {
        Self {
            inner: Inner::Tcp(BufReader::new(stream)),
            deadline: None,
        }
    }

    pub fn unix(stream: UnixStream) -> Self {
        Self {
            inner: Inner::Unix(BufReader::new(stream)),
            deadline: None,
        }
    }

    /// Replace the underlying TCP stream with a TLS-wrapped one.
    ///
    /// Only legal directly after the server's one-byte 'S' answer to
    /// SSLRequest; any plaintext left in the read buffer at that point is a
    /// protocol violation.
    pub fn upgrade_to_tls(self, connector: &TlsConnector, domain: &str) -> Result<Self> {
        match self.inner {
            Inner::Tcp(buf_reader) => {
                if !buf_reader.buffer().is_empty() {
                    return Err(Error::Protocol(
                        "unexpected plaintext after SSLRequest response".into(),
                    ));
                }
                let tcp = buf_reader.into_inner();
                let tls = connector.connect(domain, tcp).map_err(|e| match e {
                    native_tls::HandshakeError::Failure(e) => Error::Tls(e),
                    native_tls::HandshakeError::WouldBlock(_) => Error::Io(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "TLS handshake would block",
                    )),
                })?;
                Ok(Self {
                    inner: Inner::Tls(BufReader::new(tls)),
                    deadline: self.deadline,
                })
            }
            Inner::Tls(_) => Err(Error::InvalidUsage("stream is already TLS".into())),
            Inner::Unix(_) => Err(Error::InvalidUsage(
                "cannot upgrade a Unix socket to TLS".into(),
            )),
        }
    }

    /// `tls-server-end-point` channel binding data, when running over TLS.
    pub fn tls_server_end_point(&self) -> Option<Vec<u8>> {
        match &self.inner {
            Inner::Tls(r) => r.get_ref().tls_server_end_point().ok().flatten(),
            _ => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.inner, Inner::Tls(_))
    }

    /// Handle for aborting this stream from another thread.
    pub fn abort_handle(&self) -> io::Result<AbortHandle> {
        let sock = match &self.inner {
            Inner::Tcp(r) => AbortSock::Tcp(r.get_ref().try_clone()?),
            Inner::Tls(r) => AbortSock::Tcp(r.get_ref().get_ref().try_clone()?),
            Inner::Unix(r) => AbortSock::Unix(r.get_ref().try_clone()?),
        };
        Ok(AbortHandle { sock })
    }

    /// Install or clear the I/O deadline applied to subsequent syscalls.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Shut the socket down in both directions. Best-effort.
    pub fn shutdown(&self) {
        match &self.inner {
            Inner::Tcp(r) => {
                let _ = r.get_ref().shutdown(Shutdown::Both);
            }
            Inner::Tls(r) => {
                let _ = r.get_ref().get_ref().shutdown(Shutdown::Both);
            }
            Inner::Unix(r) => {
                let _ = r.get_ref().shutdown(Shutdown::Both);
            }
        }
    }

    fn remaining(&self) -> io::Result<Option<Duration>> {
        match self.deadline {
            None => Ok(None),
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    Err(deadline_error())
                } else {
                    Ok(Some(at - now))
                }
            }
        }
    }

    fn set_read_timeout_raw(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.inner {
            Inner::Tcp(r) => r.get_ref().set_read_timeout(timeout),
            Inner::Tls(r) => r.get_ref().get_ref().set_read_timeout(timeout),
            Inner::Unix(r) => r.get_ref().set_read_timeout(timeout),
        }
    }

    fn set_write_timeout_raw(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.inner {
            Inner::Tcp(r) => r.get_ref().set_write_timeout(timeout),
            Inner::Tls(r) => r.get_ref().get_ref().set_write_timeout(timeout),
            Inner::Unix(r) => r.get_ref().set_write_timeout(timeout),
        }
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let timeout = self.remaining()?;
        self.set_read_timeout_raw(timeout)?;
        match &mut self.inner {
            Inner::Tcp(r) => r.read_exact(buf),
            Inner::Tls(r) => r.read_exact(buf),
            Inner::Unix(r) => r.read_exact(buf),
        }
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Read one framed message into the buffer set.
    pub fn read_message(&mut self, bufs: &mut BufferSet) -> io::Result<()> {
        bufs.type_byte = self.read_u8()?;
        self.read_frame_body(bufs)
    }

    /// Drain one message if the server has already sent (part of) one.
    ///
    /// Returns false when nothing is available within the poll window. Once
    /// a type byte has arrived, the rest of the frame is read under the
    /// normal deadline.
    pub fn poll_message(&mut self, bufs: &mut BufferSet) -> io::Result<bool> {
        self.set_read_timeout_raw(Some(POLL_TIMEOUT))?;
        let mut byte = [0u8; 1];
        let n = match &mut self.inner {
            Inner::Tcp(r) => r.read(&mut byte),
            Inner::Tls(r) => r.read(&mut byte),
            Inner::Unix(r) => r.read(&mut byte),
        };
        match n {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => {}
            Err(e) if is_timeout(&e) => return Ok(false),
            Err(e) => return Err(e),
        }
        bufs.type_byte = byte[0];
        self.read_frame_body(bufs)?;
        Ok(true)
    }

    fn read_frame_body(&mut self, bufs: &mut BufferSet) -> io::Result<()> {
        let mut length_bytes = [0u8; 4];
        self.read_exact(&mut length_bytes)?;
        let length = u32::from_be_bytes(length_bytes) as usize;

        let payload_len = length.saturating_sub(4);
        bufs.read_buffer.clear();
        bufs.read_buffer.resize(payload_len, 0);
        self.read_exact(&mut bufs.read_buffer)
    }

    /// Write the whole buffer. A failure leaves the stream in an unknown
    /// state; callers treat it as fatal.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let timeout = self.remaining()?;
        self.set_write_timeout_raw(timeout)?;
        match &mut self.inner {
            Inner::Tcp(r) => r.get_mut().write_all(buf),
            Inner::Tls(r) => r.get_mut().write_all(buf),
            Inner::Unix(r) => r.get_mut().write_all(buf),
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::Tcp(r) => r.get_mut().flush(),
            Inner::Tls(r) => r.get_mut().flush(),
            Inner::Unix(r) => r.get_mut().flush(),
        }
    }

    /// Disable Nagle on TCP transports; no-op otherwise.
    pub fn set_nodelay(&self) -> io::Result<()> {
        match self.inner.tcp_socket() {
            Some(sock) => sock.set_nodelay(true),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((payload.len() as i32 + 4).to_be_bytes()));
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn read_message_strips_length() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(&frame(b'Z', b"I")).unwrap();
        });

        let mut stream = Stream::tcp(TcpStream::connect(addr).unwrap());
        let mut bufs = BufferSet::new();
        stream.read_message(&mut bufs).unwrap();
        assert_eq!(bufs.type_byte, b'Z');
        assert_eq!(bufs.read_buffer, b"I");
        server.join().unwrap();
    }

    #[test]
    fn poll_message_returns_false_when_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(50));
            drop(sock);
        });

        let mut stream = Stream::tcp(TcpStream::connect(addr).unwrap());
        let mut bufs = BufferSet::new();
        assert!(!stream.poll_message(&mut bufs).unwrap());
        server.join().unwrap();
    }

    #[test]
    fn expired_deadline_fails_without_syscall() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = std::thread::spawn(move || {
            let _ = listener.accept();
        });

        let mut stream = Stream::tcp(TcpStream::connect(addr).unwrap());
        stream.set_deadline(Some(Instant::now() - Duration::from_secs(1)));
        let err = stream.read_u8().unwrap_err();
        assert!(is_timeout(&err));
    }

    #[test]
    fn abort_handle_interrupts_blocked_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            // Hold the connection open without sending anything.
            std::thread::sleep(Duration::from_secs(5));
            drop(sock);
        });

        let mut stream = Stream::tcp(TcpStream::connect(addr).unwrap());
        let handle = stream.abort_handle().unwrap();
        let aborter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.abort();
        });

        let start = Instant::now();
        assert!(stream.read_u8().is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
        aborter.join().unwrap();
    }
}
