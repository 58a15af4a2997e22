//! Dialing, TLS negotiation, fallbacks and validators.

use std::collections::VecDeque;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::time::{Duration, Instant};

use native_tls::TlsConnector;

use crate::buffer::GLOBAL_BUFFER_POOL;
use crate::cancel::CancelWatcher;
use crate::config::{Config, DialFn, TlsMode};
use crate::error::{ConnectError, Error, Result};
use crate::protocol::frontend;
use crate::state::{Action, StartupFlow, TlsPlan};
use crate::stream::Stream;

use super::{Conn, RemoteAddr, STATUS_IDLE, result::OpState};

struct TlsAttempt {
    connector: Arc<TlsConnector>,
    required: bool,
}

/// One dial-and-startup attempt: an endpoint plus a TLS decision.
struct Target {
    /// Index of the endpoint this attempt belongs to; `prefer`/`allow`
    /// produce two attempts per endpoint.
    endpoint: usize,
    host: String,
    port: u16,
    socket: Option<String>,
    tls: Option<TlsAttempt>,
}

impl Target {
    fn describe(&self) -> String {
        match &self.socket {
            Some(path) => path.clone(),
            None => {
                let scheme = if self.tls.is_some() { "tls" } else { "tcp" };
                format!("{}:{} ({scheme})", self.host, self.port)
            }
        }
    }

    fn remote_addr(&self) -> RemoteAddr {
        match &self.socket {
            Some(path) => RemoteAddr::Unix(path.clone()),
            None => RemoteAddr::Tcp(self.host.clone(), self.port),
        }
    }
}

/// Try every target in order; the first fully-validated connection wins.
///
/// Authentication and validator failures are terminal for their endpoint:
/// the other TLS variant of the same host is skipped and only the next
/// fallback is tried.
pub(super) fn connect(config: &Config) -> Result<Conn> {
    let targets = expand_targets(config)?;
    let mut attempts: Vec<(String, Error)> = Vec::new();
    let mut dead_endpoint: Option<usize> = None;

    for target in targets {
        if dead_endpoint == Some(target.endpoint) {
            continue;
        }
        tracing::debug!(endpoint = %target.describe(), "connecting");
        match connect_target(config, &target) {
            Ok(mut conn) => {
                if let Some(validate) = &config.validate_connect
                    && let Err(e) = validate(&mut conn)
                {
                    let _ = conn.close();
                    attempts.push((target.describe(), e));
                    dead_endpoint = Some(target.endpoint);
                    continue;
                }
                if let Some(after) = &config.after_connect
                    && let Err(e) = after(&mut conn)
                {
                    let _ = conn.close();
                    return Err(e);
                }
                return Ok(conn);
            }
            Err(e) => {
                if matches!(e, Error::Server(_) | Error::Auth(_)) {
                    dead_endpoint = Some(target.endpoint);
                }
                attempts.push((target.describe(), e));
            }
        }
    }

    Err(Error::Connect(ConnectError { attempts }))
}

/// Expand endpoints × TLS policy into an ordered attempt list.
///
/// `prefer` tries TLS first but continues plaintext in-connection when the
/// server answers 'N'; `allow` tries plaintext first and only then TLS;
/// the verify modes and `require` never fall back.
fn expand_targets(config: &Config) -> Result<Vec<Target>> {
    if let Some(path) = &config.socket {
        // TLS does not apply to Unix sockets.
        return Ok(vec![Target {
            endpoint: 0,
            host: config.host.clone(),
            port: config.port,
            socket: Some(path.clone()),
            tls: None,
        }]);
    }

    let mut endpoints: Vec<(String, u16, Option<Arc<TlsConnector>>)> =
        vec![(config.host.clone(), config.port, config.tls.clone())];
    for fallback in &config.fallbacks {
        endpoints.push((
            fallback.host.clone(),
            fallback.port,
            fallback.tls.clone().or_else(|| config.tls.clone()),
        ));
    }

    let mut targets = Vec::new();
    for (endpoint, (host, port, tls_config)) in endpoints.into_iter().enumerate() {
        let plain = || Target {
            endpoint,
            host: host.clone(),
            port,
            socket: None,
            tls: None,
        };
        let tls = |required: bool| -> Result<Target> {
            let connector = match &tls_config {
                Some(connector) => Arc::clone(connector),
                None => Arc::new(default_connector(config.tls_mode)?),
            };
            Ok(Target {
                endpoint,
                host: host.clone(),
                port,
                socket: None,
                tls: Some(TlsAttempt {
                    connector,
                    required,
                }),
            })
        };

        match config.tls_mode {
            TlsMode::Disable => targets.push(plain()),
            TlsMode::Allow => {
                targets.push(plain());
                targets.push(tls(true)?);
            }
            TlsMode::Prefer => {
                targets.push(tls(false)?);
                targets.push(plain());
            }
            TlsMode::Require | TlsMode::VerifyCa | TlsMode::VerifyFull => {
                targets.push(tls(true)?);
            }
        }
    }
    Ok(targets)
}

/// Certificate policy for a default connector, libpq-style: only the
/// verify modes check anything.
fn default_connector(mode: TlsMode) -> Result<TlsConnector> {
    let mut builder = TlsConnector::builder();
    match mode {
        TlsMode::VerifyFull => {}
        TlsMode::VerifyCa => {
            builder.danger_accept_invalid_hostnames(true);
        }
        _ => {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
    }
    builder.build().map_err(Error::Tls)
}

fn dial(config: &Config, target: &Target) -> Result<Stream> {
    if let Some(path) = &target.socket {
        let sock = UnixStream::connect(path).map_err(Error::Io)?;
        return Ok(Stream::unix(sock));
    }
    if target.host.is_empty() {
        return Err(Error::InvalidUsage("host is empty".into()));
    }
    let tcp = match &config.dial {
        Some(dial_fn) => dial_fn(&target.host, target.port).map_err(Error::Io)?,
        None => connect_tcp(&target.host, target.port, config.connect_timeout)?,
    };
    Ok(Stream::tcp(tcp))
}

fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream> {
    use std::net::ToSocketAddrs;

    match timeout {
        None => TcpStream::connect((host, port)).map_err(Error::Io),
        Some(t) => {
            let addrs = (host, port).to_socket_addrs().map_err(Error::Io)?;
            let mut last_err = None;
            for addr in addrs {
                match TcpStream::connect_timeout(&addr, t) {
                    Ok(sock) => return Ok(sock),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(Error::Io(last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
            })))
        }
    }
}

/// Dial one target and drive the startup flow to ReadyForQuery.
fn connect_target(config: &Config, target: &Target) -> Result<Conn> {
    let mut stream = dial(config, target)?;
    stream.set_nodelay().map_err(Error::Io)?;
    if let Some(timeout) = config.connect_timeout {
        stream.set_deadline(Some(Instant::now() + timeout));
    }

    let mut bufs = GLOBAL_BUFFER_POOL.get();
    let plan = TlsPlan {
        send_ssl_request: target.tls.is_some(),
        required: target.tls.as_ref().is_some_and(|t| t.required),
    };
    let mut flow = StartupFlow::new(config, plan);

    loop {
        match flow.step(&mut bufs)? {
            Action::WriteAndReadByte => {
                stream.write_all(&bufs.write_buffer).map_err(Error::Write)?;
                stream.flush().map_err(Error::Write)?;
                let byte = stream.read_u8().map_err(Error::Io)?;
                flow.set_ssl_response(byte);
            }
            Action::ReadMessage => {
                stream.read_message(&mut bufs).map_err(Error::Io)?;
            }
            Action::WriteAndReadMessage => {
                stream.write_all(&bufs.write_buffer).map_err(Error::Write)?;
                stream.flush().map_err(Error::Write)?;
                stream.read_message(&mut bufs).map_err(Error::Io)?;
            }
            Action::TlsHandshake => {
                let attempt = target
                    .tls
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("TLS handshake without a TLS plan".into()))?;
                stream = stream.upgrade_to_tls(&attempt.connector, &target.host)?;
                flow.set_channel_binding(stream.tls_server_end_point());
            }
            Action::HandleNotice(notice) => {
                if let Some(cb) = &config.on_notice {
                    cb(&notice);
                }
                stream.read_message(&mut bufs).map_err(Error::Io)?;
            }
            Action::Finished => break,
        }
    }

    stream.set_deadline(None);
    let tx_status = flow.transaction_status();
    let server_params = flow.take_server_params();

    Ok(Conn {
        stream,
        bufs,
        status: AtomicU8::new(STATUS_IDLE),
        tx_status,
        backend_key: flow.backend_key(),
        server_params,
        on_notice: config.on_notice.clone(),
        on_notification: config.on_notification.clone(),
        watcher: CancelWatcher::new(),
        pending: VecDeque::new(),
        op: OpState::idle(),
        remote: target.remote_addr(),
        dial: config.dial.clone(),
        connect_timeout: config.connect_timeout,
    })
}

/// Open a second transport, send a CancelRequest frame, and close. The
/// server acts on it without replying.
pub(super) fn send_cancel_request(
    remote: &RemoteAddr,
    dial_fn: Option<&DialFn>,
    timeout: Option<Duration>,
    pid: u32,
    secret: u32,
) -> Result<()> {
    use std::io::{Read, Write};

    let mut frame = Vec::with_capacity(16);
    frontend::write_cancel_request(&mut frame, pid, secret);

    match remote {
        RemoteAddr::Tcp(host, port) => {
            let mut sock = match dial_fn {
                Some(dial_fn) => dial_fn(host, *port).map_err(Error::Io)?,
                None => connect_tcp(host, *port, timeout)?,
            };
            sock.write_all(&frame).map_err(Error::Write)?;
            let _ = sock.flush();
            let _ = sock.shutdown(std::net::Shutdown::Write);
            let mut sink = [0u8; 1];
            let _ = sock.read(&mut sink);
        }
        RemoteAddr::Unix(path) => {
            let mut sock = UnixStream::connect(path).map_err(Error::Io)?;
            sock.write_all(&frame).map_err(Error::Write)?;
            let _ = sock.flush();
            let _ = sock.shutdown(std::net::Shutdown::Write);
            let mut sink = [0u8; 1];
            let _ = sock.read(&mut sink);
        }
    }
    Ok(())
}
