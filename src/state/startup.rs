//! Startup and authentication state machine.

use crate::buffer::BufferSet;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::backend::{
    AuthRequest, BackendKeyData, NegotiateProtocolVersion, ParameterStatus, ReadyForQuery,
    msg_type, parse_error, parse_notice,
};
use crate::protocol::frontend::auth::ScramClient;
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_ssl_request,
    write_startup,
};
use crate::protocol::types::TransactionStatus;

use super::Action;

/// How the driver should negotiate TLS for one connect attempt.
#[derive(Debug, Clone, Copy)]
pub struct TlsPlan {
    /// Send an SSLRequest before the startup message.
    pub send_ssl_request: bool,
    /// Fail instead of continuing plaintext when the server answers 'N'.
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    SslResponse,
    AfterTls,
    Auth,
    Sasl,
    AuthResult,
    Ready,
    Finished,
}

/// Drives one endpoint from raw socket to ReadyForQuery.
pub struct StartupFlow {
    state: State,
    user: String,
    database: Option<String>,
    password: Option<String>,
    runtime_params: Vec<(String, String)>,
    plan: TlsPlan,
    ssl_response: u8,
    channel_binding: Option<Vec<u8>>,
    scram: Option<ScramClient>,
    sasl_mechanism: &'static str,
    backend_key: Option<(u32, u32)>,
    server_params: Vec<(String, String)>,
    tx_status: TransactionStatus,
}

impl StartupFlow {
    pub fn new(config: &Config, plan: TlsPlan) -> Self {
        Self {
            state: State::Initial,
            user: config.user.clone(),
            database: config.database.clone(),
            password: config.password.clone(),
            runtime_params: config.runtime_params.clone(),
            plan,
            ssl_response: 0,
            channel_binding: None,
            scram: None,
            sasl_mechanism: "",
            backend_key: None,
            server_params: Vec::new(),
            tx_status: TransactionStatus::Idle,
        }
    }

    /// Feed the one-byte answer to SSLRequest.
    pub fn set_ssl_response(&mut self, response: u8) {
        self.ssl_response = response;
    }

    /// Feed the `tls-server-end-point` hash after the TLS handshake.
    pub fn set_channel_binding(&mut self, data: Option<Vec<u8>>) {
        self.channel_binding = data;
    }

    /// Backend PID and secret key, once received.
    pub fn backend_key(&self) -> Option<(u32, u32)> {
        self.backend_key
    }

    /// Parameter statuses collected during startup.
    pub fn take_server_params(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.server_params)
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// Advance the flow. For message-driven states the buffer set must hold
    /// the message the previous action asked for.
    pub fn step(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        // States that do not consume a message.
        match self.state {
            State::Initial => return self.handle_initial(bufs),
            State::SslResponse => return self.handle_ssl_response(bufs),
            State::AfterTls => {
                bufs.write_buffer.clear();
                self.write_startup_message(&mut bufs.write_buffer);
                self.state = State::Auth;
                return Ok(Action::WriteAndReadMessage);
            }
            _ => {}
        }

        let type_byte = bufs.type_byte;

        if type_byte == msg_type::NOTICE_RESPONSE {
            return Ok(Action::HandleNotice(parse_notice(&bufs.read_buffer)?));
        }

        if type_byte == msg_type::ERROR_RESPONSE {
            return Err(Error::Server(parse_error(&bufs.read_buffer)?));
        }

        if type_byte == msg_type::NEGOTIATE_PROTOCOL_VERSION {
            let negotiate = NegotiateProtocolVersion::parse(&bufs.read_buffer)?;
            return Err(Error::Protocol(format!(
                "server downgraded to protocol 3.{}; unrecognized options: {:?}",
                negotiate.newest_minor_version, negotiate.unrecognized_options
            )));
        }

        match self.state {
            State::Auth => self.handle_auth(bufs),
            State::Sasl => self.handle_sasl(bufs),
            State::AuthResult => self.handle_auth_result(bufs),
            State::Ready => self.handle_ready(bufs),
            State::Finished | State::Initial | State::SslResponse | State::AfterTls => Err(
                Error::Protocol(format!("unexpected startup state {:?}", self.state)),
            ),
        }
    }

    fn handle_initial(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        bufs.write_buffer.clear();
        if self.plan.send_ssl_request {
            write_ssl_request(&mut bufs.write_buffer);
            self.state = State::SslResponse;
            Ok(Action::WriteAndReadByte)
        } else {
            self.write_startup_message(&mut bufs.write_buffer);
            self.state = State::Auth;
            Ok(Action::WriteAndReadMessage)
        }
    }

    fn handle_ssl_response(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        match self.ssl_response {
            b'S' => {
                self.state = State::AfterTls;
                Ok(Action::TlsHandshake)
            }
            b'N' => {
                if self.plan.required {
                    return Err(Error::Auth("server refused TLS".into()));
                }
                bufs.write_buffer.clear();
                self.write_startup_message(&mut bufs.write_buffer);
                self.state = State::Auth;
                Ok(Action::WriteAndReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "unexpected SSLRequest response: 0x{other:02x}"
            ))),
        }
    }

    fn write_startup_message(&self, write_buffer: &mut Vec<u8>) {
        let mut params: Vec<(&str, &str)> =
            vec![("user", &self.user), ("client_encoding", "UTF8")];

        if let Some(db) = &self.database {
            params.push(("database", db));
        }

        for (name, value) in &self.runtime_params {
            params.push((name, value));
        }

        write_startup(write_buffer, &params);
    }

    fn password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::Auth("password required but not provided".into()))
    }

    fn handle_auth(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        if bufs.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected Authentication message, got '{}'",
                bufs.type_byte as char
            )));
        }

        match AuthRequest::parse(&bufs.read_buffer)? {
            AuthRequest::Ok => {
                self.state = State::Ready;
                Ok(Action::ReadMessage)
            }
            AuthRequest::CleartextPassword => {
                let password = self.password()?.to_string();
                bufs.write_buffer.clear();
                write_password(&mut bufs.write_buffer, &password);
                self.state = State::AuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            AuthRequest::Md5Password { salt } => {
                let hashed = crate::protocol::frontend::auth::md5_password(
                    &self.user,
                    self.password()?,
                    &salt,
                );
                bufs.write_buffer.clear();
                write_password(&mut bufs.write_buffer, &hashed);
                self.state = State::AuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            AuthRequest::Sasl { mechanisms } => {
                let password = self.password()?;
                let (mechanism, scram) = if mechanisms.contains(&"SCRAM-SHA-256-PLUS")
                    && let Some(cb) = &self.channel_binding
                {
                    (
                        "SCRAM-SHA-256-PLUS",
                        ScramClient::with_channel_binding(password, cb),
                    )
                } else if mechanisms.contains(&"SCRAM-SHA-256") {
                    ("SCRAM-SHA-256", ScramClient::new(password))
                } else {
                    return Err(Error::Auth(format!(
                        "no supported SASL mechanism, server offers: {mechanisms:?}"
                    )));
                };

                let client_first = scram.client_first_message();
                bufs.write_buffer.clear();
                write_sasl_initial_response(
                    &mut bufs.write_buffer,
                    mechanism,
                    client_first.as_bytes(),
                );

                self.sasl_mechanism = mechanism;
                self.scram = Some(scram);
                self.state = State::Sasl;
                Ok(Action::WriteAndReadMessage)
            }
            AuthRequest::SaslContinue { .. } | AuthRequest::SaslFinal { .. } => Err(
                Error::Protocol("SASL continuation before SASL started".into()),
            ),
            AuthRequest::Unsupported(method) => Err(Error::Unsupported(format!(
                "authentication method {method} is not supported"
            ))),
        }
    }

    fn handle_sasl(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        if bufs.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected Authentication message, got '{}'",
                bufs.type_byte as char
            )));
        }

        match AuthRequest::parse(&bufs.read_buffer)? {
            AuthRequest::SaslContinue { data } => {
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-first-message: {e}")))?;

                let client_final = scram
                    .process_server_first(server_first)
                    .map_err(Error::Auth)?;

                bufs.write_buffer.clear();
                write_sasl_response(&mut bufs.write_buffer, client_final.as_bytes());
                self.state = State::Sasl;
                Ok(Action::WriteAndReadMessage)
            }
            AuthRequest::SaslFinal { data } => {
                let scram = self
                    .scram
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-final-message: {e}")))?;

                scram.verify_server_final(server_final).map_err(Error::Auth)?;

                tracing::debug!(mechanism = self.sasl_mechanism, "SASL exchange complete");
                self.state = State::AuthResult;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "unexpected message during SASL exchange: {other:?}"
            ))),
        }
    }

    fn handle_auth_result(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        if bufs.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected AuthenticationOk, got '{}'",
                bufs.type_byte as char
            )));
        }

        match AuthRequest::parse(&bufs.read_buffer)? {
            AuthRequest::Ok => {
                self.state = State::Ready;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Auth(format!("unexpected auth result: {other:?}"))),
        }
    }

    fn handle_ready(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        let payload = &bufs.read_buffer;

        match bufs.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                let key = BackendKeyData::parse(payload)?;
                self.backend_key = Some((key.pid, key.secret_key));
                Ok(Action::ReadMessage)
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                self.server_params
                    .push((param.name.to_string(), param.value.to_string()));
                Ok(Action::ReadMessage)
            }
            msg_type::NOTIFICATION_RESPONSE => Ok(Action::ReadMessage),
            msg_type::READY_FOR_QUERY => {
                self.tx_status = ReadyForQuery::parse(payload)?.tx_status;
                self.state = State::Finished;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "unexpected message during startup: '{}'",
                other as char
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            user: "alice".into(),
            database: Some("app".into()),
            password: Some("hunter2".into()),
            ..Config::default()
        }
    }

    fn plaintext_plan() -> TlsPlan {
        TlsPlan {
            send_ssl_request: false,
            required: false,
        }
    }

    fn set_message(bufs: &mut BufferSet, tag: u8, payload: &[u8]) {
        bufs.type_byte = tag;
        bufs.read_buffer.clear();
        bufs.read_buffer.extend_from_slice(payload);
    }

    #[test]
    fn plaintext_startup_to_ready() {
        let mut flow = StartupFlow::new(&test_config(), plaintext_plan());
        let mut bufs = BufferSet::new();

        // Startup message goes out first.
        assert!(matches!(
            flow.step(&mut bufs).unwrap(),
            Action::WriteAndReadMessage
        ));
        let written = bufs.write_buffer.clone();
        assert!(written.windows(6).any(|w| w == b"alice\0"));
        assert!(written.windows(4).any(|w| w == b"app\0"));

        // AuthenticationOk
        set_message(&mut bufs, b'R', &0_i32.to_be_bytes());
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::ReadMessage));

        // ParameterStatus, BackendKeyData, ReadyForQuery
        set_message(&mut bufs, b'S', b"server_version\017.0\0");
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::ReadMessage));

        let mut key = 42_u32.to_be_bytes().to_vec();
        key.extend_from_slice(&7_u32.to_be_bytes());
        set_message(&mut bufs, b'K', &key);
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::ReadMessage));

        set_message(&mut bufs, b'Z', b"I");
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::Finished));

        assert_eq!(flow.backend_key(), Some((42, 7)));
        assert_eq!(
            flow.take_server_params(),
            vec![("server_version".to_string(), "17.0".to_string())]
        );
        assert_eq!(flow.transaction_status(), TransactionStatus::Idle);
    }

    #[test]
    fn ssl_refusal_with_required_plan_fails() {
        let mut flow = StartupFlow::new(
            &test_config(),
            TlsPlan {
                send_ssl_request: true,
                required: true,
            },
        );
        let mut bufs = BufferSet::new();

        assert!(matches!(
            flow.step(&mut bufs).unwrap(),
            Action::WriteAndReadByte
        ));
        flow.set_ssl_response(b'N');
        assert!(matches!(flow.step(&mut bufs), Err(Error::Auth(_))));
    }

    #[test]
    fn ssl_refusal_with_prefer_plan_continues_plaintext() {
        let mut flow = StartupFlow::new(
            &test_config(),
            TlsPlan {
                send_ssl_request: true,
                required: false,
            },
        );
        let mut bufs = BufferSet::new();

        assert!(matches!(
            flow.step(&mut bufs).unwrap(),
            Action::WriteAndReadByte
        ));
        flow.set_ssl_response(b'N');
        assert!(matches!(
            flow.step(&mut bufs).unwrap(),
            Action::WriteAndReadMessage
        ));
    }

    #[test]
    fn garbage_ssl_response_is_protocol_violation() {
        let mut flow = StartupFlow::new(
            &test_config(),
            TlsPlan {
                send_ssl_request: true,
                required: false,
            },
        );
        let mut bufs = BufferSet::new();

        flow.step(&mut bufs).unwrap();
        flow.set_ssl_response(b'?');
        assert!(matches!(flow.step(&mut bufs), Err(Error::Protocol(_))));
    }

    #[test]
    fn cleartext_password_round_trip() {
        let mut flow = StartupFlow::new(&test_config(), plaintext_plan());
        let mut bufs = BufferSet::new();

        flow.step(&mut bufs).unwrap();
        set_message(&mut bufs, b'R', &3_i32.to_be_bytes());
        assert!(matches!(
            flow.step(&mut bufs).unwrap(),
            Action::WriteAndReadMessage
        ));
        assert_eq!(bufs.write_buffer[0], b'p');
        assert!(bufs.write_buffer.windows(8).any(|w| w == b"hunter2\0"));

        set_message(&mut bufs, b'R', &0_i32.to_be_bytes());
        assert!(matches!(flow.step(&mut bufs).unwrap(), Action::ReadMessage));
    }

    #[test]
    fn missing_password_is_an_auth_error() {
        let config = Config {
            password: None,
            ..test_config()
        };
        let mut flow = StartupFlow::new(&config, plaintext_plan());
        let mut bufs = BufferSet::new();

        flow.step(&mut bufs).unwrap();
        set_message(&mut bufs, b'R', &3_i32.to_be_bytes());
        assert!(matches!(flow.step(&mut bufs), Err(Error::Auth(_))));
    }

    #[test]
    fn server_error_during_auth_surfaces_as_pg_error() {
        let mut flow = StartupFlow::new(&test_config(), plaintext_plan());
        let mut bufs = BufferSet::new();

        flow.step(&mut bufs).unwrap();
        set_message(
            &mut bufs,
            b'E',
            b"SFATAL\0VFATAL\0C28P01\0Mpassword authentication failed\0\0",
        );
        match flow.step(&mut bufs) {
            Err(Error::Server(pg)) => assert_eq!(pg.sqlstate(), "28P01"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unsupported_auth_method_is_rejected() {
        let mut flow = StartupFlow::new(&test_config(), plaintext_plan());
        let mut bufs = BufferSet::new();

        flow.step(&mut bufs).unwrap();
        // Kerberos V5
        set_message(&mut bufs, b'R', &2_i32.to_be_bytes());
        assert!(matches!(flow.step(&mut bufs), Err(Error::Unsupported(_))));
    }

    #[test]
    fn sasl_selects_plus_when_bound() {
        let mut flow = StartupFlow::new(&test_config(), plaintext_plan());
        flow.set_channel_binding(Some(vec![1, 2, 3]));
        let mut bufs = BufferSet::new();

        flow.step(&mut bufs).unwrap();
        let mut payload = 10_i32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        set_message(&mut bufs, b'R', &payload);
        flow.step(&mut bufs).unwrap();
        assert!(
            bufs.write_buffer
                .windows(19)
                .any(|w| w == b"SCRAM-SHA-256-PLUS\0")
        );
    }
}
