//! Session-level backend messages: authentication requests, backend key
//! data, parameter statuses, ready-for-query, notifications.

use crate::error::{Error, Result};
use crate::protocol::codec::Scan;
use crate::protocol::types::TransactionStatus;

/// Authentication request carried by an 'R' message.
///
/// Only the methods this client can answer get their own variant; anything
/// else (Kerberos, GSS, SSPI) collapses into [`AuthRequest::Unsupported`]
/// with the raw method code, since the startup flow can do nothing with the
/// payload anyway.
#[derive(Debug)]
pub enum AuthRequest<'a> {
    /// The server accepted the session.
    Ok,
    /// Send the password in the clear.
    CleartextPassword,
    /// Send the salted MD5 digest.
    Md5Password { salt: [u8; 4] },
    /// Pick a SASL mechanism from the advertised list.
    Sasl { mechanisms: Vec<&'a str> },
    /// SASL server-first-message.
    SaslContinue { data: &'a [u8] },
    /// SASL server-final-message.
    SaslFinal { data: &'a [u8] },
    /// A method this client does not implement.
    Unsupported(i32),
}

impl<'a> AuthRequest<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let mut scan = Scan::new(payload);
        let request = match scan.i32()? {
            0 => AuthRequest::Ok,
            3 => AuthRequest::CleartextPassword,
            5 => AuthRequest::Md5Password {
                salt: scan.array()?,
            },
            10 => {
                // Mechanism list, closed by an empty string.
                let mut mechanisms = Vec::new();
                while !matches!(scan.peek(), None | Some(0)) {
                    mechanisms.push(scan.cstr()?);
                }
                AuthRequest::Sasl { mechanisms }
            }
            11 => AuthRequest::SaslContinue {
                data: scan.remaining(),
            },
            12 => AuthRequest::SaslFinal {
                data: scan.remaining(),
            },
            method => AuthRequest::Unsupported(method),
        };
        Ok(request)
    }
}

/// BackendKeyData ('K'): the credentials later echoed in a CancelRequest.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    pub pid: u32,
    pub secret_key: u32,
}

impl BackendKeyData {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut scan = Scan::new(payload);
        let key = Self {
            pid: scan.u32()?,
            secret_key: scan.u32()?,
        };
        scan.expect_end("BackendKeyData")?;
        Ok(key)
    }
}

/// ParameterStatus ('S'): a frontend-visible server setting changed.
#[derive(Debug, Clone)]
pub struct ParameterStatus<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

impl<'a> ParameterStatus<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let mut scan = Scan::new(payload);
        Ok(Self {
            name: scan.cstr()?,
            value: scan.cstr()?,
        })
    }
}

/// ReadyForQuery ('Z'): the server finished the current operation and
/// reports where the session stands transaction-wise.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    pub tx_status: TransactionStatus,
}

impl ReadyForQuery {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut scan = Scan::new(payload);
        let byte = scan.u8()?;
        scan.expect_end("ReadyForQuery")?;
        match TransactionStatus::from_byte(byte) {
            Some(tx_status) => Ok(Self { tx_status }),
            None => Err(Error::Protocol(format!(
                "unknown transaction status 0x{byte:02x}"
            ))),
        }
    }
}

/// NotificationResponse ('A') from LISTEN/NOTIFY.
#[derive(Debug, Clone)]
pub struct NotificationResponse<'a> {
    /// PID of the notifying backend
    pub pid: u32,
    /// Channel name
    pub channel: &'a str,
    /// Notification payload
    pub payload: &'a str,
}

impl<'a> NotificationResponse<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let mut scan = Scan::new(payload);
        Ok(Self {
            pid: scan.u32()?,
            channel: scan.cstr()?,
            payload: scan.cstr()?,
        })
    }
}

/// NegotiateProtocolVersion ('v'): the server wants to downgrade.
#[derive(Debug, Clone)]
pub struct NegotiateProtocolVersion<'a> {
    pub newest_minor_version: u32,
    pub unrecognized_options: Vec<&'a str>,
}

impl<'a> NegotiateProtocolVersion<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let mut scan = Scan::new(payload);
        let newest_minor_version = scan.u32()?;
        let option_count = scan.u32()?;
        let unrecognized_options = (0..option_count)
            .map(|_| scan.cstr())
            .collect::<Result<_>>()?;
        Ok(Self {
            newest_minor_version,
            unrecognized_options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_payload(method: i32, tail: &[u8]) -> Vec<u8> {
        let mut payload = method.to_be_bytes().to_vec();
        payload.extend_from_slice(tail);
        payload
    }

    #[test]
    fn auth_ok_and_cleartext() {
        assert!(matches!(
            AuthRequest::parse(&auth_payload(0, b"")).unwrap(),
            AuthRequest::Ok
        ));
        assert!(matches!(
            AuthRequest::parse(&auth_payload(3, b"")).unwrap(),
            AuthRequest::CleartextPassword
        ));
    }

    #[test]
    fn md5_request_carries_its_salt() {
        match AuthRequest::parse(&auth_payload(5, &[9, 8, 7, 6])).unwrap() {
            AuthRequest::Md5Password { salt } => assert_eq!(salt, [9, 8, 7, 6]),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn sasl_request_lists_mechanisms() {
        let payload = auth_payload(10, b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        match AuthRequest::parse(&payload).unwrap() {
            AuthRequest::Sasl { mechanisms } => {
                assert_eq!(mechanisms, vec!["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn exotic_methods_fold_into_unsupported() {
        for code in [2, 7, 8, 9, 99] {
            match AuthRequest::parse(&auth_payload(code, b"")).unwrap() {
                AuthRequest::Unsupported(seen) => assert_eq!(seen, code),
                other => panic!("unexpected request: {other:?}"),
            }
        }
    }

    #[test]
    fn backend_key_data_is_strict_about_length() {
        let mut payload = 42_u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&12345_u32.to_be_bytes());
        let key = BackendKeyData::parse(&payload).unwrap();
        assert_eq!((key.pid, key.secret_key), (42, 12345));

        payload.push(0);
        assert!(BackendKeyData::parse(&payload).is_err());
    }

    #[test]
    fn ready_for_query_states() {
        assert_eq!(
            ReadyForQuery::parse(b"I").unwrap().tx_status,
            TransactionStatus::Idle
        );
        assert_eq!(
            ReadyForQuery::parse(b"T").unwrap().tx_status,
            TransactionStatus::InTransaction
        );
        assert_eq!(
            ReadyForQuery::parse(b"E").unwrap().tx_status,
            TransactionStatus::Failed
        );
        assert!(ReadyForQuery::parse(b"?").is_err());
        assert!(ReadyForQuery::parse(b"").is_err());
    }

    #[test]
    fn notification_fields() {
        let mut payload = 7_u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"foo\0bar\0");
        let n = NotificationResponse::parse(&payload).unwrap();
        assert_eq!((n.pid, n.channel, n.payload), (7, "foo", "bar"));
    }

    #[test]
    fn negotiate_lists_unknown_options() {
        let mut payload = 1_u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&2_u32.to_be_bytes());
        payload.extend_from_slice(b"_pq_.a\0_pq_.b\0");
        let negotiate = NegotiateProtocolVersion::parse(&payload).unwrap();
        assert_eq!(negotiate.newest_minor_version, 1);
        assert_eq!(negotiate.unrecognized_options, vec!["_pq_.a", "_pq_.b"]);
    }
}
