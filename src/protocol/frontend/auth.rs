//! Authentication messages and the SCRAM client.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};

use crate::protocol::codec::{put_i32, put_message, put_str0};

/// Write a PasswordMessage (cleartext or MD5 hashed password).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    put_message(buf, super::msg_type::PASSWORD, |body| {
        put_str0(body, password);
    });
}

/// Compute the MD5 password response.
///
/// Format: `"md5" || hex(md5(hex(md5(password || user)) || salt))`
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::Md5;

    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let first = hasher.finalize();
    let first_hex = format!("{first:x}");

    let mut hasher = Md5::new();
    hasher.update(first_hex.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}

/// Write a SASLInitialResponse message.
pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, initial_response: &[u8]) {
    put_message(buf, super::msg_type::PASSWORD, |body| {
        put_str0(body, mechanism);
        put_i32(body, initial_response.len() as i32);
        body.extend_from_slice(initial_response);
    });
}

/// Write a SASLResponse message (client-final-message).
pub fn write_sasl_response(buf: &mut Vec<u8>, response: &[u8]) {
    put_message(buf, super::msg_type::PASSWORD, |body| {
        body.extend_from_slice(response);
    });
}

/// SCRAM-SHA-256 / SCRAM-SHA-256-PLUS client side (RFC 5802 / RFC 7677).
pub struct ScramClient {
    gs2_header: String,
    cbind_data: Vec<u8>,
    username: String,
    nonce: String,
    password: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    /// Client without channel binding (`SCRAM-SHA-256`).
    ///
    /// The username is left empty; the server takes it from the startup
    /// message.
    pub fn new(password: &str) -> Self {
        Self::with_parts("", password, random_nonce(), "n,,".into(), Vec::new())
    }

    /// Client bound to the TLS endpoint (`SCRAM-SHA-256-PLUS`), with the
    /// raw `tls-server-end-point` certificate hash.
    pub fn with_channel_binding(password: &str, cbind_data: &[u8]) -> Self {
        Self::with_parts(
            "",
            password,
            random_nonce(),
            "p=tls-server-end-point,,".into(),
            cbind_data.to_vec(),
        )
    }

    fn with_parts(
        username: &str,
        password: &str,
        nonce: String,
        gs2_header: String,
        cbind_data: Vec<u8>,
    ) -> Self {
        Self {
            gs2_header,
            cbind_data,
            username: username.to_string(),
            nonce,
            password: password.to_string(),
            auth_message: None,
            salted_password: None,
        }
    }

    fn client_first_message_bare(&self) -> String {
        format!("n={},r={}", self.username, self.nonce)
    }

    /// The client-first-message, gs2 header included.
    pub fn client_first_message(&self) -> String {
        format!("{}{}", self.gs2_header, self.client_first_message_bare())
    }

    /// Process server-first-message and produce the client-final-message.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String, String> {
        let mut combined_nonce = None;
        let mut salt_b64 = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt_b64 = Some(value);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = value.parse().ok();
            }
        }

        let combined_nonce = combined_nonce.ok_or("missing nonce in server-first-message")?;
        let salt_b64 = salt_b64.ok_or("missing salt in server-first-message")?;
        let iterations: u32 = iterations.ok_or("missing iterations in server-first-message")?;

        if !combined_nonce.starts_with(&self.nonce) {
            return Err("server nonce does not start with client nonce".into());
        }

        let salt = BASE64
            .decode(salt_b64)
            .map_err(|e| format!("invalid salt: {e}"))?;

        // SaltedPassword = Hi(password, salt, i)
        let mut salted_password = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );
        self.salted_password = Some(salted_password);

        // ClientKey = HMAC(SaltedPassword, "Client Key"); StoredKey = H(ClientKey)
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);

        // cbind-input = gs2-header || cbind-data, base64 as a whole
        let mut cbind_input = self.gs2_header.as_bytes().to_vec();
        cbind_input.extend_from_slice(&self.cbind_data);
        let client_final_without_proof =
            format!("c={},r={}", BASE64.encode(&cbind_input), combined_nonce);

        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare(),
            server_first,
            client_final_without_proof
        );

        // ClientProof = ClientKey XOR HMAC(StoredKey, AuthMessage)
        let client_signature = hmac_sha256(stored_key.as_slice(), auth_message.as_bytes())?;
        self.auth_message = Some(auth_message);

        let mut client_proof = [0u8; 32];
        for i in 0..32 {
            client_proof[i] = client_key[i] ^ client_signature[i];
        }

        Ok(format!(
            "{client_final_without_proof},p={}",
            BASE64.encode(client_proof)
        ))
    }

    /// Verify the server-final-message signature.
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), String> {
        let server_signature_b64 = server_final
            .strip_prefix("v=")
            .ok_or("invalid server-final-message format")?;

        let server_signature = BASE64
            .decode(server_signature_b64)
            .map_err(|e| format!("invalid server signature: {e}"))?;

        let salted_password = self.salted_password.as_ref().ok_or("missing salted password")?;
        let auth_message = self.auth_message.as_ref().ok_or("missing auth message")?;

        // ServerSignature = HMAC(HMAC(SaltedPassword, "Server Key"), AuthMessage)
        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if server_signature.as_slice() != expected.as_slice() {
            return Err("server signature verification failed".into());
        }
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], String> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|e| format!("HMAC error: {e}"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn random_nonce() -> String {
    use rand::RngCore;

    let mut nonce_bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut nonce_bytes);
    BASE64.encode(nonce_bytes)
}
