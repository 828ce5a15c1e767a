//! SCRAM-SHA-256 (RFC 5802/7677) client half, and the TLS verifier used
//! for `TlsSecurity::{Insecure, NoHostVerification}` (spec §4.5, §6).
//!
//! The teacher's own authentication is a bare cookie comparison with no
//! SASL exchange (`protocol::command::auth::set_client_name`/cookie
//! check), so there's no teacher code to generalize here; this module is
//! grounded instead in the hash/HMAC/base64 combination the rest of the
//! binary-protocol-client corpus reaches for when it speaks SCRAM.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn h(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// PBKDF2-HMAC-SHA256, implemented directly (RFC 5802 "Hi") rather than
/// pulling in a dedicated KDF crate for one 32-byte derivation.
fn pbkdf2_hmac_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut salted = Vec::with_capacity(salt.len() + 4);
    salted.extend_from_slice(salt);
    salted.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac(password, &salted);
    let mut result = u;
    for _ in 1..iterations {
        u = hmac(password, &u);
        result = xor(&result, &u);
    }
    result
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 18];
    rand::rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

fn parse_fields(s: &str) -> std::collections::HashMap<char, &str> {
    s.split(',')
        .filter_map(|kv| {
            let mut parts = kv.splitn(2, '=');
            let key = parts.next()?.chars().next()?;
            let value = parts.next()?;
            Some((key, value))
        })
        .collect()
}

/// One client-side SCRAM-SHA-256 exchange. Each value is used for exactly
/// one authentication round; it is not reusable across connections.
pub struct ScramSha256 {
    client_nonce: String,
    client_first_bare: String,
    auth_message: String,
    salted_password: [u8; 32],
}

impl Default for ScramSha256 {
    fn default() -> Self {
        Self::new()
    }
}

impl ScramSha256 {
    pub fn new() -> Self {
        ScramSha256 {
            client_nonce: String::new(),
            client_first_bare: String::new(),
            auth_message: String::new(),
            salted_password: [0u8; 32],
        }
    }

    /// Builds `client-first-message` and records its bare half for the
    /// eventual `AuthMessage`.
    pub fn client_first(&mut self) -> Vec<u8> {
        self.client_nonce = random_nonce();
        self.client_first_bare = format!("n=,r={}", self.client_nonce);
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consumes `server-first-message`, derives the salted password, and
    /// returns `client-final-message`.
    pub fn handle_server_first(&mut self, data: &[u8], password: &str) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Authentication(format!("non-utf8 SCRAM challenge: {e}")))?;
        let fields = parse_fields(text);

        let combined_nonce = *fields
            .get(&'r')
            .ok_or_else(|| Error::Authentication("SCRAM challenge missing nonce".into()))?;
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(Error::Authentication(
                "server nonce does not extend the client nonce".into(),
            ));
        }

        let salt_b64 = *fields
            .get(&'s')
            .ok_or_else(|| Error::Authentication("SCRAM challenge missing salt".into()))?;
        let salt = BASE64
            .decode(salt_b64)
            .map_err(|e| Error::Authentication(format!("invalid SCRAM salt: {e}")))?;

        let iterations: u32 = fields
            .get(&'i')
            .ok_or_else(|| Error::Authentication("SCRAM challenge missing iteration count".into()))?
            .parse()
            .map_err(|_| Error::Authentication("SCRAM challenge has a non-numeric iteration count".into()))?;

        self.salted_password = pbkdf2_hmac_sha256(password.as_bytes(), &salt, iterations);

        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        self.auth_message = format!("{},{},{}", self.client_first_bare, text, client_final_without_proof);

        let client_key = hmac(&self.salted_password, b"Client Key");
        let stored_key = h(&client_key);
        let client_signature = hmac(&stored_key, self.auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature);

        Ok(format!(
            "{client_final_without_proof},p={}",
            BASE64.encode(client_proof)
        )
        .into_bytes())
    }

    /// Verifies `server-final-message`'s signature against the one we
    /// computed ourselves.
    pub fn verify_server_final(&self, data: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Authentication(format!("non-utf8 SCRAM final message: {e}")))?;
        let fields = parse_fields(text);

        let server_signature_b64 = *fields
            .get(&'v')
            .ok_or_else(|| Error::Authentication("SCRAM final message missing signature".into()))?;
        let received = BASE64
            .decode(server_signature_b64)
            .map_err(|e| Error::Authentication(format!("invalid SCRAM server signature: {e}")))?;

        let server_key = hmac(&self.salted_password, b"Server Key");
        let expected = hmac(&server_key, self.auth_message.as_bytes());

        if received != expected {
            return Err(Error::Authentication(
                "server's SCRAM signature did not match; possible MITM".into(),
            ));
        }

        Ok(())
    }
}

/// A `ServerCertVerifier` for `TlsSecurity::Insecure` (no checks at all)
/// and `TlsSecurity::NoHostVerification` (chain checked against `roots`,
/// hostname not checked).
#[derive(Debug)]
pub struct PermissiveVerifier {
    pub roots: Option<rustls::RootCertStore>,
}

impl rustls::client::danger::ServerCertVerifier for PermissiveVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        match &self.roots {
            None => Ok(rustls::client::danger::ServerCertVerified::assertion()),
            Some(roots) => {
                let verifier = rustls::client::WebPkiServerVerifier::builder(std::sync::Arc::new(
                    roots.clone(),
                ))
                .build()
                .map_err(|e| rustls::Error::General(e.to_string()))?;
                // Hostname checking is the only thing `NoHostVerification`
                // skips; reuse the default verifier with a name that
                // always matches to get identical chain/expiry/OCSP logic.
                let any_name = rustls::pki_types::ServerName::try_from("ignored.invalid")
                    .expect("static hostname is valid");
                verifier.verify_server_cert(end_entity, intermediates, &any_name, &[], now)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pbkdf2_is_deterministic() {
        let a = pbkdf2_hmac_sha256(b"pencil", b"salt-value", 4096);
        let b = pbkdf2_hmac_sha256(b"pencil", b"salt-value", 4096);
        assert_eq!(a, b);
    }

    #[test]
    fn client_first_message_carries_the_nonce() {
        let mut scram = ScramSha256::new();
        let msg = String::from_utf8(scram.client_first()).unwrap();
        assert!(msg.starts_with("n,,n=,r="));
        assert!(msg.contains(&scram.client_nonce));
    }

    #[test]
    fn rejects_server_nonce_not_extending_client_nonce() {
        let mut scram = ScramSha256::new();
        scram.client_first();
        let bogus = b"r=totally-different,s=c2FsdA==,i=4096";
        let err = scram.handle_server_first(bogus, "pw").unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn full_exchange_verifies_matching_server_signature() {
        let mut scram = ScramSha256::new();
        scram.client_first();

        let salt = b"pepper-salt";
        let iterations = 4096u32;
        let server_first = format!(
            "r={}EXTRA,s={},i={iterations}",
            scram.client_nonce,
            BASE64.encode(salt)
        );

        let client_final = scram
            .handle_server_first(server_first.as_bytes(), "correct horse battery staple")
            .unwrap();
        assert!(String::from_utf8(client_final).unwrap().contains("p="));

        let server_key = hmac(&scram.salted_password, b"Server Key");
        let expected_signature = hmac(&server_key, scram.auth_message.as_bytes());
        let server_final = format!("v={}", BASE64.encode(expected_signature));

        scram.verify_server_final(server_final.as_bytes()).unwrap();
    }
}
