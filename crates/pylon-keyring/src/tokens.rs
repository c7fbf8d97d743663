//! Bootstrap token codec and detached JWS signing
//!
//! A raw token is 44 random bytes: a 12-byte id and a 32-byte secret. The
//! hex encoding is used at every external surface (logs, custom resources,
//! HTTP bodies); the canonical JSON form is the JWS payload.
//!
//! The gateway advertises each active token as a *detached* EdDSA JWS: the
//! serialized form carries the protected header and signature but omits the
//! payload. A client that holds the plaintext token can reattach its own
//! copy of the payload to produce a complete JWS, proving possession of the
//! token without it ever appearing on the wire.

use aws_lc_rs::rand::SecureRandom;
use aws_lc_rs::signature::{self, Ed25519KeyPair};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pylon_common::core::{BootstrapToken, TokenMetadata};

/// Length of the token id in bytes
pub const TOKEN_ID_LEN: usize = 12;

/// Length of the token secret in bytes
pub const TOKEN_SECRET_LEN: usize = 32;

/// JOSE protected header used for every token JWS
const JWS_HEADER: &str = r#"{"alg":"EdDSA"}"#;

/// Errors from token decoding and JWS verification
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("malformed JWS: {0}")]
    MalformedJws(String),

    #[error("unsupported JWS algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("JWS signature verification failed")]
    InvalidSignature,
}

/// Wire/JSON form of a raw token, hex-encoded
#[derive(Serialize, Deserialize)]
struct TokenJson {
    id: String,
    secret: String,
}

/// A plaintext bootstrap token
#[derive(Clone, PartialEq, Eq)]
pub struct RawToken {
    id: [u8; TOKEN_ID_LEN],
    secret: [u8; TOKEN_SECRET_LEN],
}

impl RawToken {
    /// Generate a new random token
    ///
    /// # Panics
    ///
    /// Panics if the cryptographic RNG fails; the system cannot mint
    /// credentials without a working RNG.
    pub fn generate() -> Self {
        let rng = aws_lc_rs::rand::SystemRandom::new();
        let mut id = [0u8; TOKEN_ID_LEN];
        let mut secret = [0u8; TOKEN_SECRET_LEN];
        rng.fill(&mut id)
            .and_then(|()| rng.fill(&mut secret))
            .unwrap_or_else(|_| panic!("CRITICAL: cryptographic RNG unavailable"));
        Self { id, secret }
    }

    pub fn hex_id(&self) -> String {
        hex::encode(self.id)
    }

    pub fn hex_secret(&self) -> String {
        hex::encode(self.secret)
    }

    /// Decode a token from its hex-encoded id and secret
    pub fn from_hex(id: &str, secret: &str) -> Result<Self, TokenError> {
        let id_bytes =
            hex::decode(id).map_err(|e| TokenError::Malformed(format!("bad id hex: {e}")))?;
        let secret_bytes = hex::decode(secret)
            .map_err(|e| TokenError::Malformed(format!("bad secret hex: {e}")))?;
        let id = id_bytes.try_into().map_err(|_| {
            TokenError::Malformed(format!("token id must be {TOKEN_ID_LEN} bytes"))
        })?;
        let secret = secret_bytes.try_into().map_err(|_| {
            TokenError::Malformed(format!("token secret must be {TOKEN_SECRET_LEN} bytes"))
        })?;
        Ok(Self { id, secret })
    }

    /// The external `<hex id>.<hex secret>` form handed to operators
    pub fn token_string(&self) -> String {
        format!("{}.{}", self.hex_id(), self.hex_secret())
    }

    /// Parse the external `<hex id>.<hex secret>` form
    pub fn from_token_string(s: &str) -> Result<Self, TokenError> {
        let (id, secret) = s
            .split_once('.')
            .ok_or_else(|| TokenError::Malformed("expected <id>.<secret>".into()))?;
        Self::from_hex(id, secret)
    }

    /// The canonical JSON form, used as the JWS payload
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(&TokenJson {
            id: self.hex_id(),
            secret: self.hex_secret(),
        })
        .expect("token JSON serialization cannot fail")
    }

    /// Parse the canonical JSON form
    pub fn from_json(raw: &[u8]) -> Result<Self, TokenError> {
        let parsed: TokenJson = serde_json::from_slice(raw)
            .map_err(|e| TokenError::Malformed(format!("bad token JSON: {e}")))?;
        Self::from_hex(&parsed.id, &parsed.secret)
    }

    /// Decode the plaintext token out of a persisted [`BootstrapToken`]
    pub fn from_bootstrap_token(token: &BootstrapToken) -> Result<Self, TokenError> {
        Self::from_hex(&token.token_id, &token.secret)
    }

    /// The persisted form with empty metadata
    pub fn to_bootstrap_token(&self) -> BootstrapToken {
        BootstrapToken {
            token_id: self.hex_id(),
            secret: self.hex_secret(),
            metadata: TokenMetadata::default(),
        }
    }

    /// Sign the canonical JSON form, returning a detached compact JWS
    /// (`header..signature`)
    pub fn sign_detached(&self, key: &Ed25519KeyPair) -> Vec<u8> {
        let header = URL_SAFE_NO_PAD.encode(JWS_HEADER);
        let payload = URL_SAFE_NO_PAD.encode(self.to_json());
        let signing_input = format!("{header}.{payload}");
        let sig = key.sign(signing_input.as_bytes());
        format!("{header}..{}", URL_SAFE_NO_PAD.encode(sig.as_ref())).into_bytes()
    }
}

impl std::fmt::Debug for RawToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the secret never appears in debug output
        f.debug_struct("RawToken")
            .field("id", &self.hex_id())
            .finish_non_exhaustive()
    }
}

/// Reattach a payload to a detached compact JWS, producing a complete JWS
pub fn complete_detached_jws(detached: &[u8], payload: &[u8]) -> Result<Vec<u8>, TokenError> {
    let text = std::str::from_utf8(detached)
        .map_err(|_| TokenError::MalformedJws("not valid UTF-8".into()))?;
    let (header, rest) = text
        .split_once("..")
        .ok_or_else(|| TokenError::MalformedJws("not in detached form".into()))?;
    if rest.contains('.') || header.is_empty() || rest.is_empty() {
        return Err(TokenError::MalformedJws("not in detached form".into()));
    }
    let encoded_payload = URL_SAFE_NO_PAD.encode(payload);
    Ok(format!("{header}.{encoded_payload}.{rest}").into_bytes())
}

/// Verify a complete compact JWS against an Ed25519 public key and return
/// the decoded payload
pub fn verify_jws(jws: &[u8], public_key: &[u8]) -> Result<Vec<u8>, TokenError> {
    let text =
        std::str::from_utf8(jws).map_err(|_| TokenError::MalformedJws("not valid UTF-8".into()))?;
    let mut parts = text.split('.');
    let (header_b64, payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) if parts.next().is_none() && !p.is_empty() => (h, p, s),
        _ => return Err(TokenError::MalformedJws("expected three segments".into())),
    };

    let header_raw = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|e| TokenError::MalformedJws(format!("bad header encoding: {e}")))?;
    let header: serde_json::Value = serde_json::from_slice(&header_raw)
        .map_err(|e| TokenError::MalformedJws(format!("bad header JSON: {e}")))?;
    match header.get("alg").and_then(|a| a.as_str()) {
        Some("EdDSA") => {}
        Some(other) => return Err(TokenError::UnsupportedAlgorithm(other.to_string())),
        None => return Err(TokenError::MalformedJws("missing alg".into())),
    }

    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|e| TokenError::MalformedJws(format!("bad signature encoding: {e}")))?;
    let signing_input = format!("{header_b64}.{payload_b64}");
    signature::UnparsedPublicKey::new(&signature::ED25519, public_key)
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|e| TokenError::MalformedJws(format!("bad payload encoding: {e}")))
}

/// Verify a detached compact JWS against an out-of-band payload
pub fn verify_detached(
    detached: &[u8],
    payload: &[u8],
    public_key: &[u8],
) -> Result<(), TokenError> {
    let complete = complete_detached_jws(detached, payload)?;
    verify_jws(&complete, public_key).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_lc_rs::signature::KeyPair;

    fn test_keypair() -> Ed25519KeyPair {
        let rng = aws_lc_rs::rand::SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        Ed25519KeyPair::from_pkcs8(doc.as_ref()).unwrap()
    }

    #[test]
    fn tokens_are_unique_and_hex_encoded() {
        let a = RawToken::generate();
        let b = RawToken::generate();
        assert_ne!(a.hex_id(), b.hex_id());
        assert_eq!(a.hex_id().len(), TOKEN_ID_LEN * 2);
        assert_eq!(a.hex_secret().len(), TOKEN_SECRET_LEN * 2);
    }

    #[test]
    fn hex_and_json_round_trip() {
        let token = RawToken::generate();
        let from_hex = RawToken::from_hex(&token.hex_id(), &token.hex_secret()).unwrap();
        assert_eq!(token, from_hex);

        let from_json = RawToken::from_json(&token.to_json()).unwrap();
        assert_eq!(token, from_json);
    }

    #[test]
    fn token_string_round_trips() {
        let token = RawToken::generate();
        let s = token.token_string();
        assert_eq!(RawToken::from_token_string(&s).unwrap(), token);
        assert!(RawToken::from_token_string("no-separator").is_err());
    }

    #[test]
    fn wrong_length_hex_is_rejected() {
        let token = RawToken::generate();
        assert!(RawToken::from_hex("abcd", &token.hex_secret()).is_err());
        assert!(RawToken::from_hex(&token.hex_id(), "abcd").is_err());
        assert!(RawToken::from_hex("zz", "zz").is_err());
    }

    #[test]
    fn debug_output_redacts_the_secret() {
        let token = RawToken::generate();
        let debug = format!("{token:?}");
        assert!(!debug.contains(&token.hex_secret()));
        assert!(debug.contains(&token.hex_id()));
    }

    #[test]
    fn detached_signature_completes_and_verifies() {
        let key = test_keypair();
        let token = RawToken::generate();

        let detached = token.sign_detached(&key);
        assert!(
            std::str::from_utf8(&detached).unwrap().contains(".."),
            "detached form must omit the payload"
        );

        let complete = complete_detached_jws(&detached, &token.to_json()).unwrap();
        let payload = verify_jws(&complete, key.public_key().as_ref()).unwrap();
        assert_eq!(RawToken::from_json(&payload).unwrap(), token);

        verify_detached(&detached, &token.to_json(), key.public_key().as_ref()).unwrap();
    }

    #[test]
    fn verification_fails_for_a_different_token() {
        let key = test_keypair();
        let signed = RawToken::generate();
        let other = RawToken::generate();

        let detached = signed.sign_detached(&key);
        assert!(matches!(
            verify_detached(&detached, &other.to_json(), key.public_key().as_ref()),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn verification_fails_for_a_different_key() {
        let key = test_keypair();
        let wrong_key = test_keypair();
        let token = RawToken::generate();

        let detached = token.sign_detached(&key);
        assert!(matches!(
            verify_detached(&detached, &token.to_json(), wrong_key.public_key().as_ref()),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn non_eddsa_header_is_rejected() {
        let key = test_keypair();
        let token = RawToken::generate();
        let detached = token.sign_detached(&key);
        let complete = complete_detached_jws(&detached, &token.to_json()).unwrap();

        // swap the header for HS256 and keep everything else
        let text = String::from_utf8(complete).unwrap();
        let mut parts: Vec<&str> = text.split('.').collect();
        let forged_header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256"}"#);
        parts[0] = &forged_header;
        let forged = parts.join(".");

        assert!(matches!(
            verify_jws(forged.as_bytes(), key.public_key().as_ref()),
            Err(TokenError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn garbage_jws_is_rejected() {
        let key = test_keypair();
        for input in [&b"not a jws"[..], b"a.b", b"a.b.c.d", b""] {
            assert!(verify_jws(input, key.public_key().as_ref()).is_err());
        }
        assert!(complete_detached_jws(b"no-separator", b"p").is_err());
        assert!(complete_detached_jws(b"h.p.s", b"p").is_err());
    }
}
