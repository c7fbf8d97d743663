//! Keyring-authenticated HTTP client for the gateway
//!
//! Every request carries a MAC header computed with the client session key
//! from the keyring: `Authorization: MAC id="<tenant>",nonce="<hex>",
//! mac="<base64>"` where the MAC is HMAC-SHA256 over the tenant id, the
//! nonce, and the SHA-256 digest of the body. When the keyring carries
//! public-key pins, the TLS layer re-verifies the gateway against them.

use std::sync::Arc;
use std::time::Duration;

use aws_lc_rs::digest::{digest, SHA256};
use aws_lc_rs::hmac;
use aws_lc_rs::rand::SecureRandom;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use thiserror::Error;

use pylon_bootstrap::pins::{pinned_tls_config, PinnedCertVerifier, PublicKeyPin};
use pylon_keyring::Keyring;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("keyring does not contain shared session keys")]
    NoSharedKeys,

    #[error("keyring pins are malformed: {0}")]
    BadPins(String),

    #[error("failed to build HTTP client: {0}")]
    Build(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out")]
    Timeout,
}

/// Compute the request MAC over `(tenant, nonce, sha256(body))`
fn compute_mac(client_key: &[u8], tenant_id: &str, nonce: &str, body: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, client_key);
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(tenant_id.as_bytes());
    ctx.update(nonce.as_bytes());
    ctx.update(digest(&SHA256, body).as_ref());
    ctx.sign().as_ref().to_vec()
}

/// HTTP client holding the tenant identity and session key
pub struct GatewayHttpClient {
    http: reqwest::Client,
    address: String,
    tenant_id: String,
    client_key: Vec<u8>,
}

impl GatewayHttpClient {
    /// Build a client from the agent's keyring
    ///
    /// `address` is the gateway base URL. The keyring must carry shared
    /// session keys; pins are honored when present.
    pub fn new(
        address: impl Into<String>,
        tenant_id: impl Into<String>,
        keyring: &Keyring,
    ) -> Result<Self, ClientError> {
        let shared = keyring.shared_keys().ok_or(ClientError::NoSharedKeys)?;

        let builder = reqwest::Client::builder();
        let builder = match keyring.pkp_pins() {
            Some(raw_pins) => {
                let pins = raw_pins
                    .iter()
                    .map(|raw| PublicKeyPin::from_raw(raw))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ClientError::BadPins(e.to_string()))?;
                let tls = pinned_tls_config(Arc::new(PinnedCertVerifier::new(pins)));
                builder.use_preconfigured_tls(tls)
            }
            None => builder,
        };

        Ok(Self {
            http: builder
                .build()
                .map_err(|e| ClientError::Build(e.to_string()))?,
            address: address.into().trim_end_matches('/').to_string(),
            tenant_id: tenant_id.into(),
            client_key: shared.client_key.clone(),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Start a POST request to the given gateway path
    pub fn post(&self, path: &str) -> GatewayRequest<'_> {
        GatewayRequest {
            client: self,
            url: format!("{}{path}", self.address),
            headers: HeaderMap::new(),
            body: Vec::new(),
            timeout: None,
        }
    }
}

/// A pending authenticated request
pub struct GatewayRequest<'a> {
    client: &'a GatewayHttpClient,
    url: String,
    headers: HeaderMap,
    body: Vec<u8>,
    timeout: Option<Duration>,
}

impl GatewayRequest<'_> {
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Copy a header from an incoming request when present
    pub fn forward_header(mut self, name: HeaderName, source: &HeaderMap) -> Self {
        if let Some(value) = source.get(&name) {
            self.headers.insert(name, value.clone());
        }
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sign and send, returning the gateway's status and body
    pub async fn send(self) -> Result<(StatusCode, Vec<u8>), ClientError> {
        let rng = aws_lc_rs::rand::SystemRandom::new();
        let mut nonce_bytes = [0u8; 16];
        rng.fill(&mut nonce_bytes)
            .map_err(|_| ClientError::Build("RNG unavailable".into()))?;
        let nonce = hex::encode(nonce_bytes);

        let mac = compute_mac(
            &self.client.client_key,
            &self.client.tenant_id,
            &nonce,
            &self.body,
        );
        let authorization = format!(
            "MAC id=\"{}\",nonce=\"{nonce}\",mac=\"{}\"",
            self.client.tenant_id,
            STANDARD.encode(mac)
        );

        let mut request = self
            .client
            .http
            .post(&self.url)
            .headers(self.headers)
            .header(
                AUTHORIZATION,
                HeaderValue::from_str(&authorization)
                    .map_err(|e| ClientError::Build(e.to_string()))?,
            )
            .body(self.body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout
            } else {
                ClientError::Request(e.to_string())
            }
        })?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;
        Ok((status, body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylon_keyring::keyring::{Key, SharedKeys};

    fn keyring() -> Keyring {
        Keyring::new([Key::SharedKeys(SharedKeys {
            client_key: vec![7u8; 32],
            server_key: vec![8u8; 32],
        })])
    }

    #[test]
    fn client_requires_shared_keys() {
        let empty = Keyring::default();
        assert!(matches!(
            GatewayHttpClient::new("http://gw", "agent-1", &empty),
            Err(ClientError::NoSharedKeys)
        ));
        assert!(GatewayHttpClient::new("http://gw", "agent-1", &keyring()).is_ok());
    }

    #[test]
    fn macs_are_deterministic_and_keyed() {
        let mac1 = compute_mac(&[1u8; 32], "agent-1", "abcd", b"body");
        let mac2 = compute_mac(&[1u8; 32], "agent-1", "abcd", b"body");
        assert_eq!(mac1, mac2);

        // any input change produces a different MAC
        assert_ne!(mac1, compute_mac(&[2u8; 32], "agent-1", "abcd", b"body"));
        assert_ne!(mac1, compute_mac(&[1u8; 32], "agent-2", "abcd", b"body"));
        assert_ne!(mac1, compute_mac(&[1u8; 32], "agent-1", "efgh", b"body"));
        assert_ne!(mac1, compute_mac(&[1u8; 32], "agent-1", "abcd", b"tampered"));
    }

    #[test]
    fn trailing_slash_in_address_is_normalized() {
        let client = GatewayHttpClient::new("http://gw:8080/", "agent-1", &keyring()).unwrap();
        let request = client.post("/api/agent/push");
        assert_eq!(request.url, "http://gw:8080/api/agent/push");
    }

    #[test]
    fn malformed_pins_in_keyring_are_rejected() {
        let kr = Keyring::new([
            Key::SharedKeys(SharedKeys {
                client_key: vec![7u8; 32],
                server_key: vec![8u8; 32],
            }),
            Key::PkpPins(vec![vec![1u8; 5]]),
        ]);
        assert!(matches!(
            GatewayHttpClient::new("https://gw", "agent-1", &kr),
            Err(ClientError::BadPins(_))
        ));
    }
}
