//! Agent-side bootstrap client
//!
//! Symmetric counterpart to the server: fetches the join listing over
//! pinned TLS, proves token possession by completing the gateway's detached
//! signature, and finishes the key agreement. Pin-validation and signature
//! failures are fatal; authentication is never retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use tracing::{debug, info};

use pylon_common::ident::{IdentError, IdentProvider};
use pylon_keyring::ecdh::{derive_shared_secret, EcdhError, EphemeralKeyPair, PeerPublicKey, PeerType};
use pylon_keyring::keyring::Key;
use pylon_keyring::tokens::{self, RawToken, TokenError};
use pylon_keyring::{Keyring, SharedKeys};

use crate::pins::{extract_ed25519_public_key, PinError, PinnedCertVerifier, PublicKeyPin};
use crate::{BootstrapAuthRequest, BootstrapAuthResponse, BootstrapJoinResponse, Bootstrapper};

/// Errors from the client side of the bootstrap exchange
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to reach the gateway: {0}")]
    Transport(String),

    /// The presented certificate chain did not match any pin
    #[error("server certificate pin validation failed: {0}")]
    PinValidation(String),

    #[error("server does not recognize this token")]
    TokenNotRecognized,

    /// The advertised signature does not verify against our token; either
    /// the pin belongs to a different gateway or the token is stale
    #[error("server signature does not match this token: {0}")]
    SignatureMismatch(#[from] TokenError),

    #[error("gateway certificate is unusable: {0}")]
    BadServerCertificate(#[from] PinError),

    #[error("key agreement failed: {0}")]
    KeyAgreement(#[from] EcdhError),

    #[error("identity resolution failed: {0}")]
    Identity(#[from] IdentError),

    #[error("gateway rejected the token")]
    Unauthorized,

    /// The requested cluster id already exists on the gateway
    #[error("cluster ID already in use")]
    IdConflict,

    #[error("unexpected gateway response: {0}")]
    UnexpectedResponse(String),

    #[error("finalize called more than once")]
    AlreadyFinalized,
}

/// Bootstrap client configuration
pub struct ClientConfig {
    /// The plaintext bootstrap token handed to this agent out of band
    pub token: RawToken,
    /// Gateway public-key pins; at least one must match the served chain
    pub pins: Vec<PublicKeyPin>,
    /// Gateway base URL, e.g. `https://gateway.example.com:8080`
    pub endpoint: String,

    finalized: AtomicBool,
}

impl ClientConfig {
    pub fn new(token: RawToken, pins: Vec<PublicKeyPin>, endpoint: impl Into<String>) -> Self {
        Self {
            token,
            pins,
            endpoint: endpoint.into(),
            finalized: AtomicBool::new(false),
        }
    }

    fn http_client(
        &self,
        verifier: Arc<PinnedCertVerifier>,
    ) -> Result<reqwest::Client, BootstrapError> {
        reqwest::Client::builder()
            .use_preconfigured_tls(crate::pins::pinned_tls_config(verifier))
            .build()
            .map_err(|e| BootstrapError::Transport(e.to_string()))
    }
}

#[async_trait]
impl Bootstrapper for ClientConfig {
    async fn bootstrap(&self, ident: &dyn IdentProvider) -> Result<Keyring, BootstrapError> {
        let verifier = Arc::new(PinnedCertVerifier::new(self.pins.clone()));
        let http = self.http_client(verifier.clone())?;

        // 1. fetch the join listing; the TLS layer enforces the pins
        let join: BootstrapJoinResponse = http
            .get(format!("{}/bootstrap/join", self.endpoint))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    BootstrapError::PinValidation(e.to_string())
                } else {
                    BootstrapError::Transport(e.to_string())
                }
            })?
            .error_for_status()
            .map_err(|e| BootstrapError::UnexpectedResponse(e.to_string()))?
            .json()
            .await
            .map_err(|e| BootstrapError::UnexpectedResponse(e.to_string()))?;

        let leaf = verifier.seen_leaf().ok_or_else(|| {
            BootstrapError::PinValidation("no pinned certificate observed".into())
        })?;
        let server_signing_key = extract_ed25519_public_key(&leaf)?;

        // 2. locate our signature and verify it against our own token copy
        let signature_b64 = join
            .signatures
            .get(&self.token.hex_id())
            .ok_or(BootstrapError::TokenNotRecognized)?;
        let detached = STANDARD
            .decode(signature_b64)
            .map_err(|e| BootstrapError::UnexpectedResponse(format!("bad signature: {e}")))?;
        tokens::verify_detached(&detached, &self.token.to_json(), &server_signing_key)?;
        debug!("gateway signature verified against local token");

        // 3. complete the JWS and authenticate
        let bearer = tokens::complete_detached_jws(&detached, &self.token.to_json())?;
        let bearer = String::from_utf8(bearer)
            .map_err(|_| BootstrapError::UnexpectedResponse("non-UTF-8 JWS".into()))?;

        let ekp = EphemeralKeyPair::generate()?;
        let client_id = ident.unique_identifier().await?;
        let request = BootstrapAuthRequest {
            client_id: client_id.clone(),
            client_pub_key: STANDARD.encode(&ekp.public_key),
        };

        let response = http
            .post(format!("{}/bootstrap/auth", self.endpoint))
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {bearer}"))
            .json(&request)
            .send()
            .await
            .map_err(|e| BootstrapError::Transport(e.to_string()))?;

        let response = match response.status().as_u16() {
            200 => response,
            401 => return Err(BootstrapError::Unauthorized),
            409 => return Err(BootstrapError::IdConflict),
            other => {
                return Err(BootstrapError::UnexpectedResponse(format!(
                    "status {other} from /bootstrap/auth"
                )))
            }
        };
        let auth: BootstrapAuthResponse = response
            .json()
            .await
            .map_err(|e| BootstrapError::UnexpectedResponse(e.to_string()))?;

        // 4. finish the agreement with the server role on the peer side
        let server_pub_key = STANDARD
            .decode(&auth.server_pub_key)
            .map_err(|e| BootstrapError::UnexpectedResponse(format!("bad server key: {e}")))?;
        let session = derive_shared_secret(
            ekp,
            PeerPublicKey {
                public_key: server_pub_key,
                peer_type: PeerType::Server,
            },
        )?;

        info!(cluster = %client_id, "bootstrap exchange complete");
        self.finalized.store(false, Ordering::SeqCst);
        Ok(Keyring::new([
            Key::SharedKeys(SharedKeys::from(&session)),
            Key::PkpPins(self.pins.iter().map(|p| p.as_bytes().to_vec()).collect()),
        ]))
    }

    async fn finalize(&self) -> Result<(), BootstrapError> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Err(BootstrapError::AlreadyFinalized);
        }
        // nothing to clean up for the HTTP client; the guard only enforces
        // the call-once contract
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedIdent(&'static str);

    #[async_trait]
    impl IdentProvider for FixedIdent {
        async fn unique_identifier(&self) -> Result<String, IdentError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn finalize_enforces_call_once() {
        let config = ClientConfig::new(RawToken::generate(), vec![], "https://localhost:1");
        assert!(config.finalize().await.is_ok());
        assert!(matches!(
            config.finalize().await,
            Err(BootstrapError::AlreadyFinalized)
        ));
    }

    #[tokio::test]
    async fn unreachable_gateway_is_a_transport_error() {
        let config = ClientConfig::new(RawToken::generate(), vec![], "https://127.0.0.1:1");
        let result = config.bootstrap(&FixedIdent("agent-test")).await;
        assert!(matches!(
            result,
            Err(BootstrapError::Transport(_)) | Err(BootstrapError::PinValidation(_))
        ));
    }
}
