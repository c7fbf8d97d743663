//! Gateway-side bootstrap endpoints
//!
//! Three routes under one router: `/bootstrap/join`, `/bootstrap/auth`, and
//! `/bootstrap/logging`. The handler holds no per-request mutable state;
//! all durable effects go through the storage traits.
//!
//! The durable writes in `auth` are ordered: the cluster record is created
//! first, then the keyring, then the token usage increment. A failure at
//! any step returns 500 and leaves the client free to retry with a fresh
//! client id (the cluster id is claimed by the first create).

use std::sync::Arc;

use aws_lc_rs::rand::SecureRandom;
use aws_lc_rs::signature::{Ed25519KeyPair, KeyPair};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use tracing::{error, info, warn};

use pylon_common::core::{Cluster, LoggingCluster, OpensearchUser, Reference};
use pylon_common::KEYRING_NAMESPACE_GATEWAY;
use pylon_keyring::ecdh::{derive_shared_secret, EphemeralKeyPair, PeerPublicKey, PeerType};
use pylon_keyring::keyring::Key;
use pylon_keyring::tokens::{self, RawToken};
use pylon_keyring::{Keyring, SharedKeys};
use pylon_storage::{
    ClusterStore, KeyringStoreBroker, LoggingClusterStore, StorageError, TokenStore,
};

use crate::{
    BootstrapAuthRequest, BootstrapAuthResponse, BootstrapJoinResponse, BootstrapLoggingRequest,
    BootstrapLoggingResponse,
};

/// Alphabet for generated log-store usernames and passwords
const RANDOM_ALPHABET: &[u8] = b"0123456789BCDFGHJKLMNPQRSTVWXZbcdfghjklmnpqrstvwxz";

/// Errors surfaced by the bootstrap endpoints
#[derive(Debug, Error)]
pub enum ServerError {
    /// Authorization header present on an endpoint that forbids it, or a
    /// malformed request body
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Bearer JWS missing, unverifiable, or referencing an unknown token
    #[error("unauthorized")]
    Unauthorized,

    /// Requested cluster id is already registered
    #[error("ID already in use")]
    IdConflict,

    /// No active tokens; the gateway is not accepting enrollments
    #[error("server is not accepting bootstrap requests")]
    NotAccepting,

    #[error("internal error")]
    Internal,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::IdConflict => StatusCode::CONFLICT,
            ServerError::NotAccepting => StatusCode::METHOD_NOT_ALLOWED,
            ServerError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Shared state behind the bootstrap routes
pub struct BootstrapServer {
    signing_key: Ed25519KeyPair,
    token_store: Arc<dyn TokenStore>,
    cluster_store: Arc<dyn ClusterStore>,
    logging_cluster_store: Arc<dyn LoggingClusterStore>,
    keyring_broker: Arc<dyn KeyringStoreBroker>,
}

impl BootstrapServer {
    pub fn new(
        signing_key: Ed25519KeyPair,
        token_store: Arc<dyn TokenStore>,
        cluster_store: Arc<dyn ClusterStore>,
        logging_cluster_store: Arc<dyn LoggingClusterStore>,
        keyring_broker: Arc<dyn KeyringStoreBroker>,
    ) -> Self {
        Self {
            signing_key,
            token_store,
            cluster_store,
            logging_cluster_store,
            keyring_broker,
        }
    }

    /// The router serving the three bootstrap endpoints
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/bootstrap/join", get(handle_join))
            .route("/bootstrap/auth", post(handle_auth))
            .route("/bootstrap/logging", post(handle_logging))
            .with_state(self)
    }

    /// Verify the bearer JWS and resolve the persisted token it proves
    /// possession of
    ///
    /// # Panics
    ///
    /// Panics if the JWS verifies but its payload is not a token: the signer
    /// and verifier disagree on the payload schema, which is a programming
    /// error, not a runtime condition.
    async fn authenticate(
        &self,
        headers: &HeaderMap,
    ) -> Result<pylon_common::core::BootstrapToken, ServerError> {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ServerError::Unauthorized)?;
        let bearer = auth.strip_prefix("Bearer").unwrap_or(auth).trim();

        let payload = tokens::verify_jws(bearer.as_bytes(), self.signing_key.public_key().as_ref())
            .map_err(|_| ServerError::Unauthorized)?;
        let token = RawToken::from_json(&payload)
            .unwrap_or_else(|_| panic!("bug: verify_jws returned a malformed token"));

        match self
            .token_store
            .get_token(&Reference::new(token.hex_id()))
            .await
        {
            Ok(stored) => Ok(stored),
            Err(StorageError::NotFound) => Err(ServerError::Unauthorized),
            Err(e) => {
                error!(error = %e, "error checking if token exists");
                Err(ServerError::Internal)
            }
        }
    }
}

async fn handle_join(
    State(server): State<Arc<BootstrapServer>>,
    headers: HeaderMap,
) -> Result<Json<BootstrapJoinResponse>, ServerError> {
    if headers.get(header::AUTHORIZATION).is_some() {
        return Err(ServerError::InvalidRequest(
            "authorization header not allowed on join".into(),
        ));
    }

    let tokens = server.token_store.list_tokens().await.map_err(|e| {
        error!(error = %e, "error listing tokens");
        ServerError::Internal
    })?;

    let mut response = BootstrapJoinResponse::default();
    for token in &tokens {
        let raw = RawToken::from_bootstrap_token(token).map_err(|e| {
            error!(token = %token.token_id, error = %e, "stored token is malformed");
            ServerError::Internal
        })?;
        let signature = raw.sign_detached(&server.signing_key);
        response
            .signatures
            .insert(raw.hex_id(), STANDARD.encode(signature));
    }

    if response.signatures.is_empty() {
        // no tokens: enrollment is closed
        return Err(ServerError::NotAccepting);
    }
    Ok(Json(response))
}

async fn handle_auth(
    State(server): State<Arc<BootstrapServer>>,
    headers: HeaderMap,
    body: Result<Json<BootstrapAuthRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<BootstrapAuthResponse>, ServerError> {
    let token = server.authenticate(&headers).await?;
    let Json(request) = body
        .map_err(|e| ServerError::InvalidRequest(format!("invalid request body: {e}")))?;

    // the requested id must be unclaimed
    match server
        .cluster_store
        .get_cluster(&Reference::new(&request.client_id))
        .await
    {
        Ok(_) => return Err(ServerError::IdConflict),
        Err(StorageError::NotFound) => {}
        Err(e) => {
            error!(error = %e, "error checking if cluster exists");
            return Err(ServerError::Internal);
        }
    }

    let client_pub_key = STANDARD
        .decode(&request.client_pub_key)
        .map_err(|e| ServerError::InvalidRequest(format!("invalid client public key: {e}")))?;

    let ekp = EphemeralKeyPair::generate().map_err(|e| {
        error!(error = %e, "error generating ephemeral keypair");
        ServerError::Internal
    })?;
    let server_pub_key = ekp.public_key.clone();
    let session = derive_shared_secret(
        ekp,
        PeerPublicKey {
            public_key: client_pub_key,
            peer_type: PeerType::Client,
        },
    )
    .map_err(|e| {
        error!(error = %e, "error computing shared secret");
        ServerError::Internal
    })?;
    let keyring = Keyring::new([Key::SharedKeys(SharedKeys::from(&session))]);

    let cluster = Cluster {
        id: request.client_id.clone(),
        labels: token.metadata.labels.clone(),
    };

    // durable writes, in order: cluster, keyring, usage count
    if let Err(e) = server.cluster_store.create_cluster(&cluster).await {
        if matches!(e, StorageError::AlreadyExists) {
            return Err(ServerError::IdConflict);
        }
        error!(error = %e, "error creating cluster");
        return Err(ServerError::Internal);
    }
    let keyring_store = server
        .keyring_broker
        .keyring_store(KEYRING_NAMESPACE_GATEWAY, &cluster.reference())
        .await
        .map_err(|e| {
            error!(error = %e, "error getting keyring store");
            ServerError::Internal
        })?;
    keyring_store.put(&keyring).await.map_err(|e| {
        error!(error = %e, "error storing keyring");
        ServerError::Internal
    })?;
    server
        .token_store
        .increment_usage_count(&token.reference())
        .await
        .map_err(|e| {
            error!(error = %e, "error incrementing usage count");
            ServerError::Internal
        })?;

    info!(cluster = %request.client_id, "agent bootstrap complete");
    Ok(Json(BootstrapAuthResponse {
        server_pub_key: STANDARD.encode(server_pub_key),
    }))
}

async fn handle_logging(
    State(server): State<Arc<BootstrapServer>>,
    headers: HeaderMap,
    body: Result<Json<BootstrapLoggingRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<BootstrapLoggingResponse>, ServerError> {
    server.authenticate(&headers).await?;
    let Json(request) = body
        .map_err(|e| ServerError::InvalidRequest(format!("invalid request body: {e}")))?;

    match server
        .logging_cluster_store
        .get_logging_cluster(&Reference::new(&request.client_id))
        .await
    {
        Ok(_) => return Err(ServerError::IdConflict),
        Err(StorageError::NotFound) => {}
        Err(e) => {
            error!(error = %e, "error checking if logging cluster exists");
            return Err(ServerError::Internal);
        }
    }

    let username = format!("index-{}", random_string(6));
    let password = random_string(20);

    let user_store = server
        .logging_cluster_store
        .opensearch_user_store()
        .await
        .map_err(|e| {
            error!(error = %e, "error getting log-store user store");
            ServerError::Internal
        })?;
    user_store
        .put(&OpensearchUser {
            id: username.clone(),
            secret: password.clone(),
        })
        .await
        .map_err(|e| {
            error!(error = %e, "error storing log-store user");
            ServerError::Internal
        })?;

    // a failure past this point orphans the user record
    if let Err(e) = server
        .logging_cluster_store
        .create_logging_cluster(&LoggingCluster {
            id: request.client_id.clone(),
            name: request.client_name.clone(),
            opensearch_user_id: username.clone(),
            labels: Default::default(),
        })
        .await
    {
        warn!(error = %e, user = %username, "logging cluster write failed, user record orphaned");
        return Err(ServerError::Internal);
    }

    info!(cluster = %request.client_id, "logging bootstrap complete");
    Ok(Json(BootstrapLoggingResponse { username, password }))
}

/// A random string over [`RANDOM_ALPHABET`], sampled without modulo bias
fn random_string(len: usize) -> String {
    let rng = aws_lc_rs::rand::SystemRandom::new();
    let mut out = Vec::with_capacity(len);
    let limit = 256 - (256 % RANDOM_ALPHABET.len()); // 250
    while out.len() < len {
        let mut byte = [0u8; 1];
        rng.fill(&mut byte)
            .unwrap_or_else(|_| panic!("CRITICAL: cryptographic RNG unavailable"));
        if (byte[0] as usize) < limit {
            out.push(RANDOM_ALPHABET[byte[0] as usize % RANDOM_ALPHABET.len()]);
        }
    }
    String::from_utf8(out).expect("alphabet is ASCII")
}
