//! Bootstrap protocol between agents and the gateway
//!
//! An unknown agent obtains its shared keyring from the gateway in three
//! steps:
//!
//! 1. `GET /bootstrap/join` (unauthenticated, over pinned TLS): the gateway
//!    returns a detached EdDSA signature for every active bootstrap token,
//!    keyed by hex token id. Payloads are omitted, so the listing reveals
//!    nothing about the tokens themselves.
//! 2. The agent finds the signature matching its token, verifies it against
//!    the pinned gateway key using its own copy of the token, and reattaches
//!    the payload to form a complete JWS.
//! 3. `POST /bootstrap/auth` with the completed JWS as the bearer token and
//!    an ephemeral X25519 public key. The gateway verifies the JWS with its
//!    own key (proving the client holds the plaintext token), runs the key
//!    agreement, registers the cluster, and returns its ephemeral public
//!    key. Both sides now derive the same session keys.
//!
//! `POST /bootstrap/logging` shares the same pre-flight and instead
//! provisions log-store credentials for a logging cluster.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pylon_common::ident::IdentProvider;
use pylon_keyring::Keyring;

pub mod client;
pub mod pins;
pub mod server;

pub use client::{BootstrapError, ClientConfig};
pub use pins::PublicKeyPin;
pub use server::BootstrapServer;

/// Response to `GET /bootstrap/join`
///
/// Signature values are base64-encoded detached JWS bytes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BootstrapJoinResponse {
    pub signatures: BTreeMap<String, String>,
}

/// Request body for `POST /bootstrap/auth`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapAuthRequest {
    #[serde(rename = "clientID")]
    pub client_id: String,
    /// Ephemeral X25519 public key, base64-encoded
    #[serde(rename = "clientPubKey")]
    pub client_pub_key: String,
}

/// Response body for `POST /bootstrap/auth`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapAuthResponse {
    /// Gateway's ephemeral X25519 public key, base64-encoded
    #[serde(rename = "serverPubKey")]
    pub server_pub_key: String,
}

/// Request body for `POST /bootstrap/logging`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapLoggingRequest {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "clientName")]
    pub client_name: String,
}

/// Response body for `POST /bootstrap/logging`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapLoggingResponse {
    pub username: String,
    pub password: String,
}

/// Performs the agent side of the bootstrap exchange
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Run the exchange and return the resulting keyring
    async fn bootstrap(&self, ident: &dyn IdentProvider) -> Result<Keyring, BootstrapError>;

    /// Post-bootstrap cleanup, called exactly once per successful bootstrap
    async fn finalize(&self) -> Result<(), BootstrapError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names_match_the_protocol() {
        let req = BootstrapAuthRequest {
            client_id: "agent-1".into(),
            client_pub_key: "cHVi".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["clientID"], "agent-1");
        assert_eq!(json["clientPubKey"], "cHVi");

        let resp = BootstrapAuthResponse {
            server_pub_key: "cHVi".into(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["serverPubKey"], "cHVi");

        let logging = BootstrapLoggingRequest {
            client_id: "agent-1".into(),
            client_name: "Agent One".into(),
        };
        let json = serde_json::to_value(&logging).unwrap();
        assert_eq!(json["clientID"], "agent-1");
        assert_eq!(json["clientName"], "Agent One");
    }
}
