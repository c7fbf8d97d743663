//! Ephemeral X25519 key agreement
//!
//! Each side of a bootstrap exchange generates a fresh keypair, swaps public
//! keys, and derives the session keys with [`derive_shared_secret`]. The raw
//! Diffie-Hellman output is expanded with HKDF-SHA256 salted by both public
//! keys, with the client's public key always first; the peer-role tag only
//! decides that ordering, so symmetric roles derive identical key pairs.

use aws_lc_rs::{agreement, hkdf};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an X25519 public key in bytes
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of each derived session key in bytes
pub const SESSION_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum EcdhError {
    #[error("failed to generate ephemeral keypair")]
    KeyGeneration,

    #[error("key agreement failed: peer public key rejected")]
    Agreement,
}

/// Which role the *peer* plays in the exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerType {
    Client,
    Server,
}

/// A peer's public key together with its role
#[derive(Clone, Debug)]
pub struct PeerPublicKey {
    pub public_key: Vec<u8>,
    pub peer_type: PeerType,
}

/// A per-session ephemeral keypair
///
/// The private half is consumed by [`derive_shared_secret`]; a keypair can
/// only ever agree once.
pub struct EphemeralKeyPair {
    private_key: agreement::EphemeralPrivateKey,
    pub public_key: Vec<u8>,
}

impl EphemeralKeyPair {
    pub fn generate() -> Result<Self, EcdhError> {
        let rng = aws_lc_rs::rand::SystemRandom::new();
        let private_key = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)
            .map_err(|_| EcdhError::KeyGeneration)?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| EcdhError::KeyGeneration)?
            .as_ref()
            .to_vec();
        Ok(Self {
            private_key,
            public_key,
        })
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &hex::encode(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// The two directional session keys derived from one exchange
///
/// Zeroized on drop; the keyring takes its own copy during construction.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub client_key: [u8; SESSION_KEY_LEN],
    pub server_key: [u8; SESSION_KEY_LEN],
}

/// Derive the session keys from our ephemeral keypair and the peer's public
/// key
///
/// Both sides derive the same `(client_key, server_key)` pair when they tag
/// each other with symmetric roles.
pub fn derive_shared_secret(
    local: EphemeralKeyPair,
    peer: PeerPublicKey,
) -> Result<SessionKeys, EcdhError> {
    // salt = client public key || server public key, regardless of which
    // side we are
    let mut salt_bytes = Vec::with_capacity(PUBLIC_KEY_LEN * 2);
    match peer.peer_type {
        PeerType::Client => {
            salt_bytes.extend_from_slice(&peer.public_key);
            salt_bytes.extend_from_slice(&local.public_key);
        }
        PeerType::Server => {
            salt_bytes.extend_from_slice(&local.public_key);
            salt_bytes.extend_from_slice(&peer.public_key);
        }
    }

    let peer_key = agreement::UnparsedPublicKey::new(&agreement::X25519, peer.public_key.clone());
    agreement::agree_ephemeral(
        local.private_key,
        &peer_key,
        EcdhError::Agreement,
        |raw_secret| {
            let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &salt_bytes);
            let prk = salt.extract(raw_secret);

            let mut client_key = [0u8; SESSION_KEY_LEN];
            prk.expand(&[b"client key".as_slice()], hkdf::HKDF_SHA256)
                .and_then(|okm| okm.fill(&mut client_key))
                .map_err(|_| EcdhError::Agreement)?;

            let mut server_key = [0u8; SESSION_KEY_LEN];
            prk.expand(&[b"server key".as_slice()], hkdf::HKDF_SHA256)
                .and_then(|okm| okm.fill(&mut server_key))
                .map_err(|_| EcdhError::Agreement)?;

            Ok(SessionKeys {
                client_key,
                server_key,
            })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_keys() {
        let client = EphemeralKeyPair::generate().unwrap();
        let server = EphemeralKeyPair::generate().unwrap();
        let client_pub = client.public_key.clone();
        let server_pub = server.public_key.clone();

        let client_side = derive_shared_secret(
            client,
            PeerPublicKey {
                public_key: server_pub,
                peer_type: PeerType::Server,
            },
        )
        .unwrap();
        let server_side = derive_shared_secret(
            server,
            PeerPublicKey {
                public_key: client_pub,
                peer_type: PeerType::Client,
            },
        )
        .unwrap();

        assert_eq!(client_side.client_key, server_side.client_key);
        assert_eq!(client_side.server_key, server_side.server_key);
        assert_ne!(client_side.client_key, client_side.server_key);
    }

    #[test]
    fn different_sessions_derive_different_keys() {
        let make = || {
            let client = EphemeralKeyPair::generate().unwrap();
            let server = EphemeralKeyPair::generate().unwrap();
            let server_pub = server.public_key.clone();
            derive_shared_secret(
                client,
                PeerPublicKey {
                    public_key: server_pub,
                    peer_type: PeerType::Server,
                },
            )
            .unwrap()
        };
        let a = make();
        let b = make();
        assert_ne!(a.client_key, b.client_key);
    }

    #[test]
    fn invalid_peer_key_is_rejected() {
        let local = EphemeralKeyPair::generate().unwrap();
        let result = derive_shared_secret(
            local,
            PeerPublicKey {
                public_key: vec![0u8; 7],
                peer_type: PeerType::Server,
            },
        );
        assert!(matches!(result, Err(EcdhError::Agreement)));
    }

    #[test]
    fn public_keys_are_x25519_sized() {
        let pair = EphemeralKeyPair::generate().unwrap();
        assert_eq!(pair.public_key.len(), PUBLIC_KEY_LEN);
    }
}
