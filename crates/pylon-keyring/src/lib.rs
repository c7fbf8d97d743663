//! Cryptographic material for agent-gateway trust establishment
//!
//! Three pieces fit together during bootstrap:
//!
//! - [`tokens`]: the bootstrap token codec and the detached-JWS scheme used
//!   to prove token possession without sending the token over the wire
//! - [`ecdh`]: per-session X25519 key agreement deriving the shared session
//!   keys
//! - [`keyring`]: the opaque container both sides persist once the exchange
//!   completes

pub mod ecdh;
pub mod keyring;
pub mod tokens;

pub use keyring::{Keyring, KeyringError, SharedKeys};
pub use tokens::RawToken;
