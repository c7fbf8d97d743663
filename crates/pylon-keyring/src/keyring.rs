//! The shared keyring
//!
//! A keyring is an unordered collection of typed key material shared between
//! an agent and the gateway after bootstrap: the ECDH-derived session keys,
//! optional CA certificates, and optional public-key pins. Callers outside
//! this module treat the marshaled form as an opaque blob; stores persist it
//! without inspecting it.
//!
//! The binary framing is length-tagged: `tag(1) || len(4, BE) || payload`
//! per entry. Decoding is fail-closed: unknown tags, truncation, and
//! trailing bytes are all rejected with a distinguished error.

use thiserror::Error;

use crate::ecdh::SessionKeys;

/// Errors from keyring decoding
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyringError {
    #[error("keyring data is truncated")]
    Truncated,

    #[error("unknown key tag: {0}")]
    UnknownTag(u8),

    #[error("invalid key entry: {0}")]
    Invalid(String),
}

const TAG_SHARED_KEYS: u8 = 1;
const TAG_CA_CERT: u8 = 2;
const TAG_PKP_PINS: u8 = 3;

/// The two directional MAC keys shared with the gateway
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedKeys {
    pub client_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl From<&SessionKeys> for SharedKeys {
    fn from(session: &SessionKeys) -> Self {
        Self {
            client_key: session.client_key.to_vec(),
            server_key: session.server_key.to_vec(),
        }
    }
}

/// One typed entry in a keyring
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Key {
    SharedKeys(SharedKeys),
    /// A DER-encoded CA certificate
    CaCert(Vec<u8>),
    /// SPKI-SHA256 public key pins
    PkpPins(Vec<Vec<u8>>),
}

/// Visitor over the static key variants
///
/// All methods default to no-ops so a visitor only implements the variants
/// it cares about.
pub trait KeyringVisitor {
    fn visit_shared_keys(&mut self, _keys: &SharedKeys) {}
    fn visit_ca_cert(&mut self, _der: &[u8]) {}
    fn visit_pkp_pins(&mut self, _pins: &[Vec<u8>]) {}
}

/// An unordered collection of key material
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Keyring {
    keys: Vec<Key>,
}

impl Keyring {
    pub fn new(keys: impl IntoIterator<Item = Key>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Walk every entry with the given visitor
    pub fn visit<V: KeyringVisitor>(&self, visitor: &mut V) {
        for key in &self.keys {
            match key {
                Key::SharedKeys(sk) => visitor.visit_shared_keys(sk),
                Key::CaCert(der) => visitor.visit_ca_cert(der),
                Key::PkpPins(pins) => visitor.visit_pkp_pins(pins),
            }
        }
    }

    /// The session keys, if present
    pub fn shared_keys(&self) -> Option<&SharedKeys> {
        self.keys.iter().find_map(|k| match k {
            Key::SharedKeys(sk) => Some(sk),
            _ => None,
        })
    }

    /// All CA certificates in the ring
    pub fn ca_certs(&self) -> Vec<&[u8]> {
        self.keys
            .iter()
            .filter_map(|k| match k {
                Key::CaCert(der) => Some(der.as_slice()),
                _ => None,
            })
            .collect()
    }

    /// The public-key pins, if present
    pub fn pkp_pins(&self) -> Option<&[Vec<u8>]> {
        self.keys.iter().find_map(|k| match k {
            Key::PkpPins(pins) => Some(pins.as_slice()),
            _ => None,
        })
    }

    /// Encode to the opaque binary form
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for key in &self.keys {
            match key {
                Key::SharedKeys(sk) => {
                    let mut payload = Vec::with_capacity(sk.client_key.len() + sk.server_key.len());
                    payload.extend_from_slice(&sk.client_key);
                    payload.extend_from_slice(&sk.server_key);
                    write_entry(&mut out, TAG_SHARED_KEYS, &payload);
                }
                Key::CaCert(der) => write_entry(&mut out, TAG_CA_CERT, der),
                Key::PkpPins(pins) => {
                    let mut payload = Vec::new();
                    for pin in pins {
                        let len = u16::try_from(pin.len()).expect("pin length fits in u16");
                        payload.extend_from_slice(&len.to_be_bytes());
                        payload.extend_from_slice(pin);
                    }
                    write_entry(&mut out, TAG_PKP_PINS, &payload);
                }
            }
        }
        out
    }

    /// Decode the opaque binary form, rejecting anything not produced by
    /// [`marshal`](Self::marshal)
    pub fn unmarshal(data: &[u8]) -> Result<Self, KeyringError> {
        let mut keys = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            if rest.len() < 5 {
                return Err(KeyringError::Truncated);
            }
            let tag = rest[0];
            let len = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
            rest = &rest[5..];
            if rest.len() < len {
                return Err(KeyringError::Truncated);
            }
            let (payload, remainder) = rest.split_at(len);
            rest = remainder;

            match tag {
                TAG_SHARED_KEYS => {
                    if payload.len() != 64 {
                        return Err(KeyringError::Invalid(format!(
                            "shared keys entry must be 64 bytes, got {}",
                            payload.len()
                        )));
                    }
                    keys.push(Key::SharedKeys(SharedKeys {
                        client_key: payload[..32].to_vec(),
                        server_key: payload[32..].to_vec(),
                    }));
                }
                TAG_CA_CERT => keys.push(Key::CaCert(payload.to_vec())),
                TAG_PKP_PINS => {
                    let mut pins = Vec::new();
                    let mut p = payload;
                    while !p.is_empty() {
                        if p.len() < 2 {
                            return Err(KeyringError::Truncated);
                        }
                        let pin_len = u16::from_be_bytes([p[0], p[1]]) as usize;
                        p = &p[2..];
                        if p.len() < pin_len {
                            return Err(KeyringError::Truncated);
                        }
                        let (pin, remainder) = p.split_at(pin_len);
                        pins.push(pin.to_vec());
                        p = remainder;
                    }
                    keys.push(Key::PkpPins(pins));
                }
                other => return Err(KeyringError::UnknownTag(other)),
            }
        }
        Ok(Self { keys })
    }
}

fn write_entry(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    let len = u32::try_from(payload.len()).expect("keyring entry fits in u32");
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_keys() -> SharedKeys {
        SharedKeys {
            client_key: vec![0xAA; 32],
            server_key: vec![0xBB; 32],
        }
    }

    fn full_keyring() -> Keyring {
        Keyring::new([
            Key::SharedKeys(shared_keys()),
            Key::CaCert(vec![0x30, 0x82, 0x01, 0x02]),
            Key::PkpPins(vec![vec![1u8; 32], vec![2u8; 32]]),
        ])
    }

    #[test]
    fn marshal_unmarshal_is_identity() {
        let kr = full_keyring();
        let decoded = Keyring::unmarshal(&kr.marshal()).unwrap();
        assert_eq!(kr, decoded);
    }

    #[test]
    fn empty_keyring_round_trips() {
        let kr = Keyring::default();
        assert_eq!(Keyring::unmarshal(&kr.marshal()).unwrap(), kr);
    }

    #[test]
    fn accessors_find_entries_by_variant() {
        let kr = full_keyring();
        assert_eq!(kr.shared_keys(), Some(&shared_keys()));
        assert_eq!(kr.ca_certs().len(), 1);
        assert_eq!(kr.pkp_pins().map(|p| p.len()), Some(2));

        let empty = Keyring::default();
        assert!(empty.shared_keys().is_none());
        assert!(empty.ca_certs().is_empty());
        assert!(empty.pkp_pins().is_none());
    }

    #[test]
    fn visitor_sees_every_entry() {
        #[derive(Default)]
        struct Counter {
            shared: usize,
            certs: usize,
            pins: usize,
        }
        impl KeyringVisitor for Counter {
            fn visit_shared_keys(&mut self, _: &SharedKeys) {
                self.shared += 1;
            }
            fn visit_ca_cert(&mut self, _: &[u8]) {
                self.certs += 1;
            }
            fn visit_pkp_pins(&mut self, _: &[Vec<u8>]) {
                self.pins += 1;
            }
        }

        let mut counter = Counter::default();
        full_keyring().visit(&mut counter);
        assert_eq!(
            (counter.shared, counter.certs, counter.pins),
            (1, 1, 1)
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut data = full_keyring().marshal();
        data[0] = 0x7F;
        assert_eq!(
            Keyring::unmarshal(&data),
            Err(KeyringError::UnknownTag(0x7F))
        );
    }

    #[test]
    fn truncated_input_is_rejected() {
        let data = full_keyring().marshal();
        for cut in [1, 3, data.len() - 1] {
            assert!(
                Keyring::unmarshal(&data[..cut]).is_err(),
                "truncation at {cut} must fail"
            );
        }
    }

    #[test]
    fn oversized_shared_keys_entry_is_rejected() {
        let mut data = Vec::new();
        write_entry(&mut data, TAG_SHARED_KEYS, &[0u8; 63]);
        assert!(matches!(
            Keyring::unmarshal(&data),
            Err(KeyringError::Invalid(_))
        ));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut data = full_keyring().marshal();
        data.extend_from_slice(&[0xFF, 0x00]);
        assert!(Keyring::unmarshal(&data).is_err());
    }
}
