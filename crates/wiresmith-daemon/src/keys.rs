// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Curve25519 key material in WireGuard's base64 encoding.

use std::fmt;

use aes_gcm::aead::OsRng;
use aes_gcm::{Aes256Gcm, KeyInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    Length(usize),

    #[error("key is all zeros")]
    Zero,

    #[error("private key yields a degenerate public key")]
    Degenerate,
}

pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Decode a base64 WireGuard key into its 32 raw bytes.
pub fn parse_key(b64: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(b64.trim())?;
    let len = bytes.len();
    let key: [u8; 32] = bytes.try_into().map_err(|_| KeyError::Length(len))?;
    if key == [0u8; 32] {
        return Err(KeyError::Zero);
    }
    Ok(key)
}

pub fn generate_key_pair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(&mut OsRng);
    let public = PublicKey::from(&secret);
    KeyPair {
        private_key: BASE64.encode(secret.to_bytes()),
        public_key: BASE64.encode(public.as_bytes()),
    }
}

/// Derive the public half of a caller-supplied private key, rejecting
/// anything that is not a usable scalar.
pub fn public_key_from_private(private_b64: &str) -> Result<String, KeyError> {
    let bytes = parse_key(private_b64)?;
    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    if public.as_bytes() == &[0u8; 32] {
        return Err(KeyError::Degenerate);
    }
    Ok(BASE64.encode(public.as_bytes()))
}

/// Validate a peer public key and return it in canonical encoding.
pub fn canonical_public_key(public_b64: &str) -> Result<String, KeyError> {
    parse_key(public_b64).map(|k| BASE64.encode(k))
}

pub fn generate_preshared_key() -> String {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    BASE64.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn generated_pair_is_consistent() {
        let pair = generate_key_pair();
        assert_eq!(public_key_from_private(&pair.private_key).unwrap(), pair.public_key);
        assert_eq!(parse_key(&pair.public_key).unwrap().len(), 32);
    }

    #[test]
    fn generated_pairs_differ() {
        let a = generate_key_pair();
        let b = generate_key_pair();
        assert_ne!(a.private_key, b.private_key);
    }

    #[test]
    fn known_vector() {
        // RFC 7748 section 6.1, Alice.
        let private = BASE64.encode(
            hex_bytes("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a"),
        );
        let public = BASE64.encode(
            hex_bytes("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"),
        );
        assert_eq!(public_key_from_private(&private).unwrap(), public);
    }

    fn hex_bytes(hex: &str) -> Vec<u8> {
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test_case("not base64!!"; "bad encoding")]
    #[test_case("YWFhYQ=="; "too short")]
    #[test_case("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="; "all zero")]
    fn rejects_malformed_private_keys(input: &str) {
        assert!(public_key_from_private(input).is_err());
    }

    #[test]
    fn preshared_keys_are_32_bytes() {
        let psk = generate_preshared_key();
        assert_eq!(parse_key(&psk).unwrap().len(), 32);
        assert_ne!(psk, generate_preshared_key());
    }

    #[test]
    fn canonical_public_key_trims_whitespace() {
        let pair = generate_key_pair();
        let padded = format!("  {}\n", pair.public_key);
        assert_eq!(canonical_public_key(&padded).unwrap(), pair.public_key);
    }
}
