//! Tor v3 onion addresses and onion service keys.
//!
//! Tor v3 (.onion) addresses are derived from Ed25519 public keys:
//!
//! 1. Compute checksum: SHA3-256(".onion checksum" || pubkey || version)[..2]
//! 2. Encode: base32(pubkey || checksum || version)
//! 3. Append ".onion"
//!
//! This produces a 56-character address + ".onion" suffix.
//!
//! `ADD_ONION` takes and returns the 64-byte *expanded* secret key
//! (clamped scalar followed by the signing prefix), base64 encoded with an
//! `ED25519-V3:` tag. [`OnionSecretKey`] holds exactly that form.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::hazmat::ExpandedSecretKey;
use ed25519_dalek::VerifyingKey;
use sha3::{Digest, Sha3_256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Tor v3 onion service version byte.
const ONION_VERSION: u8 = 0x03;

/// Checksum prefix per Tor spec.
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// Length of a v3 service id (address without `.onion`).
pub const SERVICE_ID_LEN: usize = 56;

/// Key type tag used by the control protocol.
pub const KEY_TYPE: &str = "ED25519-V3";

const BASE32: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

/// A Tor v3 onion address.
///
/// Format: `<56 base32 chars>.onion`
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Parse and validate an onion address, with or without the `.onion` suffix.
    ///
    /// Checks length, base32, version byte and checksum.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        let id = s.strip_suffix(".onion").unwrap_or(&s);

        if id.len() != SERVICE_ID_LEN {
            return Err(Error::InvalidAddress(format!(
                "v3 service id must be {} characters (got {})",
                SERVICE_ID_LEN,
                id.len()
            )));
        }

        let address = Self(format!("{}.onion", id));
        address.extract_public_key()?;
        Ok(address)
    }

    /// Get the full address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Service id (hostname without .onion suffix), as used by `DEL_ONION`.
    pub fn service_id(&self) -> &str {
        &self.0[..SERVICE_ID_LEN]
    }

    /// Derive an onion address from an Ed25519 public key.
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        let pubkey_bytes = public_key.as_bytes();
        let checksum = checksum(pubkey_bytes);

        // pubkey (32) || checksum (2) || version (1) = 35 bytes
        let mut addr_bytes = [0u8; 35];
        addr_bytes[..32].copy_from_slice(pubkey_bytes);
        addr_bytes[32..34].copy_from_slice(&checksum);
        addr_bytes[34] = ONION_VERSION;

        let encoded = base32::encode(BASE32, &addr_bytes);
        Self(format!("{}.onion", encoded.to_lowercase()))
    }

    /// Extract and verify the public key from this onion address.
    pub fn extract_public_key(&self) -> Result<VerifyingKey> {
        let decoded = base32::decode(BASE32, &self.service_id().to_uppercase())
            .ok_or_else(|| Error::InvalidAddress("invalid base32".into()))?;

        if decoded.len() != 35 {
            return Err(Error::InvalidAddress("invalid address length".into()));
        }

        if decoded[34] != ONION_VERSION {
            return Err(Error::InvalidAddress("unsupported onion version".into()));
        }

        let pubkey_bytes: [u8; 32] = decoded[..32]
            .try_into()
            .map_err(|_| Error::InvalidAddress("invalid key length".into()))?;

        if decoded[32..34] != checksum(&pubkey_bytes) {
            return Err(Error::InvalidAddress("checksum mismatch".into()));
        }

        VerifyingKey::from_bytes(&pubkey_bytes)
            .map_err(|e| Error::InvalidAddress(format!("invalid public key: {}", e)))
    }
}

fn checksum(pubkey: &[u8; 32]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(pubkey);
    hasher.update([ONION_VERSION]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddress({})", self.0)
    }
}

/// Expanded Ed25519 secret key of an onion service.
///
/// Zeroized on drop, never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct OnionSecretKey([u8; 64]);

impl OnionSecretKey {
    /// Wrap raw expanded key bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Copy from a slice that must be exactly 64 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("expected 64 bytes, got {}", bytes.len())))?;
        Ok(Self(bytes))
    }

    /// Parse the `ED25519-V3:<base64>` form returned in `PrivateKey=`.
    pub fn from_control_blob(blob: &str) -> Result<Self> {
        let (kind, encoded) = blob
            .split_once(':')
            .ok_or_else(|| Error::InvalidKey("missing key type".into()))?;
        if kind != KEY_TYPE {
            return Err(Error::InvalidKey(format!("unsupported key type {}", kind)));
        }
        let mut decoded = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidKey(format!("bad base64: {}", e)))?;
        let key = Self::from_slice(&decoded);
        decoded.zeroize();
        key
    }

    /// The `ED25519-V3:<base64>` argument for `ADD_ONION`.
    pub fn to_control_blob(&self) -> String {
        format!("{}:{}", KEY_TYPE, BASE64.encode(self.0))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Hex encoding, for bindings that hand keys back as strings.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Public key for this secret.
    pub fn public_key(&self) -> VerifyingKey {
        let expanded = ExpandedSecretKey::from_bytes(&self.0);
        VerifyingKey::from(&expanded)
    }

    /// Onion address this key serves.
    pub fn onion_address(&self) -> OnionAddress {
        OnionAddress::from_public_key(&self.public_key())
    }
}

impl fmt::Debug for OnionSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionSecretKey([REDACTED])")
    }
}
