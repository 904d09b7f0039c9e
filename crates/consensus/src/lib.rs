//! Protocol-wide constants, identifiers and error codes.

pub mod constants;
pub mod error;
pub mod params;

pub use error::{ErrorCode, ProtocolError};
pub use params::{chain_params, ChainParams};

pub type Hash256 = [u8; 32];

/// Parses a 64-char lowercase hex string into a [`Hash256`].
///
/// Uppercase digits are rejected: object ids and hashes travel the wire in
/// lowercase and two spellings of the same id must not alias.
pub fn hash256_from_hex(value: &str) -> Option<Hash256> {
    if value.len() != 64 || !value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return None;
    }
    let bytes = hex::decode(value).ok()?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

pub fn hash256_to_hex(value: &Hash256) -> String {
    hex::encode(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let hash = [0xabu8; 32];
        let encoded = hash256_to_hex(&hash);
        assert_eq!(hash256_from_hex(&encoded), Some(hash));
    }

    #[test]
    fn hex_rejects_uppercase_and_bad_length() {
        assert!(hash256_from_hex(&"AB".repeat(32)).is_none());
        assert!(hash256_from_hex("abcd").is_none());
        assert!(hash256_from_hex(&"zz".repeat(32)).is_none());
    }
}
