//! Object ids: Blake2s-256 over canonical JSON bytes.

use blake2s_simd::Params;
use marabud_consensus::Hash256;
use serde_json::Value;

use crate::jcs;

pub fn blake2s(bytes: &[u8]) -> Hash256 {
    let digest = Params::new().hash_length(32).hash(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// The id of an object is the hash of its canonical serialization.
pub fn object_id(value: &Value) -> Hash256 {
    blake2s(&jcs::to_canonical_vec(value))
}
