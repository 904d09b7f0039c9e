//! Core object types, canonical JSON serialization and object hashing.

pub mod hash;
pub mod jcs;
pub mod object;

pub use hash::{blake2s, object_id};
pub use object::{verify_signature, Block, Object, Outpoint, PrevId, Transaction, TxInput, TxOutput};
