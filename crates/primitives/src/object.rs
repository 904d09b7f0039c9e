//! Wire object schemas and their structural checks.
//!
//! Schemas are strict: unknown members fail deserialization, and
//! [`Transaction::check_format`]/[`Block::check_format`] reject anything the
//! protocol grammar does not admit before semantic validation runs.

use ed25519_dalek::{Signature, VerifyingKey};
use marabud_consensus::constants::POW_TARGET;
use marabud_consensus::{ErrorCode, Hash256, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hash;
use crate::jcs;

const MAX_NOTE_LENGTH: usize = 128;
const MAX_STUDENT_IDS: usize = 10;

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq, Hash)]
#[serde(deny_unknown_fields)]
pub struct Outpoint {
    pub txid: String,
    pub index: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TxInput {
    pub outpoint: Outpoint,
    pub sig: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TxOutput {
    pub pubkey: String,
    pub value: u64,
}

/// A transaction in either of its two shapes: regular (`inputs`) or
/// coinbase (`height`). Both members are optional at the schema level so
/// that a transaction carrying both can be parsed and then rejected with
/// the proper error.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Transaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<TxInput>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    pub outputs: Vec<TxOutput>,
}

/// `previd` must be present on the wire even when null. Serde defaults a
/// missing `Option` member to `None`, so the field is wrapped to make an
/// absent member a parse error instead of an implicit genesis claim.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct PrevId(pub Option<String>);

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Block {
    pub txids: Vec<String>,
    pub nonce: String,
    pub previd: PrevId,
    pub created: u64,
    #[serde(rename = "T")]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub studentids: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Object {
    Transaction(Transaction),
    Block(Block),
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.height.is_some() && self.inputs.is_none()
    }

    pub fn inputs(&self) -> &[TxInput] {
        self.inputs.as_deref().unwrap_or(&[])
    }

    pub fn check_format(&self) -> Result<(), ProtocolError> {
        match (&self.inputs, self.height) {
            (Some(_), Some(_)) => {
                return Err(ProtocolError::format(
                    "transaction carries both inputs and height",
                ));
            }
            (None, None) => {
                return Err(ProtocolError::format(
                    "transaction carries neither inputs nor height",
                ));
            }
            (Some(inputs), None) => {
                if inputs.is_empty() {
                    return Err(ProtocolError::format("transaction has no inputs"));
                }
                for input in inputs {
                    if !is_hex(&input.outpoint.txid, 64) {
                        return Err(ProtocolError::format("outpoint txid is not 64-hex"));
                    }
                    if !is_hex(&input.sig, 128) {
                        return Err(ProtocolError::format("signature is not 128-hex"));
                    }
                }
            }
            (None, Some(_)) => {
                if self.outputs.len() != 1 {
                    return Err(ProtocolError::format(
                        "coinbase must carry exactly one output",
                    ));
                }
            }
        }
        for output in &self.outputs {
            if !is_hex(&output.pubkey, 64) {
                return Err(ProtocolError::format("output pubkey is not 64-hex"));
            }
        }
        Ok(())
    }

    /// Canonical bytes of this transaction with every `sig` replaced by
    /// JSON null: the message that input signatures commit to.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let view = SignableTransaction {
            kind: "transaction",
            inputs: self.inputs.as_ref().map(|inputs| {
                inputs
                    .iter()
                    .map(|input| SignableInput {
                        outpoint: &input.outpoint,
                        sig: (),
                    })
                    .collect()
            }),
            height: self.height,
            outputs: &self.outputs,
        };
        let value = serde_json::to_value(&view)
            .map_err(|err| ProtocolError::internal(err.to_string()))?;
        Ok(jcs::to_canonical_vec(&value))
    }
}

// The unit type serializes as JSON null, which is exactly what the signable
// form substitutes for each signature.
#[derive(Serialize)]
struct SignableInput<'a> {
    outpoint: &'a Outpoint,
    sig: (),
}

#[derive(Serialize)]
struct SignableTransaction<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    inputs: Option<Vec<SignableInput<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u64>,
    outputs: &'a [TxOutput],
}

impl Block {
    pub fn check_format(&self) -> Result<(), ProtocolError> {
        for txid in &self.txids {
            if !is_hex(txid, 64) {
                return Err(ProtocolError::format("block txid is not 64-hex"));
            }
        }
        if !is_hex(&self.nonce, 64) {
            return Err(ProtocolError::format("block nonce is not 64-hex"));
        }
        if let Some(previd) = &self.previd.0 {
            if !is_hex(previd, 64) {
                return Err(ProtocolError::format("block previd is not 64-hex"));
            }
        }
        if self.target != POW_TARGET {
            return Err(ProtocolError::format("block target is not the network target"));
        }
        if let Some(miner) = &self.miner {
            check_annotation(miner, "miner")?;
        }
        if let Some(note) = &self.note {
            check_annotation(note, "note")?;
        }
        if let Some(studentids) = &self.studentids {
            if studentids.len() > MAX_STUDENT_IDS {
                return Err(ProtocolError::format("too many studentids"));
            }
            for id in studentids {
                check_annotation(id, "studentid")?;
            }
        }
        Ok(())
    }
}

impl Object {
    /// The object id: Blake2s-256 of the canonical serialization.
    pub fn id(&self) -> Result<Hash256, ProtocolError> {
        let value = self.to_value()?;
        Ok(hash::object_id(&value))
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        serde_json::to_value(self).map_err(|err| ProtocolError::internal(err.to_string()))
    }

    pub fn check_format(&self) -> Result<(), ProtocolError> {
        match self {
            Object::Transaction(tx) => tx.check_format(),
            Object::Block(block) => block.check_format(),
        }
    }
}

/// Ed25519 verification of `sig_hex` over `message` with the 32-byte
/// `pubkey_hex` key. Any decode failure counts as a bad signature; the hex
/// shape was already enforced by the format checks.
pub fn verify_signature(pubkey_hex: &str, sig_hex: &str, message: &[u8]) -> bool {
    let Ok(pubkey_bytes) = hex::decode(pubkey_hex) else {
        return false;
    };
    let Ok(pubkey_array) = <[u8; 32]>::try_from(pubkey_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pubkey_array) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);
    verifying_key.verify_strict(message, &signature).is_ok()
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn check_annotation(value: &str, what: &str) -> Result<(), ProtocolError> {
    if value.len() > MAX_NOTE_LENGTH || !value.bytes().all(|b| (0x20..0x7f).contains(&b)) {
        return Err(ProtocolError::new(
            ErrorCode::InvalidFormat,
            format!("{what} must be printable ASCII of at most {MAX_NOTE_LENGTH} chars"),
        ));
    }
    Ok(())
}
