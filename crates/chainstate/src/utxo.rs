//! UTXO set logic: persisted per-block sets and in-memory views.

use std::collections::HashMap;

use marabud_consensus::{ErrorCode, ProtocolError};
use marabud_primitives::{Outpoint, Transaction};
use serde::{Deserialize, Serialize};

/// One unspent output in a block's post-state set. Sets are persisted as
/// JSON arrays sorted by (txid, index), which the field order encodes.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct UtxoEntry {
    pub txid: String,
    pub index: u64,
    pub value: u64,
}

/// A mutable view of a UTXO set, keyed by outpoint.
pub type UtxoView = HashMap<Outpoint, u64>;

pub fn view_from_entries(entries: &[UtxoEntry]) -> UtxoView {
    entries
        .iter()
        .map(|entry| {
            (
                Outpoint {
                    txid: entry.txid.clone(),
                    index: entry.index,
                },
                entry.value,
            )
        })
        .collect()
}

pub fn entries_from_view(view: &UtxoView) -> Vec<UtxoEntry> {
    let mut entries: Vec<UtxoEntry> = view
        .iter()
        .map(|(outpoint, value)| UtxoEntry {
            txid: outpoint.txid.clone(),
            index: outpoint.index,
            value: *value,
        })
        .collect();
    entries.sort();
    entries
}

/// Applies a regular transaction to a view: every input's UTXO must be
/// present and is removed, every output becomes a new UTXO. Returns the
/// transaction's fee. The view is untouched when the transaction does not
/// apply, so a failed application can be skipped or surfaced without
/// rebuilding it.
pub fn apply_transaction(
    view: &mut UtxoView,
    txid_hex: &str,
    tx: &Transaction,
) -> Result<u64, ProtocolError> {
    let mut total_in: u64 = 0;
    for input in tx.inputs() {
        let value = view.get(&input.outpoint).copied().ok_or_else(|| {
            ProtocolError::new(
                ErrorCode::InvalidTxOutpoint,
                format!(
                    "outpoint {}:{} is not unspent",
                    input.outpoint.txid, input.outpoint.index
                ),
            )
        })?;
        total_in = total_in.checked_add(value).ok_or_else(|| {
            ProtocolError::new(ErrorCode::InvalidTxConservation, "input value overflow")
        })?;
    }

    let mut total_out: u64 = 0;
    for output in &tx.outputs {
        total_out = total_out.checked_add(output.value).ok_or_else(|| {
            ProtocolError::new(ErrorCode::InvalidTxConservation, "output value overflow")
        })?;
    }
    let fee = total_in.checked_sub(total_out).ok_or_else(|| {
        ProtocolError::new(
            ErrorCode::InvalidTxConservation,
            "outputs exceed resolved inputs",
        )
    })?;

    for input in tx.inputs() {
        view.remove(&input.outpoint);
    }
    for (index, output) in tx.outputs.iter().enumerate() {
        view.insert(
            Outpoint {
                txid: txid_hex.to_string(),
                index: index as u64,
            },
            output.value,
        );
    }
    Ok(fee)
}
