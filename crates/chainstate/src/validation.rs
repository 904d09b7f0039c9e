//! Semantic validation of transactions and blocks.

use std::collections::HashSet;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use marabud_consensus::{
    hash256_from_hex, hash256_to_hex, ChainParams, ErrorCode, Hash256, ProtocolError,
};
use marabud_primitives::{verify_signature, Block, Object, Outpoint, Transaction};
use marabud_storage::KeyValueStore;
use rayon::prelude::*;

use crate::state::{ChainState, ChainTip};
use crate::utxo::{apply_transaction, entries_from_view, view_from_entries};

/// Capability to resolve an object id into an object, fetching it from the
/// network when the local store misses. Block validation depends on it;
/// the node's fetcher supplies the concrete implementation.
pub trait ObjectProvider: Sync {
    fn ensure(
        &self,
        id: &Hash256,
    ) -> impl Future<Output = Result<Object, ProtocolError>> + Send;
}

#[derive(Debug)]
pub enum TipChange {
    Unchanged,
    Advanced {
        old: Option<ChainTip>,
        new: ChainTip,
    },
}

#[derive(Debug)]
pub struct BlockOutcome {
    pub height: i64,
    pub tip: TipChange,
}

fn internal(err: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::internal(err.to_string())
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

/// Validates a transaction against the object store. Coinbase
/// transactions have no store-dependent rules beyond their shape.
pub fn validate_transaction<S: KeyValueStore>(
    state: &ChainState<S>,
    tx: &Transaction,
) -> Result<(), ProtocolError> {
    tx.check_format()?;
    if tx.is_coinbase() {
        return Ok(());
    }

    let inputs = tx.inputs();
    let mut resolved = Vec::with_capacity(inputs.len());
    for input in inputs {
        let source_id = hash256_from_hex(&input.outpoint.txid)
            .ok_or_else(|| ProtocolError::format("outpoint txid is not 64-hex"))?;
        let source = state
            .object(&source_id)
            .map_err(internal)?
            .ok_or_else(|| {
                ProtocolError::new(
                    ErrorCode::UnknownObject,
                    format!("outpoint transaction {} not known", input.outpoint.txid),
                )
            })?;
        let Object::Transaction(source_tx) = source else {
            return Err(ProtocolError::new(
                ErrorCode::InvalidTxOutpoint,
                "outpoint references a block",
            ));
        };
        let output = source_tx
            .outputs
            .get(input.outpoint.index as usize)
            .ok_or_else(|| {
                ProtocolError::new(
                    ErrorCode::InvalidTxOutpoint,
                    format!(
                        "outpoint index {} out of range",
                        input.outpoint.index
                    ),
                )
            })?;
        resolved.push(output.clone());
    }

    // Signature verification dominates transaction cost; fan it out when
    // there is more than one input to check.
    let message = tx.signable_bytes()?;
    let all_valid = if inputs.len() > 1 {
        inputs
            .par_iter()
            .zip(resolved.par_iter())
            .all(|(input, output)| verify_signature(&output.pubkey, &input.sig, &message))
    } else {
        inputs
            .iter()
            .zip(resolved.iter())
            .all(|(input, output)| verify_signature(&output.pubkey, &input.sig, &message))
    };
    if !all_valid {
        return Err(ProtocolError::new(
            ErrorCode::InvalidTxSignature,
            "input signature does not verify",
        ));
    }

    let mut seen: HashSet<&Outpoint> = HashSet::with_capacity(inputs.len());
    for input in inputs {
        if !seen.insert(&input.outpoint) {
            return Err(ProtocolError::new(
                ErrorCode::InvalidTxConservation,
                "duplicate outpoint",
            ));
        }
    }

    let mut total_in: u64 = 0;
    for output in &resolved {
        total_in = total_in.checked_add(output.value).ok_or_else(|| {
            ProtocolError::new(ErrorCode::InvalidTxConservation, "input value overflow")
        })?;
    }
    let mut total_out: u64 = 0;
    for output in &tx.outputs {
        total_out = total_out.checked_add(output.value).ok_or_else(|| {
            ProtocolError::new(ErrorCode::InvalidTxConservation, "output value overflow")
        })?;
    }
    if total_out > total_in {
        return Err(ProtocolError::new(
            ErrorCode::InvalidTxConservation,
            "outputs exceed inputs",
        ));
    }
    Ok(())
}

/// Validates a block, resolving its parent and transactions through
/// `provider`, replaying it on the parent's UTXO set, persisting the
/// post-state set, and advancing the chaintip when the block's height
/// exceeds the current tip's.
pub async fn validate_block<S, P>(
    state: &ChainState<S>,
    params: &ChainParams,
    id: &Hash256,
    block: &Block,
    provider: &P,
) -> Result<BlockOutcome, ProtocolError>
where
    S: KeyValueStore,
    P: ObjectProvider,
{
    block.check_format()?;

    if *id >= params.pow_target {
        return Err(ProtocolError::new(
            ErrorCode::InvalidBlockPow,
            "block hash does not meet the target",
        ));
    }
    if block.created > now_secs() {
        return Err(ProtocolError::new(
            ErrorCode::InvalidBlockTimestamp,
            "block timestamp is in the future",
        ));
    }

    let (parent_height, parent_entries) = match &block.previd.0 {
        None => {
            if *id != params.genesis_id {
                return Err(ProtocolError::new(
                    ErrorCode::InvalidGenesis,
                    "block without previd is not the genesis block",
                ));
            }
            (-1i64, Vec::new())
        }
        Some(prev_hex) => {
            let prev = hash256_from_hex(prev_hex)
                .ok_or_else(|| ProtocolError::format("previd is not 64-hex"))?;
            let Object::Block(parent) = provider.ensure(&prev).await? else {
                return Err(ProtocolError::format("previd references a transaction"));
            };
            if parent.created >= block.created {
                return Err(ProtocolError::new(
                    ErrorCode::InvalidBlockTimestamp,
                    "block not created after its parent",
                ));
            }
            let height = state.block_height(&prev, &parent).map_err(internal)?;
            let entries = state
                .utxo_set(&prev)
                .map_err(internal)?
                .ok_or_else(|| internal("missing UTXO set for stored parent"))?;
            (height, entries)
        }
    };

    let mut txs: Vec<(Hash256, Transaction)> = Vec::with_capacity(block.txids.len());
    for txid_hex in &block.txids {
        let txid = hash256_from_hex(txid_hex)
            .ok_or_else(|| ProtocolError::format("block txid is not 64-hex"))?;
        let Object::Transaction(tx) = provider.ensure(&txid).await? else {
            return Err(ProtocolError::format("block txid references a block"));
        };
        txs.push((txid, tx));
    }

    for (position, (_, tx)) in txs.iter().enumerate() {
        if position > 0 && tx.is_coinbase() {
            return Err(ProtocolError::new(
                ErrorCode::InvalidBlockCoinbase,
                "coinbase is not the first transaction",
            ));
        }
    }
    let coinbase = txs.first().filter(|(_, tx)| tx.is_coinbase());

    let mut view = view_from_entries(&parent_entries);
    let mut fees: u64 = 0;
    for (position, (txid, tx)) in txs.iter().enumerate() {
        if position == 0 && tx.is_coinbase() {
            let output = tx
                .outputs
                .first()
                .ok_or_else(|| ProtocolError::format("coinbase has no output"))?;
            view.insert(
                Outpoint {
                    txid: hash256_to_hex(txid),
                    index: 0,
                },
                output.value,
            );
            continue;
        }
        let fee = apply_transaction(&mut view, &hash256_to_hex(txid), tx)?;
        fees = fees.checked_add(fee).ok_or_else(|| {
            ProtocolError::new(ErrorCode::InvalidTxConservation, "fee overflow")
        })?;
    }

    if let Some((coinbase_id, coinbase_tx)) = coinbase {
        let outpoint = Outpoint {
            txid: hash256_to_hex(coinbase_id),
            index: 0,
        };
        if !view.contains_key(&outpoint) {
            return Err(ProtocolError::new(
                ErrorCode::InvalidTxOutpoint,
                "coinbase output spent within its own block",
            ));
        }
        let output = coinbase_tx
            .outputs
            .first()
            .ok_or_else(|| ProtocolError::format("coinbase has no output"))?;
        let budget = params
            .block_reward
            .checked_add(fees)
            .ok_or_else(|| internal("coinbase budget overflow"))?;
        if output.value > budget {
            return Err(ProtocolError::new(
                ErrorCode::InvalidBlockCoinbase,
                "coinbase value exceeds reward plus fees",
            ));
        }
        let expected = parent_height + 1;
        if coinbase_tx.height != Some(expected as u64) {
            return Err(ProtocolError::new(
                ErrorCode::InvalidBlockCoinbase,
                format!("coinbase height is not {expected}"),
            ));
        }
    }

    state
        .put_utxo_set(id, &entries_from_view(&view))
        .map_err(internal)?;
    let height = parent_height + 1;
    state.note_height(id, height);

    let candidate = ChainTip {
        hash: *id,
        block: block.clone(),
        height,
    };
    let tip = match state.advance_tip(&candidate).map_err(internal)? {
        Some(old) => TipChange::Advanced {
            old,
            new: candidate,
        },
        None => TipChange::Unchanged,
    };
    Ok(BlockOutcome { height, tip })
}
