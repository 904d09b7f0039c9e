//! The mempool: non-coinbase transactions applicable atop the chaintip.

use marabud_chainstate::state::{ChainState, ChainStateError, ChainTip};
use marabud_chainstate::utxo::{apply_transaction, view_from_entries, UtxoView};
use marabud_consensus::{hash256_to_hex, ErrorCode, Hash256, ProtocolError};
use marabud_primitives::Transaction;
use marabud_storage::KeyValueStore;

/// Ordered transaction ids plus the UTXO view they were applied against.
/// The view always equals the chaintip's stored set with every listed
/// transaction applied in order. The transaction list is not durable: a
/// restarted node begins with an empty list atop the tip's set.
pub struct Mempool {
    txs: Vec<Hash256>,
    view: UtxoView,
}

impl Mempool {
    pub fn bootstrap<S: KeyValueStore>(state: &ChainState<S>) -> Result<Self, ChainStateError> {
        let view = match state.chaintip()? {
            Some(tip) => {
                let entries = state.utxo_set(&tip.hash)?.ok_or_else(|| {
                    ChainStateError::Corrupt("chaintip has no stored UTXO set".to_string())
                })?;
                view_from_entries(&entries)
            }
            None => UtxoView::new(),
        };
        Ok(Self {
            txs: Vec::new(),
            view,
        })
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.txs.clone()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Admits an accepted non-coinbase transaction. Fails with
    /// `INVALID_TX_OUTPOINT` when the transaction conflicts with the
    /// mempool view even though it validated against the chain.
    pub fn add(&mut self, id: Hash256, tx: &Transaction) -> Result<(), ProtocolError> {
        if self.txs.contains(&id) {
            return Ok(());
        }
        apply_transaction(&mut self.view, &hash256_to_hex(&id), tx)?;
        self.txs.push(id);
        Ok(())
    }

    /// Rebuilds the mempool after the chaintip moved from `old` to `new`:
    /// transactions from abandoned blocks are offered back first, then the
    /// previous mempool, each silently dropped when no longer applicable.
    /// State is only swapped in once the whole replay succeeded, so a
    /// failure leaves the previous mempool intact.
    pub fn reorganize<S: KeyValueStore>(
        &mut self,
        state: &ChainState<S>,
        old: Option<&ChainTip>,
        new: &ChainTip,
    ) -> Result<(), ChainStateError> {
        let mut to_apply = match old {
            Some(old) => state.branch_transactions(old, new)?,
            None => Vec::new(),
        };
        for id in &self.txs {
            let tx = state.transaction(id)?.ok_or_else(|| {
                ChainStateError::Corrupt(format!(
                    "mempool transaction {} not in store",
                    hash256_to_hex(id)
                ))
            })?;
            to_apply.push((*id, tx));
        }

        let entries = state.utxo_set(&new.hash)?.ok_or_else(|| {
            ChainStateError::Corrupt("new chaintip has no stored UTXO set".to_string())
        })?;
        let mut view = view_from_entries(&entries);
        let mut txs = Vec::with_capacity(to_apply.len());
        for (id, tx) in &to_apply {
            match apply_transaction(&mut view, &hash256_to_hex(id), tx) {
                Ok(_) => txs.push(*id),
                Err(err) if err.code == ErrorCode::InvalidTxOutpoint => {}
                Err(err) => {
                    return Err(ChainStateError::Corrupt(format!(
                        "mempool replay of {}: {err}",
                        hash256_to_hex(id)
                    )));
                }
            }
        }

        self.txs = txs;
        self.view = view;
        Ok(())
    }
}
