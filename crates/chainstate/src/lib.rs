//! Chainstate: object store, UTXO index, chaintip and validation.

pub mod state;
pub mod utxo;
pub mod validation;

pub use state::{ChainState, ChainStateError, ChainTip};
pub use utxo::{apply_transaction, entries_from_view, view_from_entries, UtxoEntry, UtxoView};
pub use validation::{
    now_secs, validate_block, validate_transaction, BlockOutcome, ObjectProvider, TipChange,
};
