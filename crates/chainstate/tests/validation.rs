use std::future::Future;
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use marabud_chainstate::state::{ChainState, ChainTip};
use marabud_chainstate::utxo::view_from_entries;
use marabud_chainstate::validation::{
    now_secs, validate_block, validate_transaction, BlockOutcome, ObjectProvider, TipChange,
};
use marabud_consensus::constants::{BLOCK_REWARD, POW_TARGET};
use marabud_consensus::params::{chain_params, ChainParams};
use marabud_consensus::{hash256_to_hex, ErrorCode, Hash256, ProtocolError};
use marabud_primitives::{Block, Object, Outpoint, PrevId, Transaction, TxInput, TxOutput};
use marabud_storage::memory::MemoryStore;

type TestState = ChainState<MemoryStore>;

fn state() -> TestState {
    ChainState::new(Arc::new(MemoryStore::new()))
}

/// Provider that resolves against the store only; tests stage every
/// dependency up front.
struct StoreOnly<'a>(&'a TestState);

impl ObjectProvider for StoreOnly<'_> {
    fn ensure(
        &self,
        id: &Hash256,
    ) -> impl Future<Output = Result<Object, ProtocolError>> + Send {
        let result = match self.0.object(id) {
            Ok(Some(object)) => Ok(object),
            Ok(None) => Err(ProtocolError::new(
                ErrorCode::UnfindableObject,
                "object not in store",
            )),
            Err(err) => Err(ProtocolError::internal(err.to_string())),
        };
        async move { result }
    }
}

/// Params with proof-of-work relaxed so test blocks need no mining, and
/// the genesis id pinned to the test chain's root.
fn test_params(genesis_id: Hash256) -> ChainParams {
    let mut params = chain_params();
    params.genesis_id = genesis_id;
    params.pow_target = [0xff; 32];
    params
}

fn keypair(seed: u8) -> (SigningKey, String) {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let pubkey = hex::encode(key.verifying_key().to_bytes());
    (key, pubkey)
}

fn coinbase(pubkey: &str, value: u64, height: u64) -> Transaction {
    Transaction {
        inputs: None,
        height: Some(height),
        outputs: vec![TxOutput {
            pubkey: pubkey.to_string(),
            value,
        }],
    }
}

fn signed_spend(
    key: &SigningKey,
    sources: &[(Hash256, u64)],
    outputs: &[(String, u64)],
) -> Transaction {
    let mut tx = Transaction {
        inputs: Some(
            sources
                .iter()
                .map(|(txid, index)| TxInput {
                    outpoint: Outpoint {
                        txid: hash256_to_hex(txid),
                        index: *index,
                    },
                    sig: "00".repeat(64),
                })
                .collect(),
        ),
        height: None,
        outputs: outputs
            .iter()
            .map(|(pubkey, value)| TxOutput {
                pubkey: pubkey.clone(),
                value: *value,
            })
            .collect(),
    };
    let message = tx.signable_bytes().expect("signable");
    let sig = hex::encode(key.sign(&message).to_bytes());
    for input in tx.inputs.as_mut().expect("inputs") {
        input.sig = sig.clone();
    }
    tx
}

fn block(previd: Option<&Hash256>, created: u64, txids: &[Hash256]) -> Block {
    Block {
        txids: txids.iter().map(hash256_to_hex).collect(),
        nonce: "0".repeat(64),
        previd: PrevId(previd.map(hash256_to_hex)),
        created,
        target: POW_TARGET.to_string(),
        miner: None,
        note: None,
        studentids: None,
    }
}

fn store_tx(state: &TestState, tx: &Transaction) -> Hash256 {
    let object = Object::Transaction(tx.clone());
    let id = object.id().expect("id");
    state.put_object(&id, &object).expect("put");
    id
}

async fn accept_block(
    state: &TestState,
    params: &ChainParams,
    block: &Block,
) -> Result<(Hash256, BlockOutcome), ProtocolError> {
    let object = Object::Block(block.clone());
    let id = object.id()?;
    let outcome = validate_block(state, params, &id, block, &StoreOnly(state)).await?;
    state
        .put_object(&id, &object)
        .map_err(|err| ProtocolError::internal(err.to_string()))?;
    Ok((id, outcome))
}

fn genesis_fixture() -> (TestState, ChainParams, Block, Hash256) {
    let state = state();
    let genesis = block(None, 1_000, &[]);
    let genesis_id = Object::Block(genesis.clone()).id().expect("id");
    let params = test_params(genesis_id);
    (state, params, genesis, genesis_id)
}

#[tokio::test]
async fn genesis_accepted_as_tip() {
    let (state, params, genesis, genesis_id) = genesis_fixture();
    let (id, outcome) = accept_block(&state, &params, &genesis).await.expect("accept");

    assert_eq!(id, genesis_id);
    assert_eq!(outcome.height, 0);
    assert!(matches!(
        outcome.tip,
        TipChange::Advanced { old: None, .. }
    ));

    let tip = state.chaintip().expect("chaintip").expect("some tip");
    assert_eq!(tip.hash, genesis_id);
    assert_eq!(tip.height, 0);
    assert!(state.utxo_set(&genesis_id).expect("utxo").expect("set").is_empty());
}

#[tokio::test]
async fn foreign_root_rejected() {
    let (state, params, _, _) = genesis_fixture();
    let impostor = block(None, 2_000, &[]);
    let err = accept_block(&state, &params, &impostor).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidGenesis);
}

#[tokio::test]
async fn pow_target_enforced() {
    let (state, mut params, genesis, _) = genesis_fixture();
    params.pow_target = [0x00; 32];
    let err = accept_block(&state, &params, &genesis).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidBlockPow);
}

#[tokio::test]
async fn future_blocks_rejected() {
    let (state, params, _, genesis_id) = genesis_fixture();
    let future = block(Some(&genesis_id), now_secs() + 3_600, &[]);
    let err = accept_block(&state, &params, &future).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidBlockTimestamp);
}

#[tokio::test]
async fn child_must_be_created_after_parent() {
    let (state, params, genesis, genesis_id) = genesis_fixture();
    accept_block(&state, &params, &genesis).await.expect("genesis");

    let stale = block(Some(&genesis_id), genesis.created, &[]);
    let err = accept_block(&state, &params, &stale).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidBlockTimestamp);
}

#[tokio::test]
async fn missing_parent_is_unfindable() {
    let (state, params, _, _) = genesis_fixture();
    let orphan = block(Some(&[0x42; 32]), 1_500, &[]);
    let err = accept_block(&state, &params, &orphan).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UnfindableObject);
}

#[test]
fn spend_of_unknown_transaction_rejected() {
    let state = state();
    let (key, pubkey) = keypair(1);
    let tx = signed_spend(&key, &[([0x33; 32], 0)], &[(pubkey, 10)]);
    let err = validate_transaction(&state, &tx).unwrap_err();
    assert_eq!(err.code, ErrorCode::UnknownObject);
}

#[test]
fn outpoint_index_must_be_in_range() {
    let state = state();
    let (key, pubkey) = keypair(1);
    let source = store_tx(&state, &coinbase(&pubkey, 100, 0));
    let tx = signed_spend(&key, &[(source, 1)], &[(pubkey, 10)]);
    let err = validate_transaction(&state, &tx).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidTxOutpoint);
}

#[test]
fn signature_validates_and_mutation_fails() {
    let state = state();
    let (key, pubkey) = keypair(1);
    let source = store_tx(&state, &coinbase(&pubkey, 100, 0));

    let tx = signed_spend(&key, &[(source, 0)], &[(pubkey.clone(), 90)]);
    validate_transaction(&state, &tx).expect("valid spend");

    let mut mutated = tx.clone();
    let inputs = mutated.inputs.as_mut().expect("inputs");
    let mut sig = std::mem::take(&mut inputs[0].sig).into_bytes();
    sig[0] = if sig[0] == b'0' { b'1' } else { b'0' };
    inputs[0].sig = String::from_utf8(sig).expect("hex");
    let err = validate_transaction(&state, &mutated).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidTxSignature);
}

#[test]
fn wrong_key_signature_rejected() {
    let state = state();
    let (_, pubkey) = keypair(1);
    let (other_key, _) = keypair(2);
    let source = store_tx(&state, &coinbase(&pubkey, 100, 0));
    let tx = signed_spend(&other_key, &[(source, 0)], &[(pubkey, 90)]);
    let err = validate_transaction(&state, &tx).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidTxSignature);
}

#[test]
fn conservation_enforced() {
    let state = state();
    let (key, pubkey) = keypair(1);
    let source = store_tx(&state, &coinbase(&pubkey, 100, 0));

    let overspend = signed_spend(&key, &[(source, 0)], &[(pubkey.clone(), 101)]);
    let err = validate_transaction(&state, &overspend).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidTxConservation);

    let doubled = signed_spend(&key, &[(source, 0), (source, 0)], &[(pubkey, 150)]);
    let err = validate_transaction(&state, &doubled).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidTxConservation);
}

#[tokio::test]
async fn coinbase_chain_with_fees() {
    let (state, params, genesis, genesis_id) = genesis_fixture();
    accept_block(&state, &params, &genesis).await.expect("genesis");

    let (key, pubkey) = keypair(1);
    let cb1 = coinbase(&pubkey, BLOCK_REWARD, 1);
    let cb1_id = store_tx(&state, &cb1);
    let b1 = block(Some(&genesis_id), 1_001, &[cb1_id]);
    let (b1_id, outcome) = accept_block(&state, &params, &b1).await.expect("b1");
    assert_eq!(outcome.height, 1);

    // Spend the first coinbase, paying a fee of 10 that the second
    // coinbase claims on top of the subsidy.
    let fee = 10;
    let spend = signed_spend(&key, &[(cb1_id, 0)], &[(pubkey.clone(), BLOCK_REWARD - fee)]);
    validate_transaction(&state, &spend).expect("spend");
    let spend_id = store_tx(&state, &spend);

    let cb2 = coinbase(&pubkey, BLOCK_REWARD + fee, 2);
    let cb2_id = store_tx(&state, &cb2);
    let b2 = block(Some(&b1_id), 1_002, &[cb2_id, spend_id]);
    let (b2_id, outcome) = accept_block(&state, &params, &b2).await.expect("b2");
    assert_eq!(outcome.height, 2);

    let tip = state.chaintip().expect("chaintip").expect("tip");
    assert_eq!(tip.hash, b2_id);
    assert_eq!(tip.height, 2);

    let entries = state.utxo_set(&b2_id).expect("utxo").expect("set");
    let view = view_from_entries(&entries);
    assert_eq!(view.len(), 2);
    assert_eq!(
        view.get(&Outpoint {
            txid: hash256_to_hex(&cb2_id),
            index: 0
        }),
        Some(&(BLOCK_REWARD + fee))
    );
    assert_eq!(
        view.get(&Outpoint {
            txid: hash256_to_hex(&spend_id),
            index: 0
        }),
        Some(&(BLOCK_REWARD - fee))
    );
}

#[tokio::test]
async fn coinbase_height_must_match_block_height() {
    let (state, params, genesis, genesis_id) = genesis_fixture();
    accept_block(&state, &params, &genesis).await.expect("genesis");

    let (_, pubkey) = keypair(1);
    let cb = store_tx(&state, &coinbase(&pubkey, BLOCK_REWARD, 5));
    let b1 = block(Some(&genesis_id), 1_001, &[cb]);
    let err = accept_block(&state, &params, &b1).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidBlockCoinbase);
}

#[tokio::test]
async fn coinbase_value_capped_at_reward_plus_fees() {
    let (state, params, genesis, genesis_id) = genesis_fixture();
    accept_block(&state, &params, &genesis).await.expect("genesis");

    let (_, pubkey) = keypair(1);
    let cb = store_tx(&state, &coinbase(&pubkey, BLOCK_REWARD + 1, 1));
    let b1 = block(Some(&genesis_id), 1_001, &[cb]);
    let err = accept_block(&state, &params, &b1).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidBlockCoinbase);
}

#[tokio::test]
async fn coinbase_must_be_first() {
    let (state, params, genesis, genesis_id) = genesis_fixture();
    accept_block(&state, &params, &genesis).await.expect("genesis");

    let (key, pubkey) = keypair(1);
    let cb1 = store_tx(&state, &coinbase(&pubkey, BLOCK_REWARD, 1));
    let b1 = block(Some(&genesis_id), 1_001, &[cb1]);
    let (b1_id, _) = accept_block(&state, &params, &b1).await.expect("b1");

    let spend = signed_spend(&key, &[(cb1, 0)], &[(pubkey.clone(), BLOCK_REWARD)]);
    let spend_id = store_tx(&state, &spend);
    let cb2 = store_tx(&state, &coinbase(&pubkey, BLOCK_REWARD, 2));
    let b2 = block(Some(&b1_id), 1_002, &[spend_id, cb2]);
    let err = accept_block(&state, &params, &b2).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidBlockCoinbase);
}

#[tokio::test]
async fn double_spend_within_block_rejected() {
    let (state, params, genesis, genesis_id) = genesis_fixture();
    accept_block(&state, &params, &genesis).await.expect("genesis");

    let (key, pubkey) = keypair(1);
    let cb1 = store_tx(&state, &coinbase(&pubkey, BLOCK_REWARD, 1));
    let b1 = block(Some(&genesis_id), 1_001, &[cb1]);
    let (b1_id, _) = accept_block(&state, &params, &b1).await.expect("b1");

    let first = signed_spend(&key, &[(cb1, 0)], &[(pubkey.clone(), BLOCK_REWARD)]);
    let second = signed_spend(&key, &[(cb1, 0)], &[(pubkey.clone(), BLOCK_REWARD - 1)]);
    let first_id = store_tx(&state, &first);
    let second_id = store_tx(&state, &second);

    let b2 = block(Some(&b1_id), 1_002, &[first_id, second_id]);
    let err = accept_block(&state, &params, &b2).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidTxOutpoint);
}

#[tokio::test]
async fn coinbase_spent_in_same_block_rejected() {
    let (state, params, genesis, genesis_id) = genesis_fixture();
    accept_block(&state, &params, &genesis).await.expect("genesis");

    let (key, pubkey) = keypair(1);
    let cb = coinbase(&pubkey, BLOCK_REWARD, 1);
    let cb_id = store_tx(&state, &cb);
    let spend = signed_spend(&key, &[(cb_id, 0)], &[(pubkey.clone(), BLOCK_REWARD)]);
    let spend_id = store_tx(&state, &spend);

    let b1 = block(Some(&genesis_id), 1_001, &[cb_id, spend_id]);
    let err = accept_block(&state, &params, &b1).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidTxOutpoint);
}

#[test]
fn tip_advance_is_compare_and_set() {
    let state = state();
    let low = ChainTip {
        hash: [0x02; 32],
        block: block(Some(&[0x01; 32]), 1_001, &[]),
        height: 2,
    };
    let high = ChainTip {
        hash: [0x03; 32],
        block: block(Some(&[0x02; 32]), 1_002, &[]),
        height: 3,
    };
    assert!(state.advance_tip(&high).expect("advance").is_some());

    // A concurrently validated lower block re-compares against the
    // committed tip and must not displace it.
    assert!(state.advance_tip(&low).expect("advance").is_none());
    let tip = state.chaintip().expect("chaintip").expect("tip");
    assert_eq!(tip.hash, high.hash);

    // The displaced tip comes back for mempool reconciliation.
    let higher = ChainTip {
        hash: [0x04; 32],
        block: block(Some(&[0x03; 32]), 1_003, &[]),
        height: 4,
    };
    let displaced = state
        .advance_tip(&higher)
        .expect("advance")
        .flatten()
        .expect("displaced tip");
    assert_eq!(displaced.hash, high.hash);
}

#[tokio::test]
async fn equal_height_keeps_incumbent_tip() {
    let (state, params, genesis, genesis_id) = genesis_fixture();
    accept_block(&state, &params, &genesis).await.expect("genesis");

    let (_, pubkey_a) = keypair(1);
    let (_, pubkey_b) = keypair(2);
    let cb_a = store_tx(&state, &coinbase(&pubkey_a, BLOCK_REWARD, 1));
    let cb_b = store_tx(&state, &coinbase(&pubkey_b, BLOCK_REWARD, 1));

    let b1a = block(Some(&genesis_id), 1_001, &[cb_a]);
    let (b1a_id, _) = accept_block(&state, &params, &b1a).await.expect("b1a");

    let b1b = block(Some(&genesis_id), 1_002, &[cb_b]);
    let (_, outcome) = accept_block(&state, &params, &b1b).await.expect("b1b");
    assert!(matches!(outcome.tip, TipChange::Unchanged));

    let tip = state.chaintip().expect("chaintip").expect("tip");
    assert_eq!(tip.hash, b1a_id);
}

#[tokio::test]
async fn reorganization_reports_forgotten_transactions() {
    let (state, params, genesis, genesis_id) = genesis_fixture();
    accept_block(&state, &params, &genesis).await.expect("genesis");

    let (key, pubkey) = keypair(1);
    let (_, pubkey_prime) = keypair(2);

    // Old branch: G -> A -> B, where B carries a regular spend.
    let cb_a = store_tx(&state, &coinbase(&pubkey, BLOCK_REWARD, 1));
    let block_a = block(Some(&genesis_id), 1_001, &[cb_a]);
    let (a_id, _) = accept_block(&state, &params, &block_a).await.expect("A");

    let spend = signed_spend(&key, &[(cb_a, 0)], &[(pubkey.clone(), BLOCK_REWARD)]);
    let spend_id = store_tx(&state, &spend);
    let cb_b = store_tx(&state, &coinbase(&pubkey, BLOCK_REWARD, 2));
    let block_b = block(Some(&a_id), 1_002, &[cb_b, spend_id]);
    let (_, outcome) = accept_block(&state, &params, &block_b).await.expect("B");
    let TipChange::Advanced { new: tip_b, .. } = outcome.tip else {
        panic!("B should advance the tip");
    };

    // New branch: G -> A' -> B' -> C', longer than the old one.
    let cb_a2 = store_tx(&state, &coinbase(&pubkey_prime, BLOCK_REWARD, 1));
    let block_a2 = block(Some(&genesis_id), 1_001, &[cb_a2]);
    let (a2_id, _) = accept_block(&state, &params, &block_a2).await.expect("A'");

    let cb_b2 = store_tx(&state, &coinbase(&pubkey_prime, BLOCK_REWARD, 2));
    let block_b2 = block(Some(&a2_id), 1_002, &[cb_b2]);
    let (b2_id, _) = accept_block(&state, &params, &block_b2).await.expect("B'");

    let cb_c2 = store_tx(&state, &coinbase(&pubkey_prime, BLOCK_REWARD, 3));
    let block_c2 = block(Some(&b2_id), 1_003, &[cb_c2]);
    let (c2_id, outcome) = accept_block(&state, &params, &block_c2).await.expect("C'");

    let TipChange::Advanced { old, new } = outcome.tip else {
        panic!("C' should advance the tip");
    };
    let old = old.expect("previous tip");
    assert_eq!(old.hash, tip_b.hash);
    assert_eq!(new.hash, c2_id);
    assert_eq!(new.height, 3);

    // Only the regular spend comes back; coinbases are never offered.
    let forgotten = state.branch_transactions(&old, &new).expect("branch walk");
    let ids: Vec<Hash256> = forgotten.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![spend_id]);
}
