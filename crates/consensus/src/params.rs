use crate::constants::{BLOCK_REWARD, DEFAULT_PORT, GENESIS_BLOCK_ID, POW_TARGET};
use crate::{hash256_from_hex, Hash256};

/// Network parameters fixed for the lifetime of the process.
#[derive(Clone, Debug)]
pub struct ChainParams {
    pub genesis_id: Hash256,
    pub pow_target: Hash256,
    pub block_reward: u64,
    pub default_port: u16,
}

pub fn chain_params() -> ChainParams {
    let genesis_id = hash256_from_hex(GENESIS_BLOCK_ID).expect("genesis id constant");
    let pow_target = hash256_from_hex(POW_TARGET).expect("pow target constant");
    ChainParams {
        genesis_id,
        pow_target,
        block_reward: BLOCK_REWARD,
        default_port: DEFAULT_PORT,
    }
}
