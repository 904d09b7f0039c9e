//! Consensus-wide constants shared across validation.

/// Subsidy minted by a block's coinbase, in picocoin (network rule).
pub const BLOCK_REWARD: u64 = 50_000_000_000_000;

/// Block id of the hard-coded genesis block.
pub const GENESIS_BLOCK_ID: &str =
    "0000000052a0e645eca917ae1c196e0d0a4fb756747f29ef52594d68484bb5e2";

/// The fixed proof-of-work target every block must carry verbatim.
pub const POW_TARGET: &str = "00000000abc00000000000000000000000000000000000000000000000000000";

/// Protocol version announced in `hello`.
pub const PROTOCOL_VERSION: &str = "0.9.0";

/// Agent string announced in `hello`.
pub const AGENT: &str = "Marabud 0.9.0";

/// Default P2P listen port; also the port assumed for peers announced
/// without one.
pub const DEFAULT_PORT: u16 = 18018;

/// The maximum allowed length of one wire line, in bytes (network rule).
pub const MAX_MESSAGE_BYTES: usize = 100 * 1024;

/// Seconds a fresh connection may stay silent before `hello` must have
/// arrived.
pub const HELLO_TIMEOUT_SECS: u64 = 30;

/// Seconds a partial line may sit in the read buffer without progress.
pub const PARTIAL_LINE_TIMEOUT_SECS: u64 = 10;

/// Seconds to wait for a peer to deliver a requested object.
pub const OBJECT_FETCH_TIMEOUT_SECS: u64 = 5;

/// Default number of outgoing connections the dialer maintains.
pub const DEFAULT_PEER_TARGET: usize = 8;

/// Accepts any remote protocol version of the `0.9.x` family.
pub fn version_acceptable(version: &str) -> bool {
    let Some(rest) = version.strip_prefix("0.9.") else {
        return false;
    };
    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
}
