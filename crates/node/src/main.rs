mod fetcher;
mod mempool;
mod messages;
mod peers;
mod session;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marabud_chainstate::state::ChainState;
use marabud_consensus::constants::{DEFAULT_PEER_TARGET, DEFAULT_PORT, OBJECT_FETCH_TIMEOUT_SECS};
use marabud_consensus::params::chain_params;
use marabud_storage::fjall::FjallStore;
use marabud_storage::memory::MemoryStore;
use marabud_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::fetcher::Fetcher;
use crate::mempool::Mempool;
use crate::messages::normalize_peer_addr;
use crate::peers::{dial_loop, AddrBook, Dialer};
use crate::session::{run_session, Hub, NodeCtx};

const DEFAULT_DATA_DIR: &str = "data";
const STATUS_INTERVAL_SECS: u64 = 60;

#[derive(Clone, Copy, Debug)]
enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

struct Config {
    backend: Backend,
    data_dir: PathBuf,
    listen_port: u16,
    peer_target: usize,
    bootstrap_peers: Vec<String>,
}

enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }

    fn exists(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        match self {
            Store::Memory(store) => store.exists(column, key),
            Store::Fjall(store) => store.exists(column, key),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = parse_args()?;
    let params = Arc::new(chain_params());

    let store = match config.backend {
        Backend::Memory => Store::Memory(MemoryStore::new()),
        Backend::Fjall => {
            let db_path = config.data_dir.join("db");
            std::fs::create_dir_all(&config.data_dir).map_err(|err| err.to_string())?;
            Store::Fjall(FjallStore::open(&db_path).map_err(|err| err.to_string())?)
        }
    };
    let state = Arc::new(ChainState::new(Arc::new(store)));

    let mempool = Mempool::bootstrap(state.as_ref()).map_err(|err| err.to_string())?;
    if let Some(tip) = state.chaintip().map_err(|err| err.to_string())? {
        info!(
            height = tip.height,
            tip = %marabud_consensus::hash256_to_hex(&tip.hash),
            "loaded chaintip"
        );
    }

    let hub = Arc::new(Hub::default());
    let fetcher = Arc::new(Fetcher::new(
        Arc::clone(&state),
        Arc::clone(&hub),
        Duration::from_secs(OBJECT_FETCH_TIMEOUT_SECS),
    ));

    let addr_book = AddrBook::default();
    let seeded = addr_book.insert_many(config.bootstrap_peers.iter().cloned());
    if seeded > 0 {
        info!(peers = seeded, "seeded address book");
    }

    let ctx = Arc::new(NodeCtx {
        params,
        state,
        mempool: Mutex::new(mempool),
        fetcher,
        hub,
        addr_book,
        dialer: Dialer::new(config.peer_target),
    });

    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(dial_loop(ctx));
    }
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(status_loop(ctx));
    }

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|err| format!("failed to bind listener {bind_addr}: {err}"))?;
    info!(%bind_addr, "listening");

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        debug!(peer = %remote_addr, "inbound connection");
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            run_session(ctx, stream, remote_addr.to_string()).await;
        });
    }
}

async fn status_loop(ctx: Arc<NodeCtx<Store>>) {
    loop {
        tokio::time::sleep(Duration::from_secs(STATUS_INTERVAL_SECS)).await;
        let (height, mempool_size) = {
            let height = ctx
                .state
                .chaintip()
                .ok()
                .flatten()
                .map(|tip| tip.height)
                .unwrap_or(-1);
            let size = ctx.mempool.lock().map(|mempool| mempool.len()).unwrap_or(0);
            (height, size)
        };
        info!(
            height,
            sessions = ctx.hub.session_count(),
            outbound = ctx.dialer.connected_count(),
            known_peers = ctx.addr_book.len(),
            mempool = mempool_size,
            "status"
        );
    }
}

fn usage() -> String {
    [
        "usage: marabud [options]",
        "  --backend <memory|fjall>   storage backend (default fjall)",
        "  --data-dir <path>          database directory (default data)",
        "  --listen <port>            P2P listen port (default 18018)",
        "  --peer <host:port>         bootstrap peer, repeatable",
        "  --peer-target <count>      outgoing connection target (default 8)",
    ]
    .join("\n")
}

fn parse_args() -> Result<Config, String> {
    let mut backend = Backend::Fjall;
    let mut data_dir = PathBuf::from(DEFAULT_DATA_DIR);
    let mut listen_port = DEFAULT_PORT;
    let mut peer_target = DEFAULT_PEER_TARGET;
    let mut bootstrap_peers: Vec<String> = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backend" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --backend\n{}", usage()))?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                data_dir = PathBuf::from(value);
            }
            "--listen" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --listen\n{}", usage()))?;
                listen_port = value
                    .parse()
                    .map_err(|_| format!("invalid port '{value}'\n{}", usage()))?;
            }
            "--peer" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --peer\n{}", usage()))?;
                let addr = normalize_peer_addr(&value)
                    .ok_or_else(|| format!("invalid peer '{value}'\n{}", usage()))?;
                bootstrap_peers.push(addr);
            }
            "--peer-target" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --peer-target\n{}", usage()))?;
                peer_target = value
                    .parse()
                    .map_err(|_| format!("invalid count '{value}'\n{}", usage()))?;
            }
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    Ok(Config {
        backend,
        data_dir,
        listen_port,
        peer_target,
        bootstrap_peers,
    })
}
