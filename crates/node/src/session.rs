//! Per-peer sessions: handshake, line framing and message dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marabud_chainstate::state::ChainState;
use marabud_chainstate::validation::{validate_block, validate_transaction, TipChange};
use marabud_chainstate::ObjectProvider;
use marabud_consensus::constants::{
    version_acceptable, HELLO_TIMEOUT_SECS, MAX_MESSAGE_BYTES, PARTIAL_LINE_TIMEOUT_SECS,
};
use marabud_consensus::{hash256_from_hex, hash256_to_hex, ChainParams, ErrorCode, ProtocolError};
use marabud_primitives::Object;
use marabud_storage::KeyValueStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::fetcher::Fetcher;
use crate::mempool::Mempool;
use crate::messages::{
    normalize_peer_addr, ChainTipMsg, GetChainTipMsg, GetMempoolMsg, GetPeersMsg, MempoolMsg,
    Message, PeersMsg,
};
use crate::peers::{AddrBook, Dialer};

const READ_CHUNK_BYTES: usize = 4096;
const IDLE_RECHECK_SECS: u64 = 3600;
const MAX_PEERS_REPLY: usize = 100;

/// Everything a session needs, shared across all sessions.
pub struct NodeCtx<S> {
    pub params: Arc<ChainParams>,
    pub state: Arc<ChainState<S>>,
    pub mempool: Mutex<Mempool>,
    pub fetcher: Arc<Fetcher<S>>,
    pub hub: Arc<Hub>,
    pub addr_book: AddrBook,
    pub dialer: Dialer,
}

/// Registry of live, handshaken sessions, addressed by their outbound
/// queues. Gossip iterates the registry under a short lock.
#[derive(Default)]
pub struct Hub {
    sessions: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn register(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(id, sender);
        }
        id
    }

    pub fn unregister(&self, id: u64) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&id);
        }
    }

    pub fn broadcast(&self, message: &Message) {
        let senders: Vec<mpsc::UnboundedSender<Message>> = match self.sessions.lock() {
            Ok(sessions) => sessions.values().cloned().collect(),
            Err(_) => return,
        };
        for sender in senders {
            let _ = sender.send(message.clone());
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }
}

fn internal(err: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::internal(err.to_string())
}

/// Drives one peer connection from handshake to close. Used for inbound
/// and outbound connections alike; both sides open with `hello` and the
/// initial requests.
pub async fn run_session<S: KeyValueStore + 'static>(
    ctx: Arc<NodeCtx<S>>,
    stream: TcpStream,
    peer: String,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (close_tx, mut close_rx) = watch::channel(false);

    let writer_peer = peer.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let mut line = match message.encode() {
                Ok(line) => line,
                Err(err) => {
                    warn!(peer = %writer_peer, %err, "dropping unencodable message");
                    continue;
                }
            };
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        ctx: Arc::clone(&ctx),
        out: out_tx,
        close: close_tx,
        peer: peer.clone(),
        handshaken: false,
        hub_id: None,
    };

    // Entry actions: greet and ask for everything we track.
    session.send(Message::hello());
    session.send(Message::GetPeers(GetPeersMsg {}));
    session.send(Message::GetChainTip(GetChainTipMsg {}));
    session.send(Message::GetMempool(GetMempoolMsg {}));

    let connected_at = Instant::now();
    let mut last_progress = Instant::now();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_BYTES];

    'session: loop {
        let (deadline, times_out) = if !session.handshaken {
            (connected_at + Duration::from_secs(HELLO_TIMEOUT_SECS), true)
        } else if !buf.is_empty() {
            (
                last_progress + Duration::from_secs(PARTIAL_LINE_TIMEOUT_SECS),
                true,
            )
        } else {
            (Instant::now() + Duration::from_secs(IDLE_RECHECK_SECS), false)
        };

        tokio::select! {
            result = reader.read(&mut chunk) => {
                match result {
                    Ok(0) => {
                        debug!(peer = %peer, "peer closed the connection");
                        break 'session;
                    }
                    Ok(count) => {
                        buf.extend_from_slice(&chunk[..count]);
                        last_progress = Instant::now();
                    }
                    Err(err) => {
                        debug!(peer = %peer, %err, "read failed");
                        break 'session;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                if times_out {
                    session.fail(ProtocolError::format("timed out"));
                    break 'session;
                }
                continue 'session;
            }
            _ = close_rx.changed() => {
                break 'session;
            }
        }

        while let Some(position) = buf.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = buf.drain(..=position).collect();
            let line = &line[..line.len() - 1];
            if line.len() > MAX_MESSAGE_BYTES {
                session.fail(ProtocolError::format("message exceeds size limit"));
                break 'session;
            }
            let Ok(text) = std::str::from_utf8(line) else {
                session.fail(ProtocolError::format("message is not UTF-8"));
                break 'session;
            };
            if let Err(err) = session.handle_line(text).await {
                let closes = err.closes_connection();
                session.fail(err);
                if closes {
                    break 'session;
                }
            }
        }
        if buf.len() > MAX_MESSAGE_BYTES {
            session.fail(ProtocolError::format("message exceeds size limit"));
            break 'session;
        }
    }

    if let Some(id) = session.hub_id {
        ctx.hub.unregister(id);
    }
    drop(session);
    let _ = writer_task.await;
}

struct Session<S> {
    ctx: Arc<NodeCtx<S>>,
    out: mpsc::UnboundedSender<Message>,
    close: watch::Sender<bool>,
    peer: String,
    handshaken: bool,
    hub_id: Option<u64>,
}

impl<S: KeyValueStore + 'static> Session<S> {
    fn send(&self, message: Message) {
        let _ = self.out.send(message);
    }

    fn fail(&self, err: ProtocolError) {
        if err.code == ErrorCode::InternalError {
            warn!(peer = %self.peer, %err, "internal error");
        } else {
            debug!(peer = %self.peer, %err, "protocol error");
        }
        self.send(Message::error(&err));
    }

    async fn handle_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        let message = Message::decode(line)?;

        if !self.handshaken {
            let Message::Hello(hello) = message else {
                return Err(ProtocolError::new(
                    ErrorCode::InvalidHandshake,
                    "expected hello before any other message",
                ));
            };
            if !version_acceptable(&hello.version) {
                return Err(ProtocolError::format(format!(
                    "unsupported protocol version {}",
                    hello.version
                )));
            }
            info!(
                peer = %self.peer,
                agent = hello.agent.as_deref().unwrap_or(""),
                "handshake complete"
            );
            self.handshaken = true;
            self.hub_id = Some(self.ctx.hub.register(self.out.clone()));
            return Ok(());
        }

        match message {
            Message::Hello(_) => {}
            Message::Error(err) => {
                warn!(
                    peer = %self.peer,
                    name = %err.name,
                    description = err.description.as_deref().unwrap_or(""),
                    "peer reported an error"
                );
            }
            Message::GetPeers(_) => {
                let peers = self.ctx.addr_book.sample(MAX_PEERS_REPLY);
                self.send(Message::Peers(PeersMsg { peers }));
            }
            Message::Peers(msg) => {
                let mut added = 0;
                for raw in &msg.peers {
                    if let Some(addr) = normalize_peer_addr(raw) {
                        if self.ctx.addr_book.insert(addr) {
                            added += 1;
                        }
                    }
                }
                if added > 0 {
                    debug!(peer = %self.peer, added, "learned peers");
                    self.ctx.dialer.kick.notify_one();
                }
            }
            Message::GetObject(msg) => {
                let id = hash256_from_hex(&msg.objectid)
                    .ok_or_else(|| ProtocolError::format("objectid is not 64-hex"))?;
                match self.ctx.state.object(&id).map_err(internal)? {
                    Some(object) => self.send(Message::object(object)),
                    None => self.send(Message::error(&ProtocolError::new(
                        ErrorCode::UnknownObject,
                        format!("object {} not known", msg.objectid),
                    ))),
                }
            }
            Message::IHaveObject(msg) => {
                let id = hash256_from_hex(&msg.objectid)
                    .ok_or_else(|| ProtocolError::format("objectid is not 64-hex"))?;
                if !self.ctx.state.object_exists(&id).map_err(internal)? {
                    self.send(Message::getobject(&id));
                }
            }
            Message::Object(msg) => {
                let object = msg.object;
                match object {
                    Object::Transaction(_) => self.intake_transaction(object)?,
                    Object::Block(_) => {
                        // Block validation suspends on ancestor fetches; run
                        // it off the session loop so this peer can keep
                        // serving the objects it is asked for.
                        let ctx = Arc::clone(&self.ctx);
                        let out = self.out.clone();
                        let close = self.close.clone();
                        let peer = self.peer.clone();
                        tokio::spawn(async move {
                            if let Err(err) = intake_block(&ctx, &object).await {
                                if err.code == ErrorCode::InternalError {
                                    warn!(peer = %peer, %err, "block intake failed");
                                } else {
                                    debug!(peer = %peer, %err, "rejected block");
                                }
                                let _ = out.send(Message::error(&err));
                                if err.closes_connection() {
                                    let _ = close.send(true);
                                }
                            }
                        });
                    }
                }
            }
            Message::GetChainTip(_) => {
                if let Some(tip) = self.ctx.state.chaintip().map_err(internal)? {
                    self.send(Message::ChainTip(ChainTipMsg {
                        blockid: hash256_to_hex(&tip.hash),
                    }));
                }
            }
            Message::ChainTip(msg) => {
                let id = hash256_from_hex(&msg.blockid)
                    .ok_or_else(|| ProtocolError::format("blockid is not 64-hex"))?;
                let ctx = Arc::clone(&self.ctx);
                let peer = self.peer.clone();
                tokio::spawn(async move {
                    if let Err(err) = ctx.fetcher.ensure(&id).await {
                        debug!(peer = %peer, %err, "announced chaintip not fetchable");
                    }
                });
            }
            Message::GetMempool(_) => {
                let txids = {
                    let mempool = self
                        .ctx
                        .mempool
                        .lock()
                        .map_err(|_| internal("mempool lock poisoned"))?;
                    mempool.txids()
                };
                let txids = txids.iter().map(hash256_to_hex).collect();
                self.send(Message::Mempool(MempoolMsg { txids }));
            }
            Message::Mempool(msg) => {
                for txid in &msg.txids {
                    let id = hash256_from_hex(txid)
                        .ok_or_else(|| ProtocolError::format("mempool txid is not 64-hex"))?;
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        let _ = ctx.fetcher.ensure(&id).await;
                    });
                }
            }
        }
        Ok(())
    }

    /// Transaction intake: validate, store, resolve waiters, gossip, and
    /// offer to the mempool. A transaction that is valid against the chain
    /// but conflicts with the mempool surfaces `INVALID_TX_OUTPOINT` on
    /// this session.
    fn intake_transaction(&self, object: Object) -> Result<(), ProtocolError> {
        object.check_format()?;
        let id = object.id()?;
        let Object::Transaction(tx) = &object else {
            return Err(internal("transaction intake of a non-transaction"));
        };

        let newly_stored = if self.ctx.state.object_exists(&id).map_err(internal)? {
            false
        } else {
            validate_transaction(&self.ctx.state, tx)?;
            self.ctx.state.put_object(&id, &object).map_err(internal)?
        };
        self.ctx.fetcher.deliver(&id, &object);

        if newly_stored {
            debug!(peer = %self.peer, id = %hash256_to_hex(&id), "stored transaction");
            self.ctx.hub.broadcast(&Message::ihaveobject(&id));
            if !tx.is_coinbase() {
                let mut mempool = self
                    .ctx
                    .mempool
                    .lock()
                    .map_err(|_| internal("mempool lock poisoned"))?;
                mempool.add(id, tx)?;
            }
        }
        Ok(())
    }
}

/// Block intake, run as its own task: validate (fetching ancestors and
/// transactions as needed), store, resolve waiters, gossip, and
/// reconcile the mempool when the chaintip advanced.
async fn intake_block<S: KeyValueStore + 'static>(
    ctx: &Arc<NodeCtx<S>>,
    object: &Object,
) -> Result<(), ProtocolError> {
    object.check_format()?;
    let id = object.id()?;
    let Object::Block(block) = object else {
        return Err(internal("block intake of a non-block"));
    };

    if ctx.state.object_exists(&id).map_err(internal)? {
        ctx.fetcher.deliver(&id, object);
        return Ok(());
    }

    let outcome = validate_block(&ctx.state, &ctx.params, &id, block, ctx.fetcher.as_ref()).await?;
    ctx.state.put_object(&id, object).map_err(internal)?;
    ctx.fetcher.deliver(&id, object);
    info!(
        id = %hash256_to_hex(&id),
        height = outcome.height,
        "accepted block"
    );
    ctx.hub.broadcast(&Message::ihaveobject(&id));

    if let TipChange::Advanced { old, new } = outcome.tip {
        info!(height = new.height, tip = %hash256_to_hex(&new.hash), "chaintip advanced");
        let result = {
            let mut mempool = ctx
                .mempool
                .lock()
                .map_err(|_| internal("mempool lock poisoned"))?;
            mempool.reorganize(&ctx.state, old.as_ref(), &new)
        };
        if let Err(err) = result {
            // The previous mempool stays in place; this is the internal
            // error path of the reorganization.
            warn!(%err, "mempool reorganization failed");
        }
    }
    Ok(())
}
