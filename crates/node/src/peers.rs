//! Known-peer bookkeeping and the outbound dialer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marabud_chainstate::validation::now_secs;
use marabud_storage::KeyValueStore;
use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::session::{run_session, NodeCtx};

const DIAL_TIMEOUT_SECS: u64 = 5;
const DIAL_INTERVAL_SECS: u64 = 30;
const ATTEMPT_SPACING_SECS: u64 = 10;

#[derive(Clone, Copy, Debug, Default)]
struct AddrEntry {
    last_seen: u64,
    last_attempt: u64,
    failures: u32,
}

/// Known "host:port" strings with enough bookkeeping to pace dials.
#[derive(Default)]
pub struct AddrBook {
    entries: Mutex<HashMap<String, AddrEntry>>,
}

impl AddrBook {
    pub fn insert(&self, addr: String) -> bool {
        let now = now_secs();
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let entry = entries.entry(addr).or_default();
        let fresh = entry.last_seen == 0;
        entry.last_seen = now;
        fresh
    }

    pub fn insert_many(&self, addrs: impl IntoIterator<Item = String>) -> usize {
        addrs.into_iter().filter(|addr| self.insert(addr.clone())).count()
    }

    pub fn sample(&self, limit: usize) -> Vec<String> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let mut addrs: Vec<String> = entries.keys().cloned().collect();
        drop(entries);
        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(limit);
        addrs
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn record_attempt(&self, addr: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(addr) {
                entry.last_attempt = now_secs();
            }
        }
    }

    pub fn record_success(&self, addr: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(addr) {
                entry.last_seen = now_secs();
                entry.failures = 0;
            }
        }
    }

    pub fn record_failure(&self, addr: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(addr) {
                entry.failures = entry.failures.saturating_add(1);
            }
        }
    }

    fn dial_candidates(&self, limit: usize, connected: &HashSet<String>) -> Vec<String> {
        let now = now_secs();
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let mut eligible: Vec<String> = entries
            .iter()
            .filter(|(addr, entry)| {
                !connected.contains(*addr)
                    && now.saturating_sub(entry.last_attempt) >= ATTEMPT_SPACING_SECS
                    && now >= entry.last_attempt.saturating_add(failure_cooldown_secs(entry.failures))
            })
            .map(|(addr, _)| addr.clone())
            .collect();
        drop(entries);
        eligible.shuffle(&mut rand::thread_rng());
        eligible.truncate(limit);
        eligible
    }
}

fn failure_cooldown_secs(failures: u32) -> u64 {
    if failures == 0 {
        return 0;
    }
    let failures = failures.min(10);
    5u64.saturating_mul(2u64.saturating_pow(failures)).min(3600)
}

/// Tracks live outbound connections and wakes the dial loop when new
/// peers are learned.
pub struct Dialer {
    pub target: usize,
    connected: Mutex<HashSet<String>>,
    pub kick: Notify,
}

impl Dialer {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            connected: Mutex::new(HashSet::new()),
            kick: Notify::new(),
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connected.lock().map(|set| set.len()).unwrap_or(0)
    }

    fn reserve(&self, addr: &str) -> bool {
        self.connected
            .lock()
            .map(|mut set| set.insert(addr.to_string()))
            .unwrap_or(false)
    }

    fn release(&self, addr: &str) {
        if let Ok(mut set) = self.connected.lock() {
            set.remove(addr);
        }
    }

    fn snapshot(&self) -> HashSet<String> {
        self.connected.lock().map(|set| set.clone()).unwrap_or_default()
    }
}

/// Keeps the number of outgoing connections at the configured target.
/// Failed dials are logged and cooled down, not retried eagerly.
pub async fn dial_loop<S: KeyValueStore + 'static>(ctx: Arc<NodeCtx<S>>) {
    loop {
        let connected = ctx.dialer.snapshot();
        let need = ctx.dialer.target.saturating_sub(connected.len());
        if need > 0 {
            for addr in ctx.addr_book.dial_candidates(need, &connected) {
                if !ctx.dialer.reserve(&addr) {
                    continue;
                }
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    dial_one(ctx, addr).await;
                });
            }
        }

        tokio::select! {
            _ = ctx.dialer.kick.notified() => {}
            _ = tokio::time::sleep(Duration::from_secs(DIAL_INTERVAL_SECS)) => {}
        }
    }
}

async fn dial_one<S: KeyValueStore + 'static>(ctx: Arc<NodeCtx<S>>, addr: String) {
    ctx.addr_book.record_attempt(&addr);
    let stream = timeout(
        Duration::from_secs(DIAL_TIMEOUT_SECS),
        TcpStream::connect(&addr),
    )
    .await;
    match stream {
        Ok(Ok(stream)) => {
            info!(peer = %addr, "connected");
            ctx.addr_book.record_success(&addr);
            run_session(Arc::clone(&ctx), stream, addr.clone()).await;
            debug!(peer = %addr, "session ended");
        }
        Ok(Err(err)) => {
            debug!(peer = %addr, %err, "dial failed");
            ctx.addr_book.record_failure(&addr);
        }
        Err(_) => {
            debug!(peer = %addr, "dial timed out");
            ctx.addr_book.record_failure(&addr);
        }
    }
    ctx.dialer.release(&addr);
}
