//! Object fetcher: resolves ids against the store, or requests them from
//! every live peer and waits for delivery.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marabud_chainstate::state::ChainState;
use marabud_chainstate::validation::ObjectProvider;
use marabud_consensus::{hash256_to_hex, ErrorCode, Hash256, ProtocolError};
use marabud_primitives::Object;
use marabud_storage::KeyValueStore;
use tokio::sync::broadcast;

use crate::messages::Message;
use crate::session::Hub;

const WAITER_QUEUE: usize = 4;

pub struct Fetcher<S> {
    state: Arc<ChainState<S>>,
    hub: Arc<Hub>,
    waiters: Mutex<HashMap<Hash256, broadcast::Sender<Object>>>,
    timeout: Duration,
}

impl<S: KeyValueStore> Fetcher<S> {
    pub fn new(state: Arc<ChainState<S>>, hub: Arc<Hub>, timeout: Duration) -> Self {
        Self {
            state,
            hub,
            waiters: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Resolves every waiter registered for `id`. Sessions call this after
    /// an object passed validation and reached the store; resolving an id
    /// nobody waits for is a no-op, and racing deliveries are harmless
    /// (first one wins, the store put is idempotent).
    pub fn deliver(&self, id: &Hash256, object: &Object) {
        let sender = match self.waiters.lock() {
            Ok(mut waiters) => waiters.remove(id),
            Err(_) => None,
        };
        if let Some(sender) = sender {
            let _ = sender.send(object.clone());
        }
    }

    async fn ensure_inner(&self, id: Hash256) -> Result<Object, ProtocolError> {
        if let Some(object) = self.state.object(&id).map_err(internal)? {
            return Ok(object);
        }

        let mut receiver = {
            let mut waiters = self
                .waiters
                .lock()
                .map_err(|_| ProtocolError::internal("fetcher lock poisoned"))?;
            waiters
                .entry(id)
                .or_insert_with(|| broadcast::channel(WAITER_QUEUE).0)
                .subscribe()
        };

        self.hub.broadcast(&Message::getobject(&id));

        // An object delivered between the store probe and the subscription
        // above never reaches this waiter; probe once more before parking.
        if let Some(object) = self.state.object(&id).map_err(internal)? {
            return Ok(object);
        }

        let result = tokio::time::timeout(self.timeout, receiver.recv()).await;
        drop(receiver);
        match result {
            Ok(Ok(object)) => Ok(object),
            _ => {
                if let Ok(mut waiters) = self.waiters.lock() {
                    let idle = waiters
                        .get(&id)
                        .map(|sender| sender.receiver_count() == 0)
                        .unwrap_or(false);
                    if idle {
                        waiters.remove(&id);
                    }
                }
                Err(ProtocolError::new(
                    ErrorCode::UnfindableObject,
                    format!("object {} could not be fetched", hash256_to_hex(&id)),
                ))
            }
        }
    }
}

impl<S: KeyValueStore> ObjectProvider for Fetcher<S> {
    fn ensure(&self, id: &Hash256) -> impl Future<Output = Result<Object, ProtocolError>> + Send {
        self.ensure_inner(*id)
    }
}

fn internal(err: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::internal(err.to_string())
}
