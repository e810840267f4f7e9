//! In-process fixtures for exercising a cluster without a real network.

use std::collections::HashMap;
use std::collections::HashSet;

use anyerror::AnyError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use parking_lot::RwLock;
use prost::Message as _;
use std::sync::Arc;

use crate::message::Message;
use crate::network::Transporter;
use crate::state_machine::StateMachine;
use crate::Entry;
use crate::NodeId;
use crate::Raft;

/// Routes messages between co-located nodes, with per-node isolation to
/// simulate partitions.
#[derive(Default)]
pub struct Router {
    targets: RwLock<HashMap<NodeId, Raft>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl Router {
    pub fn new() -> Arc<Router> {
        Arc::new(Router::default())
    }

    pub fn register(&self, id: NodeId, raft: Raft) {
        self.targets.write().insert(id, raft);
    }

    /// Cut every link to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        self.isolated.write().insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.isolated.write().remove(&id);
    }

    fn blocked(&self, a: NodeId, b: NodeId) -> bool {
        let isolated = self.isolated.read();
        isolated.contains(&a) || isolated.contains(&b)
    }
}

/// The per-node transport endpoint over a shared [`Router`].
pub struct RouterTransport {
    id: NodeId,
    router: Arc<Router>,
}

impl RouterTransport {
    pub fn new(id: NodeId, router: Arc<Router>) -> Arc<RouterTransport> {
        Arc::new(RouterTransport { id, router })
    }
}

#[async_trait]
impl Transporter for RouterTransport {
    async fn send(&self, message: Message) -> Result<(), AnyError> {
        let to = message.to;
        if self.router.blocked(self.id, to) {
            return Err(AnyError::error(format!("link {} -> {} is down", self.id, to)));
        }

        let target = self.router.targets.read().get(&to).cloned();
        match target {
            Some(raft) => {
                raft.handle_message(message);
                Ok(())
            }
            None => Err(AnyError::error(format!("unknown peer {to}"))),
        }
    }
}

/// Snapshot body format of [`MemStateMachine`].
#[derive(Clone, PartialEq, ::prost::Message)]
struct MemSnapshot {
    #[prost(message, repeated, tag = "1")]
    entries: Vec<Entry>,
}

/// A state machine that remembers every applied entry.
#[derive(Default)]
pub struct MemStateMachine {
    entries: Mutex<Vec<Entry>>,
    fail_next_apply: Mutex<bool>,
}

impl MemStateMachine {
    pub fn new() -> Arc<MemStateMachine> {
        Arc::new(MemStateMachine::default())
    }

    /// Payloads applied so far, in order.
    pub fn applied_data(&self) -> Vec<Bytes> {
        self.entries.lock().iter().map(|e| e.data.clone()).collect()
    }

    pub fn applied_entries(&self) -> Vec<Entry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Make the next `apply` call fail once.
    pub fn fail_next_apply(&self) {
        *self.fail_next_apply.lock() = true;
    }
}

#[async_trait]
impl StateMachine for MemStateMachine {
    async fn apply(&self, entries: &[Entry]) -> Result<(), AnyError> {
        let mut fail = self.fail_next_apply.lock();
        if *fail {
            *fail = false;
            return Err(AnyError::error("injected apply failure"));
        }
        drop(fail);

        self.entries.lock().extend_from_slice(entries);
        Ok(())
    }

    async fn apply_snapshot(&self, data: Bytes) -> Result<(), AnyError> {
        let decoded = MemSnapshot::decode(data).map_err(|e| AnyError::new(&e))?;
        *self.entries.lock() = decoded.entries;
        Ok(())
    }

    async fn snapshot(&self) -> Result<Bytes, AnyError> {
        let blob = MemSnapshot {
            entries: self.entries.lock().clone(),
        };
        Ok(Bytes::from(blob.encode_to_vec()))
    }
}
