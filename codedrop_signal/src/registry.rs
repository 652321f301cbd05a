//! The pairing table: which connection holds which side of each code.

use std::collections::HashMap;

use axum::extract::ws::Message;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use codedrop_core::wire::Role;

/// One registered socket: its connection id and its outbound queue.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub conn_id: Uuid,
    pub tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// The two slots behind one transfer code.
#[derive(Debug, Default)]
struct Pair {
    sender: Option<PeerHandle>,
    receiver: Option<PeerHandle>,
}

impl Pair {
    fn slot(&self, role: Role) -> &Option<PeerHandle> {
        match role {
            Role::Sender => &self.sender,
            Role::Receiver => &self.receiver,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<PeerHandle> {
        match role {
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        }
    }

    fn is_empty(&self) -> bool {
        self.sender.is_none() && self.receiver.is_none()
    }
}

/// What [`Registry::register`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The slot was claimed; `peer_present` says whether the other side is
    /// already waiting.
    Registered { peer_present: bool },
    /// Another live connection already holds this role under this code.
    Conflict,
}

/// Code-to-pair map shared by every socket task.
#[derive(Debug, Default)]
pub struct Registry {
    pairs: RwLock<HashMap<String, Pair>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `role` under `code` for `handle`.
    ///
    /// Re-registering the same connection is a no-op, and a slot whose
    /// socket has since closed can be taken over without waiting for its
    /// task to finish cleanup.
    pub async fn register(&self, code: &str, role: Role, handle: PeerHandle) -> RegisterOutcome {
        let mut pairs = self.pairs.write().await;
        let pair = pairs.entry(code.to_string()).or_default();
        if let Some(existing) = pair.slot(role) {
            if existing.conn_id != handle.conn_id {
                if existing.is_open() {
                    return RegisterOutcome::Conflict;
                }
                tracing::debug!("replacing dead {} slot under {}", role, code);
            }
        }
        let peer_present = pair
            .slot(role.other())
            .as_ref()
            .is_some_and(PeerHandle::is_open);
        *pair.slot_mut(role) = Some(handle);
        RegisterOutcome::Registered { peer_present }
    }

    /// Hands `message` to the other socket under `code`. Returns whether a
    /// live peer accepted it.
    pub async fn relay_to_peer(&self, code: &str, from: Uuid, message: Message) -> bool {
        let target = {
            let pairs = self.pairs.read().await;
            let Some(pair) = pairs.get(code) else {
                return false;
            };
            [&pair.sender, &pair.receiver]
                .into_iter()
                .flatten()
                .find(|handle| handle.conn_id != from)
                .cloned()
        };
        match target {
            Some(handle) => handle.tx.send(message).await.is_ok(),
            None => false,
        }
    }

    /// Clears every slot held by `conn_id` under `code`, dropping the pair
    /// entry once both sides are gone.
    pub async fn deregister(&self, code: &str, conn_id: Uuid) {
        let mut pairs = self.pairs.write().await;
        if let Some(pair) = pairs.get_mut(code) {
            for slot in [&mut pair.sender, &mut pair.receiver] {
                if slot.as_ref().is_some_and(|handle| handle.conn_id == conn_id) {
                    *slot = None;
                }
            }
            if pair.is_empty() {
                pairs.remove(code);
            }
        }
    }

    /// How many codes currently have at least one socket registered.
    pub async fn active_codes(&self) -> usize {
        self.pairs.read().await.len()
    }
}
