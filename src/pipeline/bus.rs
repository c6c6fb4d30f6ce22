//! In-process message routing between sessions, clients and observers.
//!
//! Two kinds of traffic go through the bus:
//!
//! - **Client output**: each connected session owns a bounded mpsc channel.
//!   Publishers look the sender up under a short `std::sync::Mutex`, clone it
//!   and send after the lock is released. The receiving [`ClientEvents`]
//!   stamps the per-session `seq` as events are delivered, so sequence order
//!   always equals delivery order no matter how many tasks publish.
//! - **Observability**: a `broadcast` of [`RuntimeEvent`]s with a bounded
//!   replay history and delivery counters.

use crate::config::BusConfig;
use crate::pipeline::messages::{ClientEvent, ClientPayload, SessionId, TurnId};
use crate::runtime::RuntimeEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

#[derive(Debug)]
struct Outbound {
    turn_id: Option<TurnId>,
    payload: ClientPayload,
}

/// Receiving half of a session's client channel.
#[derive(Debug)]
pub struct ClientEvents {
    session_id: SessionId,
    rx: mpsc::Receiver<Outbound>,
    next_seq: u64,
}

impl ClientEvents {
    /// Session this stream belongs to.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Next event, or `None` once the session is gone and the channel drained.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        let outbound = self.rx.recv().await?;
        Some(self.stamp(outbound))
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        let outbound = self.rx.try_recv().ok()?;
        Some(self.stamp(outbound))
    }

    fn stamp(&mut self, outbound: Outbound) -> ClientEvent {
        self.next_seq += 1;
        ClientEvent {
            seq: self.next_seq,
            session_id: self.session_id,
            turn_id: outbound.turn_id,
            payload: outbound.payload,
        }
    }
}

/// Observability counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Runtime events emitted.
    pub published: u64,
    /// Runtime events that reached at least one subscriber.
    pub delivered: u64,
    /// Runtime events with no subscriber at emit time.
    pub dropped: u64,
    /// Client events that found their session disconnected.
    pub undeliverable: u64,
}

/// Routes client output per session and fans out runtime events.
#[derive(Debug)]
pub struct SessionEventBus {
    outbound: Mutex<HashMap<SessionId, mpsc::Sender<Outbound>>>,
    outbound_capacity: usize,
    runtime_tx: broadcast::Sender<RuntimeEvent>,
    history: Mutex<VecDeque<RuntimeEvent>>,
    max_history: usize,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    undeliverable: AtomicU64,
}

impl SessionEventBus {
    #[must_use]
    pub fn new(config: &BusConfig) -> Self {
        let (runtime_tx, _) = broadcast::channel(config.runtime_broadcast_size.max(1));
        Self {
            outbound: Mutex::new(HashMap::new()),
            outbound_capacity: config.outbound_channel_size.max(1),
            runtime_tx,
            history: Mutex::new(VecDeque::new()),
            max_history: config.max_history,
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            undeliverable: AtomicU64::new(0),
        }
    }

    /// Open the client channel of a session, replacing any previous one.
    pub fn register(&self, session_id: SessionId) -> ClientEvents {
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        if let Ok(mut map) = self.outbound.lock() {
            map.insert(session_id, tx);
        }
        debug!(session_id = %session_id, "client channel registered");
        ClientEvents {
            session_id,
            rx,
            next_seq: 0,
        }
    }

    /// Close the client channel of a session. Queued events stay readable.
    pub fn unregister(&self, session_id: SessionId) {
        if let Ok(mut map) = self.outbound.lock() {
            map.remove(&session_id);
        }
    }

    /// Whether the session's client is still listening.
    #[must_use]
    pub fn is_connected(&self, session_id: SessionId) -> bool {
        self.sender(session_id).is_some_and(|tx| !tx.is_closed())
    }

    fn sender(&self, session_id: SessionId) -> Option<mpsc::Sender<Outbound>> {
        self.outbound.lock().ok()?.get(&session_id).cloned()
    }

    /// Deliver an event to one session's client.
    ///
    /// Waits for channel capacity. Returns `false` when the session has no
    /// connected client.
    pub async fn publish_to_session(
        &self,
        session_id: SessionId,
        turn_id: Option<TurnId>,
        payload: ClientPayload,
    ) -> bool {
        let Some(tx) = self.sender(session_id) else {
            self.undeliverable.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        trace!(session_id = %session_id, event = payload.name(), "client event");
        if tx.send(Outbound { turn_id, payload }).await.is_err() {
            self.undeliverable.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Subscribe to runtime events emitted from now on.
    #[must_use]
    pub fn subscribe_runtime(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.runtime_tx.subscribe()
    }

    /// Emit a runtime event to subscribers and the replay history.
    pub fn emit(&self, event: RuntimeEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.max_history > 0
            && let Ok(mut history) = self.history.lock()
        {
            if history.len() >= self.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        match self.runtime_tx.send(event) {
            Ok(_) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Most recent runtime events, oldest first, optionally for one session.
    #[must_use]
    pub fn history(&self, session_id: Option<SessionId>, limit: usize) -> Vec<RuntimeEvent> {
        let Ok(history) = self.history.lock() else {
            return Vec::new();
        };
        let mut events: Vec<RuntimeEvent> = history
            .iter()
            .rev()
            .filter(|e| session_id.is_none_or(|id| e.session_id() == id))
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    /// Drop the replay history.
    pub fn clear_history(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            undeliverable: self.undeliverable.load(Ordering::Relaxed),
        }
    }
}
