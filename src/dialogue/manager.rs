//! Session registry.
//!
//! The manager only holds handles. Each session's state lives in its own
//! task and is reached through that task's bounded command channel, so a
//! slow session never blocks lookups for the others.

use crate::dialogue::session::SessionSnapshot;
use crate::error::{BuddyError, Result};
use crate::pipeline::controller::{
    SessionCommand, SessionInput, SessionRuntime, SessionTask, spawn_session,
};
use crate::pipeline::messages::{SessionId, Slots};
use crate::pipeline::turn::TurnRecord;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

#[derive(Debug)]
struct SessionHandle {
    channel: String,
    task: SessionTask,
}

impl SessionHandle {
    fn is_alive(&self) -> bool {
        !self.task.command_tx.is_closed() && !self.task.join.is_finished()
    }
}

#[derive(Debug, Default)]
struct Registry {
    sessions: HashMap<SessionId, SessionHandle>,
    by_channel: HashMap<String, SessionId>,
}

impl Registry {
    /// Forget sessions whose task has exited.
    fn prune(&mut self) {
        let dead: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, handle)| !handle.is_alive())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(handle) = self.sessions.remove(&id) {
                self.by_channel.remove(&handle.channel);
                debug!(session_id = %id, channel = %handle.channel, "session handle pruned");
            }
        }
    }
}

/// Creates sessions and routes requests to their tasks.
#[derive(Debug)]
pub struct SessionManager {
    runtime: Arc<SessionRuntime>,
    registry: Mutex<Registry>,
}

impl SessionManager {
    #[must_use]
    pub fn new(runtime: Arc<SessionRuntime>) -> Self {
        Self {
            runtime,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Open a session for `channel`, or return the live one it already has.
    ///
    /// # Errors
    ///
    /// `BuddyError::Channel` if the registry lock is poisoned.
    pub fn create_session(&self, channel: &str) -> Result<SessionId> {
        let mut registry = self.lock()?;
        registry.prune();
        if let Some(id) = registry.by_channel.get(channel) {
            return Ok(*id);
        }
        let id = SessionId::new();
        let task = spawn_session(Arc::clone(&self.runtime), id, channel);
        registry.sessions.insert(
            id,
            SessionHandle {
                channel: channel.to_owned(),
                task,
            },
        );
        registry.by_channel.insert(channel.to_owned(), id);
        info!(session_id = %id, channel, "session created");
        Ok(id)
    }

    /// Sender for frontend input into a session.
    ///
    /// # Errors
    ///
    /// `BuddyError::SessionExpired` if the session is gone.
    pub fn input(&self, session_id: SessionId) -> Result<mpsc::Sender<SessionInput>> {
        let registry = self.lock()?;
        registry
            .sessions
            .get(&session_id)
            .filter(|h| h.is_alive())
            .map(|h| h.task.input_tx.clone())
            .ok_or_else(|| expired(session_id))
    }

    /// The session's current context slots.
    ///
    /// # Errors
    ///
    /// `BuddyError::SessionExpired` if the session is gone.
    pub async fn get_context(&self, session_id: SessionId) -> Result<Slots> {
        self.request(session_id, SessionCommand::GetContext).await
    }

    /// The session's retained turn history, oldest first.
    ///
    /// # Errors
    ///
    /// `BuddyError::SessionExpired` if the session is gone.
    pub async fn history(&self, session_id: SessionId) -> Result<Vec<TurnRecord>> {
        self.request(session_id, SessionCommand::History).await
    }

    /// Append a finalized record to the session's history.
    ///
    /// # Errors
    ///
    /// `BuddyError::SessionExpired` if the session is gone.
    pub async fn commit_turn(&self, session_id: SessionId, record: TurnRecord) -> Result<()> {
        let record = Box::new(record);
        self.request(session_id, |reply| SessionCommand::CommitTurn(record, reply))
            .await
    }

    /// Point-in-time view of a session.
    ///
    /// # Errors
    ///
    /// `BuddyError::SessionExpired` if the session is gone.
    pub async fn snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot> {
        self.request(session_id, SessionCommand::Snapshot).await
    }

    /// Cancel any in-flight turn and destroy the session.
    ///
    /// # Errors
    ///
    /// `BuddyError::SessionExpired` if the session was already gone.
    pub async fn expire(&self, session_id: SessionId) -> Result<()> {
        self.request(session_id, SessionCommand::Expire).await?;
        if let Ok(mut registry) = self.registry.lock()
            && let Some(handle) = registry.sessions.remove(&session_id)
        {
            registry.by_channel.remove(&handle.channel);
        }
        Ok(())
    }

    /// Ids of sessions whose task is still running.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let Ok(mut registry) = self.registry.lock() else {
            return Vec::new();
        };
        registry.prune();
        let mut ids: Vec<SessionId> = registry.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Whether a client is currently receiving this session's events.
    #[must_use]
    pub fn is_connected(&self, session_id: SessionId) -> bool {
        self.runtime.bus.is_connected(session_id)
    }

    /// Live session bound to `channel`, if any.
    #[must_use]
    pub fn session_for_channel(&self, channel: &str) -> Option<SessionId> {
        let mut registry = self.registry.lock().ok()?;
        registry.prune();
        registry.by_channel.get(channel).copied()
    }

    /// Cancel every session and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = match self.registry.lock() {
            Ok(mut registry) => {
                registry.by_channel.clear();
                registry.sessions.drain().map(|(_, h)| h).collect()
            }
            Err(_) => Vec::new(),
        };
        info!(sessions = handles.len(), "shutting down sessions");
        for handle in &handles {
            handle.task.cancel.cancel();
        }
        for handle in handles {
            let _ = handle.task.join.await;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| BuddyError::Channel("session registry poisoned".to_owned()))
    }

    async fn request<T>(
        &self,
        session_id: SessionId,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let command_tx = {
            let registry = self.lock()?;
            registry
                .sessions
                .get(&session_id)
                .map(|h| h.task.command_tx.clone())
                .ok_or_else(|| expired(session_id))?
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| expired(session_id))?;
        reply_rx.await.map_err(|_| expired(session_id))
    }
}

fn expired(session_id: SessionId) -> BuddyError {
    BuddyError::SessionExpired(session_id.to_string())
}
