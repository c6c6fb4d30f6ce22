//! Host command channel and router over the orchestrator.
//!
//! Text hosts address sessions by `channel` name. Each opened channel gets a
//! [`DeviceConnection`](crate::pipeline::coordinator::DeviceConnection) whose
//! client events are forwarded onto the shared event broadcast.

use crate::error::{BuddyError, Result};
use crate::host::contract::{CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope};
use crate::pipeline::coordinator::Orchestrator;
use crate::pipeline::messages::{DeviceInput, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct HostCommandRequest {
    envelope: CommandEnvelope,
    response_tx: oneshot::Sender<ResponseEnvelope>,
}

#[derive(Clone)]
pub struct HostCommandClient {
    request_tx: mpsc::Sender<HostCommandRequest>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl HostCommandClient {
    /// Validate and dispatch a command, waiting for its response.
    ///
    /// Command-level failures come back as `ok: false` responses carrying
    /// the request id; `Err` means the envelope was invalid or the server
    /// is gone.
    pub async fn send(&self, envelope: CommandEnvelope) -> Result<ResponseEnvelope> {
        envelope.validate().map_err(|e| {
            BuddyError::InvalidCommand(format!(
                "invalid host command envelope {}: {}",
                envelope.request_id, e
            ))
        })?;

        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(HostCommandRequest {
                envelope,
                response_tx,
            })
            .await
            .map_err(|e| BuddyError::Channel(format!("failed to send host command request: {e}")))?;

        response_rx
            .await
            .map_err(|e| BuddyError::Channel(format!("host command response dropped: {e}")))
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }
}

/// A channel opened through the bridge.
struct HostConnection {
    session_id: SessionId,
    input: mpsc::Sender<DeviceInput>,
    forwarder: JoinHandle<()>,
}

pub struct HostCommandServer {
    request_rx: mpsc::Receiver<HostCommandRequest>,
    event_tx: broadcast::Sender<EventEnvelope>,
    orchestrator: Arc<Orchestrator>,
    connections: HashMap<String, HostConnection>,
}

#[must_use]
pub fn command_channel(
    request_capacity: usize,
    event_capacity: usize,
    orchestrator: Arc<Orchestrator>,
) -> (HostCommandClient, HostCommandServer) {
    let (request_tx, request_rx) = mpsc::channel(request_capacity.max(1));
    let (event_tx, _event_rx) = broadcast::channel(event_capacity.max(1));

    (
        HostCommandClient {
            request_tx,
            event_tx: event_tx.clone(),
        },
        HostCommandServer {
            request_rx,
            event_tx,
            orchestrator,
            connections: HashMap::new(),
        },
    )
}

impl HostCommandServer {
    /// Serve requests until every client is dropped.
    pub async fn run(mut self) {
        while let Some(request) = self.request_rx.recv().await {
            let response = self.route(&request.envelope).await;
            let _ = request.response_tx.send(response);
        }
        for (_, connection) in self.connections.drain() {
            connection.forwarder.abort();
        }
    }

    /// Route a command envelope and render its outcome.
    pub async fn route(&mut self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        let request_id = envelope.request_id.clone();
        let outcome = match envelope.command {
            CommandName::HostPing => Ok(serde_json::json!({
                "pong": true,
                "contract_version": crate::host::contract::EVENT_VERSION,
            })),
            CommandName::SessionOpen => self.handle_session_open(envelope).await,
            CommandName::SessionText => self.handle_session_text(envelope).await,
            CommandName::SessionPushToTalk => self.handle_push_to_talk(envelope).await,
            CommandName::SessionClose => self.handle_session_close(envelope).await,
            CommandName::SessionContext => self.handle_session_context(envelope).await,
            CommandName::SessionHistory => self.handle_session_history(envelope).await,
            CommandName::SkillsList => self.handle_skills_list(envelope),
            CommandName::RuntimeStop => self.handle_runtime_stop().await,
        };
        match outcome {
            Ok(payload) => ResponseEnvelope::ok(request_id, payload),
            Err(e) => {
                debug!(command = envelope.command.as_str(), error = %e, "host command rejected");
                ResponseEnvelope::error(request_id, e.to_string())
            }
        }
    }

    async fn handle_session_open(&mut self, envelope: &CommandEnvelope) -> Result<serde_json::Value> {
        let channel = envelope.channel()?.to_owned();
        if let Some(existing) = self.live_connection(&channel) {
            return Ok(serde_json::json!({
                "channel": channel,
                "session_id": existing.session_id,
                "resumed": true,
            }));
        }
        if let Some(stale) = self.connections.remove(&channel) {
            stale.forwarder.abort();
        }

        let connection = self.orchestrator.connect(&channel).await?;
        let session_id = connection.session_id;
        let mut events = connection.events;
        let event_tx = self.event_tx.clone();
        let forward_channel = channel.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let _ = event_tx.send(EventEnvelope::from_client_event(&forward_channel, &event));
            }
            debug!(channel = %forward_channel, "client event stream ended");
        });
        self.connections.insert(
            channel.clone(),
            HostConnection {
                session_id,
                input: connection.input,
                forwarder,
            },
        );
        info!(channel = %channel, session_id = %session_id, "host session opened");
        Ok(serde_json::json!({
            "channel": channel,
            "session_id": session_id,
            "resumed": false,
        }))
    }

    async fn handle_session_text(&mut self, envelope: &CommandEnvelope) -> Result<serde_json::Value> {
        let text = envelope.str_field("text")?.to_owned();
        let session_id = self
            .deliver(envelope, DeviceInput::Text(text.clone()))
            .await?;
        Ok(serde_json::json!({
            "accepted": true,
            "session_id": session_id,
            "text": text,
        }))
    }

    async fn handle_push_to_talk(&mut self, envelope: &CommandEnvelope) -> Result<serde_json::Value> {
        let session_id = self.deliver(envelope, DeviceInput::PushToTalk).await?;
        Ok(serde_json::json!({"accepted": true, "session_id": session_id}))
    }

    async fn handle_session_close(&mut self, envelope: &CommandEnvelope) -> Result<serde_json::Value> {
        let channel = envelope.channel()?;
        let Some(connection) = self.connections.remove(channel) else {
            return Err(no_session(channel));
        };
        // The session publishes SessionClosed before its event stream ends,
        // so the forwarder is left to drain on its own.
        let closed = self
            .orchestrator
            .manager()
            .expire(connection.session_id)
            .await
            .is_ok();
        info!(channel = %channel, session_id = %connection.session_id, closed, "host session closed");
        Ok(serde_json::json!({
            "channel": channel,
            "session_id": connection.session_id,
            "closed": closed,
        }))
    }

    async fn handle_session_context(&self, envelope: &CommandEnvelope) -> Result<serde_json::Value> {
        let session_id = self.session_id(envelope)?;
        let slots = self.orchestrator.manager().get_context(session_id).await?;
        Ok(serde_json::json!({"session_id": session_id, "slots": slots}))
    }

    async fn handle_session_history(&self, envelope: &CommandEnvelope) -> Result<serde_json::Value> {
        let session_id = self.session_id(envelope)?;
        let mut turns = self.orchestrator.manager().history(session_id).await?;
        if let Some(limit) = envelope.payload.get("limit").and_then(serde_json::Value::as_u64) {
            let keep = usize::try_from(limit).unwrap_or(usize::MAX);
            let skip = turns.len().saturating_sub(keep);
            turns.drain(..skip);
        }
        Ok(serde_json::json!({"session_id": session_id, "turns": turns}))
    }

    fn handle_skills_list(&self, envelope: &CommandEnvelope) -> Result<serde_json::Value> {
        let dispatcher = self.orchestrator.dispatcher();
        let query = envelope.payload.get("query").and_then(serde_json::Value::as_str);
        let skills: Vec<_> = dispatcher
            .table()
            .descriptors()
            .into_iter()
            .filter(|d| query.is_none_or(|q| d.matches_query(q)))
            .collect();
        Ok(serde_json::json!({
            "skills": skills,
            "stats": dispatcher.stats(),
        }))
    }

    async fn handle_runtime_stop(&mut self) -> Result<serde_json::Value> {
        let sessions = self.orchestrator.manager().active_sessions().len();
        self.orchestrator.shutdown().await;
        for (_, connection) in self.connections.drain() {
            connection.forwarder.abort();
        }
        info!(sessions, "runtime stopped by host");
        Ok(serde_json::json!({"stopped": true, "sessions_closed": sessions}))
    }

    /// Connection on `channel` whose session is still running.
    fn live_connection(&self, channel: &str) -> Option<&HostConnection> {
        let connection = self.connections.get(channel)?;
        let live = self.orchestrator.manager().session_for_channel(channel);
        (live == Some(connection.session_id) && !connection.input.is_closed()).then_some(connection)
    }

    fn session_id(&self, envelope: &CommandEnvelope) -> Result<SessionId> {
        let channel = envelope.channel()?;
        self.live_connection(channel)
            .map(|c| c.session_id)
            .ok_or_else(|| no_session(channel))
    }

    async fn deliver(&mut self, envelope: &CommandEnvelope, input: DeviceInput) -> Result<SessionId> {
        let channel = envelope.channel()?;
        let Some(connection) = self.live_connection(channel) else {
            return Err(no_session(channel));
        };
        let session_id = connection.session_id;
        if connection.input.send(input).await.is_err() {
            warn!(channel = %channel, session_id = %session_id, "device input closed");
            if let Some(stale) = self.connections.remove(channel) {
                stale.forwarder.abort();
            }
            return Err(no_session(channel));
        }
        Ok(session_id)
    }
}

fn no_session(channel: &str) -> BuddyError {
    BuddyError::SessionExpired(format!("no open session on channel `{channel}`"))
}
