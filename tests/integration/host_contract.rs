//! The newline-delimited JSON host bridge, end to end.

use crate::helpers::{keyword_classifier, providers, scripted_stt, table, tone_tts};
use buddy::config::BuddyConfig;
use buddy::host::contract::{CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope};
use buddy::host::stdio::run_bridge;
use buddy::skills::builtins::builtin_skills;
use buddy::Orchestrator;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

const LINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Host side of a running bridge.
struct Host {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
    events: Vec<EventEnvelope>,
    bridge: JoinHandle<buddy::Result<()>>,
    next_id: u32,
}

impl Host {
    fn start() -> Self {
        let config = BuddyConfig::default();
        let tts = tone_tts(&config, 3);
        let orchestrator = Orchestrator::new(
            config,
            providers(scripted_stt(Vec::new()), tts, keyword_classifier()),
            table(builtin_skills()),
        )
        .expect("valid orchestrator");

        let (host_io, bridge_io) = tokio::io::duplex(64 * 1024);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_io);
        let bridge = tokio::spawn(run_bridge(
            Arc::new(orchestrator),
            BufReader::new(bridge_read),
            bridge_write,
        ));
        let (host_read, writer) = tokio::io::split(host_io);
        Self {
            lines: BufReader::new(host_read).lines(),
            writer,
            events: Vec::new(),
            bridge,
            next_id: 0,
        }
    }

    async fn write_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn next_line(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(LINE_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for bridge output")
            .unwrap()?;
        Some(serde_json::from_str(&line).expect("bridge writes JSON lines"))
    }

    /// Read until the response for `request_id`, keeping any events seen.
    async fn response_for(&mut self, request_id: &str) -> ResponseEnvelope {
        loop {
            let value = self.next_line().await.expect("bridge closed before responding");
            if value.get("event_id").is_some() {
                self.events.push(serde_json::from_value(value).unwrap());
                continue;
            }
            let response: ResponseEnvelope = serde_json::from_value(value).unwrap();
            if response.request_id == request_id {
                return response;
            }
        }
    }

    async fn call(&mut self, command: CommandName, payload: Value) -> ResponseEnvelope {
        self.next_id += 1;
        let request_id = format!("req-{}", self.next_id);
        let envelope = CommandEnvelope::new(request_id.clone(), command, payload);
        self.write_raw(&serde_json::to_string(&envelope).unwrap()).await;
        self.response_for(&request_id).await
    }

    /// Read events until one named `event` has `value` at `pointer`.
    async fn wait_event(&mut self, event: &str, pointer: &str, value: &str) -> EventEnvelope {
        if let Some(found) = self.events.iter().find(|e| matches_event(e, event, pointer, value)) {
            return found.clone();
        }
        loop {
            let line = self.next_line().await.expect("bridge closed while waiting for event");
            if line.get("event_id").is_none() {
                continue;
            }
            let envelope: EventEnvelope = serde_json::from_value(line).unwrap();
            self.events.push(envelope.clone());
            if matches_event(&envelope, event, pointer, value) {
                return envelope;
            }
        }
    }
}

fn matches_event(envelope: &EventEnvelope, event: &str, pointer: &str, value: &str) -> bool {
    envelope.event == event && envelope.payload.pointer(pointer).and_then(Value::as_str) == Some(value)
}

// ─── Commands ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_text_turn_over_the_bridge() {
    let mut host = Host::start();

    let pong = host.call(CommandName::HostPing, json!({})).await;
    assert!(pong.ok);
    assert_eq!(pong.payload["pong"], true);

    let open = host.call(CommandName::SessionOpen, json!({"channel": "kitchen"})).await;
    assert!(open.ok, "{open:?}");
    assert_eq!(open.payload["resumed"], false);
    let session_id = open.payload["session_id"].clone();

    let sent = host
        .call(CommandName::SessionText, json!({"channel": "kitchen", "text": "hello"}))
        .await;
    assert!(sent.ok, "{sent:?}");

    let answer = host.wait_event("response.text", "/body/kind", "answer").await;
    assert_eq!(answer.payload["channel"], "kitchen");
    assert_eq!(answer.payload["session_id"], session_id);
    assert!(!answer.payload["turn_id"].is_null());
    host.wait_event("turn.state", "/body/state", "idle").await;

    let history = host
        .call(CommandName::SessionHistory, json!({"channel": "kitchen"}))
        .await;
    assert!(history.ok);
    let turns = history.payload["turns"].as_array().unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0]["utterance"], "hello");
    assert_eq!(turns[0]["status"], "succeeded");

    let context = host
        .call(CommandName::SessionContext, json!({"channel": "kitchen"}))
        .await;
    assert_eq!(context.payload["slots"]["last_intent"], "greeting");

    // Event ids are unique per session and sequence.
    let mut ids: Vec<&str> = host.events.iter().map(|e| e.event_id.as_str()).collect();
    let total = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), total);

    let stop = host.call(CommandName::RuntimeStop, json!({})).await;
    assert!(stop.ok);
    assert_eq!(stop.payload["stopped"], true);
    host.bridge.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bad_input_gets_error_responses() {
    let mut host = Host::start();

    host.write_raw("{not json").await;
    let parse = host.response_for("parse-error").await;
    assert!(!parse.ok);
    assert!(parse.error.unwrap().contains("failed to parse"));

    host.write_raw(r#"{"v":7,"request_id":"old","command":"host.ping"}"#)
        .await;
    let version = host.response_for("old").await;
    assert!(!version.ok);

    let orphan = host
        .call(CommandName::SessionText, json!({"channel": "nowhere", "text": "hi"}))
        .await;
    assert!(!orphan.ok);
    assert!(orphan.error.unwrap().contains("nowhere"));

    // The bridge keeps serving after errors.
    let pong = host.call(CommandName::HostPing, json!({})).await;
    assert!(pong.ok);

    let stop = host.call(CommandName::RuntimeStop, json!({})).await;
    assert!(stop.ok);
    host.bridge.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_closing_a_session_emits_closed_event() {
    let mut host = Host::start();

    host.call(CommandName::SessionOpen, json!({"channel": "den"})).await;
    let closed = host.call(CommandName::SessionClose, json!({"channel": "den"})).await;
    assert!(closed.ok, "{closed:?}");
    host.wait_event("session.closed", "/body/reason/reason", "expired").await;

    let reopened = host.call(CommandName::SessionOpen, json!({"channel": "den"})).await;
    assert!(reopened.ok);
    assert_eq!(reopened.payload["resumed"], false);

    host.call(CommandName::RuntimeStop, json!({})).await;
    host.bridge.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stdin_eof_shuts_the_bridge_down() {
    let mut host = Host::start();
    host.call(CommandName::HostPing, json!({})).await;
    host.writer.shutdown().await.unwrap();
    host.bridge.await.unwrap().unwrap();
}
