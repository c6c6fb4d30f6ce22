//! Line-oriented JSON transport for the host command channel.
//!
//! Each input line is one `CommandEnvelope`. Each output line is either the
//! `ResponseEnvelope` for a command or an `EventEnvelope` carrying a session
//! event. Output lines from the two sources interleave but never tear.
//!
//! Only protocol lines go to stdout. Logs belong on stderr.

use crate::error::{BuddyError, Result};
use crate::host::channel::{HostCommandClient, command_channel};
use crate::host::contract::{CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope};
use crate::pipeline::coordinator::Orchestrator;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 64;
/// Sized for several sessions streaming response audio at once.
const EVENT_CAPACITY: usize = 1024;

/// Request id used when a line cannot be parsed at all.
const PARSE_ERROR_ID: &str = "parse-error";

type SharedWriter<W> = Arc<Mutex<W>>;

/// Serve the host protocol on stdin/stdout.
///
/// Returns when stdin reaches EOF or after `runtime.stop`; either way every
/// session is closed first.
pub async fn run_stdio_bridge(orchestrator: Arc<Orchestrator>) -> Result<()> {
    let reader = BufReader::new(tokio::io::stdin());
    let writer = BufWriter::new(tokio::io::stdout());
    run_bridge(Arc::clone(&orchestrator), reader, writer).await?;
    orchestrator.shutdown().await;
    Ok(())
}

/// Serve the host protocol over any line reader and writer.
///
/// The command router and the event writer run as their own tasks; commands
/// are read and answered one at a time on the caller's task.
pub async fn run_bridge<R, W>(orchestrator: Arc<Orchestrator>, reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (client, server) = command_channel(REQUEST_CAPACITY, EVENT_CAPACITY, orchestrator);
    let writer: SharedWriter<W> = Arc::new(Mutex::new(writer));

    let router = tokio::spawn(server.run());
    let events = tokio::spawn(forward_events(client.subscribe_events(), Arc::clone(&writer)));

    // Dropping the client inside `serve_commands` closes the request
    // channel, which ends the router.
    let served = serve_commands(client, reader, &writer).await;
    let _ = router.await;
    events.abort();
    let _ = events.await;
    served
}

/// Copy broadcast events to the writer until the channel closes.
async fn forward_events<W: AsyncWrite + Unpin>(
    mut events: broadcast::Receiver<EventEnvelope>,
    writer: SharedWriter<W>,
) {
    loop {
        let envelope = match events.recv().await {
            Ok(envelope) => envelope,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "host event writer fell behind, events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("host event stream closed");
                return;
            }
        };
        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, event = %envelope.event, "event envelope not serializable");
                continue;
            }
        };
        let mut out = writer.lock().await;
        if let Err(e) = write_line(&mut *out, &json).await {
            warn!(error = %e, "host output closed, event writer stopping");
            return;
        }
    }
}

async fn serve_commands<R, W>(
    client: HostCommandClient,
    mut reader: R,
    writer: &SharedWriter<W>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| BuddyError::Channel(format!("host input read failed: {e}")))?;
        if read == 0 {
            info!("host input closed");
            return Ok(());
        }
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }

        let envelope = match serde_json::from_str::<CommandEnvelope>(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, line = %raw, "unparseable host command");
                let response = ResponseEnvelope::error(
                    PARSE_ERROR_ID,
                    format!("failed to parse command envelope: {e}"),
                );
                write_response(writer, &response).await?;
                continue;
            }
        };

        let stop = envelope.command == CommandName::RuntimeStop;
        let request_id = envelope.request_id.clone();
        let response = client.send(envelope).await.unwrap_or_else(|e| {
            warn!(request_id = %request_id, error = %e, "host command rejected");
            ResponseEnvelope::error(request_id, format!("dispatch failed: {e}"))
        });
        write_response(writer, &response).await?;

        if stop {
            info!("runtime.stop handled, host bridge exiting");
            return Ok(());
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &SharedWriter<W>,
    response: &ResponseEnvelope,
) -> Result<()> {
    let json = serde_json::to_string(response)
        .map_err(|e| BuddyError::Channel(format!("response envelope not serializable: {e}")))?;
    let mut out = writer.lock().await;
    write_line(&mut *out, &json).await
}

/// One line, flushed.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<()> {
    let io = |e: std::io::Error| BuddyError::Channel(format!("host output write failed: {e}"));
    writer.write_all(json.as_bytes()).await.map_err(io)?;
    writer.write_all(b"\n").await.map_err(io)?;
    writer.flush().await.map_err(io)
}
