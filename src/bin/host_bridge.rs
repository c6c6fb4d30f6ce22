//! Headless host bridge binary for stdin/stdout JSON communication.
//!
//! Text clients open sessions by channel name and exchange
//! `CommandEnvelope` / `ResponseEnvelope` / `EventEnvelope` lines. Speech
//! providers are the deterministic scripted ones; skills are the built-ins.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel. Set `BUDDY_LOG_DIR` to also write a daily
//! rolling log file.

use buddy::config::BuddyConfig;
use buddy::host::stdio::run_stdio_bridge;
use buddy::scripted::{ScriptedClassifier, ScriptedTranscriber, ToneSynthesizer};
use buddy::skills::SkillTable;
use buddy::skills::builtins::builtin_skills;
use buddy::{Orchestrator, Providers};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    tracing::info!("buddy-host starting");

    let config = load_config()?;
    let frame_interval = Duration::from_millis(u64::from(config.audio.frame_ms));
    let providers = Providers {
        stt: Arc::new(ScriptedTranscriber::new("scripted-stt", Vec::new())),
        stt_fallback: None,
        tts: Arc::new(ToneSynthesizer::new("tone-tts", &config.audio, 10, frame_interval)),
        tts_fallback: None,
        classifier: Arc::new(ScriptedClassifier::new(Vec::new())),
        spotter: None,
    };
    let orchestrator = Orchestrator::new(config, providers, SkillTable::new(builtin_skills()))
        .map_err(|e| anyhow::anyhow!("buddy-host failed to start: {e}"))?;

    run_stdio_bridge(Arc::new(orchestrator))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "buddy-host exited with error");
            anyhow::anyhow!("buddy-host failed: {e}")
        })?;

    tracing::info!("buddy-host shut down cleanly");
    Ok(())
}

/// Stderr logging, plus a rolling file when `BUDDY_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file_layer, guard) = match std::env::var_os("BUDDY_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "buddy-host.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

/// `BUDDY_CONFIG` if set, else the default path if it exists, else defaults.
fn load_config() -> anyhow::Result<BuddyConfig> {
    let path = std::env::var_os("BUDDY_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(BuddyConfig::default_config_path);
    if !path.exists() {
        return Ok(BuddyConfig::default());
    }
    tracing::info!(path = %path.display(), "loading config");
    BuddyConfig::from_file(&path)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))
}
