//! Orchestrator that wires providers, pools, skills and sessions together.

use crate::audio::AudioFrontend;
use crate::config::BuddyConfig;
use crate::dialogue::SessionManager;
use crate::error::Result;
use crate::nlu::IntentClassifier;
use crate::pipeline::bus::{ClientEvents, SessionEventBus};
use crate::pipeline::controller::SessionRuntime;
use crate::pipeline::messages::{ClientPayload, DeviceInput, SessionId};
use crate::pipeline::pool::WorkerPool;
use crate::runtime::RuntimeEvent;
use crate::skills::{SkillDispatcher, SkillTable};
use crate::stt::{Transcriber, TranscriberAdapter};
use crate::tts::{Synthesizer, SynthesizerAdapter};
use crate::wakeword::{SpotterFactory, energy_spotter_factory};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Speech and language providers injected at startup.
#[derive(Clone)]
pub struct Providers {
    pub stt: Arc<dyn Transcriber>,
    pub stt_fallback: Option<Arc<dyn Transcriber>>,
    pub tts: Arc<dyn Synthesizer>,
    pub tts_fallback: Option<Arc<dyn Synthesizer>>,
    pub classifier: Arc<dyn IntentClassifier>,
    /// Wake word spotters; `None` uses the built-in energy spotter.
    pub spotter: Option<SpotterFactory>,
}

/// A connected device or text client.
#[derive(Debug)]
pub struct DeviceConnection {
    pub session_id: SessionId,
    /// Audio, push-to-talk, text and lifecycle input.
    pub input: mpsc::Sender<DeviceInput>,
    /// Ordered client events for this session.
    pub events: ClientEvents,
}

/// Owns everything shared between sessions.
///
/// Built once; the skill table, provider pools, bus and session manager are
/// handed to sessions as `Arc`s and never replaced.
pub struct Orchestrator {
    config: Arc<BuddyConfig>,
    bus: Arc<SessionEventBus>,
    runtime: Arc<SessionRuntime>,
    manager: SessionManager,
    spotter_factory: SpotterFactory,
    /// Live frontend per session; a reconnect retires the previous one.
    frontends: Mutex<HashMap<SessionId, CancellationToken>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runtime", &self.runtime)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build the orchestrator.
    ///
    /// # Errors
    ///
    /// `BuddyError::Config` if the configuration fails validation.
    pub fn new(config: BuddyConfig, providers: Providers, skills: SkillTable) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let bus = Arc::new(SessionEventBus::new(&config.bus));

        let stt_pool = Arc::new(WorkerPool::new("stt", &config.stt));
        let tts_pool = Arc::new(WorkerPool::new("tts", &config.tts));
        let feed_capacity = feed_capacity(&config);
        let transcriber = Arc::new(TranscriberAdapter::new(
            providers.stt,
            providers.stt_fallback,
            stt_pool,
            &config.stt,
            feed_capacity,
        ));
        let synthesizer = Arc::new(SynthesizerAdapter::new(
            providers.tts,
            providers.tts_fallback,
            tts_pool,
            &config.tts,
        ));
        let dispatcher = Arc::new(SkillDispatcher::new(
            Arc::new(skills),
            Arc::clone(&bus),
            &config.skills,
        ));
        let spotter_factory = providers
            .spotter
            .unwrap_or_else(|| energy_spotter_factory(&config.wakeword));

        let runtime = Arc::new(SessionRuntime {
            config: Arc::clone(&config),
            bus: Arc::clone(&bus),
            transcriber,
            synthesizer,
            classifier: providers.classifier,
            dispatcher,
            shutdown: cancel.clone(),
        });
        let manager = SessionManager::new(Arc::clone(&runtime));
        info!(
            skills = runtime.dispatcher.table().len(),
            stt_pool = config.stt.pool_size,
            tts_pool = config.tts.pool_size,
            "orchestrator ready"
        );

        Ok(Self {
            config,
            bus,
            runtime,
            manager,
            spotter_factory,
            frontends: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Connect a device on `channel`.
    ///
    /// Reconnecting on a channel whose session is still alive resumes that
    /// session; the previous event receiver is closed.
    ///
    /// # Errors
    ///
    /// `BuddyError::SessionExpired` if the session ended during setup.
    pub async fn connect(&self, channel: &str) -> Result<DeviceConnection> {
        let session_id = self.manager.create_session(channel)?;
        let session_input = self.manager.input(session_id)?;
        let events = self.bus.register(session_id);
        self.bus
            .publish_to_session(session_id, None, ClientPayload::SessionStarted)
            .await;

        let (input, device_rx) = mpsc::channel(self.config.audio.device_channel_size.max(1));
        let spotter = self
            .config
            .wakeword
            .enabled
            .then(|| (self.spotter_factory)());
        let frontend = AudioFrontend::new(session_id, self.config.audio.clone(), spotter);
        let frontend_cancel = self.cancel.child_token();
        if let Ok(mut frontends) = self.frontends.lock() {
            frontends.retain(|id, _| self.manager.is_connected(*id));
            // The retired frontend exits without disconnecting the session.
            if let Some(previous) = frontends.insert(session_id, frontend_cancel.clone()) {
                previous.cancel();
            }
        }
        tokio::spawn(frontend.run(device_rx, session_input, frontend_cancel));

        Ok(DeviceConnection {
            session_id,
            input,
            events,
        })
    }

    #[must_use]
    pub fn config(&self) -> &BuddyConfig {
        &self.config
    }

    #[must_use]
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<SessionEventBus> {
        &self.bus
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<SkillDispatcher> {
        &self.runtime.dispatcher
    }

    #[must_use]
    pub fn transcriber(&self) -> &Arc<TranscriberAdapter> {
        &self.runtime.transcriber
    }

    #[must_use]
    pub fn synthesizer(&self) -> &Arc<SynthesizerAdapter> {
        &self.runtime.synthesizer
    }

    /// Observability stream.
    #[must_use]
    pub fn subscribe_runtime(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.bus.subscribe_runtime()
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close every session and stop the provider pools.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.cancel.cancel();
        self.manager.shutdown().await;
        self.runtime.dispatcher.shutdown();
        self.runtime.transcriber.pool().close();
        self.runtime.synthesizer.pool().close();
    }
}

/// Frames one segment may buffer: the longest allowed utterance.
fn feed_capacity(config: &BuddyConfig) -> usize {
    let frame_ms = config.audio.frame_ms.max(1);
    (config.vad.max_speech_duration_ms / frame_ms) as usize + 1
}
