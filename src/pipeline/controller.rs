//! Per-session turn controller.
//!
//! Every dialogue session runs one task that owns its [`DialogueSession`]
//! and at most one active turn. Stage work (transcription, classification,
//! skill calls, synthesis) runs in short-lived tasks that report back over
//! the turn's bounded stage channel. Each report carries the epoch it was
//! started in; reports from an older epoch are ignored, and the channel is
//! dropped together with a cancelled turn.

use crate::config::BuddyConfig;
use crate::dialogue::session::{DialogueSession, SessionSnapshot};
use crate::error::{BuddyError, ErrorKind, Result};
use crate::nlu::{IntentClassifier, SpeculativeIntent, normalize};
use crate::pipeline::bus::SessionEventBus;
use crate::pipeline::latency::{BudgetOverrun, LatencyTracker};
use crate::pipeline::messages::{
    AudioFrame, ClientPayload, CloseReason, Intent, ResponseKind, SessionId, Slots,
    TranscriptEvent, TriggerKind, TurnId,
};
use crate::pipeline::queue::{EnqueueAction, PendingInputQueue};
use crate::pipeline::turn::{Stage, TurnDraft, TurnRecord, TurnState, TurnStatus};
use crate::runtime::RuntimeEvent;
use crate::skills::{InvocationRequest, SkillDispatcher, SkillInvocation, SkillOutcome};
use crate::stt::TranscriberAdapter;
use crate::tts::SynthesizerAdapter;
use crate::vad::{EnergyVad, VadEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames buffered between a synthesizer and the stage forwarder.
const SYNTH_FRAME_BUFFER: usize = 16;
/// Transcript events buffered between a transcriber and the stage forwarder.
const TRANSCRIPT_BUFFER: usize = 16;

/// Shared dependencies of every session task. Built once by the orchestrator.
pub struct SessionRuntime {
    pub config: Arc<BuddyConfig>,
    pub bus: Arc<SessionEventBus>,
    pub transcriber: Arc<TranscriberAdapter>,
    pub synthesizer: Arc<SynthesizerAdapter>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub dispatcher: Arc<SkillDispatcher>,
    /// Parent of every session token.
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("classifier", &self.classifier.name())
            .field("transcriber", &self.transcriber)
            .field("synthesizer", &self.synthesizer)
            .finish_non_exhaustive()
    }
}

/// Input from the device frontend.
#[derive(Debug, Clone)]
pub enum SessionInput {
    /// Wake word or push-to-talk.
    Trigger(TriggerKind),
    Audio(AudioFrame),
    Text(String),
    CaptureError(String),
    Disconnect,
}

/// Requests from the session manager, answered over a oneshot.
#[derive(Debug)]
pub enum SessionCommand {
    GetContext(oneshot::Sender<Slots>),
    History(oneshot::Sender<Vec<TurnRecord>>),
    CommitTurn(Box<TurnRecord>, oneshot::Sender<()>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    /// Cancel any in-flight turn and close the session.
    Expire(oneshot::Sender<()>),
}

/// Handles to a spawned session task.
#[derive(Debug)]
pub(crate) struct SessionTask {
    pub input_tx: mpsc::Sender<SessionInput>,
    pub command_tx: mpsc::Sender<SessionCommand>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
}

/// Spawn the task that runs one session's turns.
pub(crate) fn spawn_session(
    runtime: Arc<SessionRuntime>,
    session_id: SessionId,
    channel: &str,
) -> SessionTask {
    let (input_tx, input_rx) = mpsc::channel(runtime.config.audio.device_channel_size.max(1));
    let (command_tx, command_rx) = mpsc::channel(runtime.config.bus.command_channel_size.max(1));
    let cancel = runtime.shutdown.child_token();
    let controller = TurnController::new(runtime, session_id, channel, cancel.clone());
    let join = tokio::spawn(controller.run(input_rx, command_rx));
    SessionTask {
        input_tx,
        command_tx,
        cancel,
        join,
    }
}

/// What happens once the current utterance has been delivered.
#[derive(Debug, Clone, Copy)]
enum AfterSpeech {
    Finish {
        status: TurnStatus,
        error: Option<ErrorKind>,
    },
    /// Clarification prompt: listen again within the same turn.
    Relisten,
}

#[derive(Debug)]
struct StageEvent {
    epoch: u64,
    kind: StageKind,
}

#[derive(Debug)]
enum StageKind {
    Transcript(TranscriptEvent),
    TranscriptionDone(Result<()>),
    Intent {
        text: String,
        result: Result<Intent>,
        speculative: bool,
    },
    SkillDone(Box<SkillInvocation>),
    Audio {
        frame: AudioFrame,
        filler: bool,
    },
    SynthesisDone {
        result: Result<()>,
        filler: bool,
    },
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Listen,
    TurnBudget,
    /// The current stage overran its deadline.
    Stage,
    Idle,
}

/// State of the one turn a session may have in flight.
struct ActiveTurn {
    draft: TurnDraft,
    /// Child of the session token; fired on barge-in and session close.
    cancel: CancellationToken,
    latency: LatencyTracker,
    vad: EnergyVad,
    epoch: u64,
    stage_tx: mpsc::Sender<StageEvent>,
    stage_rx: mpsc::Receiver<StageEvent>,
    feed: Option<mpsc::Sender<AudioFrame>>,
    stt_cancel: Option<CancellationToken>,
    speech_ended: bool,
    final_text: Option<String>,
    speculative: Option<SpeculativeIntent>,
    speculating: bool,
    awaiting_intent: bool,
    listen_deadline: Instant,
    /// Deadline of the transcription, classification or synthesis in flight.
    stage_deadline: Option<Instant>,
    after: Option<AfterSpeech>,
    filler: Option<CancellationToken>,
    synth_cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveTurn {
    fn turn_id(&self) -> TurnId {
        self.draft.turn_id
    }

    fn sender(&self) -> (mpsc::Sender<StageEvent>, u64) {
        (self.stage_tx.clone(), self.epoch)
    }

    /// Drop per-listen state and start a new epoch.
    fn reset_listening(&mut self, listen_timeout: std::time::Duration) {
        self.epoch += 1;
        if let Some(stt) = self.stt_cancel.take() {
            stt.cancel();
        }
        self.feed = None;
        self.vad.reset();
        self.speech_ended = false;
        self.final_text = None;
        self.speculative = None;
        self.speculating = false;
        self.awaiting_intent = false;
        self.after = None;
        self.synth_cancel = None;
        self.stage_deadline = None;
        self.listen_deadline = Instant::now() + listen_timeout;
    }

    fn stop_filler(&mut self) {
        if let Some(filler) = self.filler.take() {
            filler.cancel();
        }
    }

    /// Stop all stage work now.
    fn abort(&mut self) {
        self.cancel.cancel();
        self.stop_filler();
        self.feed = None;
        self.vad.reset();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

struct TurnController {
    rt: Arc<SessionRuntime>,
    session: DialogueSession,
    pending: PendingInputQueue,
    turn: Option<ActiveTurn>,
    cancel: CancellationToken,
}

impl TurnController {
    fn new(
        rt: Arc<SessionRuntime>,
        session_id: SessionId,
        channel: &str,
        cancel: CancellationToken,
    ) -> Self {
        let session = DialogueSession::new(session_id, channel, rt.config.session.history_window);
        let pending = PendingInputQueue::new(&rt.config.turn);
        Self {
            rt,
            session,
            pending,
            turn: None,
            cancel,
        }
    }

    fn id(&self) -> SessionId {
        self.session.id
    }

    async fn run(
        mut self,
        mut inputs: mpsc::Receiver<SessionInput>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) {
        info!(session_id = %self.id(), channel = %self.session.channel, "session started");
        self.rt.bus.emit(RuntimeEvent::SessionOpened {
            session_id: self.id(),
            channel: self.session.channel.clone(),
        });
        let cancel = self.cancel.clone();

        let reason = loop {
            let timer = self.next_timer();
            tokio::select! {
                biased;
                () = cancel.cancelled() => break CloseReason::Shutdown,
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Some(reply) = self.on_command(command) {
                            self.close(CloseReason::Expired).await;
                            let _ = reply.send(());
                            return;
                        }
                    }
                    // Manager dropped the handle.
                    None => break CloseReason::Shutdown,
                },
                input = inputs.recv() => match input {
                    Some(input) => {
                        if let Some(reason) = self.on_input(input).await {
                            break reason;
                        }
                    }
                    None => break CloseReason::Disconnected,
                },
                event = next_stage_event(&mut self.turn) => self.on_stage(event).await,
                () = sleep_until(timer.map(|(at, _)| at)) => {
                    if let Some((_, timer)) = timer
                        && let Some(reason) = self.on_timer(timer).await
                    {
                        break reason;
                    }
                }
            }
        };
        self.close(reason).await;
    }

    fn next_timer(&self) -> Option<(Instant, Timer)> {
        let Some(turn) = &self.turn else {
            let at = self.session.last_activity_at + self.rt.config.session.idle_timeout();
            return Some((at, Timer::Idle));
        };
        match self.session.state {
            TurnState::Listening if !turn.vad.in_speech() => {
                Some((turn.listen_deadline, Timer::Listen))
            }
            TurnState::DispatchingSkill if turn.latency.turn_budget_pending() => Some((
                turn.latency.turn_deadline(&turn.draft.clock),
                Timer::TurnBudget,
            )),
            TurnState::Understanding if turn.awaiting_intent => {
                turn.stage_deadline.map(|at| (at, Timer::Stage))
            }
            TurnState::Transcribing | TurnState::Synthesizing | TurnState::Speaking => {
                turn.stage_deadline.map(|at| (at, Timer::Stage))
            }
            _ => None,
        }
    }

    /// Answer a manager request. Returns the reply handle of an `Expire`,
    /// which the run loop acknowledges once the session is closed.
    fn on_command(&mut self, command: SessionCommand) -> Option<oneshot::Sender<()>> {
        match command {
            SessionCommand::GetContext(reply) => {
                let _ = reply.send(self.session.context().clone());
            }
            SessionCommand::History(reply) => {
                let _ = reply.send(self.session.history().to_vec());
            }
            SessionCommand::CommitTurn(record, reply) => {
                self.session.commit(*record);
                let _ = reply.send(());
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.session.snapshot());
            }
            SessionCommand::Expire(reply) => return Some(reply),
        }
        None
    }

    // --- inputs -----------------------------------------------------------

    async fn on_input(&mut self, input: SessionInput) -> Option<CloseReason> {
        match input {
            SessionInput::Trigger(trigger) => self.on_trigger(trigger).await,
            SessionInput::Audio(frame) => self.on_audio(frame).await,
            SessionInput::Text(text) => self.on_text(text).await,
            SessionInput::CaptureError(message) => {
                warn!(session_id = %self.id(), error = %message, "capture failed, closing session");
                return Some(CloseReason::CaptureError(message));
            }
            SessionInput::Disconnect => return Some(CloseReason::Disconnected),
        }
        None
    }

    async fn on_trigger(&mut self, trigger: TriggerKind) {
        let state = self.session.state;
        if self.turn.is_none() {
            self.start_turn(trigger).await;
        } else if state.is_barge_in_target() {
            if self.rt.config.turn.barge_in_enabled {
                self.barge_in(trigger).await;
            } else {
                debug!(session_id = %self.id(), state = %state, "barge-in disabled, trigger ignored");
            }
        } else {
            debug!(session_id = %self.id(), state = %state, "already listening, trigger ignored");
        }
    }

    async fn on_text(&mut self, text: String) {
        let text = text.trim().to_owned();
        if text.is_empty() {
            return;
        }
        let state = self.session.state;
        let listening_quietly = state == TurnState::Listening
            && self.turn.as_ref().is_some_and(|t| !t.vad.in_speech());
        if self.turn.is_none() {
            self.start_turn(TriggerKind::Text).await;
            self.begin_understanding(text).await;
        } else if listening_quietly {
            self.session.metrics.record_trigger(TriggerKind::Text);
            self.session.touch();
            self.begin_understanding(text).await;
        } else if state.is_idle_adjacent() {
            let action = self.pending.enqueue(text);
            debug!(session_id = %self.id(), ?action, pending = self.pending.len(), "text queued behind response");
            if action == EnqueueAction::DroppedIncoming {
                info!(session_id = %self.id(), "pending queue full, message dropped");
            }
        } else {
            self.barge_in(TriggerKind::Text).await;
            self.begin_understanding(text).await;
        }
    }

    async fn on_audio(&mut self, frame: AudioFrame) {
        let state = self.session.state;
        let stt_timeout = self.rt.config.stt.job_timeout();
        let max_speech =
            std::time::Duration::from_millis(u64::from(self.rt.config.vad.max_speech_duration_ms));
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let accepts = state == TurnState::Listening
            || (state == TurnState::Transcribing && !turn.speech_ended);
        if !accepts {
            return;
        }
        let event = turn.vad.process_frame(&frame);
        match event {
            VadEvent::Silence => {}
            VadEvent::SpeechStart => {
                turn.draft.clock.mark(Stage::SpeechStart);
                turn.stage_deadline = Some(Instant::now() + max_speech + stt_timeout);
                self.transition(TurnState::Transcribing).await;
                self.start_transcription();
                self.feed(frame);
            }
            VadEvent::Speech => self.feed(frame),
            VadEvent::SpeechEnd(segment) => {
                self.feed(frame);
                if let Some(turn) = self.turn.as_mut() {
                    debug!(
                        session_id = %self.session.id,
                        frames = segment.frames.len(),
                        duration_ms = segment.duration().as_millis() as u64,
                        "speech segment closed"
                    );
                    turn.draft.clock.mark(Stage::SpeechEnd);
                    turn.speech_ended = true;
                    turn.feed = None;
                    turn.stage_deadline = Some(Instant::now() + stt_timeout);
                }
                self.try_understand().await;
            }
            VadEvent::Discarded => {
                let listen_timeout = self.rt.config.turn.listen_timeout();
                turn.reset_listening(listen_timeout);
                debug!(session_id = %self.session.id, "speech too short, listening again");
                self.transition(TurnState::Listening).await;
            }
        }
    }

    fn feed(&mut self, frame: AudioFrame) {
        if let Some(turn) = self.turn.as_ref()
            && let Some(feed) = turn.feed.as_ref()
            && feed.try_send(frame).is_err()
        {
            debug!(session_id = %self.session.id, "transcriber feed full, frame dropped");
        }
    }

    // --- turn lifecycle ---------------------------------------------------

    async fn start_turn(&mut self, trigger: TriggerKind) {
        let config = &self.rt.config;
        let (stage_tx, stage_rx) = mpsc::channel(config.bus.stage_channel_size.max(1));
        let draft = TurnDraft::new(self.session.id, trigger);
        info!(
            session_id = %self.session.id,
            turn_id = %draft.turn_id,
            ?trigger,
            "turn started"
        );
        self.turn = Some(ActiveTurn {
            draft,
            cancel: self.cancel.child_token(),
            latency: LatencyTracker::new(&config.turn),
            vad: EnergyVad::new(&config.vad),
            epoch: 0,
            stage_tx,
            stage_rx,
            feed: None,
            stt_cancel: None,
            speech_ended: false,
            final_text: None,
            speculative: None,
            speculating: false,
            awaiting_intent: false,
            listen_deadline: Instant::now() + config.turn.listen_timeout(),
            stage_deadline: None,
            after: None,
            filler: None,
            synth_cancel: None,
            tasks: Vec::new(),
        });
        self.session.metrics.record_trigger(trigger);
        self.session.touch();
        self.transition(TurnState::Listening).await;
    }

    /// Cancel the active turn and start a new one for `trigger`.
    async fn barge_in(&mut self, trigger: TriggerKind) {
        if let Some(cancelled) = self.abort_turn(TurnStatus::Cancelled, None).await {
            info!(session_id = %self.session.id, turn_id = %cancelled, "barge-in");
            self.rt.bus.emit(RuntimeEvent::BargeIn {
                session_id: self.session.id,
                cancelled,
            });
            self.rt
                .bus
                .publish_to_session(
                    self.session.id,
                    Some(cancelled),
                    ClientPayload::BargeIn { cancelled },
                )
                .await;
        }
        self.start_turn(trigger).await;
    }

    /// Stop the active turn and commit it with `status`. Leaves the session
    /// in `Cancelled`; the caller decides where to go next.
    async fn abort_turn(
        &mut self,
        status: TurnStatus,
        error: Option<ErrorKind>,
    ) -> Option<TurnId> {
        let mut turn = self.turn.take()?;
        turn.abort();
        let turn_id = turn.turn_id();
        self.set_state(TurnState::Cancelled, Some(turn_id)).await;
        let record = turn.draft.finish(status, error);
        self.commit(record);
        Some(turn_id)
    }

    /// Finalize the active turn and return to idle.
    async fn finish_turn(&mut self, status: TurnStatus, error: Option<ErrorKind>) {
        let Some(mut turn) = self.turn.take() else {
            return;
        };
        turn.stop_filler();
        turn.feed = None;
        for task in turn.tasks.drain(..) {
            task.abort();
        }
        if let Some(overrun) = turn.latency.check_turn(&turn.draft.clock) {
            self.report_overrun(turn.turn_id(), overrun);
        }
        let turn_id = turn.turn_id();
        let record = turn.draft.finish(status, error);
        self.commit(record);
        self.set_state(TurnState::Idle, Some(turn_id)).await;

        if let Some(text) = self.pending.dequeue() {
            debug!(session_id = %self.session.id, remaining = self.pending.len(), "starting queued text turn");
            self.start_turn(TriggerKind::Text).await;
            self.begin_understanding(text).await;
        }
    }

    /// Drop a turn that never heard anything.
    async fn abandon_turn(&mut self) {
        let Some(mut turn) = self.turn.take() else {
            return;
        };
        turn.abort();
        let turn_id = turn.turn_id();
        debug!(session_id = %self.session.id, turn_id = %turn_id, "no speech, turn abandoned");
        self.set_state(TurnState::Idle, Some(turn_id)).await;
    }

    fn commit(&mut self, record: TurnRecord) {
        info!(
            session_id = %self.session.id,
            turn_id = %record.turn_id,
            status = ?record.status,
            error_kind = ?record.error_kind,
            latency_ms = record.latency_ms,
            clarification_rounds = record.clarification_rounds,
            "turn finished"
        );
        self.session.commit(record.clone());
        self.rt.bus.emit(RuntimeEvent::TurnCompleted(Box::new(record)));
    }

    async fn relisten(&mut self) {
        let listen_timeout = self.rt.config.turn.listen_timeout();
        if let Some(turn) = self.turn.as_mut() {
            turn.reset_listening(listen_timeout);
        }
        self.transition(TurnState::Listening).await;
    }

    async fn close(&mut self, reason: CloseReason) {
        let (status, error) = match &reason {
            CloseReason::Expired | CloseReason::IdleTimeout => {
                (TurnStatus::Cancelled, Some(ErrorKind::SessionExpired))
            }
            CloseReason::CaptureError(_) => (TurnStatus::Failed, Some(ErrorKind::CaptureError)),
            CloseReason::Disconnected | CloseReason::Shutdown => (TurnStatus::Cancelled, None),
        };
        if self.abort_turn(status, error).await.is_some() {
            self.set_state(TurnState::Idle, None).await;
        }
        let dropped = self.pending.clear();
        info!(
            session_id = %self.session.id,
            reason = ?reason,
            dropped_pending = dropped,
            "session closed"
        );
        self.rt
            .bus
            .publish_to_session(
                self.session.id,
                None,
                ClientPayload::SessionClosed {
                    reason: reason.clone(),
                },
            )
            .await;
        self.rt.bus.emit(RuntimeEvent::SessionClosed {
            session_id: self.session.id,
            reason,
        });
        self.rt.bus.unregister(self.session.id);
        self.cancel.cancel();
    }

    async fn transition(&mut self, to: TurnState) {
        let turn_id = self.turn.as_ref().map(ActiveTurn::turn_id);
        self.set_state(to, turn_id).await;
    }

    async fn set_state(&mut self, to: TurnState, turn_id: Option<TurnId>) {
        let from = self.session.state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(session_id = %self.session.id, from = %from, to = %to, "unexpected turn transition");
        }
        debug!(session_id = %self.session.id, from = %from, to = %to, "turn state");
        self.session.state = to;
        self.rt
            .bus
            .publish_to_session(
                self.session.id,
                turn_id,
                ClientPayload::StateChanged { state: to },
            )
            .await;
        self.rt.bus.emit(RuntimeEvent::StateChanged {
            session_id: self.session.id,
            turn_id,
            from,
            to,
        });
    }

    fn report_overrun(&self, turn_id: TurnId, overrun: BudgetOverrun) {
        warn!(
            session_id = %self.session.id,
            turn_id = %turn_id,
            budget = ?overrun.budget,
            budget_ms = overrun.budget_ms,
            elapsed_ms = overrun.elapsed_ms,
            "latency budget exceeded"
        );
        self.rt.bus.emit(RuntimeEvent::LatencyBudgetExceeded {
            session_id: self.session.id,
            turn_id,
            budget: overrun.budget,
            budget_ms: overrun.budget_ms,
            elapsed_ms: overrun.elapsed_ms,
        });
    }

    fn report_stage_failure(&self, turn_id: TurnId, error: &BuddyError) {
        let Some(kind) = error.kind() else {
            return;
        };
        if kind == ErrorKind::Overloaded {
            return;
        }
        warn!(session_id = %self.session.id, turn_id = %turn_id, kind = %kind, error = %error, "stage failed");
        self.rt.bus.emit(RuntimeEvent::StageFailed {
            session_id: self.session.id,
            turn_id,
            kind,
            detail: error.to_string(),
        });
    }

    fn report_saturation(&self, pool: &'static str, waited_ms: u64) {
        self.rt.bus.emit(RuntimeEvent::PoolSaturated {
            session_id: self.session.id,
            pool,
            waited_ms,
        });
    }

    // --- stages -----------------------------------------------------------

    fn start_transcription(&mut self) {
        let session_id = self.session.id;
        let transcriber = Arc::clone(&self.rt.transcriber);
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let (feed_tx, feed_rx) = mpsc::channel(transcriber.feed_capacity());
        let stt_cancel = turn.cancel.child_token();
        turn.feed = Some(feed_tx);
        turn.stt_cancel = Some(stt_cancel.clone());
        let (stage_tx, epoch) = turn.sender();
        turn.tasks.push(tokio::spawn(async move {
            let (events_tx, mut events_rx) = mpsc::channel(TRANSCRIPT_BUFFER);
            let stream = transcriber.stream(session_id, feed_rx, events_tx, stt_cancel);
            let forward = async {
                while let Some(event) = events_rx.recv().await {
                    let kind = StageKind::Transcript(event);
                    if stage_tx.send(StageEvent { epoch, kind }).await.is_err() {
                        break;
                    }
                }
            };
            let (result, ()) = tokio::join!(stream, forward);
            let _ = stage_tx
                .send(StageEvent {
                    epoch,
                    kind: StageKind::TranscriptionDone(result),
                })
                .await;
        }));
    }

    fn spawn_classify(&mut self, text: String, speculative: bool) {
        let classifier = Arc::clone(&self.rt.classifier);
        let context = self.session.context().clone();
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let (stage_tx, epoch) = turn.sender();
        turn.tasks.push(tokio::spawn(async move {
            let result = classifier.classify(&text, &context).await;
            let kind = StageKind::Intent {
                text,
                result,
                speculative,
            };
            let _ = stage_tx.send(StageEvent { epoch, kind }).await;
        }));
    }

    /// Move to `Understanding` once speech has ended and the final
    /// transcript is in, whichever comes last.
    async fn try_understand(&mut self) {
        if self.session.state != TurnState::Transcribing {
            return;
        }
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if !turn.speech_ended {
            return;
        }
        let Some(text) = turn.final_text.clone() else {
            return;
        };
        if text.trim().is_empty() {
            debug!(session_id = %self.session.id, turn_id = %turn.turn_id(), "empty transcript, listening again");
            self.relisten().await;
            return;
        }
        let speculated = turn
            .speculative
            .take()
            .and_then(|spec| spec.take_if_matches(&text));
        if let Some(intent) = speculated {
            debug!(session_id = %self.session.id, intent = %intent.name, "using speculative intent");
            turn.draft.utterance = Some(text);
            self.transition(TurnState::Understanding).await;
            self.handle_intent(Ok(intent)).await;
        } else {
            self.begin_understanding(text).await;
        }
    }

    async fn begin_understanding(&mut self, text: String) {
        let classify_timeout = self.rt.config.nlu.classify_timeout();
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.draft.utterance = Some(text.clone());
        turn.awaiting_intent = true;
        turn.stage_deadline = Some(Instant::now() + classify_timeout);
        self.transition(TurnState::Understanding).await;
        self.spawn_classify(text, false);
    }

    async fn handle_intent(&mut self, result: Result<Intent>) {
        let nlu = self.rt.config.nlu.clone();
        let responses = self.rt.config.responses.clone();
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.awaiting_intent = false;
        turn.draft.clock.mark(Stage::Intent);
        let turn_id = turn.turn_id();
        let overrun = turn.latency.check_nlu(&turn.draft.clock);

        let intent = match result {
            Ok(intent) => Some(intent),
            Err(e) => {
                warn!(session_id = %self.session.id, turn_id = %turn_id, error = %e, "classifier failed");
                None
            }
        };
        let confident = intent
            .as_ref()
            .is_some_and(|i| i.confidence >= nlu.confidence_threshold);

        if !confident {
            turn.draft.clarification_rounds += 1;
            let rounds = turn.draft.clarification_rounds;
            if intent.is_some() {
                turn.draft.intent = intent;
            }
            if let Some(overrun) = overrun {
                self.report_overrun(turn_id, overrun);
            }
            debug!(session_id = %self.session.id, turn_id = %turn_id, rounds, "low confidence intent");
            if rounds >= nlu.max_clarification_rounds {
                self.speak(
                    responses.not_understood,
                    ResponseKind::Fallback,
                    AfterSpeech::Finish {
                        status: TurnStatus::Failed,
                        error: Some(ErrorKind::IntentAmbiguous),
                    },
                )
                .await;
            } else {
                self.speak(
                    responses.clarification,
                    ResponseKind::Clarification,
                    AfterSpeech::Relisten,
                )
                .await;
            }
            return;
        }

        let Some(intent) = intent else {
            return;
        };
        turn.draft.intent = Some(intent.clone());
        if let Some(overrun) = overrun {
            self.report_overrun(turn_id, overrun);
        }
        self.session.remember_intent(&intent);
        debug!(
            session_id = %self.session.id,
            turn_id = %turn_id,
            intent = %intent.name,
            confidence = intent.confidence,
            "intent resolved"
        );

        if !self.rt.dispatcher.can_handle(&intent.name) {
            info!(session_id = %self.session.id, intent = %intent.name, "no skill for intent");
            self.speak(
                responses.no_skill,
                ResponseKind::Fallback,
                AfterSpeech::Finish {
                    status: TurnStatus::Failed,
                    error: Some(ErrorKind::SkillError),
                },
            )
            .await;
            return;
        }

        self.transition(TurnState::DispatchingSkill).await;
        let session_id = self.session.id;
        let dispatcher = Arc::clone(&self.rt.dispatcher);
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.draft.clock.mark(Stage::SkillStarted);
        let request = InvocationRequest {
            session_id,
            turn_id,
            intent,
            cancel: turn.cancel.clone(),
        };
        let (stage_tx, epoch) = turn.sender();
        turn.tasks.push(tokio::spawn(async move {
            let invocation = dispatcher.invoke(request).await;
            let kind = StageKind::SkillDone(Box::new(invocation));
            let _ = stage_tx.send(StageEvent { epoch, kind }).await;
        }));
    }

    async fn on_skill_done(&mut self, invocation: SkillInvocation) {
        if self.session.state != TurnState::DispatchingSkill {
            return;
        }
        let responses = self.rt.config.responses.clone();
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.draft.clock.mark(Stage::SkillFinished);
        turn.stop_filler();
        let turn_id = turn.turn_id();
        debug!(
            session_id = %self.session.id,
            turn_id = %turn_id,
            skill = %invocation.skill,
            status = ?invocation.status(),
            attempts = invocation.attempts,
            latency_ms = invocation.latency.as_millis() as u64,
            "skill returned"
        );
        match invocation.outcome {
            SkillOutcome::Succeeded(output) => {
                self.speak(
                    output.text,
                    ResponseKind::Answer,
                    AfterSpeech::Finish {
                        status: TurnStatus::Succeeded,
                        error: None,
                    },
                )
                .await;
            }
            SkillOutcome::TimedOut => {
                let error = BuddyError::SkillTimeout {
                    timeout_ms: u64::try_from(invocation.latency.as_millis()).unwrap_or(u64::MAX),
                };
                self.report_stage_failure(turn_id, &error);
                self.speak(
                    responses.skill_timeout,
                    ResponseKind::Fallback,
                    AfterSpeech::Finish {
                        status: TurnStatus::Failed,
                        error: Some(ErrorKind::SkillTimeout),
                    },
                )
                .await;
            }
            SkillOutcome::Failed(message) => {
                self.report_stage_failure(turn_id, &BuddyError::Skill(message));
                self.speak(
                    responses.skill_error,
                    ResponseKind::Fallback,
                    AfterSpeech::Finish {
                        status: TurnStatus::Failed,
                        error: Some(ErrorKind::SkillError),
                    },
                )
                .await;
            }
        }
    }

    /// Deliver `text` and synthesize it; `after` runs once audio is done.
    async fn speak(&mut self, text: String, kind: ResponseKind, after: AfterSpeech) {
        self.transition(TurnState::Synthesizing).await;
        let session_id = self.session.id;
        let tts_timeout = self.rt.config.tts.job_timeout();
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.stop_filler();
        if let Some(stt) = turn.stt_cancel.take() {
            stt.cancel();
        }
        turn.feed = None;
        turn.vad.reset();
        turn.draft.response = Some(text.clone());
        turn.draft.clock.mark(Stage::SynthesisStarted);
        turn.after = Some(after);
        turn.stage_deadline = Some(Instant::now() + tts_timeout);
        let turn_id = turn.turn_id();
        let cancel = turn.cancel.child_token();
        turn.synth_cancel = Some(cancel.clone());
        let (stage_tx, epoch) = turn.sender();
        let handle = spawn_synthesis(
            Arc::clone(&self.rt.synthesizer),
            session_id,
            text.clone(),
            cancel,
            stage_tx,
            epoch,
            false,
        );
        turn.tasks.push(handle);
        self.rt
            .bus
            .publish_to_session(
                session_id,
                Some(turn_id),
                ClientPayload::ResponseText { text, kind },
            )
            .await;
    }

    async fn start_filler(&mut self) {
        let session_id = self.session.id;
        let text = self.rt.config.responses.filler.clone();
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let turn_id = turn.turn_id();
        let cancel = turn.cancel.child_token();
        turn.filler = Some(cancel.clone());
        let (stage_tx, epoch) = turn.sender();
        let handle = spawn_synthesis(
            Arc::clone(&self.rt.synthesizer),
            session_id,
            text.clone(),
            cancel,
            stage_tx,
            epoch,
            true,
        );
        turn.tasks.push(handle);
        info!(session_id = %session_id, turn_id = %turn_id, "skill still running, speaking filler");
        self.rt
            .bus
            .publish_to_session(
                session_id,
                Some(turn_id),
                ClientPayload::ResponseText {
                    text,
                    kind: ResponseKind::Filler,
                },
            )
            .await;
    }

    async fn on_synthesis_done(&mut self, result: Result<()>, filler: bool) {
        let session_id = self.session.id;
        let state = self.session.state;
        let responses_synthesis_error = self.rt.config.responses.synthesis_error.clone();
        let max_wait_ms = self.rt.config.tts.max_queue_wait_ms;
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let turn_id = turn.turn_id();

        if filler {
            let active = turn.filler.as_ref().is_some_and(|f| !f.is_cancelled());
            turn.filler = None;
            if active && result.is_ok() && state == TurnState::DispatchingSkill {
                self.rt
                    .bus
                    .publish_to_session(session_id, Some(turn_id), ClientPayload::ResponseAudioEnd)
                    .await;
            }
            return;
        }
        if !matches!(state, TurnState::Synthesizing | TurnState::Speaking) {
            return;
        }
        let Some(mut after) = turn.after.take() else {
            return;
        };

        match result {
            Ok(()) => {
                self.rt
                    .bus
                    .publish_to_session(session_id, Some(turn_id), ClientPayload::ResponseAudioEnd)
                    .await;
            }
            Err(BuddyError::Overloaded(detail)) => {
                warn!(session_id = %session_id, turn_id = %turn_id, detail = %detail, "tts saturated, text-only reply");
                turn.draft.degraded = true;
                self.report_saturation("tts", max_wait_ms);
            }
            Err(error) => {
                turn.draft.degraded = true;
                if let AfterSpeech::Finish {
                    status: TurnStatus::Succeeded,
                    ..
                } = after
                {
                    after = AfterSpeech::Finish {
                        status: TurnStatus::Failed,
                        error: Some(ErrorKind::SynthesisError),
                    };
                }
                self.report_stage_failure(turn_id, &error);
                self.rt
                    .bus
                    .publish_to_session(
                        session_id,
                        Some(turn_id),
                        ClientPayload::ResponseText {
                            text: responses_synthesis_error,
                            kind: ResponseKind::Fallback,
                        },
                    )
                    .await;
            }
        }

        match after {
            AfterSpeech::Finish { status, error } => self.finish_turn(status, error).await,
            AfterSpeech::Relisten => self.relisten().await,
        }
    }

    async fn on_stage(&mut self, event: StageEvent) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if event.epoch != turn.epoch {
            debug!(session_id = %self.session.id, epoch = event.epoch, "stale stage event dropped");
            return;
        }
        let state = self.session.state;
        let session_id = self.session.id;
        let turn_id = turn.turn_id();

        match event.kind {
            StageKind::Transcript(transcript) => {
                if state != TurnState::Transcribing {
                    return;
                }
                if transcript.is_final {
                    turn.draft.clock.mark(Stage::FinalTranscript);
                    let text = transcript.text.trim().to_owned();
                    turn.final_text = Some(text.clone());
                    if !text.is_empty() {
                        self.rt
                            .bus
                            .publish_to_session(
                                session_id,
                                Some(turn_id),
                                ClientPayload::FinalTranscript { text },
                            )
                            .await;
                    }
                    self.try_understand().await;
                    return;
                }
                let text = transcript.text.trim().to_owned();
                if text.is_empty() {
                    return;
                }
                turn.draft.clock.mark(Stage::FirstPartial);
                let speculate = self.rt.config.nlu.speculative
                    && !turn.speculating
                    && !turn.speculative.as_ref().is_some_and(|s| s.matches(&text));
                if speculate {
                    turn.speculating = true;
                    self.spawn_classify(text.clone(), true);
                }
                self.rt
                    .bus
                    .publish_to_session(
                        session_id,
                        Some(turn_id),
                        ClientPayload::PartialTranscript { text },
                    )
                    .await;
            }
            StageKind::TranscriptionDone(result) => {
                if state != TurnState::Transcribing {
                    return;
                }
                turn.stt_cancel = None;
                match result {
                    Ok(()) => {
                        if turn.final_text.is_none() {
                            turn.final_text = Some(String::new());
                        }
                        self.try_understand().await;
                    }
                    Err(error) => self.on_transcription_failed(error).await,
                }
            }
            StageKind::Intent {
                text,
                result,
                speculative,
            } => {
                if speculative {
                    turn.speculating = false;
                    if state == TurnState::Transcribing {
                        if let Ok(intent) = result {
                            turn.speculative = Some(SpeculativeIntent::new(&text, intent));
                        }
                        return;
                    }
                }
                let matches_utterance = turn
                    .draft
                    .utterance
                    .as_deref()
                    .is_some_and(|u| normalize(u) == normalize(&text));
                if state == TurnState::Understanding && turn.awaiting_intent && matches_utterance {
                    self.handle_intent(result).await;
                }
            }
            StageKind::SkillDone(invocation) => self.on_skill_done(*invocation).await,
            StageKind::Audio { frame, filler } => {
                if filler {
                    let active = turn.filler.as_ref().is_some_and(|f| !f.is_cancelled());
                    if !active || state != TurnState::DispatchingSkill {
                        return;
                    }
                } else {
                    if !matches!(state, TurnState::Synthesizing | TurnState::Speaking) {
                        return;
                    }
                    if state == TurnState::Synthesizing {
                        turn.draft.clock.mark(Stage::FirstAudio);
                        self.transition(TurnState::Speaking).await;
                    }
                }
                self.rt
                    .bus
                    .publish_to_session(session_id, Some(turn_id), ClientPayload::ResponseAudio(frame))
                    .await;
            }
            StageKind::SynthesisDone { result, filler } => {
                self.on_synthesis_done(result, filler).await;
            }
        }
    }

    async fn on_transcription_failed(&mut self, error: BuddyError) {
        let responses = self.rt.config.responses.clone();
        let max_wait_ms = self.rt.config.stt.max_queue_wait_ms;
        let Some(turn) = self.turn.as_ref() else {
            return;
        };
        let turn_id = turn.turn_id();
        if let BuddyError::Overloaded(detail) = &error {
            warn!(session_id = %self.session.id, turn_id = %turn_id, detail = %detail, "stt saturated, asking user to repeat");
            self.report_saturation("stt", max_wait_ms);
            self.speak(
                responses.stt_overloaded,
                ResponseKind::Fallback,
                AfterSpeech::Finish {
                    status: TurnStatus::Failed,
                    error: Some(ErrorKind::Overloaded),
                },
            )
            .await;
            return;
        }
        self.report_stage_failure(turn_id, &error);
        self.speak(
            responses.transcription_error,
            ResponseKind::Fallback,
            AfterSpeech::Finish {
                status: TurnStatus::Failed,
                error: Some(ErrorKind::TranscriptionError),
            },
        )
        .await;
    }

    async fn on_timer(&mut self, timer: Timer) -> Option<CloseReason> {
        match timer {
            Timer::Idle => {
                if self.turn.is_none() {
                    info!(session_id = %self.session.id, "session idle timeout");
                    return Some(CloseReason::IdleTimeout);
                }
            }
            Timer::Listen => {
                let had_utterance = self
                    .turn
                    .as_ref()
                    .is_some_and(|t| t.draft.utterance.is_some());
                info!(session_id = %self.session.id, had_utterance, "listen timeout");
                if had_utterance {
                    if let Some(turn) = self.turn.as_mut() {
                        turn.abort();
                    }
                    self.finish_turn(TurnStatus::Failed, Some(ErrorKind::IntentAmbiguous))
                        .await;
                } else {
                    self.abandon_turn().await;
                }
            }
            Timer::Stage => self.on_stage_timeout().await,
            Timer::TurnBudget => {
                let Some(turn) = self.turn.as_mut() else {
                    return None;
                };
                let turn_id = turn.turn_id();
                let overrun = turn.latency.check_turn(&turn.draft.clock);
                let filler = self.session.state == TurnState::DispatchingSkill
                    && turn.latency.take_filler();
                if let Some(overrun) = overrun {
                    self.report_overrun(turn_id, overrun);
                }
                if filler {
                    self.start_filler().await;
                }
            }
        }
        None
    }

    /// Give up on a stage that produced nothing before its deadline.
    async fn on_stage_timeout(&mut self) {
        let state = self.session.state;
        let responses = self.rt.config.responses.clone();
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.stage_deadline = None;
        let turn_id = turn.turn_id();
        match state {
            TurnState::Transcribing => {
                warn!(session_id = %self.session.id, turn_id = %turn_id, "no final transcript before deadline");
                let ms = self.rt.config.stt.job_timeout_ms;
                self.on_transcription_failed(BuddyError::Transcription(format!(
                    "no final transcript within {ms} ms"
                )))
                .await;
            }
            TurnState::Understanding => {
                turn.awaiting_intent = false;
                warn!(session_id = %self.session.id, turn_id = %turn_id, "classifier did not answer before deadline");
                let ms = self.rt.config.nlu.classify_timeout_ms;
                let error =
                    BuddyError::IntentAmbiguous(format!("no intent within {ms} ms"));
                self.report_stage_failure(turn_id, &error);
                self.speak(
                    responses.not_understood,
                    ResponseKind::Fallback,
                    AfterSpeech::Finish {
                        status: TurnStatus::Failed,
                        error: Some(ErrorKind::IntentAmbiguous),
                    },
                )
                .await;
            }
            TurnState::Synthesizing | TurnState::Speaking => {
                if let Some(synth) = turn.synth_cancel.take() {
                    synth.cancel();
                }
                warn!(session_id = %self.session.id, turn_id = %turn_id, "synthesis did not finish before deadline");
                let ms = self.rt.config.tts.job_timeout_ms;
                self.on_synthesis_done(
                    Err(BuddyError::Synthesis(format!("no end of audio within {ms} ms"))),
                    false,
                )
                .await;
            }
            _ => {}
        }
    }
}

fn spawn_synthesis(
    synthesizer: Arc<SynthesizerAdapter>,
    session_id: SessionId,
    text: String,
    cancel: CancellationToken,
    stage_tx: mpsc::Sender<StageEvent>,
    epoch: u64,
    filler: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let permit = tokio::select! {
            permit = synthesizer.admit(session_id) => permit,
            () = cancel.cancelled() => return,
        };
        let result = match permit {
            Ok(permit) => {
                let (frames_tx, mut frames_rx) = mpsc::channel(SYNTH_FRAME_BUFFER);
                let speak = synthesizer.speak(permit, session_id, &text, frames_tx, cancel);
                let forward = async {
                    while let Some(frame) = frames_rx.recv().await {
                        let kind = StageKind::Audio { frame, filler };
                        if stage_tx.send(StageEvent { epoch, kind }).await.is_err() {
                            break;
                        }
                    }
                };
                let (result, ()) = tokio::join!(speak, forward);
                result
            }
            Err(e) => Err(e),
        };
        let _ = stage_tx
            .send(StageEvent {
                epoch,
                kind: StageKind::SynthesisDone { result, filler },
            })
            .await;
    })
}

async fn next_stage_event(turn: &mut Option<ActiveTurn>) -> StageEvent {
    match turn {
        // The turn holds a sender, so the channel never closes under it.
        Some(turn) => match turn.stage_rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
