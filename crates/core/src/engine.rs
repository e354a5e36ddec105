//! Session Runtime
//!
//! Plays a question sequence as a guided conversation. One `Engine` drives one
//! session from a single event loop: client signals, timer expiries and the
//! results of background network calls all arrive as `EngineEvent`s, and every
//! outward effect leaves as an `EngineCommand`. Nothing in here blocks on I/O;
//! slow calls are spawned and report back through the event channel.

use crate::answer::{AnswerRecord, AnswerTracker};
use crate::catalog::{Language, Question};
use crate::clients::{
    AnswerSink, CaptureDevice, CaptureLease, FeedbackReport, FeedbackService, FollowupSource,
    SequenceFetchError, SequenceSource, SessionLifecycle, SpeechSynthesizer,
};
use crate::idle::{IdleManager, SilenceOutcome};
use crate::media::{MediaLibrary, MediaRef, SystemClip};
use crate::playlist::PlaylistQueue;
use crate::retry::RetryPolicy;
use crate::sequencer::SequenceResponse;
use crate::session_timer::{SessionTimer, TimerSignal};
use crate::{EngineCommand, EngineEvent};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub silence_threshold: Duration,
    pub retry: RetryPolicy,
    pub session_duration: Duration,
    pub timer_tick: Duration,
    pub language: Language,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            silence_threshold: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            session_duration: Duration::from_secs(1200),
            timer_tick: Duration::from_secs(1),
            language: Language::En,
        }
    }
}

/// Identity of the session being played.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub user_id: String,
}

/// Everything outside the engine it needs to talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub sequences: Arc<dyn SequenceSource>,
    pub feedback: Arc<dyn FeedbackService>,
    pub followups: Arc<dyn FollowupSource>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub answers: Arc<dyn AnswerSink>,
    pub lifecycle: Arc<dyn SessionLifecycle>,
    pub capture: Arc<dyn CaptureDevice>,
}

/// Why a sequence request was made; decides what happens with the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePurpose {
    /// Issued when the engine boots, before the candidate presses start.
    Initial,
    /// Issued once the opener has been answered, or when the first request
    /// did not carry an opener.
    Continuation,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid session: {0}")]
    InvalidSession(String),
    #[error("no question sequence available: {0}")]
    SequenceUnavailable(String),
    #[error("session stopped before completion")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Loading,
    Ready,
    Running,
    Closing,
}

pub struct Engine {
    session: SessionContext,
    config: EngineConfig,
    collab: Collaborators,
    media: MediaLibrary,
    playlist: PlaylistQueue,
    idle: IdleManager,
    tracker: AnswerTracker,
    events: mpsc::UnboundedSender<EngineEvent>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    phase: Phase,
    opener: Option<Question>,
    questions: Vec<Question>,
    next_index: usize,
    active: Option<Question>,
    active_is_opener: bool,
    answered: HashSet<String>,
    /// Follow-up prompt waiting for the main clarify clip to start.
    pending_prompt: Option<(String, Option<Bytes>)>,
    lease: Option<CaptureLease>,
    timer: Option<SessionTimer>,
    start_requested: bool,
    awaiting_media: bool,
    sequence_pending: bool,
    terminated: bool,
    outcome: Option<Result<(), EngineError>>,
}

impl Engine {
    /// Builds an engine and the receiver its event loop consumes.
    ///
    /// Hosts feed client signals through `event_sender()`.
    pub fn new(
        session: SessionContext,
        config: EngineConfig,
        media: MediaLibrary,
        collab: Collaborators,
        commands: mpsc::UnboundedSender<EngineCommand>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let idle = IdleManager::new(
            session.session_id,
            config.language,
            config.silence_threshold,
            media.clone(),
            collab.followups.clone(),
            collab.speech.clone(),
            events.clone(),
        );
        let engine = Self {
            session,
            config,
            collab,
            media,
            playlist: PlaylistQueue::new(),
            idle,
            tracker: AnswerTracker::default(),
            events,
            commands,
            phase: Phase::Loading,
            opener: None,
            questions: Vec::new(),
            next_index: 0,
            active: None,
            active_is_opener: false,
            answered: HashSet::new(),
            pending_prompt: None,
            lease: None,
            timer: None,
            start_requested: false,
            awaiting_media: false,
            sequence_pending: false,
            terminated: false,
            outcome: None,
        };
        (engine, events_rx)
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<EngineEvent> {
        self.events.clone()
    }

    /// Runs the session until it reaches a terminal state.
    #[instrument(name = "engine", skip_all, fields(session_id = %self.session.session_id))]
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Result<(), EngineError> {
        let mut playlist_rx = self.playlist.subscribe();
        self.request_sequence(SequencePurpose::Initial);

        while self.outcome.is_none() {
            tokio::select! {
                biased;
                Some(current) = playlist_rx.recv() => self.on_current_changed(current),
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => self.finish(Err(EngineError::Disconnected)),
                },
            }
        }

        self.idle.disable();
        if let Some(timer) = self.timer.as_mut() {
            timer.stop();
        }
        if let Some(lease) = self.lease.as_mut() {
            lease.release();
        }
        let outcome = self.outcome.take().unwrap_or(Err(EngineError::Disconnected));
        info!(ok = outcome.is_ok(), "Engine stopped");
        outcome
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Start => self.on_start(),
            EngineEvent::MediaEnded { uri, seq } => self.on_media_ended(uri.as_deref(), seq),
            EngineEvent::UserSpeaking => {
                if self.idle.on_user_speaking() {
                    self.tracker.on_speaking();
                }
            }
            EngineEvent::Transcript { text } => {
                if self.idle.is_engaged() {
                    self.tracker.on_transcript(&text);
                }
            }
            EngineEvent::SilenceElapsed { generation } => self.on_silence(generation),
            EngineEvent::ClarificationReady { turn, text, audio } => {
                if let Some(prompt) =
                    self.idle
                        .complete_clarification(turn, text, audio, &mut self.playlist)
                {
                    self.pending_prompt = Some(prompt);
                    self.kick();
                }
            }
            EngineEvent::SequenceLoaded { purpose, result } => {
                self.sequence_pending = false;
                self.on_sequence_loaded(purpose, result);
            }
            EngineEvent::FeedbackReady { report } => {
                info!(ok = report.ok, "Feedback hand-off finished");
                self.emit(EngineCommand::Feedback(report));
                self.emit(EngineCommand::ReturnToDashboard);
                self.finish(Ok(()));
            }
            EngineEvent::Timer(signal) => self.on_timer(signal),
            EngineEvent::Shutdown => {
                info!("Shutdown requested");
                self.finish(Err(EngineError::Disconnected));
            }
        }
    }

    fn on_start(&mut self) {
        match self.phase {
            Phase::Loading => {
                debug!("Start received while loading; deferring");
                self.start_requested = true;
            }
            Phase::Ready => self.begin(),
            Phase::Running | Phase::Closing => debug!("Ignoring duplicate start"),
        }
    }

    fn begin(&mut self) {
        info!("Session starting");
        self.phase = Phase::Running;
        match CaptureLease::acquire(self.collab.capture.clone()) {
            Ok(lease) => self.lease = Some(lease),
            Err(e) => warn!(error = ?e, "Capture unavailable; continuing without it"),
        }

        let lifecycle = self.collab.lifecycle.clone();
        let session_id = self.session.session_id;
        tokio::spawn(async move {
            if let Err(e) = lifecycle.started(session_id).await {
                warn!(error = ?e, "Failed to mark session started");
            }
        });

        self.timer = Some(SessionTimer::start(
            self.config.session_duration,
            self.config.timer_tick,
            self.events.clone(),
        ));

        self.playlist.reset();
        self.playlist.add(self.media.intro(self.config.language));
        self.advance_playlist();
    }

    fn on_current_changed(&mut self, current: Option<MediaRef>) {
        let Some(item) = current else {
            return;
        };
        if let Some(lease) = self.lease.as_mut() {
            lease.set_transcribing(item.is_listening());
        }
        let question_text = item.question_id().and_then(|id| {
            let question = self.active.as_ref().filter(|q| q.question_id == id)?;
            let text = question.text.resolve(self.config.language)?;
            Some((id.to_string(), text.clone()))
        });
        let prompt = match item.clip() {
            Some(SystemClip::ClarifyMain) => self.pending_prompt.take(),
            _ => None,
        };
        self.emit(EngineCommand::Play(item));
        if let Some((question_id, text)) = question_text {
            self.emit(EngineCommand::QuestionText { question_id, text });
        }
        if let Some((text, audio)) = prompt {
            self.emit(EngineCommand::Speak { text, audio });
        }
    }

    fn on_media_ended(&mut self, uri: Option<&str>, seq: Option<u64>) {
        let Some(current) = self.playlist.current().cloned() else {
            debug!("Media end with nothing playing");
            return;
        };
        // Idle clips share a URI, so the queue stamp is the exact match.
        let stale = match (seq, uri) {
            (Some(seq), _) => seq != current.seq,
            (None, Some(uri)) => uri != current.uri,
            (None, None) => false,
        };
        if stale {
            debug!(?uri, ?seq, current = %current.uri, "Ignoring stale media end");
            return;
        }

        if self.phase == Phase::Closing || self.terminated {
            self.advance_playlist();
            return;
        }

        match current.clip() {
            Some(SystemClip::IntroSecond) => self.first_question(),
            None => self.on_question_clip_ended(),
            Some(_) => {
                self.idle.continue_loop(&mut self.playlist);
                self.advance_playlist();
            }
        }
    }

    fn first_question(&mut self) {
        if let Some(opener) = self.opener.clone() {
            self.play_question(opener, true);
        } else if let Some(first) = self.questions.first().cloned() {
            self.next_index = 1;
            self.play_question(first, false);
        } else {
            self.request_sequence(SequencePurpose::Continuation);
            self.awaiting_media = true;
        }
    }

    fn on_question_clip_ended(&mut self) {
        self.idle.reset_context();
        self.tracker = AnswerTracker::default();
        if let Some(question) = &self.active {
            let text = question.text.resolve(self.config.language).cloned();
            self.idle.set_question(&question.question_id, text);
        }
        self.idle.start_loop(&mut self.playlist);
        self.advance_playlist();
    }

    fn on_silence(&mut self, generation: u64) {
        match self
            .idle
            .handle_silence(generation, &mut self.playlist, self.tracker.transcript())
        {
            SilenceOutcome::Ignored | SilenceOutcome::Patience => {}
            SilenceOutcome::Clarify => {
                self.tracker.on_pause();
                // The clarification interrupts whatever idle clip is playing.
                self.advance_playlist();
            }
            SilenceOutcome::Advance => {
                self.tracker.on_pause();
                self.record_answer();
                self.next_question();
            }
        }
    }

    fn next_question(&mut self) {
        if self.active_is_opener {
            self.active_is_opener = false;
            self.opener = None;
            self.playlist.clear_pending();
            if self.questions.is_empty() {
                self.request_sequence(SequencePurpose::Continuation);
                return;
            }
        }
        match self.questions.get(self.next_index).cloned() {
            Some(question) => {
                self.next_index += 1;
                self.play_question(question, false);
            }
            None => self.begin_closing(),
        }
    }

    fn play_question(&mut self, question: Question, is_opener: bool) {
        info!(question_id = %question.question_id, is_opener, "Playing question");
        self.idle.reset_context();
        self.tracker = AnswerTracker::default();
        self.pending_prompt = None;
        self.playlist.clear_pending();
        self.playlist
            .add([self.media.question(&question, self.config.language)]);
        self.active = Some(question);
        self.active_is_opener = is_opener;
        self.advance_playlist();
    }

    fn record_answer(&mut self) {
        let Some(question) = &self.active else {
            return;
        };
        if !self.answered.insert(question.question_id.clone()) {
            debug!(question_id = %question.question_id, "Answer already recorded");
            return;
        }
        let (transcript, metrics) = self.tracker.finalize();
        let record = AnswerRecord {
            user_id: self.session.user_id.clone(),
            session_id: self.session.session_id,
            question_id: question.question_id.clone(),
            transcript,
            metrics,
        };
        let answers = self.collab.answers.clone();
        tokio::spawn(async move {
            if let Err(e) = answers.record(&record).await {
                warn!(error = ?e, question_id = %record.question_id, "Failed to record answer");
            }
        });
    }

    fn begin_closing(&mut self) {
        info!("No questions left; closing session");
        self.phase = Phase::Closing;
        self.idle.disable();
        self.playlist.clear_pending();
        self.playlist.add(self.media.closing(self.config.language));
        self.advance_playlist();
        self.terminate();
    }

    fn on_timer(&mut self, signal: TimerSignal) {
        if self.terminated {
            return;
        }
        match signal {
            TimerSignal::HardStop => {
                warn!("Session time is up; stopping");
                self.playlist.reset();
                self.emit(EngineCommand::Halt);
                self.idle.disable();
                if self.idle.has_spoken() {
                    self.record_answer();
                }
                self.phase = Phase::Closing;
                self.terminate();
            }
            _ => {
                info!(?signal, "Time warning");
                self.emit(EngineCommand::TimeWarning {
                    signal,
                    notice: signal.spoken_notice().map(str::to_string),
                });
            }
        }
    }

    /// Releases the session's resources and hands off to feedback generation.
    /// Runs once, whichever path gets here first.
    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Some(lease) = self.lease.as_mut() {
            lease.release();
        }
        if let Some(timer) = self.timer.as_mut() {
            timer.stop();
        }

        let session_id = self.session.session_id;
        let lifecycle = self.collab.lifecycle.clone();
        let feedback = self.collab.feedback.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = lifecycle.completed(session_id).await {
                warn!(error = ?e, "Failed to mark session completed");
            }
            let report = match feedback.generate(session_id).await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = ?e, "Feedback generation failed");
                    FeedbackReport::default()
                }
            };
            let _ = events.send(EngineEvent::FeedbackReady { report });
        });
    }

    fn request_sequence(&mut self, purpose: SequencePurpose) {
        if self.sequence_pending {
            debug!(?purpose, "Sequence request already in flight");
            return;
        }
        self.sequence_pending = true;
        let source = self.collab.sequences.clone();
        let retry = self.config.retry;
        let session_id = self.session.session_id;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = retry
                .run(
                    |attempt| {
                        let source = source.clone();
                        async move {
                            debug!(attempt, ?purpose, "Requesting sequence");
                            match source.request(session_id).await {
                                Ok(SequenceResponse::Sequence { questions, .. })
                                    if questions.is_empty() =>
                                {
                                    Err(SequenceFetchError::NotReady("empty sequence".into()))
                                }
                                other => other,
                            }
                        }
                    },
                    SequenceFetchError::is_retryable,
                )
                .await;
            let _ = events.send(EngineEvent::SequenceLoaded { purpose, result });
        });
    }

    fn on_sequence_loaded(
        &mut self,
        purpose: SequencePurpose,
        result: Result<SequenceResponse, SequenceFetchError>,
    ) {
        match (purpose, result) {
            (SequencePurpose::Initial, Ok(response)) => {
                let total_questions = match response {
                    SequenceResponse::Opener { question, .. } => {
                        self.opener = question;
                        usize::from(self.opener.is_some())
                    }
                    SequenceResponse::Sequence { questions, .. } => {
                        self.questions = questions;
                        self.questions.len()
                    }
                };
                info!(total_questions, "Session ready");
                self.phase = Phase::Ready;
                self.emit(EngineCommand::Ready { total_questions });
                if self.start_requested {
                    self.begin();
                }
            }
            (SequencePurpose::Initial, Err(SequenceFetchError::InvalidSession(reason))) => {
                error!(%reason, "Refusing to play an invalid session");
                self.emit(EngineCommand::InvalidSession {
                    reason: reason.clone(),
                });
                self.finish(Err(EngineError::InvalidSession(reason)));
            }
            (SequencePurpose::Initial, Err(e)) => {
                error!(error = %e, "Sequence never became ready");
                self.emit(EngineCommand::ReturnToDashboard);
                self.finish(Err(EngineError::SequenceUnavailable(e.to_string())));
            }
            (SequencePurpose::Continuation, _) if self.terminated => {}
            (SequencePurpose::Continuation, Ok(SequenceResponse::Sequence { questions, .. })) => {
                info!(total_questions = questions.len(), "Full sequence loaded");
                self.questions = questions;
                self.next_index = 0;
                self.next_question();
            }
            (SequencePurpose::Continuation, Ok(SequenceResponse::Opener { .. })) => {
                warn!("Sequencer returned the opener again; closing");
                self.begin_closing();
            }
            (SequencePurpose::Continuation, Err(e)) => {
                error!(error = %e, "Could not load the rest of the sequence; closing");
                self.begin_closing();
            }
        }
    }

    /// Starts the next pending item, or remembers that the player is idle.
    fn advance_playlist(&mut self) {
        self.awaiting_media = self.playlist.next().is_none();
    }

    /// Starts playback if the player went idle waiting for new items.
    fn kick(&mut self) {
        if self.awaiting_media {
            self.advance_playlist();
        }
    }

    fn emit(&mut self, command: EngineCommand) {
        if self.commands.send(command).is_err() && self.outcome.is_none() {
            warn!("Command receiver dropped; stopping engine");
            self.outcome = Some(Err(EngineError::Disconnected));
        }
    }

    fn finish(&mut self, outcome: Result<(), EngineError>) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::question;
    use crate::clients::{FollowupRequest, NoFollowups, NoSpeech};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::task::JoinHandle;

    struct ScriptedSequences {
        replies: Mutex<VecDeque<Result<SequenceResponse, SequenceFetchError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSequences {
        fn new(replies: Vec<Result<SequenceResponse, SequenceFetchError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl SequenceSource for ScriptedSequences {
        async fn request(&self, _session_id: Uuid) -> Result<SequenceResponse, SequenceFetchError> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SequenceFetchError::NotReady("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct Recorder {
        answers: Mutex<Vec<AnswerRecord>>,
        lifecycle: Mutex<Vec<&'static str>>,
        capture: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AnswerSink for Recorder {
        async fn record(&self, answer: &AnswerRecord) -> Result<()> {
            self.answers.lock().unwrap().push(answer.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl SessionLifecycle for Recorder {
        async fn started(&self, _session_id: Uuid) -> Result<()> {
            self.lifecycle.lock().unwrap().push("started");
            Ok(())
        }

        async fn completed(&self, _session_id: Uuid) -> Result<()> {
            self.lifecycle.lock().unwrap().push("completed");
            Ok(())
        }
    }

    impl CaptureDevice for Recorder {
        fn acquire(&self) -> Result<()> {
            self.capture.lock().unwrap().push("acquire".into());
            Ok(())
        }

        fn release(&self) {
            self.capture.lock().unwrap().push("release".into());
        }

        fn set_transcribing(&self, enabled: bool) {
            self.capture.lock().unwrap().push(format!("transcribing={enabled}"));
        }
    }

    #[async_trait]
    impl FeedbackService for Recorder {
        async fn generate(&self, _session_id: Uuid) -> Result<FeedbackReport> {
            Ok(FeedbackReport {
                ok: true,
                final_text: Some("Well done".into()),
                audio_reference: None,
            })
        }
    }

    struct SlowFollowups;

    #[async_trait]
    impl FollowupSource for SlowFollowups {
        async fn followup(&self, _request: &FollowupRequest) -> Result<Option<String>> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Some("What did you learn from it?".into()))
        }
    }

    struct SlowFeedback;

    #[async_trait]
    impl FeedbackService for SlowFeedback {
        async fn generate(&self, _session_id: Uuid) -> Result<FeedbackReport> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(FeedbackReport {
                ok: true,
                final_text: None,
                audio_reference: None,
            })
        }
    }

    struct Harness {
        events: mpsc::UnboundedSender<EngineEvent>,
        commands: UnboundedReceiver<EngineCommand>,
        recorder: Arc<Recorder>,
        sequences: Arc<ScriptedSequences>,
        handle: JoinHandle<Result<(), EngineError>>,
    }

    impl Harness {
        fn start(replies: Vec<Result<SequenceResponse, SequenceFetchError>>, config: EngineConfig) -> Self {
            Self::start_with(replies, config, |_| {})
        }

        fn start_with(
            replies: Vec<Result<SequenceResponse, SequenceFetchError>>,
            config: EngineConfig,
            customize: impl FnOnce(&mut Collaborators),
        ) -> Self {
            let recorder = Arc::new(Recorder::default());
            let sequences = Arc::new(ScriptedSequences::new(replies));
            let mut collab = Collaborators {
                sequences: sequences.clone(),
                feedback: recorder.clone(),
                followups: Arc::new(NoFollowups),
                speech: Arc::new(NoSpeech),
                answers: recorder.clone(),
                lifecycle: recorder.clone(),
                capture: recorder.clone(),
            };
            customize(&mut collab);
            let (tx, commands) = mpsc::unbounded_channel();
            let session = SessionContext {
                session_id: Uuid::nil(),
                user_id: "candidate-1".into(),
            };
            let (engine, events_rx) = Engine::new(
                session,
                config,
                MediaLibrary::new("https://media.test"),
                collab,
                tx,
            );
            let events = engine.event_sender();
            let handle = tokio::spawn(engine.run(events_rx));
            Self {
                events,
                commands,
                recorder,
                sequences,
                handle,
            }
        }

        fn send(&self, event: EngineEvent) {
            self.events.send(event).unwrap();
        }

        async fn next(&mut self) -> EngineCommand {
            self.commands.recv().await.expect("engine hung up")
        }

        /// Skips commands until one matches; returns it.
        async fn until(&mut self, wanted: impl Fn(&EngineCommand) -> bool) -> EngineCommand {
            loop {
                let command = self.next().await;
                if wanted(&command) {
                    return command;
                }
            }
        }

        async fn next_play(&mut self) -> MediaRef {
            match self.until(|c| matches!(c, EngineCommand::Play(_))).await {
                EngineCommand::Play(media) => media,
                _ => unreachable!(),
            }
        }

        fn end(&self, media: &MediaRef) {
            self.send(EngineEvent::MediaEnded {
                uri: Some(media.uri.clone()),
                seq: Some(media.seq),
            });
        }

        /// Plays through a question and answers it until the engine moves on.
        async fn answer_current_question(&mut self, question_id: &str, words: &str) {
            let clip = self.next_play().await;
            assert_eq!(clip.question_id(), Some(question_id));
            self.end(&clip);

            let idle = self.next_play().await;
            assert_eq!(idle.clip(), Some(SystemClip::IdleListen));
            self.send(EngineEvent::UserSpeaking);
            self.send(EngineEvent::Transcript { text: words.into() });

            // First silence after speech: clarification.
            let clarify = self.next_play().await;
            assert_eq!(clarify.clip(), Some(SystemClip::ClarifyShort));
            self.end(&clarify);
            let main = self.next_play().await;
            assert_eq!(main.clip(), Some(SystemClip::ClarifyMain));
            assert_eq!(
                self.next().await,
                EngineCommand::Speak {
                    text: crate::idle::DEFAULT_FOLLOWUP.into(),
                    audio: None
                }
            );
            // Second silence advances without further input.
        }
    }

    fn opener() -> Question {
        question(1, "q_0001", "general", None, 1, &["student"], 0.0)
    }

    fn sequence(keys: &[&str]) -> SequenceResponse {
        let questions: Vec<Question> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| question(10 + i as i64, key, "general", None, 1, &["student"], 0.5))
            .collect();
        SequenceResponse::Sequence {
            session_id: Uuid::nil(),
            total_questions: questions.len(),
            questions,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_session_from_opener_to_dashboard() {
        let mut h = Harness::start(
            vec![
                Ok(SequenceResponse::Opener {
                    session_id: Uuid::nil(),
                    question: Some(opener()),
                }),
                Ok(sequence(&["q_0100"])),
            ],
            EngineConfig::default(),
        );

        assert_eq!(h.next().await, EngineCommand::Ready { total_questions: 1 });
        h.send(EngineEvent::Start);

        let intro_one = h.next_play().await;
        assert_eq!(intro_one.clip(), Some(SystemClip::IntroFirst));
        h.end(&intro_one);
        let intro_two = h.next_play().await;
        h.end(&intro_two);

        h.answer_current_question("q_0001", "I am a graduate uh engineer").await;
        h.answer_current_question("q_0100", "I enjoy hard problems").await;

        let closing = h.next_play().await;
        assert_eq!(closing.clip(), Some(SystemClip::EndSimulation));
        let feedback = h.until(|c| matches!(c, EngineCommand::Feedback(_))).await;
        assert_eq!(
            feedback,
            EngineCommand::Feedback(FeedbackReport {
                ok: true,
                final_text: Some("Well done".into()),
                audio_reference: None
            })
        );
        assert_eq!(h.next().await, EngineCommand::ReturnToDashboard);
        assert!(h.handle.await.unwrap().is_ok());

        let answers = h.recorder.answers.lock().unwrap().clone();
        let keys: Vec<_> = answers.iter().map(|a| a.question_id.as_str()).collect();
        assert_eq!(keys, vec!["q_0001", "q_0100"]);
        assert_eq!(answers[0].transcript, "I am a graduate uh engineer");
        assert_eq!(answers[0].metrics.hesitations_count, 1);
        assert_eq!(answers[0].metrics.pauses_count, 2);
        assert_eq!(answers[0].user_id, "candidate-1");
        assert_eq!(
            *h.recorder.lifecycle.lock().unwrap(),
            vec!["started", "completed"]
        );

        let capture = h.recorder.capture.lock().unwrap().clone();
        assert_eq!(capture.first().map(String::as_str), Some("acquire"));
        assert_eq!(capture.last().map(String::as_str), Some("release"));
        assert!(capture.contains(&"transcribing=true".to_string()));
        assert_eq!(capture.iter().filter(|c| *c == "release").count(), 1);
        assert_eq!(h.sequences.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_question_text_follows_question_clip() {
        let mut h = Harness::start(vec![Ok(sequence(&["q_0200"]))], EngineConfig::default());
        assert_eq!(h.next().await, EngineCommand::Ready { total_questions: 1 });
        h.send(EngineEvent::Start);
        for _ in 0..2 {
            let intro = h.next_play().await;
            h.end(&intro);
        }
        let clip = h.next_play().await;
        assert_eq!(clip.question_id(), Some("q_0200"));
        assert_eq!(
            h.next().await,
            EngineCommand::QuestionText {
                question_id: "q_0200".into(),
                text: "Prompt for q_0200".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_stop_halts_and_terminates_once() {
        let config = EngineConfig {
            session_duration: Duration::from_secs(60),
            ..EngineConfig::default()
        };
        let mut h = Harness::start(vec![Ok(sequence(&["q_0100", "q_0101"]))], config);
        assert!(matches!(h.next().await, EngineCommand::Ready { .. }));
        h.send(EngineEvent::Start);
        for _ in 0..2 {
            let intro = h.next_play().await;
            h.end(&intro);
        }
        let clip = h.next_play().await;
        h.end(&clip);
        // The candidate never speaks: patience until time runs out.
        let warning = h.until(|c| matches!(c, EngineCommand::TimeWarning { .. })).await;
        assert_eq!(
            warning,
            EngineCommand::TimeWarning {
                signal: TimerSignal::FinalWarning,
                notice: Some("Thirty seconds remaining.".into())
            }
        );
        assert_eq!(
            h.until(|c| matches!(c, EngineCommand::Halt)).await,
            EngineCommand::Halt
        );
        assert!(matches!(h.next().await, EngineCommand::Feedback(_)));
        assert_eq!(h.next().await, EngineCommand::ReturnToDashboard);
        assert!(h.handle.await.unwrap().is_ok());

        assert!(h.recorder.answers.lock().unwrap().is_empty());
        assert_eq!(
            *h.recorder.lifecycle.lock().unwrap(),
            vec!["started", "completed"]
        );
        let capture = h.recorder.capture.lock().unwrap().clone();
        assert_eq!(capture.iter().filter(|c| *c == "release").count(), 1);
        assert_eq!(capture.last().map(String::as_str), Some("release"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_session_is_refused() {
        let mut h = Harness::start(
            vec![Err(SequenceFetchError::InvalidSession("unknown session".into()))],
            EngineConfig::default(),
        );
        assert_eq!(
            h.next().await,
            EngineCommand::InvalidSession {
                reason: "unknown session".into()
            }
        );
        assert!(matches!(
            h.handle.await.unwrap(),
            Err(EngineError::InvalidSession(_))
        ));
        assert_eq!(h.sequences.calls(), 1);
        assert!(h.recorder.capture.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unready_sequence_redirects_after_bounded_retry() {
        let started = tokio::time::Instant::now();
        let mut h = Harness::start(
            vec![Ok(sequence(&[])), Ok(sequence(&[]))],
            EngineConfig::default(),
        );
        assert_eq!(h.next().await, EngineCommand::ReturnToDashboard);
        assert!(matches!(
            h.handle.await.unwrap(),
            Err(EngineError::SequenceUnavailable(_))
        ));
        assert_eq!(h.sequences.calls(), 6);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_opener_requests_sequence_after_intro() {
        let mut h = Harness::start(
            vec![
                Ok(SequenceResponse::Opener {
                    session_id: Uuid::nil(),
                    question: None,
                }),
                Ok(sequence(&["q_0300"])),
            ],
            EngineConfig::default(),
        );
        assert_eq!(h.next().await, EngineCommand::Ready { total_questions: 0 });
        h.send(EngineEvent::Start);
        for _ in 0..2 {
            let intro = h.next_play().await;
            h.end(&intro);
        }
        let clip = h.next_play().await;
        assert_eq!(clip.question_id(), Some("q_0300"));
        assert_eq!(h.sequences.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_media_end_is_ignored() {
        let mut h = Harness::start(vec![Ok(sequence(&["q_0100"]))], EngineConfig::default());
        assert!(matches!(h.next().await, EngineCommand::Ready { .. }));
        h.send(EngineEvent::Start);
        let intro = h.next_play().await;
        h.send(EngineEvent::MediaEnded {
            uri: Some("https://media.test/old.mp4".into()),
            seq: None,
        });
        h.end(&intro);
        let second = h.next_play().await;
        assert_eq!(second.clip(), Some(SystemClip::IntroSecond));
    }

    /// Plays the intro and the first question clip, leaving the first idle
    /// clip on screen.
    async fn reach_first_idle(h: &mut Harness) -> MediaRef {
        assert!(matches!(h.next().await, EngineCommand::Ready { .. }));
        h.send(EngineEvent::Start);
        for _ in 0..2 {
            let intro = h.next_play().await;
            h.end(&intro);
        }
        let clip = h.next_play().await;
        h.end(&clip);
        let idle = h.next_play().await;
        assert_eq!(idle.clip(), Some(SystemClip::IdleListen));
        idle
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_media_end_does_not_skip_identical_clip() {
        let mut h = Harness::start(vec![Ok(sequence(&["q_0100"]))], EngineConfig::default());
        let first = reach_first_idle(&mut h).await;
        h.end(&first);
        let second = h.next_play().await;
        assert_eq!(second.uri, first.uri);
        assert_ne!(second.seq, first.seq);

        // The player reports the first clip twice.
        h.end(&first);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.commands.try_recv().is_err());

        h.end(&second);
        let third = h.next_play().await;
        assert_eq!(third.seq, second.seq + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_main_clarify_clip_follows_short_one_with_slow_followup() {
        let mut h = Harness::start_with(
            vec![Ok(sequence(&["q_0100"]))],
            EngineConfig::default(),
            |collab| collab.followups = Arc::new(SlowFollowups),
        );
        reach_first_idle(&mut h).await;
        h.send(EngineEvent::UserSpeaking);
        h.send(EngineEvent::Transcript {
            text: "I rewrote our build system".into(),
        });

        let short = h.next_play().await;
        assert_eq!(short.clip(), Some(SystemClip::ClarifyShort));
        let asked_at = tokio::time::Instant::now();
        h.end(&short);

        // Nothing else plays until the follow-up is ready.
        let main = match h.next().await {
            EngineCommand::Play(media) => media,
            other => panic!("expected the main clarify clip, got {other:?}"),
        };
        assert_eq!(main.clip(), Some(SystemClip::ClarifyMain));
        assert!(asked_at.elapsed() >= Duration::from_secs(10));
        assert_eq!(
            h.next().await,
            EngineCommand::Speak {
                text: "What did you learn from it?".into(),
                audio: None
            }
        );
        h.end(&main);
        assert_eq!(h.next_play().await.clip(), Some(SystemClip::IdleListen));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_stop_records_spoken_answer_and_ignores_later_signals() {
        let config = EngineConfig {
            session_duration: Duration::from_secs(60),
            silence_threshold: Duration::from_secs(120),
            ..EngineConfig::default()
        };
        let mut h = Harness::start_with(
            vec![Ok(sequence(&["q_0100", "q_0101"]))],
            config,
            |collab| collab.feedback = Arc::new(SlowFeedback),
        );
        let idle = reach_first_idle(&mut h).await;
        h.send(EngineEvent::UserSpeaking);
        h.send(EngineEvent::Transcript {
            text: "I was halfway through my answer".into(),
        });

        assert_eq!(
            h.until(|c| matches!(c, EngineCommand::Halt)).await,
            EngineCommand::Halt
        );
        // Feedback is still being generated while these arrive.
        h.send(EngineEvent::UserSpeaking);
        h.send(EngineEvent::Transcript {
            text: "I was halfway through my answer and more".into(),
        });
        h.end(&idle);

        let mut after_halt = Vec::new();
        while let Some(command) = h.commands.recv().await {
            after_halt.push(command);
        }
        assert_eq!(
            after_halt,
            vec![
                EngineCommand::Feedback(FeedbackReport {
                    ok: true,
                    final_text: None,
                    audio_reference: None
                }),
                EngineCommand::ReturnToDashboard
            ]
        );
        assert!(h.handle.await.unwrap().is_ok());

        let answers = h.recorder.answers.lock().unwrap().clone();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].question_id, "q_0100");
        assert_eq!(answers[0].transcript, "I was halfway through my answer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_capture() {
        let mut h = Harness::start(vec![Ok(sequence(&["q_0100"]))], EngineConfig::default());
        assert!(matches!(h.next().await, EngineCommand::Ready { .. }));
        h.send(EngineEvent::Start);
        h.next_play().await;
        h.send(EngineEvent::Shutdown);
        assert!(matches!(
            h.handle.await.unwrap(),
            Err(EngineError::Disconnected)
        ));
        let capture = h.recorder.capture.lock().unwrap().clone();
        assert_eq!(capture.last().map(String::as_str), Some("release"));
    }
}
