//! Engagement State Machine
//!
//! Decides what happens while a candidate is (or is not) answering: keep
//! waiting, ask a clarifying follow-up, or move on. Silence is measured by a
//! single cancellable timer whose expiry comes back to the session loop as an
//! event tagged with the generation that armed it.

use crate::EngineEvent;
use crate::catalog::Language;
use crate::clients::{FollowupRequest, FollowupSource, SpeechSynthesizer};
use crate::media::{MediaLibrary, SystemClip};
use crate::playlist::PlaylistQueue;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Spoken when no contextual follow-up can be obtained.
pub const DEFAULT_FOLLOWUP: &str = "Do you want me to repeat the question?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementState {
    /// No question is being answered (intro, question clip, between questions).
    Inactive,
    Listening,
    Clarifying,
    Advancing,
    /// The session is over; every signal is ignored.
    Disabled,
}

/// What the session loop must do after a silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceOutcome {
    /// Stale or irrelevant expiry.
    Ignored,
    /// Nothing said yet; keep waiting.
    Patience,
    /// A clarification clip was queued and should start now.
    Clarify,
    /// Second silence after speech; move to the next question.
    Advance,
}

/// One-shot silence timer. Arming cancels the previous handle first.
#[derive(Debug)]
pub struct SilenceTimer {
    threshold: Duration,
    generation: u64,
    armed: Option<u64>,
    handle: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl SilenceTimer {
    pub fn new(threshold: Duration, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            threshold,
            generation: 0,
            armed: None,
            handle: None,
            events,
        }
    }

    pub fn arm(&mut self) -> u64 {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let threshold = self.threshold;
        let events = self.events.clone();
        self.armed = Some(generation);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            let _ = events.send(EngineEvent::SilenceElapsed { generation });
        }));
        generation
    }

    pub fn cancel(&mut self) {
        self.armed = None;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Consumes an expiry if it belongs to the most recently armed timer.
    pub fn take_expired(&mut self, generation: u64) -> bool {
        if self.armed == Some(generation) {
            self.armed = None;
            self.handle = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl Drop for SilenceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Per-session engagement context.
pub struct IdleManager {
    state: EngagementState,
    has_spoken: bool,
    relance_count: u8,
    timer: SilenceTimer,
    /// Bumped whenever an outstanding clarification must be discarded.
    clarify_turn: u64,
    question_id: Option<String>,
    question_text: Option<String>,
    last_followup: Option<String>,
    session_id: Uuid,
    language: Language,
    media: MediaLibrary,
    followups: Arc<dyn FollowupSource>,
    speech: Arc<dyn SpeechSynthesizer>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl IdleManager {
    pub fn new(
        session_id: Uuid,
        language: Language,
        silence_threshold: Duration,
        media: MediaLibrary,
        followups: Arc<dyn FollowupSource>,
        speech: Arc<dyn SpeechSynthesizer>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            state: EngagementState::Inactive,
            has_spoken: false,
            relance_count: 0,
            timer: SilenceTimer::new(silence_threshold, events.clone()),
            clarify_turn: 0,
            question_id: None,
            question_text: None,
            last_followup: None,
            session_id,
            language,
            media,
            followups,
            speech,
            events,
        }
    }

    pub fn state(&self) -> EngagementState {
        self.state
    }

    pub fn has_spoken(&self) -> bool {
        self.has_spoken
    }

    pub fn relance_count(&self) -> u8 {
        self.relance_count
    }

    /// Whether engagement signals are currently relevant.
    pub fn is_engaged(&self) -> bool {
        matches!(
            self.state,
            EngagementState::Listening | EngagementState::Clarifying
        )
    }

    /// Question the candidate is answering; used as follow-up context.
    pub fn set_question(&mut self, question_id: &str, text: Option<String>) {
        self.question_id = Some(question_id.to_string());
        self.question_text = text;
    }

    /// Queues one idle cycle and arms the silence timer.
    pub fn start_loop(&mut self, playlist: &mut PlaylistQueue) {
        if self.state == EngagementState::Disabled {
            return;
        }
        self.state = EngagementState::Listening;
        playlist.add(self.media.idle_cycle(self.language));
        self.timer.arm();
        debug!(question_id = ?self.question_id, "Listening loop started");
    }

    /// Queues another idle cycle if the candidate would otherwise be left
    /// without media. Returns whether anything was queued.
    ///
    /// Nothing is queued while a clarification is outstanding: the main
    /// clarify clip must directly follow the short one.
    pub fn continue_loop(&mut self, playlist: &mut PlaylistQueue) -> bool {
        if self.state != EngagementState::Listening || playlist.size() > 0 {
            return false;
        }
        playlist.add(self.media.idle_cycle(self.language));
        true
    }

    /// Returns false when the signal was ignored.
    pub fn on_user_speaking(&mut self) -> bool {
        if !self.is_engaged() {
            return false;
        }
        self.has_spoken = true;
        self.relance_count = 0;
        if self.state == EngagementState::Clarifying {
            // The candidate picked up again; the pending prompt is moot.
            self.state = EngagementState::Listening;
            self.clarify_turn += 1;
        }
        self.timer.arm();
        true
    }

    /// Applies the silence rules for an expired timer.
    ///
    /// `transcript` is the answer so far, sent as follow-up context.
    pub fn handle_silence(
        &mut self,
        generation: u64,
        playlist: &mut PlaylistQueue,
        transcript: &str,
    ) -> SilenceOutcome {
        if !self.timer.take_expired(generation) || !self.is_engaged() {
            debug!(generation, state = ?self.state, "Ignoring silence expiry");
            return SilenceOutcome::Ignored;
        }

        if !self.has_spoken {
            self.timer.arm();
            return SilenceOutcome::Patience;
        }

        if self.relance_count >= 1 {
            info!("Second silence after a clarification; advancing");
            self.relance_count = 0;
            self.state = EngagementState::Advancing;
            self.timer.cancel();
            return SilenceOutcome::Advance;
        }

        self.relance_count += 1;
        self.state = EngagementState::Clarifying;
        self.timer.cancel();
        self.clarify_turn += 1;
        playlist.clear_pending();
        playlist.add([self.media.system(SystemClip::ClarifyShort, self.language)]);
        self.spawn_clarification(transcript);
        info!(turn = self.clarify_turn, "Silence after speech; clarifying");
        SilenceOutcome::Clarify
    }

    fn spawn_clarification(&self, transcript: &str) {
        let turn = self.clarify_turn;
        let language = self.language;
        let cached = self.last_followup.clone();
        let request = FollowupRequest {
            session_id: self.session_id,
            question_id: self.question_id.clone(),
            question: self.question_text.clone(),
            answer: transcript.to_string(),
            lang: language,
        };
        let followups = self.followups.clone();
        let speech = self.speech.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let text = match cached {
                Some(text) => text,
                None => match followups.followup(&request).await {
                    Ok(Some(text)) if !text.trim().is_empty() => text,
                    Ok(_) => DEFAULT_FOLLOWUP.to_string(),
                    Err(e) => {
                        warn!(error = ?e, "Follow-up request failed; using default prompt");
                        DEFAULT_FOLLOWUP.to_string()
                    }
                },
            };
            let audio = match speech.synthesize(&text, language).await {
                Ok(audio) if !audio.is_empty() => Some(audio),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = ?e, "Speech synthesis failed; sending text only");
                    None
                }
            };
            let _ = events.send(EngineEvent::ClarificationReady { turn, text, audio });
        });
    }

    /// Finishes a clarification once its prompt is ready.
    ///
    /// Returns the prompt to speak, or `None` when the clarification is stale.
    pub fn complete_clarification(
        &mut self,
        turn: u64,
        text: String,
        audio: Option<Bytes>,
        playlist: &mut PlaylistQueue,
    ) -> Option<(String, Option<Bytes>)> {
        if turn != self.clarify_turn || !self.is_engaged() {
            debug!(turn, current = self.clarify_turn, "Dropping stale clarification");
            return None;
        }
        self.last_followup = Some(text.clone());
        playlist.add([self.media.system(SystemClip::ClarifyMain, self.language)]);
        playlist.add(self.media.idle_cycle(self.language));
        self.state = EngagementState::Listening;
        self.timer.arm();
        Some((text, audio))
    }

    /// Clears the per-question context. Called whenever control moves to a
    /// new question.
    pub fn reset_context(&mut self) {
        self.timer.cancel();
        self.has_spoken = false;
        self.relance_count = 0;
        self.clarify_turn += 1;
        self.question_id = None;
        self.question_text = None;
        self.last_followup = None;
        if self.state != EngagementState::Disabled {
            self.state = EngagementState::Inactive;
        }
    }

    /// Stops all engagement activity for the rest of the session.
    pub fn disable(&mut self) {
        self.timer.cancel();
        self.clarify_turn += 1;
        self.state = EngagementState::Disabled;
    }
}
