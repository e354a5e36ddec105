//! Collaborator contracts of the engine and their HTTP implementations.
//!
//! Every external service the runtime talks to sits behind a trait so a
//! session can run against fakes in tests, against in-process services in the
//! API, or against remote endpoints over HTTP.

use crate::answer::AnswerRecord;
use crate::catalog::Language;
use crate::sequencer::SequenceResponse;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a sequence could not be obtained.
#[derive(Debug, Error)]
pub enum SequenceFetchError {
    /// The sequencer has nothing to hand out yet.
    #[error("sequence not ready: {0}")]
    NotReady(String),
    /// The session id is missing or unknown. Never retried.
    #[error("invalid session: {0}")]
    InvalidSession(String),
    #[error("sequencer unreachable: {0}")]
    Transport(#[from] anyhow::Error),
}

impl SequenceFetchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SequenceFetchError::InvalidSession(_))
    }
}

/// Source of sequencing results for a session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SequenceSource: Send + Sync {
    async fn request(&self, session_id: Uuid) -> Result<SequenceResponse, SequenceFetchError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackReport {
    pub ok: bool,
    pub final_text: Option<String>,
    pub audio_reference: Option<String>,
}

/// Downstream feedback generation, triggered once per session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedbackService: Send + Sync {
    async fn generate(&self, session_id: Uuid) -> Result<FeedbackReport>;
}

/// Context sent when asking for a follow-up prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FollowupRequest {
    pub session_id: Uuid,
    pub question_id: Option<String>,
    pub question: Option<String>,
    pub answer: String,
    pub lang: Language,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FollowupSource: Send + Sync {
    /// A contextual follow-up, or `None` when the source has nothing to say.
    async fn followup(&self, request: &FollowupRequest) -> Result<Option<String>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Audio for `text`. An empty buffer means "nothing to play".
    async fn synthesize(&self, text: &str, language: Language) -> Result<Bytes>;
}

/// Append-only answer persistence.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnswerSink: Send + Sync {
    async fn record(&self, answer: &AnswerRecord) -> Result<()>;
}

/// Session status transitions owned by the runtime.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionLifecycle: Send + Sync {
    async fn started(&self, session_id: Uuid) -> Result<()>;
    async fn completed(&self, session_id: Uuid) -> Result<()>;
}

/// The candidate's capture capability (microphone, camera, transcription).
#[cfg_attr(test, mockall::automock)]
pub trait CaptureDevice: Send + Sync {
    fn acquire(&self) -> Result<()>;
    fn release(&self);
    fn set_transcribing(&self, enabled: bool);
}

/// Scoped hold on a `CaptureDevice`; released exactly once, at the latest on drop.
pub struct CaptureLease {
    device: Arc<dyn CaptureDevice>,
    transcribing: bool,
    released: bool,
}

impl CaptureLease {
    pub fn acquire(device: Arc<dyn CaptureDevice>) -> Result<Self> {
        device.acquire()?;
        Ok(Self {
            device,
            transcribing: false,
            released: false,
        })
    }

    /// Toggles transcription, skipping redundant calls.
    pub fn set_transcribing(&mut self, enabled: bool) {
        if self.released || self.transcribing == enabled {
            return;
        }
        self.transcribing = enabled;
        self.device.set_transcribing(enabled);
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.set_transcribing(false);
        self.released = true;
        self.device.release();
    }
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        self.release();
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

#[derive(Serialize)]
struct SessionBody {
    session_id: Uuid,
}

/// Sequencer reached over HTTP (`POST {session_id}`).
pub struct HttpSequenceSource {
    http_client: reqwest::Client,
    url: String,
}

impl HttpSequenceSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http_client: http_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SequenceSource for HttpSequenceSource {
    async fn request(&self, session_id: Uuid) -> Result<SequenceResponse, SequenceFetchError> {
        debug!(%session_id, url = %self.url, "Requesting sequence");
        let response = self
            .http_client
            .post(&self.url)
            .json(&SessionBody { session_id })
            .send()
            .await
            .map_err(|e| SequenceFetchError::Transport(e.into()))?;

        let status = response.status();
        if status == 400 || status == 404 {
            let body = response.text().await.unwrap_or_default();
            return Err(SequenceFetchError::InvalidSession(body));
        }
        if !status.is_success() {
            return Err(SequenceFetchError::NotReady(format!("sequencer returned {status}")));
        }
        response
            .json::<SequenceResponse>()
            .await
            .map_err(|e| SequenceFetchError::NotReady(format!("unreadable sequencer reply: {e}")))
    }
}

/// Feedback generation over HTTP (`POST {session_id}`).
pub struct HttpFeedbackService {
    http_client: reqwest::Client,
    url: String,
}

impl HttpFeedbackService {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http_client: http_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl FeedbackService for HttpFeedbackService {
    async fn generate(&self, session_id: Uuid) -> Result<FeedbackReport> {
        let response = self
            .http_client
            .post(&self.url)
            .json(&SessionBody { session_id })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("feedback service returned {status}"));
        }
        Ok(response.json().await?)
    }
}

#[derive(Deserialize)]
struct FollowupReply {
    followup_text: Option<String>,
}

/// Contextual follow-up generation over HTTP.
pub struct HttpFollowupSource {
    http_client: reqwest::Client,
    url: String,
}

impl HttpFollowupSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http_client: http_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl FollowupSource for HttpFollowupSource {
    async fn followup(&self, request: &FollowupRequest) -> Result<Option<String>> {
        let response = self.http_client.post(&self.url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("follow-up service returned {status}"));
        }
        let reply: FollowupReply = response.json().await?;
        Ok(reply.followup_text.filter(|t| !t.trim().is_empty()))
    }
}

#[derive(Serialize)]
struct SpeechBody<'a> {
    text: &'a str,
    language: Language,
}

/// Text-to-speech over HTTP; the reply body is the audio.
pub struct HttpSpeechSynthesizer {
    http_client: reqwest::Client,
    url: String,
}

impl HttpSpeechSynthesizer {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http_client: http_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str, language: Language) -> Result<Bytes> {
        let response = self
            .http_client
            .post(&self.url)
            .json(&SpeechBody { text, language })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("speech service returned {status}"));
        }
        Ok(response.bytes().await?)
    }
}

/// Used when no feedback endpoint is configured; reports a soft failure.
pub struct NoFeedback;

#[async_trait]
impl FeedbackService for NoFeedback {
    async fn generate(&self, session_id: Uuid) -> Result<FeedbackReport> {
        warn!(%session_id, "Feedback generation is not configured");
        Ok(FeedbackReport::default())
    }
}

/// Used when no follow-up endpoint is configured.
pub struct NoFollowups;

#[async_trait]
impl FollowupSource for NoFollowups {
    async fn followup(&self, _request: &FollowupRequest) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Used when no speech endpoint is configured; follow-ups are sent as text only.
pub struct NoSpeech;

#[async_trait]
impl SpeechSynthesizer for NoSpeech {
    async fn synthesize(&self, _text: &str, _language: Language) -> Result<Bytes> {
        Ok(Bytes::new())
    }
}
