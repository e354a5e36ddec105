//! API and Database Models
//!
//! This module defines the core data structures used for both database mapping
//! with `sqlx` and for generating OpenAPI documentation with `utoipa`.

use chrono::{DateTime, Utc};
use rehearsal_core::{
    answer::{AnswerMetrics, AnswerRecord},
    catalog::{Language, Localized, Question},
    pyramid::Segment,
    sequencer::CandidateProfile,
};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use std::{fmt, time::Duration};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[sqlx(type_name = "session_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Started,
    Completed,
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            SessionStatus::Pending => 0,
            SessionStatus::Started => 1,
            SessionStatus::Completed => 2,
        }
    }

    /// Sessions only move forward: pending, started, completed.
    /// Re-applying the current status is allowed.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Started => write!(f, "started"),
            SessionStatus::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct Session {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub user_id: String,
    #[schema(example = "elite")]
    pub segment: String,
    #[schema(example = "graduate")]
    pub career_stage: Option<String>,
    #[schema(example = "finance")]
    pub domain: Option<String>,
    pub sub_domain: Option<String>,
    #[schema(example = "en")]
    pub lang: String,
    #[schema(value_type = String, example = "pending")]
    pub status: SessionStatus,
    /// Whether the forced opener has been handed out.
    pub init_q1_sent: bool,
    /// The assigned sequence, in play order.
    #[schema(value_type = Vec<Object>)]
    pub questions: Json<Vec<Question>>,
    pub total_questions: i32,
    /// Target duration in seconds.
    pub duration_target: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// The candidate snapshot the sequencer works from.
    pub fn profile(&self) -> CandidateProfile {
        CandidateProfile {
            segment: Segment::from_code(Some(&self.segment)),
            career_stage: self.career_stage.clone(),
            domain: self.domain.clone(),
            sub_domain: self.sub_domain.clone(),
        }
    }

    pub fn language(&self) -> Language {
        Language::from_code(&self.lang)
    }

    /// Countdown length for the live session: the stored target, or
    /// `fallback` when the row has none.
    pub fn duration(&self, fallback: Duration) -> Duration {
        match u64::try_from(self.duration_target) {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => fallback,
        }
    }
}

/// A stored answer ("memory") for one question of a session.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct Answer {
    pub id: i64,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    pub user_id: String,
    #[schema(example = "q_0001")]
    pub question_id: String,
    pub transcript: String,
    pub duration_ms: i64,
    pub pauses_count: i32,
    pub speaking_speed_wpm: f64,
    pub hesitations_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Raw catalog row. Not exposed over HTTP.
#[derive(FromRow, Debug, Clone)]
pub struct QuestionRow {
    pub id: i64,
    pub question_id: String,
    pub domain: String,
    pub sub_domain: Option<String>,
    pub level: i16,
    pub career_target: Vec<String>,
    pub probability: f64,
    pub question_en: Option<String>,
    pub question_fr: Option<String>,
    pub video_url_en: Option<String>,
    pub video_url_fr: Option<String>,
    pub expected_keywords: Vec<String>,
    pub expected_answer: Option<String>,
}

impl From<QuestionRow> for Question {
    fn from(row: QuestionRow) -> Self {
        Question {
            id: row.id,
            question_id: row.question_id,
            domain: row.domain,
            sub_domain: row.sub_domain,
            difficulty: row.level.clamp(1, 3) as u8,
            career_target: row.career_target,
            probability: row.probability,
            text: Localized {
                en: row.question_en,
                fr: row.question_fr,
            },
            video: Localized {
                en: row.video_url_en,
                fr: row.video_url_fr,
            },
            expected_keywords: row.expected_keywords,
            expected_answer: row.expected_answer,
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct CreateSessionPayload {
    #[schema(example = "elite")]
    pub segment: Option<String>,
    #[schema(example = "graduate")]
    pub career_stage: Option<String>,
    #[schema(example = "finance")]
    pub domain: Option<String>,
    pub sub_domain: Option<String>,
    #[schema(example = "en")]
    pub lang: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateSessionStatusPayload {
    #[schema(example = "started")]
    pub status: SessionStatus,
}

#[derive(Deserialize, ToSchema)]
pub struct OrchestratePayload {
    #[schema(value_type = Option<String>, format = Uuid)]
    pub session_id: Option<Uuid>,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateAnswerPayload {
    #[schema(example = "q_0001")]
    pub question_id: String,
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub pauses_count: u32,
    #[serde(default)]
    pub speaking_speed_wpm: f64,
    #[serde(default)]
    pub hesitations_count: u32,
}

impl CreateAnswerPayload {
    pub fn into_record(self, session_id: Uuid, user_id: &str) -> AnswerRecord {
        AnswerRecord {
            user_id: user_id.to_string(),
            session_id,
            question_id: self.question_id,
            transcript: self.transcript,
            metrics: AnswerMetrics {
                duration_ms: self.duration_ms,
                pauses_count: self.pauses_count,
                speaking_speed_wpm: self.speaking_speed_wpm,
                hesitations_count: self.hesitations_count,
            },
        }
    }
}

/// Shape of the sequencer reply, for documentation only.
///
/// `INIT_Q1` carries `question`; `INIT_SEQUENCE` carries `total_questions`
/// and `questions`.
#[derive(Serialize, ToSchema)]
pub struct SequenceReply {
    #[schema(example = "INIT_SEQUENCE")]
    pub action: String,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    #[schema(value_type = Option<Object>)]
    pub question: Option<serde_json::Value>,
    pub total_questions: Option<usize>,
    #[schema(value_type = Option<Vec<Object>>)]
    pub questions: Option<Vec<serde_json::Value>>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
