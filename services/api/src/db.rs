//! Data Access Layer
//!
//! This module contains all the functions for interacting with the PostgreSQL database.
//! Queries are checked at runtime so the crate builds without a live database.

use anyhow::Result;
use rehearsal_core::{
    answer::AnswerRecord,
    catalog::{Question, QuestionQuery},
};
use sqlx::{PgPool, types::Json};
use std::collections::HashSet;
use uuid::Uuid;

use crate::models::{Answer, CreateSessionPayload, QuestionRow, Session, SessionStatus};

const SESSION_COLUMNS: &str = "id, user_id, segment, career_stage, domain, sub_domain, lang, \
     status, init_q1_sent, questions, total_questions, duration_target, created_at, updated_at";

const QUESTION_COLUMNS: &str = "id, question_id, domain, sub_domain, level, career_target, \
     probability, question_en, question_fr, video_url_en, video_url_fr, expected_keywords, \
     expected_answer";

const ANSWER_COLUMNS: &str = "id, session_id, user_id, question_id, transcript, duration_ms, \
     pauses_count, speaking_speed_wpm, hesitations_count, created_at";

/// Duration target written alongside every stored sequence, in seconds.
pub const DURATION_TARGET_SECS: i32 = 1200;

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Creates a new `pending` session holding the candidate's profile snapshot.
    pub async fn create_session(
        &self,
        user_id: &str,
        payload: &CreateSessionPayload,
    ) -> Result<Session> {
        let sql = format!(
            "INSERT INTO sessions (user_id, segment, career_stage, domain, sub_domain, lang) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {SESSION_COLUMNS}"
        );
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(user_id)
            .bind(payload.segment.as_deref().unwrap_or("elite"))
            .bind(payload.career_stage.as_deref())
            .bind(payload.domain.as_deref())
            .bind(payload.sub_domain.as_deref())
            .bind(payload.lang.as_deref().unwrap_or("en"))
            .fetch_one(&self.pool)
            .await?;
        Ok(session)
    }

    /// Retrieves a single session by its ID, scoped to a specific user.
    pub async fn get_session(&self, session_id: Uuid, user_id: &str) -> Result<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1 AND user_id = $2");
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(session_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    /// Retrieves a single session by its ID, regardless of owner.
    pub async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    /// Lists all sessions for a given user, ordered by most recent.
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let sessions = sqlx::query_as::<_, Session>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(sessions)
    }

    /// Updates the status of a session (e.g., from 'pending' to 'started').
    pub async fn update_session_status(
        &self,
        session_id: Uuid,
        status: SessionStatus,
    ) -> Result<Session> {
        let sql = format!(
            "UPDATE sessions SET status = $1, updated_at = now() WHERE id = $2 \
             RETURNING {SESSION_COLUMNS}"
        );
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(status)
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(session)
    }

    /// Records that the forced opener was handed out.
    pub async fn mark_opener_sent(&self, session_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET init_q1_sent = TRUE, updated_at = now() WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persists the assigned sequence and its length.
    pub async fn store_sequence(&self, session_id: Uuid, questions: &[Question]) -> Result<()> {
        let total = i32::try_from(questions.len())?;
        sqlx::query(
            "UPDATE sessions SET questions = $1, total_questions = $2, duration_target = $3, \
             updated_at = now() WHERE id = $4",
        )
        .bind(Json(questions))
        .bind(total)
        .bind(DURATION_TARGET_SECS)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Business keys of every question that already has an answer in this session.
    pub async fn asked_question_ids(&self, session_id: Uuid) -> Result<HashSet<String>> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT question_id FROM memories WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys.into_iter().collect())
    }

    /// Appends an answer. Returns `None` when the question already has one.
    pub async fn insert_answer(&self, record: &AnswerRecord) -> Result<Option<Answer>> {
        let metrics = &record.metrics;
        let sql = format!(
            "INSERT INTO memories (session_id, user_id, question_id, transcript, duration_ms, \
             pauses_count, speaking_speed_wpm, hesitations_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (session_id, question_id) DO NOTHING \
             RETURNING {ANSWER_COLUMNS}"
        );
        let answer = sqlx::query_as::<_, Answer>(&sql)
            .bind(record.session_id)
            .bind(&record.user_id)
            .bind(&record.question_id)
            .bind(&record.transcript)
            .bind(i64::try_from(metrics.duration_ms).unwrap_or(i64::MAX))
            .bind(i32::try_from(metrics.pauses_count).unwrap_or(i32::MAX))
            .bind(metrics.speaking_speed_wpm)
            .bind(i32::try_from(metrics.hesitations_count).unwrap_or(i32::MAX))
            .fetch_optional(&self.pool)
            .await?;
        Ok(answer)
    }

    /// Lists a session's answers in the order they were written.
    pub async fn list_answers(&self, session_id: Uuid) -> Result<Vec<Answer>> {
        let sql =
            format!("SELECT {ANSWER_COLUMNS} FROM memories WHERE session_id = $1 ORDER BY id ASC");
        let answers = sqlx::query_as::<_, Answer>(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(answers)
    }

    /// Active catalog questions matching `query`, in catalog order.
    pub async fn find_questions(&self, query: &QuestionQuery) -> Result<Vec<Question>> {
        let levels: Vec<i16> = query.difficulties.iter().map(|d| i16::from(*d)).collect();
        let exclude: Vec<String> = query.exclude.iter().cloned().collect();
        let sql = format!(
            "SELECT {QUESTION_COLUMNS} FROM questions \
             WHERE is_active \
               AND domain = $1 \
               AND ($2::text IS NULL OR sub_domain = $2) \
               AND level = ANY($3) \
               AND career_target && $4 \
               AND NOT (question_id = ANY($5)) \
             ORDER BY id ASC"
        );
        let rows = sqlx::query_as::<_, QuestionRow>(&sql)
            .bind(&query.domain)
            .bind(query.sub_domain.as_deref())
            .bind(&levels)
            .bind(&query.career_targets)
            .bind(&exclude)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Question::from).collect())
    }

    /// Looks up one active question by business key.
    pub async fn find_question(&self, question_id: &str) -> Result<Option<Question>> {
        let sql =
            format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE is_active AND question_id = $1");
        let row = sqlx::query_as::<_, QuestionRow>(&sql)
            .bind(question_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Question::from))
    }

    /// Stamps `last_used_at` on the given storage keys.
    pub async fn mark_questions_used(&self, ids: &[i64]) -> Result<()> {
        sqlx::query("UPDATE questions SET last_used_at = now() WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
