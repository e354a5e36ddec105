//! Engine collaborators backed by this service: answers and session status go
//! to Postgres, capture control goes to the connected client.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rehearsal_core::{
    answer::AnswerRecord,
    clients::{AnswerSink, CaptureDevice, SessionLifecycle},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::{db::Db, models::SessionStatus};

pub struct DbAnswerSink {
    db: Arc<Db>,
}

impl DbAnswerSink {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AnswerSink for DbAnswerSink {
    async fn record(&self, answer: &AnswerRecord) -> Result<()> {
        if self.db.insert_answer(answer).await?.is_none() {
            debug!(
                question_id = %answer.question_id,
                "Answer already recorded; keeping the first one"
            );
        }
        Ok(())
    }
}

pub struct DbLifecycle {
    db: Arc<Db>,
}

impl DbLifecycle {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Moves the session to `next`, leaving it alone if that would go backwards.
    async fn advance(&self, session_id: Uuid, next: SessionStatus) -> Result<()> {
        let session = self
            .db
            .find_session(session_id)
            .await?
            .ok_or_else(|| anyhow!("session {session_id} not found"))?;
        if !session.status.can_transition_to(next) {
            debug!(current = %session.status, %next, "Keeping session status");
            return Ok(());
        }
        self.db.update_session_status(session_id, next).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionLifecycle for DbLifecycle {
    async fn started(&self, session_id: Uuid) -> Result<()> {
        self.advance(session_id, SessionStatus::Started).await
    }

    async fn completed(&self, session_id: Uuid) -> Result<()> {
        self.advance(session_id, SessionStatus::Completed).await
    }
}

/// Capture state changes the client must apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureNotice {
    Active(bool),
    Transcribing(bool),
}

/// Capture device living in the candidate's browser, driven over the socket.
pub struct ClientCapture {
    notices: mpsc::UnboundedSender<CaptureNotice>,
}

impl ClientCapture {
    pub fn new(notices: mpsc::UnboundedSender<CaptureNotice>) -> Self {
        Self { notices }
    }
}

impl CaptureDevice for ClientCapture {
    fn acquire(&self) -> Result<()> {
        self.notices
            .send(CaptureNotice::Active(true))
            .map_err(|_| anyhow!("client connection is gone"))
    }

    fn release(&self) {
        let _ = self.notices.send(CaptureNotice::Active(false));
    }

    fn set_transcribing(&self, enabled: bool) {
        let _ = self.notices.send(CaptureNotice::Transcribing(enabled));
    }
}
