//! Sequencing for stored sessions.
//!
//! Loads the session's profile and answer history, runs the sequencer, and
//! persists whatever the result obliges the caller to store: the opener marker
//! or the assigned question list.

use anyhow::Result;
use async_trait::async_trait;
use rehearsal_core::{
    catalog::Question,
    clients::{SequenceFetchError, SequenceSource},
    sequencer::{CandidateProfile, SequenceRequest, SequenceResponse, Sequenced, Sequencer},
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::Db;

#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// What the sequencer needs to know about a stored session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub profile: CandidateProfile,
    pub opener_sent: bool,
}

/// Session persistence used while sequencing.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn snapshot(&self, session_id: Uuid) -> Result<Option<SessionSnapshot>>;
    async fn asked(&self, session_id: Uuid) -> Result<HashSet<String>>;
    async fn mark_opener_sent(&self, session_id: Uuid) -> Result<()>;
    async fn store_sequence(&self, session_id: Uuid, questions: &[Question]) -> Result<()>;
}

#[async_trait]
impl SessionStore for Db {
    async fn snapshot(&self, session_id: Uuid) -> Result<Option<SessionSnapshot>> {
        Ok(self
            .find_session(session_id)
            .await?
            .map(|session| SessionSnapshot {
                profile: session.profile(),
                opener_sent: session.init_q1_sent,
            }))
    }

    async fn asked(&self, session_id: Uuid) -> Result<HashSet<String>> {
        self.asked_question_ids(session_id).await
    }

    async fn mark_opener_sent(&self, session_id: Uuid) -> Result<()> {
        Db::mark_opener_sent(self, session_id).await
    }

    async fn store_sequence(&self, session_id: Uuid, questions: &[Question]) -> Result<()> {
        Db::store_sequence(self, session_id, questions).await
    }
}

pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    sequencer: Sequencer,
    // Sequencing calls for one session must not interleave.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn SessionStore>, sequencer: Sequencer) -> Self {
        Self {
            store,
            sequencer,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Computes and persists the next sequencing result for `session_id`.
    #[instrument(name = "orchestrate", skip(self))]
    pub async fn orchestrate(&self, session_id: Uuid) -> Result<SequenceResponse, OrchestrateError> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(session_id)
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.sequence_locked(session_id).await
        };
        drop(lock);

        // Callers clone the entry under the map lock, so a count of one means
        // nobody else is waiting on this session.
        let mut locks = self.locks.lock().await;
        if locks
            .get(&session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&session_id);
        }
        result
    }

    async fn sequence_locked(&self, session_id: Uuid) -> Result<SequenceResponse, OrchestrateError> {
        let snapshot = self
            .store
            .snapshot(session_id)
            .await?
            .ok_or(OrchestrateError::SessionNotFound(session_id))?;
        let asked = self.store.asked(session_id).await?;

        let request = SequenceRequest {
            profile: snapshot.profile,
            asked,
            opener_sent: snapshot.opener_sent,
        };
        let sequenced = self.sequencer.sequence(&request).await;

        match &sequenced {
            Sequenced::Opener(question) => {
                self.store.mark_opener_sent(session_id).await?;
                info!(found = question.is_some(), "Opener handed out");
            }
            Sequenced::Sequence(questions) => {
                self.store.store_sequence(session_id, questions).await?;
                info!(total = questions.len(), "Sequence stored");
            }
        }

        Ok(SequenceResponse::from_sequenced(session_id, sequenced))
    }
}

/// Serves an engine's sequence requests from the in-process orchestrator.
pub struct LocalSequenceSource {
    orchestrator: Arc<Orchestrator>,
}

impl LocalSequenceSource {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl SequenceSource for LocalSequenceSource {
    async fn request(&self, session_id: Uuid) -> Result<SequenceResponse, SequenceFetchError> {
        self.orchestrator
            .orchestrate(session_id)
            .await
            .map_err(|e| match e {
                OrchestrateError::SessionNotFound(id) => {
                    SequenceFetchError::InvalidSession(format!("session {id} not found"))
                }
                OrchestrateError::Storage(err) => SequenceFetchError::Transport(err),
            })
    }
}
