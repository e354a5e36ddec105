//! Postgres-backed question catalog.

use anyhow::Result;
use async_trait::async_trait;
use rehearsal_core::catalog::{Question, QuestionCatalog, QuestionQuery};
use std::sync::Arc;

use crate::db::Db;

pub struct PgQuestionCatalog {
    db: Arc<Db>,
}

impl PgQuestionCatalog {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl QuestionCatalog for PgQuestionCatalog {
    async fn find(&self, query: &QuestionQuery) -> Result<Vec<Question>> {
        self.db.find_questions(query).await
    }

    async fn find_by_key(&self, question_id: &str) -> Result<Option<Question>> {
        self.db.find_question(question_id).await
    }

    async fn mark_used(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.db.mark_questions_used(ids).await
    }
}
