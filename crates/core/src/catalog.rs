//! Question Catalog
//!
//! This module defines the question record consumed by the sequencer and the
//! read-only catalog contract it queries. The catalog is an external store;
//! `InMemoryCatalog` backs tests and local development.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::Mutex;

/// Domain every other domain falls back to.
pub const GENERAL_DOMAIN: &str = "general";

/// Languages for which prompt text and media are authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Fr,
}

impl Language {
    /// The other supported language, used as the first media fallback.
    pub fn other(self) -> Self {
        match self {
            Language::En => Language::Fr,
            Language::Fr => Language::En,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Fr => "fr",
        }
    }

    /// Parses a language code, defaulting to English for anything unknown.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_lowercase().as_str() {
            "fr" => Language::Fr,
            _ => Language::En,
        }
    }
}

/// A value authored once per supported language.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Localized<T> {
    pub en: Option<T>,
    pub fr: Option<T>,
}

impl<T> Localized<T> {
    pub fn get(&self, language: Language) -> Option<&T> {
        match language {
            Language::En => self.en.as_ref(),
            Language::Fr => self.fr.as_ref(),
        }
    }

    /// Returns the value for `language`, falling back to the other language.
    pub fn resolve(&self, language: Language) -> Option<&T> {
        self.get(language).or_else(|| self.get(language.other()))
    }
}

/// An interview question as stored in the catalog and exposed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Storage key.
    pub id: i64,
    /// Stable business key (e.g. `q_0001`), used for exclusion.
    pub question_id: String,
    pub domain: String,
    pub sub_domain: Option<String>,
    /// Difficulty level, 1 to 3.
    pub difficulty: u8,
    /// Career stages this question targets.
    pub career_target: Vec<String>,
    /// Ranking weight; higher is preferred.
    pub probability: f64,
    pub text: Localized<String>,
    pub video: Localized<String>,
    #[serde(default)]
    pub expected_keywords: Vec<String>,
    #[serde(default)]
    pub expected_answer: Option<String>,
}

/// Filter for a single catalog fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionQuery {
    pub domain: String,
    /// Exact sub-domain filter, applied only when present.
    pub sub_domain: Option<String>,
    pub difficulties: Vec<u8>,
    /// Pyramid-expanded career stages; a question matches when it targets any of them.
    pub career_targets: Vec<String>,
    /// Business keys that must not be returned.
    pub exclude: HashSet<String>,
}

impl QuestionQuery {
    /// Whether `question` satisfies every filter of this query.
    pub fn matches(&self, question: &Question) -> bool {
        question.domain == self.domain
            && self
                .sub_domain
                .as_deref()
                .is_none_or(|sub| question.sub_domain.as_deref() == Some(sub))
            && self.difficulties.contains(&question.difficulty)
            && question
                .career_target
                .iter()
                .any(|target| self.career_targets.contains(target))
            && !self.exclude.contains(&question.question_id)
    }
}

/// Read access to the question store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuestionCatalog: Send + Sync {
    /// Returns every active question matching `query`, in catalog order.
    ///
    /// Ranking and truncation are the caller's job.
    async fn find(&self, query: &QuestionQuery) -> Result<Vec<Question>>;

    /// Looks up a single active question by business key.
    async fn find_by_key(&self, question_id: &str) -> Result<Option<Question>>;

    /// Stamps the "last used" marker on the given storage keys.
    async fn mark_used(&self, ids: &[i64]) -> Result<()>;
}

/// A catalog held entirely in memory.
///
/// Catalog order is insertion order. `mark_used` calls are recorded so tests
/// can observe the bookkeeping side effect.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    questions: Vec<Question>,
    used_log: Mutex<Vec<i64>>,
}

impl InMemoryCatalog {
    pub fn new(questions: Vec<Question>) -> Self {
        Self {
            questions,
            used_log: Mutex::new(Vec::new()),
        }
    }

    /// Storage keys passed to `mark_used` so far, in call order.
    pub async fn used_log(&self) -> Vec<i64> {
        self.used_log.lock().await.clone()
    }
}

#[async_trait]
impl QuestionCatalog for InMemoryCatalog {
    async fn find(&self, query: &QuestionQuery) -> Result<Vec<Question>> {
        Ok(self
            .questions
            .iter()
            .filter(|q| query.matches(q))
            .cloned()
            .collect())
    }

    async fn find_by_key(&self, question_id: &str) -> Result<Option<Question>> {
        Ok(self
            .questions
            .iter()
            .find(|q| q.question_id == question_id)
            .cloned())
    }

    async fn mark_used(&self, ids: &[i64]) -> Result<()> {
        self.used_log.lock().await.extend_from_slice(ids);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Builds a question with English media derived from its key.
    pub fn question(
        id: i64,
        key: &str,
        domain: &str,
        sub_domain: Option<&str>,
        difficulty: u8,
        targets: &[&str],
        probability: f64,
    ) -> Question {
        Question {
            id,
            question_id: key.to_string(),
            domain: domain.to_string(),
            sub_domain: sub_domain.map(str::to_string),
            difficulty,
            career_target: targets.iter().map(|t| t.to_string()).collect(),
            probability,
            text: Localized {
                en: Some(format!("Prompt for {key}")),
                fr: None,
            },
            video: Localized {
                en: Some(format!("https://cdn.test/questions/{key}_en.mp4")),
                fr: None,
            },
            expected_keywords: vec![],
            expected_answer: None,
        }
    }
}
