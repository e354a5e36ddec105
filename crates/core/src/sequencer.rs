//! Adaptive Question Sequencer
//!
//! Computes the ordered, non-repeating list of questions for a session. The
//! algorithm is deterministic: every choice is a probability ranking over the
//! catalog, never a random sample.
//!
//! 1. A forced opener is returned on its own the first time a session asks.
//! 2. The candidate's stage is expanded through the career pyramid.
//! 3. A general block takes up to 4 questions per difficulty level.
//! 4. A domain block fills a 7/5/5 per-level quota from the candidate's domain,
//!    then from the domain's fallback chain.

use crate::catalog::{GENERAL_DOMAIN, Question, QuestionCatalog, QuestionQuery};
use crate::pyramid::{Segment, eligible_stages};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Business key of the question every session opens with.
pub const OPENER_QUESTION_ID: &str = "q_0001";

/// Questions taken from the general domain per difficulty level.
pub const GENERAL_BLOCK_PER_LEVEL: usize = 4;

/// Per-difficulty quota of the domain-specific block.
pub const DOMAIN_QUOTA: [(u8, usize); 3] = [(1, 7), (2, 5), (3, 5)];

/// Preference order used to backfill a requested difficulty level.
pub fn difficulty_cascade(level: u8) -> &'static [u8] {
    match level {
        1 => &[1, 2, 3],
        2 => &[2, 1, 3],
        _ => &[3, 2, 1],
    }
}

/// Alternate domains tried when a domain lacks eligible content.
///
/// Every domain currently falls back to the general pool only.
pub fn domain_fallback(_domain: &str) -> &'static [&'static str] {
    &[GENERAL_DOMAIN]
}

/// The profile snapshot the sequencer works from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub segment: Segment,
    pub career_stage: Option<String>,
    pub domain: Option<String>,
    pub sub_domain: Option<String>,
}

impl CandidateProfile {
    /// The candidate's domain, defaulting to the general pool.
    pub fn domain(&self) -> &str {
        self.domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(GENERAL_DOMAIN)
    }

    fn sub_domain(&self) -> Option<&str> {
        self.sub_domain.as_deref().filter(|s| !s.is_empty())
    }
}

/// Everything one sequencing call needs to know about the session.
#[derive(Debug, Clone, Default)]
pub struct SequenceRequest {
    pub profile: CandidateProfile,
    /// Business keys that already have an answer record.
    pub asked: HashSet<String>,
    /// Whether the forced opener was already handed out.
    pub opener_sent: bool,
}

/// Result of a sequencing call.
#[derive(Debug, Clone, PartialEq)]
pub enum Sequenced {
    /// The forced opener. The caller must persist the "opener sent" marker.
    /// `None` when the catalog has no opener record.
    Opener(Option<Question>),
    /// General block followed by domain block.
    Sequence(Vec<Question>),
}

/// Wire response of the sequencer endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum SequenceResponse {
    #[serde(rename = "INIT_Q1")]
    Opener {
        session_id: Uuid,
        question: Option<Question>,
    },
    #[serde(rename = "INIT_SEQUENCE")]
    Sequence {
        session_id: Uuid,
        total_questions: usize,
        questions: Vec<Question>,
    },
}

impl SequenceResponse {
    pub fn from_sequenced(session_id: Uuid, sequenced: Sequenced) -> Self {
        match sequenced {
            Sequenced::Opener(question) => SequenceResponse::Opener {
                session_id,
                question,
            },
            Sequenced::Sequence(questions) => SequenceResponse::Sequence {
                session_id,
                total_questions: questions.len(),
                questions,
            },
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            SequenceResponse::Opener { session_id, .. }
            | SequenceResponse::Sequence { session_id, .. } => *session_id,
        }
    }
}

/// Orders `candidates` by cascade position, then by descending probability,
/// and keeps the first `limit`.
///
/// Candidates whose key is in `exclude` or repeats an earlier candidate are
/// dropped. The sort is stable, so equal candidates keep catalog order.
pub fn rank(
    candidates: Vec<Question>,
    cascade: &[u8],
    exclude: &HashSet<String>,
    limit: usize,
) -> Vec<Question> {
    let mut seen = HashSet::new();
    let mut eligible: Vec<Question> = candidates
        .into_iter()
        .filter(|q| !exclude.contains(&q.question_id) && seen.insert(q.question_id.clone()))
        .collect();

    let preference = |q: &Question| {
        cascade
            .iter()
            .position(|d| *d == q.difficulty)
            .unwrap_or(usize::MAX)
    };
    eligible.sort_by(|a, b| {
        preference(a).cmp(&preference(b)).then_with(|| {
            b.probability
                .partial_cmp(&a.probability)
                .unwrap_or(Ordering::Equal)
        })
    });
    eligible.truncate(limit);
    eligible
}

/// The sequencer itself. Holds no per-session state; callers must not run two
/// sequencing calls for the same session concurrently.
pub struct Sequencer {
    catalog: Arc<dyn QuestionCatalog>,
}

impl Sequencer {
    pub fn new(catalog: Arc<dyn QuestionCatalog>) -> Self {
        Self { catalog }
    }

    /// Computes the next sequencing result for a session.
    #[instrument(name = "sequence", skip_all, fields(segment = ?request.profile.segment, domain = %request.profile.domain()))]
    pub async fn sequence(&self, request: &SequenceRequest) -> Sequenced {
        if request.asked.is_empty() && !request.opener_sent {
            let opener = match self.catalog.find_by_key(OPENER_QUESTION_ID).await {
                Ok(opener) => opener,
                Err(e) => {
                    warn!(error = ?e, "Failed to load the opener question");
                    None
                }
            };
            if opener.is_none() {
                warn!(key = OPENER_QUESTION_ID, "Opener question is missing from the catalog");
            }
            info!("Returning forced opener");
            return Sequenced::Opener(opener);
        }

        let profile = &request.profile;
        let stages = eligible_stages(profile.segment, profile.career_stage.as_deref());
        let mut used = request.asked.clone();
        // The opener is handed out on its own, never as part of a sequence.
        used.insert(OPENER_QUESTION_ID.to_string());
        let mut selected: Vec<Question> = Vec::new();

        for level in 1..=3 {
            let batch = self
                .fetch(GENERAL_DOMAIN, None, level, &stages, &used, GENERAL_BLOCK_PER_LEVEL)
                .await;
            absorb(&mut selected, &mut used, batch);
        }
        let general_count = selected.len();

        let domain = profile.domain();
        for (level, quota) in DOMAIN_QUOTA {
            let primary = self
                .fetch(domain, profile.sub_domain(), level, &stages, &used, quota)
                .await;
            let mut left = quota - primary.len();
            absorb(&mut selected, &mut used, primary);

            for fallback in domain_fallback(domain) {
                if left == 0 {
                    break;
                }
                let extra = self
                    .fetch(fallback, None, level, &stages, &used, left)
                    .await;
                left -= extra.len();
                absorb(&mut selected, &mut used, extra);
            }
            if left > 0 {
                debug!(level, missing = left, "Domain quota not met after fallback chain");
            }
        }

        if !selected.is_empty() {
            let ids: Vec<i64> = selected.iter().map(|q| q.id).collect();
            if let Err(e) = self.catalog.mark_used(&ids).await {
                warn!(error = ?e, "Failed to stamp last-used markers");
            }
        } else {
            warn!("No eligible content anywhere in the fallback chain");
        }

        info!(
            general = general_count,
            domain_specific = selected.len() - general_count,
            "Sequence computed"
        );
        Sequenced::Sequence(selected)
    }

    /// One catalog fetch. Read errors degrade to an empty result.
    async fn fetch(
        &self,
        domain: &str,
        sub_domain: Option<&str>,
        level: u8,
        stages: &[String],
        used: &HashSet<String>,
        limit: usize,
    ) -> Vec<Question> {
        if limit == 0 {
            return Vec::new();
        }
        let cascade = difficulty_cascade(level);
        let query = QuestionQuery {
            domain: domain.to_string(),
            sub_domain: sub_domain.map(str::to_string),
            difficulties: cascade.to_vec(),
            career_targets: stages.to_vec(),
            exclude: used.clone(),
        };
        match self.catalog.find(&query).await {
            Ok(candidates) => rank(candidates, cascade, used, limit),
            Err(e) => {
                warn!(error = ?e, domain, level, "Catalog fetch failed; treating as empty");
                Vec::new()
            }
        }
    }
}

fn absorb(selected: &mut Vec<Question>, used: &mut HashSet<String>, batch: Vec<Question>) {
    for question in batch {
        if used.insert(question.question_id.clone()) {
            selected.push(question);
        }
    }
}
