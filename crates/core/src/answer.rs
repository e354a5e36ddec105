//! Per-question answer tracking and the record written once a question is done.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

const HESITATION_TOKENS: &[&str] = &["euh", "uh", "erm", "hum"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerMetrics {
    /// Time from first detected speech to finalization.
    pub duration_ms: u64,
    /// Silences detected after the candidate started speaking.
    pub pauses_count: u32,
    pub speaking_speed_wpm: f64,
    pub hesitations_count: u32,
}

/// One answered question. The first record for a (session, question) wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub user_id: String,
    pub session_id: Uuid,
    pub question_id: String,
    pub transcript: String,
    pub metrics: AnswerMetrics,
}

/// Number of filler tokens in `transcript`, matched per word.
pub fn count_hesitations(transcript: &str) -> u32 {
    transcript
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| {
            let word = word.to_lowercase();
            HESITATION_TOKENS.contains(&word.as_str())
        })
        .count() as u32
}

pub fn word_count(transcript: &str) -> usize {
    transcript.split_whitespace().count()
}

/// Accumulates speech signals for the question currently on screen.
#[derive(Debug, Default)]
pub struct AnswerTracker {
    first_speech: Option<Instant>,
    pauses: u32,
    transcript: String,
}

impl AnswerTracker {
    pub fn on_speaking(&mut self) {
        self.first_speech.get_or_insert_with(Instant::now);
    }

    /// Transcripts are cumulative; the latest one replaces the previous.
    pub fn on_transcript(&mut self, text: &str) {
        self.transcript = text.trim().to_string();
    }

    /// A silence was detected. Only counts once the candidate has spoken.
    pub fn on_pause(&mut self) {
        if self.first_speech.is_some() {
            self.pauses += 1;
        }
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Computes the metrics and resets the tracker for the next question.
    pub fn finalize(&mut self) -> (String, AnswerMetrics) {
        let tracker = std::mem::take(self);
        let duration_ms = tracker
            .first_speech
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let words = word_count(&tracker.transcript);
        let speaking_speed_wpm = if duration_ms > 0 {
            let wpm = words as f64 / (duration_ms as f64 / 60_000.0);
            (wpm * 10.0).round() / 10.0
        } else {
            0.0
        };
        let metrics = AnswerMetrics {
            duration_ms,
            pauses_count: tracker.pauses,
            speaking_speed_wpm,
            hesitations_count: count_hesitations(&tracker.transcript),
        };
        (tracker.transcript, metrics)
    }
}
