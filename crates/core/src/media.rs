//! Media references and the library that resolves them to playable URIs.

use crate::catalog::{Language, Question};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Listen clips per idle cycle, followed by one smile clip.
pub const IDLE_LISTEN_REPEATS: usize = 5;

/// Fixed clips the avatar plays outside of questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemClip {
    IntroFirst,
    IntroSecond,
    IdleListen,
    IdleSmile,
    ClarifyShort,
    ClarifyMain,
    EndSimulation,
    PrepareFeedback,
}

impl SystemClip {
    fn asset_key(self) -> &'static str {
        match self {
            SystemClip::IntroFirst => "intro_1",
            SystemClip::IntroSecond => "intro_2",
            SystemClip::IdleListen => "idle_listen",
            SystemClip::IdleSmile => "idle_smile",
            SystemClip::ClarifyShort => "clarify_short",
            SystemClip::ClarifyMain => "clarify_main",
            SystemClip::EndSimulation => "end_simulation",
            SystemClip::PrepareFeedback => "prepare_feedback",
        }
    }

    /// Clips during which the candidate is expected to talk.
    pub fn is_listening(self) -> bool {
        matches!(self, SystemClip::IdleListen | SystemClip::IdleSmile)
    }
}

/// What a media reference plays; the engine branches on this at media end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaKind {
    System { clip: SystemClip },
    Question { question_id: String },
}

/// A playable item in the playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub uri: String,
    #[serde(flatten)]
    pub kind: MediaKind,
    /// Stamped by the playlist when queued; 0 until then.
    #[serde(default)]
    pub seq: u64,
}

impl MediaRef {
    pub fn clip(&self) -> Option<SystemClip> {
        match &self.kind {
            MediaKind::System { clip } => Some(*clip),
            MediaKind::Question { .. } => None,
        }
    }

    pub fn question_id(&self) -> Option<&str> {
        match &self.kind {
            MediaKind::Question { question_id } => Some(question_id),
            MediaKind::System { .. } => None,
        }
    }

    /// Whether transcription should be on while this item plays.
    pub fn is_listening(&self) -> bool {
        self.clip().is_some_and(SystemClip::is_listening)
    }
}

/// Resolves clips and question media to URIs under a base URL.
#[derive(Debug, Clone)]
pub struct MediaLibrary {
    base_url: String,
}

impl MediaLibrary {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// System clip in `language`. Intro clips are only authored in English.
    pub fn system(&self, clip: SystemClip, language: Language) -> MediaRef {
        let language = match clip {
            SystemClip::IntroFirst | SystemClip::IntroSecond => Language::En,
            _ => language,
        };
        MediaRef {
            uri: format!(
                "{}/system/{}/{}.mp4",
                self.base_url,
                language.code(),
                clip.asset_key()
            ),
            kind: MediaKind::System { clip },
            seq: 0,
        }
    }

    /// Question media in `language`, else the other language, else a placeholder.
    pub fn question(&self, question: &Question, language: Language) -> MediaRef {
        let uri = match question
            .video
            .resolve(language)
            .filter(|uri| !uri.trim().is_empty())
        {
            Some(uri) => uri.clone(),
            None => {
                warn!(question_id = %question.question_id, "No media for question; using placeholder");
                format!("{}/system/question_missing.mp4", self.base_url)
            }
        };
        MediaRef {
            uri,
            kind: MediaKind::Question {
                question_id: question.question_id.clone(),
            },
            seq: 0,
        }
    }

    /// One idle cycle: repeated listen clips then a smile.
    pub fn idle_cycle(&self, language: Language) -> Vec<MediaRef> {
        let listen = self.system(SystemClip::IdleListen, language);
        let mut cycle = vec![listen; IDLE_LISTEN_REPEATS];
        cycle.push(self.system(SystemClip::IdleSmile, language));
        cycle
    }

    pub fn intro(&self, language: Language) -> Vec<MediaRef> {
        vec![
            self.system(SystemClip::IntroFirst, language),
            self.system(SystemClip::IntroSecond, language),
        ]
    }

    pub fn closing(&self, language: Language) -> Vec<MediaRef> {
        vec![
            self.system(SystemClip::EndSimulation, language),
            self.system(SystemClip::PrepareFeedback, language),
        ]
    }
}
