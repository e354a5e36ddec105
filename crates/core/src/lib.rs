pub mod answer;
pub mod catalog;
pub mod clients;
pub mod engine;
pub mod idle;
pub mod media;
pub mod playlist;
pub mod pyramid;
pub mod retry;
pub mod sequencer;
pub mod session_timer;

use bytes::Bytes;
use clients::{FeedbackReport, SequenceFetchError};
use engine::SequencePurpose;
use media::MediaRef;
use sequencer::SequenceResponse;
use session_timer::TimerSignal;

/// Inputs to a running session, from the client and from the session's own
/// background tasks. All of them are processed one at a time, in arrival order.
#[derive(Debug)]
pub enum EngineEvent {
    /// The candidate pressed start.
    Start,
    /// The player finished the current item. `seq` (or, failing that, `uri`)
    /// guards against stale reports.
    MediaEnded {
        uri: Option<String>,
        seq: Option<u64>,
    },
    UserSpeaking,
    /// Cumulative transcript of the current answer.
    Transcript { text: String },
    SilenceElapsed { generation: u64 },
    ClarificationReady {
        turn: u64,
        text: String,
        audio: Option<Bytes>,
    },
    SequenceLoaded {
        purpose: SequencePurpose,
        result: Result<SequenceResponse, SequenceFetchError>,
    },
    FeedbackReady { report: FeedbackReport },
    Timer(TimerSignal),
    /// The host is going away; stop without completing the session.
    Shutdown,
}

/// Side effects the session asks its host to perform.
///
/// The engine never touches the client directly; everything it wants shown,
/// played or said goes through this enum.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// The initial sequence is loaded and the session can be started.
    Ready { total_questions: usize },
    Play(MediaRef),
    QuestionText { question_id: String, text: String },
    Speak { text: String, audio: Option<Bytes> },
    TimeWarning {
        signal: TimerSignal,
        notice: Option<String>,
    },
    /// Stop playback immediately.
    Halt,
    Feedback(FeedbackReport),
    ReturnToDashboard,
    InvalidSession { reason: String },
}
