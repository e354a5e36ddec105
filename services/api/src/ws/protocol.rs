//! Defines the WebSocket message protocol between the candidate's browser and the API server.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rehearsal_core::{
    EngineCommand, EngineEvent, clients::FeedbackReport, media::MediaRef,
    session_timer::TimerSignal,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attaches the connection to a stored session. This must be the first message.
    Init {
        session_id: Option<Uuid>,
        /// Preferred language code; defaults to the session's language.
        language: Option<String>,
    },
    /// The candidate pressed start.
    Start,
    /// The player finished an item. `seq` echoes the value from `play`.
    MediaEnded {
        uri: Option<String>,
        seq: Option<u64>,
    },
    /// Voice activity detected on the candidate's side.
    UserSpeaking,
    /// Cumulative transcript of the current answer.
    Transcript { text: String },
}

impl ClientMessage {
    /// The engine event this message maps to. `init` has none.
    pub fn into_event(self) -> Option<EngineEvent> {
        match self {
            ClientMessage::Init { .. } => None,
            ClientMessage::Start => Some(EngineEvent::Start),
            ClientMessage::MediaEnded { uri, seq } => Some(EngineEvent::MediaEnded { uri, seq }),
            ClientMessage::UserSpeaking => Some(EngineEvent::UserSpeaking),
            ClientMessage::Transcript { text } => Some(EngineEvent::Transcript { text }),
        }
    }
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The session is loaded and can be started.
    Ready { total_questions: usize },
    /// Play this item now, replacing whatever is playing.
    Play { media: MediaRef },
    /// Prompt text of the question now playing.
    QuestionText { question_id: String, text: String },
    /// A spoken line. `audio` is base64 encoded; absent when synthesis had nothing.
    Speak { text: String, audio: Option<String> },
    TimeWarning {
        signal: TimerSignal,
        notice: Option<String>,
    },
    /// Open or close the microphone and camera.
    Capture { active: bool },
    /// Turn live transcription on or off.
    Transcription { enabled: bool },
    /// Stop playback immediately.
    Halt,
    Feedback { report: FeedbackReport },
    ReturnToDashboard,
    InvalidSession { reason: String },
    /// Reports a fatal error to the client.
    Error { message: String },
}

impl From<EngineCommand> for ServerMessage {
    fn from(command: EngineCommand) -> Self {
        match command {
            EngineCommand::Ready { total_questions } => ServerMessage::Ready { total_questions },
            EngineCommand::Play(media) => ServerMessage::Play { media },
            EngineCommand::QuestionText { question_id, text } => {
                ServerMessage::QuestionText { question_id, text }
            }
            EngineCommand::Speak { text, audio } => ServerMessage::Speak {
                text,
                audio: audio
                    .filter(|bytes| !bytes.is_empty())
                    .map(|bytes| STANDARD.encode(bytes)),
            },
            EngineCommand::TimeWarning { signal, notice } => {
                ServerMessage::TimeWarning { signal, notice }
            }
            EngineCommand::Halt => ServerMessage::Halt,
            EngineCommand::Feedback(report) => ServerMessage::Feedback { report },
            EngineCommand::ReturnToDashboard => ServerMessage::ReturnToDashboard,
            EngineCommand::InvalidSession { reason } => ServerMessage::InvalidSession { reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rehearsal_core::{catalog::Language, media::MediaLibrary, media::SystemClip};
    use serde_json::json;

    #[test]
    fn test_parse_client_messages() {
        let session_id = Uuid::new_v4();
        let init: ClientMessage = serde_json::from_value(json!({
            "type": "init",
            "session_id": session_id,
            "language": "fr"
        }))
        .unwrap();
        assert_eq!(
            init,
            ClientMessage::Init {
                session_id: Some(session_id),
                language: Some("fr".to_string())
            }
        );

        let ended: ClientMessage =
            serde_json::from_str(r#"{"type":"media_ended","uri":"https://cdn/a.mp4"}"#).unwrap();
        assert_eq!(
            ended,
            ClientMessage::MediaEnded {
                uri: Some("https://cdn/a.mp4".to_string()),
                seq: None
            }
        );

        let ended: ClientMessage =
            serde_json::from_str(r#"{"type":"media_ended","seq":42}"#).unwrap();
        assert_eq!(
            ended,
            ClientMessage::MediaEnded {
                uri: None,
                seq: Some(42)
            }
        );

        let speaking: ClientMessage = serde_json::from_str(r#"{"type":"user_speaking"}"#).unwrap();
        assert_eq!(speaking, ClientMessage::UserSpeaking);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_client_messages_map_to_events() {
        let init = ClientMessage::Init {
            session_id: None,
            language: None,
        };
        assert!(init.into_event().is_none());

        let event = ClientMessage::Transcript {
            text: "I led a team".to_string(),
        }
        .into_event();
        assert!(matches!(event, Some(EngineEvent::Transcript { text }) if text == "I led a team"));

        let event = ClientMessage::MediaEnded {
            uri: None,
            seq: Some(7),
        }
        .into_event();
        assert!(matches!(
            event,
            Some(EngineEvent::MediaEnded {
                uri: None,
                seq: Some(7)
            })
        ));
    }

    #[test]
    fn test_play_message_shape() {
        let media = MediaLibrary::new("https://cdn.test/videos")
            .system(SystemClip::IdleListen, Language::Fr);
        let msg = ServerMessage::from(EngineCommand::Play(media));

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "play");
        assert_eq!(json["media"]["uri"], "https://cdn.test/videos/system/fr/idle_listen.mp4");
        assert_eq!(json["media"]["type"], "system");
        assert_eq!(json["media"]["clip"], "idle_listen");
        assert_eq!(json["media"]["seq"], 0);
    }

    #[test]
    fn test_speak_audio_is_base64() {
        let msg = ServerMessage::from(EngineCommand::Speak {
            text: "Hello".to_string(),
            audio: Some(Bytes::from_static(b"RIFF")),
        });
        assert_eq!(
            msg,
            ServerMessage::Speak {
                text: "Hello".to_string(),
                audio: Some("UklGRg==".to_string())
            }
        );

        let silent = ServerMessage::from(EngineCommand::Speak {
            text: "Hello".to_string(),
            audio: Some(Bytes::new()),
        });
        assert_eq!(
            silent,
            ServerMessage::Speak {
                text: "Hello".to_string(),
                audio: None
            }
        );
    }

    #[test]
    fn test_unit_messages_serialize_with_type_only() {
        assert_eq!(
            serde_json::to_string(&ServerMessage::ReturnToDashboard).unwrap(),
            r#"{"type":"return_to_dashboard"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerMessage::from(EngineCommand::Halt)).unwrap(),
            r#"{"type":"halt"}"#
        );
    }

    #[test]
    fn test_time_warning_message() {
        let msg = ServerMessage::from(EngineCommand::TimeWarning {
            signal: TimerSignal::Close,
            notice: Some("You have two minutes remaining.".to_string()),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "time_warning");
        assert_eq!(json["signal"], "close");
        assert_eq!(json["notice"], "You have two minutes remaining.");
    }
}
