//! Manages the WebSocket connection lifecycle for an interview session.

use super::protocol::{ClientMessage, ServerMessage};
use crate::{
    adapters::{CaptureNotice, ClientCapture, DbAnswerSink, DbLifecycle},
    models::Session,
    orchestrator::LocalSequenceSource,
    state::AppState,
};
use anyhow::{Context, Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use rehearsal_core::{
    EngineCommand, EngineEvent,
    catalog::Language,
    engine::{Collaborators, Engine, EngineConfig, SessionContext},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Performs the `init` handshake, loads the stored session and then hosts one
/// engine for the lifetime of the connection.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let temp_id: u32 = rand::random();
    tracing::Span::current().record("session_id", &temp_id.to_string());
    info!("New WebSocket connection. Awaiting initialization...");

    let (mut socket_tx, mut socket_rx) = socket.split();

    // The first message from the client must be an `init` message.
    let init = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => parse_init(&text),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };
    let (session_id, language) = match init {
        Ok(init) => init,
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };
    tracing::Span::current().record("session_id", &session_id.to_string());

    let session = match state.db.find_session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            warn!("Unknown session requested.");
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::InvalidSession {
                    reason: format!("session {session_id} not found"),
                },
            )
            .await;
            return;
        }
        Err(e) => {
            error!(error = ?e, "Failed to load session.");
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: "Failed to load session.".to_string(),
                },
            )
            .await;
            return;
        }
    };

    let language = language
        .map(|code| Language::from_code(&code))
        .unwrap_or_else(|| session.language());
    let session_span = tracing::info_span!(
        "interview",
        %session_id,
        user_id = %session.user_id,
        lang = language.code()
    );
    if let Err(e) = run_interview(state, socket_tx, socket_rx, session, language)
        .instrument(session_span)
        .await
    {
        error!(error = ?e, "Interview session terminated with error.");
    }
}

/// Parses the `init` message.
fn parse_init(init_text: &str) -> Result<(Uuid, Option<String>)> {
    match serde_json::from_str::<ClientMessage>(init_text)? {
        ClientMessage::Init {
            session_id,
            language,
        } => Ok((
            session_id.context("`session_id` is required for `init`")?,
            language,
        )),
        _ => Err(anyhow!("First message must be `init`")),
    }
}

/// Relays between the socket and one engine until either side is done.
async fn run_interview(
    state: Arc<AppState>,
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut socket_rx: SplitStream<WebSocket>,
    session: Session,
    language: Language,
) -> Result<()> {
    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel::<EngineCommand>();
    let (capture_tx, mut capture_rx) = mpsc::unbounded_channel::<CaptureNotice>();

    let collab = Collaborators {
        sequences: Arc::new(LocalSequenceSource::new(state.orchestrator.clone())),
        feedback: state.feedback.clone(),
        followups: state.followups.clone(),
        speech: state.speech.clone(),
        answers: Arc::new(DbAnswerSink::new(state.db.clone())),
        lifecycle: Arc::new(DbLifecycle::new(state.db.clone())),
        capture: Arc::new(ClientCapture::new(capture_tx)),
    };
    let config = EngineConfig {
        silence_threshold: state.config.silence_threshold,
        session_duration: session.duration(state.config.session_duration),
        language,
        ..EngineConfig::default()
    };
    let context = SessionContext {
        session_id: session.id,
        user_id: session.user_id.clone(),
    };

    let (engine, events_rx) =
        Engine::new(context, config, state.media.clone(), collab, commands_tx);
    let events = engine.event_sender();
    let mut engine_task = tokio::spawn(engine.run(events_rx).in_current_span());

    loop {
        tokio::select! {
            biased;
            Some(command) = commands_rx.recv() => {
                send_msg(&mut socket_tx, command.into()).await?;
            },
            Some(notice) = capture_rx.recv() => {
                send_msg(&mut socket_tx, capture_message(notice)).await?;
            },
            outcome = &mut engine_task => {
                while let Ok(command) = commands_rx.try_recv() {
                    send_msg(&mut socket_tx, command.into()).await?;
                }
                while let Ok(notice) = capture_rx.try_recv() {
                    send_msg(&mut socket_tx, capture_message(notice)).await?;
                }
                match outcome.context("Engine task panicked")? {
                    Ok(()) => info!("Interview completed."),
                    Err(e) => warn!(error = %e, "Interview ended early."),
                }
                let _ = socket_tx.close().await;
                return Ok(());
            },
            msg = socket_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => match msg.into_event() {
                        Some(event) => {
                            debug!(?event, "Client event");
                            if events.send(event).is_err() {
                                debug!("Engine no longer accepts events.");
                            }
                        }
                        None => warn!("Ignoring repeated init message."),
                    },
                    Err(e) => warn!(error = %e, "Ignoring malformed client message."),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client disconnected. Shutting down session.");
                    break;
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    error!("Error receiving from client WebSocket: {:?}", e);
                    break;
                }
            },
        }
    }

    let _ = events.send(EngineEvent::Shutdown);
    match engine_task.await.context("Engine task panicked")? {
        Ok(()) => info!("Engine stopped after disconnect."),
        Err(e) => debug!(error = %e, "Engine stopped after disconnect."),
    }
    Ok(())
}

fn capture_message(notice: CaptureNotice) -> ServerMessage {
    match notice {
        CaptureNotice::Active(active) => ServerMessage::Capture { active },
        CaptureNotice::Transcribing(enabled) => ServerMessage::Transcription { enabled },
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init() {
        let session_id = Uuid::new_v4();
        let text = format!(r#"{{"type":"init","session_id":"{session_id}","language":"fr"}}"#);
        let (parsed, language) = parse_init(&text).unwrap();
        assert_eq!(parsed, session_id);
        assert_eq!(language.as_deref(), Some("fr"));
    }

    #[test]
    fn test_parse_init_requires_session_id() {
        let err = parse_init(r#"{"type":"init"}"#).unwrap_err();
        assert!(err.to_string().contains("session_id"));
    }

    #[test]
    fn test_parse_init_rejects_other_messages() {
        let err = parse_init(r#"{"type":"start"}"#).unwrap_err();
        assert_eq!(err.to_string(), "First message must be `init`");
    }

    #[test]
    fn test_capture_notices_map_to_messages() {
        assert_eq!(
            capture_message(CaptureNotice::Active(true)),
            ServerMessage::Capture { active: true }
        );
        assert_eq!(
            capture_message(CaptureNotice::Transcribing(false)),
            ServerMessage::Transcription { enabled: false }
        );
    }
}
