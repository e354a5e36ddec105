//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like database pools and service clients.

use crate::{config::Config, orchestrator::Orchestrator};
use rehearsal_core::{
    clients::{FeedbackService, FollowupSource, SpeechSynthesizer},
    media::MediaLibrary,
};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<crate::db::Db>,
    pub orchestrator: Arc<Orchestrator>,
    pub media: MediaLibrary,
    pub feedback: Arc<dyn FeedbackService>,
    pub followups: Arc<dyn FollowupSource>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub config: Arc<Config>,
}
