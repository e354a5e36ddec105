//! Main Entrypoint for the Rehearsal API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the database connection pool and running migrations.
//! 3. Initializing shared services (sequencer and external collaborators).
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use rehearsal_api::{
    catalog::PgQuestionCatalog, config::Config, db::Db, orchestrator::Orchestrator,
    router::create_router, state::AppState,
};
use rehearsal_core::{
    clients::{
        FeedbackService, FollowupSource, HttpFeedbackService, HttpFollowupSource,
        HttpSpeechSynthesizer, NoFeedback, NoFollowups, NoSpeech, SpeechSynthesizer,
    },
    media::MediaLibrary,
    sequencer::Sequencer,
};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        return;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Database ---
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Arc::new(Db::new(pool));
    db.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");

    // --- 4. Initialize Shared Services ---
    let sequencer = Sequencer::new(Arc::new(PgQuestionCatalog::new(db.clone())));
    let orchestrator = Arc::new(Orchestrator::new(db.clone(), sequencer));

    let feedback: Arc<dyn FeedbackService> = match &config.feedback_url {
        Some(url) => Arc::new(HttpFeedbackService::new(url.clone())?),
        None => {
            warn!("FEEDBACK_URL not set; sessions will end without a feedback report.");
            Arc::new(NoFeedback)
        }
    };
    let followups: Arc<dyn FollowupSource> = match &config.followup_url {
        Some(url) => Arc::new(HttpFollowupSource::new(url.clone())?),
        None => {
            warn!("FOLLOWUP_URL not set; clarifications will use the default prompt.");
            Arc::new(NoFollowups)
        }
    };
    let speech: Arc<dyn SpeechSynthesizer> = match &config.speech_url {
        Some(url) => Arc::new(HttpSpeechSynthesizer::new(url.clone())?),
        None => {
            warn!("SPEECH_URL not set; spoken lines will be sent as text only.");
            Arc::new(NoSpeech)
        }
    };

    let app_state = Arc::new(AppState {
        db,
        orchestrator,
        media: MediaLibrary::new(config.media_base_url.clone()),
        feedback,
        followups,
        speech,
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        bind_address = %config.bind_address,
        media_base_url = %config.media_base_url,
        session_duration_secs = config.session_duration.as_secs(),
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
