//! fedinote - a single-actor federated note publishing server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub actor, inbox and note endpoints              │
//! │  - Well-known discovery                                     │
//! │  - Owner API                                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Service / Federation Layer                     │
//! │  - Note publishing, fan-out                                 │
//! │  - Inbox ingestion, HTTP signatures                         │
//! │  - Durable delivery scheduler                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Note publishing
//! - `federation`: Signing, resolution, delivery and ingestion
//! - `data`: Database layer
//! - `auth`: Owner token authentication
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use federation::{
    ActorResolver, DeliveryClient, FanoutEngine, InboxIngestion, JobScheduler, LocalKey,
    OutboundFetch, ReqwestFetcher,
};

/// Application state shared across all handlers
///
/// Cloned for each request; every field is a cheap handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Signing key of the local actor
    pub key: Arc<LocalKey>,

    pub resolver: ActorResolver,
    pub delivery: DeliveryClient,
    pub scheduler: JobScheduler,
    pub fanout: FanoutEngine,
    pub inbox: InboxIngestion,
    pub notes: service::NoteService,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Load or generate the actor key
    /// 3. Build the outbound HTTP transport
    /// 4. Wire federation components
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = data::Database::connect(&config.database.path).await?;
        tracing::info!(path = %config.database.path.display(), "Database connected");

        let key_id = format!("{}#main-key", config.actor_url());
        let key = LocalKey::load_or_generate(&config.actor.private_key_path, key_id)?;

        let fetcher = ReqwestFetcher::new(&config.federation)?;

        let state = Self::with_parts(config, Arc::new(db), Arc::new(key), Arc::new(fetcher));
        tracing::info!("Application state initialized successfully");
        Ok(state)
    }

    /// Wire application state from already constructed parts
    pub fn with_parts(
        config: config::AppConfig,
        db: Arc<data::Database>,
        key: Arc<LocalKey>,
        fetcher: Arc<dyn OutboundFetch>,
    ) -> Self {
        let actor_url = config.actor_url();

        let resolver = ActorResolver::new(db.clone(), fetcher.clone(), key.clone());
        let delivery = DeliveryClient::new(fetcher, key.clone());
        let scheduler = JobScheduler::new(db.clone(), delivery.clone(), &config.delivery);
        let fanout = FanoutEngine::new(
            db.clone(),
            resolver.clone(),
            scheduler.clone(),
            actor_url.clone(),
        );
        let inbox = InboxIngestion::new(
            db.clone(),
            resolver.clone(),
            fanout.clone(),
            actor_url.clone(),
            config.federation.signature_max_skew_secs,
        );
        let notes =
            service::NoteService::new(db.clone(), fanout.clone(), scheduler.clone(), actor_url);

        Self {
            config: Arc::new(config),
            db,
            key,
            resolver,
            delivery,
            scheduler,
            fanout,
            inbox,
            notes,
        }
    }
}

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use axum::extract::DefaultBodyLimit;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .nest("/api", api::admin_router())
        .merge(api::metrics_router())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
