//! # Server Configuration
//!
//! Application state wiring, the router and the serve loop.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::chat::ChatProxy;
use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::handlers;
use crate::ingestion::{EmailIngestionClient, TrackableIngestionClient};
use crate::mailbox::{GmailClient, MailboxProvider};
use crate::repositories::{MailboxAccountRepository, MailboxStore};
use crate::sync_engine::{MailboxSyncEngine, SyncLeases};
use crate::telemetry::trace_middleware;
use crate::watch::PushSubscriptionManager;
use crate::webhook::WebhookIngestor;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub store: Arc<dyn MailboxStore>,
    pub provider: Arc<dyn MailboxProvider>,
    pub engine: Arc<MailboxSyncEngine>,
    pub watch: Arc<PushSubscriptionManager>,
    pub webhook: Arc<WebhookIngestor>,
    pub chat: Arc<ChatProxy>,
}

impl AppState {
    /// Build every collaborator from configuration.
    pub fn from_config(config: Arc<AppConfig>, db: DatabaseConnection) -> anyhow::Result<Self> {
        let crypto_key = config
            .crypto_key
            .clone()
            .ok_or_else(|| anyhow!("crypto key not present in configuration"))
            .and_then(|bytes| CryptoKey::new(bytes).context("initializing crypto key"))?;

        let provider = GmailClient::from_config(&config).context("building Gmail client")?;
        let ingestion =
            TrackableIngestionClient::from_config(&config).context("building ingestion client")?;
        let chat = ChatProxy::from_config(&config).context("building chat proxy")?;

        Ok(Self::from_parts(
            config,
            db,
            crypto_key,
            Arc::new(provider),
            Arc::new(ingestion),
            chat,
        ))
    }

    /// Wire state around explicit provider and ingestion implementations.
    pub fn from_parts(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        crypto_key: CryptoKey,
        provider: Arc<dyn MailboxProvider>,
        ingestion: Arc<dyn EmailIngestionClient>,
        chat: ChatProxy,
    ) -> Self {
        let store: Arc<dyn MailboxStore> = Arc::new(MailboxAccountRepository::new(
            Arc::new(db.clone()),
            crypto_key,
        ));

        let engine = Arc::new(MailboxSyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            ingestion,
            SyncLeases::default(),
        ));
        let watch = Arc::new(PushSubscriptionManager::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            config.pubsub_topic.clone(),
        ));
        let webhook = Arc::new(WebhookIngestor::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            config.webhook_secret.clone(),
        ));

        Self {
            config,
            db,
            store,
            provider,
            engine,
            watch,
            webhook,
            chat: Arc::new(chat),
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let mailbox = Router::new()
        .route(
            "/mailbox/connection",
            put(handlers::mailbox::put_connection).delete(handlers::mailbox::delete_connection),
        )
        .route("/mailbox/sync", post(handlers::mailbox::sync_mailbox))
        .route("/mailbox/sync-status", get(handlers::mailbox::sync_status))
        .route(
            "/mailbox/watch",
            post(handlers::watch::setup_watch)
                .get(handlers::watch::watch_status)
                .delete(handlers::watch::stop_watch),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/webhooks/gmail", post(handlers::webhooks::gmail_webhook))
        .route(
            "/agent/chat",
            get(handlers::chat::chat_health)
                .post(handlers::chat::chat)
                .delete(handlers::chat::clear_session),
        )
        .merge(mailbox)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_middleware))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Serve until ctrl-c, then drain in-flight requests.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let addr = config
        .bind_addr()
        .map_err(|e| anyhow!("Invalid server address: {}", e))?;
    let profile = config.profile.clone();

    let state = AppState::from_config(Arc::new(config), db)?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!(addr = %addr, profile = %profile, "Server listening");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::mailbox::put_connection,
        crate::handlers::mailbox::delete_connection,
        crate::handlers::mailbox::sync_mailbox,
        crate::handlers::mailbox::sync_status,
        crate::handlers::watch::setup_watch,
        crate::handlers::watch::watch_status,
        crate::handlers::watch::stop_watch,
        crate::handlers::webhooks::gmail_webhook,
        crate::handlers::chat::chat_health,
        crate::handlers::chat::chat,
        crate::handlers::chat::clear_session,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::error::ApiError,
            crate::handlers::mailbox::ConnectMailboxRequest,
            crate::handlers::mailbox::ConnectionResponse,
            crate::handlers::mailbox::SyncRequest,
            crate::handlers::mailbox::SyncResponse,
            crate::handlers::mailbox::SyncedEmail,
            crate::handlers::mailbox::IngestionSummary,
            crate::handlers::mailbox::SyncStatusResponse,
            crate::handlers::watch::WatchSetupResponse,
            crate::handlers::watch::WatchStatusResponse,
            crate::handlers::watch::WatchStopResponse,
            crate::webhook::PushEnvelope,
            crate::webhook::PushMessage,
            crate::webhook::WebhookAck,
            crate::chat::ChatRequest,
            crate::chat::ChatMessage,
            crate::chat::ChatPart,
            crate::handlers::chat::ChatHealth,
            crate::handlers::chat::ChatErrorBody,
            crate::sync_engine::SyncStrategy,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "root", description = "Service metadata and health"),
        (name = "mailbox", description = "Mailbox connection, sync and push subscription"),
        (name = "webhooks", description = "Push notification delivery"),
        (name = "chat", description = "Agent chat stream proxy"),
    ),
    info(
        title = "Mailbox Sync API",
        description = "Order email ingestion from connected mailboxes",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
