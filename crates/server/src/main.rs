mod auth;
mod chat;
mod config;
mod delivery;
mod heartbeat;
mod registry;
mod scheduler;
mod socket;

const REQUEST_ID_HEADER: &str = "x-request-id";
const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";

use anyhow::{anyhow, Result};
use axum::{
    extract::{MatchedPath, State},
    http::{header::HeaderName, HeaderValue},
    routing::get,
    Json, Router,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::sync::{watch, Semaphore};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crewline_storage::{connect, ConversationRepository, StoragePool, UserRepository};

use crate::auth::{AccessTokenSigner, AccessTokenVerifier, Identity, DEFAULT_TOKEN_TTL_HOURS};
use crate::chat::{ChatService, ChatStore, InMemoryChatStore, PgChatStore};
use crate::config::{CliOverrides, LogFormat, ServerConfig};
use crate::delivery::DeliveryQueueProcessor;
use crate::heartbeat::LivenessMonitor;
use crate::registry::ConnectionRegistry;
use crate::scheduler::ScheduledMessageProcessor;

#[derive(Clone)]
struct StorageState {
    status: StorageStatus,
    pool: Option<StoragePool>,
}

#[derive(Clone)]
enum StorageStatus {
    Unconfigured,
    Connected,
    Error(String),
}

impl StorageState {
    fn unconfigured() -> Self {
        Self {
            status: StorageStatus::Unconfigured,
            pool: None,
        }
    }

    fn connected_with_pool(pool: StoragePool) -> Self {
        Self {
            status: StorageStatus::Connected,
            pool: Some(pool),
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: StorageStatus::Error(message),
            pool: None,
        }
    }

    fn component(&self) -> ComponentStatus {
        match &self.status {
            StorageStatus::Unconfigured => ComponentStatus {
                name: "database",
                status: "pending",
                details: Some("database_url not configured".to_string()),
            },
            StorageStatus::Connected => ComponentStatus {
                name: "database",
                status: "configured",
                details: Some("connection established".to_string()),
            },
            StorageStatus::Error(message) => ComponentStatus {
                name: "database",
                status: "error",
                details: Some(message.clone()),
            },
        }
    }

    fn readiness_status(&self) -> &'static str {
        match self.status {
            StorageStatus::Connected => "ready",
            StorageStatus::Unconfigured | StorageStatus::Error(_) => "degraded",
        }
    }

    fn pool(&self) -> Option<StoragePool> {
        self.pool.clone()
    }
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "crewline-server",
    version,
    about = "Crewline realtime chat gateway"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    auth_signing_key: Option<String>,
    #[arg(long)]
    chat_echo_to_sender: Option<bool>,
    #[arg(long)]
    chat_queue_offline_deliveries: Option<bool>,
    #[arg(long)]
    chat_delivery_interval_secs: Option<u64>,
    #[arg(long)]
    chat_scheduled_interval_secs: Option<u64>,
    #[arg(long)]
    chat_heartbeat_interval_secs: Option<u64>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            database_url: self.database_url,
            auth_signing_key: self.auth_signing_key,
            echo_to_sender: self.chat_echo_to_sender,
            queue_offline_deliveries: self.chat_queue_offline_deliveries,
            delivery_interval_secs: self.chat_delivery_interval_secs,
            scheduled_interval_secs: self.chat_scheduled_interval_secs,
            heartbeat_interval_secs: self.chat_heartbeat_interval_secs,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Seed a user row into the configured database.
    SeedUser(SeedUserCommand),
    /// Seed a conversation with the given participants.
    SeedConversation(SeedConversationCommand),
    /// Mint a signed access token for a user. Development helper; the
    /// platform's auth service is the production issuer.
    IssueToken(IssueTokenCommand),
}

#[derive(Args, Debug)]
struct SeedUserCommand {
    /// Tenant the user belongs to.
    #[arg(long)]
    tenant_id: Uuid,
    /// Username for the seeded account.
    #[arg(long)]
    username: String,
    /// Optional display name.
    #[arg(long)]
    display_name: Option<String>,
}

#[derive(Args, Debug)]
struct SeedConversationCommand {
    /// Tenant the conversation belongs to.
    #[arg(long)]
    tenant_id: Uuid,
    /// Participant user id; repeat for each member.
    #[arg(long = "participant", action = ArgAction::Append)]
    participants: Vec<Uuid>,
}

#[derive(Args, Debug)]
struct IssueTokenCommand {
    #[arg(long)]
    user_id: Uuid,
    #[arg(long)]
    tenant_id: Uuid,
    #[arg(long, default_value = "member")]
    role: String,
    #[arg(long, default_value_t = DEFAULT_TOKEN_TTL_HOURS)]
    ttl_hours: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.clone().into_overrides();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&overrides)?;

    if let Some(command) = cli.command {
        return run_command(&config, command).await;
    }

    let config = Arc::new(config);
    run(config).await
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::SeedUser(cmd) => seed_user(config, cmd).await,
        CliCommand::SeedConversation(cmd) => seed_conversation(config, cmd).await,
        CliCommand::IssueToken(cmd) => issue_token(config, cmd),
    }
}

async fn seed_user(config: &ServerConfig, cmd: SeedUserCommand) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to seed users"))?;

    let username = cmd.username.trim();
    if username.is_empty() {
        anyhow::bail!("username must be provided");
    }

    let pool = connect(database_url).await?;
    let profile = UserRepository::new(pool)
        .create(cmd.tenant_id, username, cmd.display_name.as_deref())
        .await?;
    println!(
        "Seeded user '{}' with id {} in tenant {}",
        profile.username, profile.id, cmd.tenant_id
    );
    Ok(())
}

async fn seed_conversation(config: &ServerConfig, cmd: SeedConversationCommand) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to seed conversations"))?;

    if cmd.participants.is_empty() {
        anyhow::bail!("at least one --participant must be provided");
    }

    let pool = connect(database_url).await?;
    let conversation_id = ConversationRepository::new(pool)
        .create(cmd.tenant_id, &cmd.participants)
        .await?;
    println!(
        "Seeded conversation {} with {} participant(s)",
        conversation_id,
        cmd.participants.len()
    );
    Ok(())
}

fn issue_token(config: &ServerConfig, cmd: IssueTokenCommand) -> Result<()> {
    let signer = AccessTokenSigner::from_config(&config.auth)?;
    if config.auth.signing_key.is_none() {
        eprintln!("warning: no signing key configured; this token only verifies against an ephemeral key");
    }

    let token = signer.issue(
        &Identity {
            user_id: cmd.user_id,
            tenant_id: cmd.tenant_id,
            role: cmd.role,
        },
        chrono::Duration::hours(cmd.ttl_hours),
    )?;
    println!("{token}");
    Ok(())
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    init_tracing(&config);

    let env_override_keys = ServerConfig::environment_override_keys();
    if env_override_keys.is_empty() {
        info!("no CREWLINE_SERVER environment overrides detected");
    } else {
        info!(keys = ?env_override_keys, "detected CREWLINE_SERVER environment overrides");
    }

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = ?config.log_format,
        database_url_configured = config.database_url.is_some(),
        auth_signing_key_configured = config.auth.signing_key.is_some(),
        chat_echo_to_sender = config.chat.echo_to_sender,
        chat_queue_offline_deliveries = config.chat.queue_offline_deliveries,
        chat_delivery_interval_secs = config.chat.delivery_interval_secs,
        chat_scheduled_interval_secs = config.chat.scheduled_interval_secs,
        chat_heartbeat_interval_secs = config.chat.heartbeat_interval_secs,
        "resolved server configuration"
    );

    let storage = match config.database_url.as_deref() {
        Some(url) => match connect(url).await {
            Ok(pool) => {
                info!("database connection established");
                StorageState::connected_with_pool(pool)
            }
            Err(err) => {
                error!(?err, "failed to establish database connection");
                StorageState::error(err.to_string())
            }
        },
        None => StorageState::unconfigured(),
    };

    let signer = AccessTokenSigner::from_config(&config.auth)?;
    if config.auth.signing_key.is_some() {
        info!(
            verifying_key = %signer.verifying_key_base64(),
            "auth signing key loaded from configuration"
        );
    } else {
        info!(
            verifying_key = %signer.verifying_key_base64(),
            "no auth signing key supplied; generated ephemeral key"
        );
    }

    let registry = Arc::new(ConnectionRegistry::new());
    let store: Arc<dyn ChatStore> = match storage.pool() {
        Some(pool) => Arc::new(PgChatStore::new(pool)),
        None => {
            info!("no database configured; using in-memory chat store");
            Arc::new(InMemoryChatStore::new())
        }
    };
    let chat = Arc::new(ChatService::new(
        store.clone(),
        registry.clone(),
        &config.chat,
    ));

    let state = AppState::new(
        config.clone(),
        storage,
        chat.clone(),
        Arc::new(signer.verifier()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let delivery = Arc::new(DeliveryQueueProcessor::new(
        store.clone(),
        registry.clone(),
        &config.chat,
    ))
    .spawn(config.chat.delivery_interval(), shutdown_rx.clone());
    let scheduler = Arc::new(ScheduledMessageProcessor::new(
        store,
        registry.clone(),
        &config.chat,
    ))
    .spawn(config.chat.scheduled_interval(), shutdown_rx.clone());
    let liveness = Arc::new(LivenessMonitor::new(registry))
        .spawn(config.chat.heartbeat_interval(), shutdown_rx);

    let app = build_app(state);

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the background loops along with the listener.
    let _ = shutdown_tx.send(true);
    for handle in [delivery, scheduler, liveness] {
        let _ = handle.await;
    }

    Ok(())
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    storage: StorageState,
    chat: Arc<ChatService>,
    verifier: Arc<AccessTokenVerifier>,
    connection_permits: Arc<Semaphore>,
}

impl AppState {
    fn new(
        config: Arc<ServerConfig>,
        storage: StorageState,
        chat: Arc<ChatService>,
        verifier: Arc<AccessTokenVerifier>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            storage,
            chat,
            verifier,
            connection_permits: Arc::new(Semaphore::new(config.chat.max_connections)),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub(crate) fn chat(&self) -> Arc<ChatService> {
        self.chat.clone()
    }

    pub(crate) fn verifier(&self) -> Arc<AccessTokenVerifier> {
        self.verifier.clone()
    }

    pub(crate) fn connection_permits(&self) -> Arc<Semaphore> {
        self.connection_permits.clone()
    }

    fn database_component(&self) -> ComponentStatus {
        self.storage.component()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    let components = vec![state.database_component()];
    let status = state.storage.readiness_status();

    Json(ReadinessResponse {
        status,
        uptime_seconds: state.uptime_seconds(),
        components,
    })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn build_app(state: AppState) -> Router {
    let client_v1_routes = Router::new().route("/realtime/ws", get(socket::realtime_socket));

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version));

    // Keep legacy paths while exposing the same handlers under a versioned
    // prefix.
    router = router.merge(client_v1_routes.clone());
    router = router.nest("/client/v1", client_v1_routes);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http().make_span_with(
        |request: &axum::http::Request<axum::body::Body>| {
            let route = request
                .extensions()
                .get::<MatchedPath>()
                .map(|matched| matched.as_str().to_string())
                .unwrap_or_else(|| request.uri().path().to_string());
            let request_id = request
                .extensions()
                .get::<RequestId>()
                .and_then(|rid| rid.header_value().to_str().ok())
                .unwrap_or("unknown")
                .to_string();

            tracing::info_span!(
                "http.request",
                method = %request.method(),
                route = %route,
                request_id = %request_id
            )
        },
    );

    let instrumentation = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ))
        .layer(PropagateHeaderLayer::new(request_id_header.clone()))
        .layer(trace_layer)
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .into_inner();

    router.layer(instrumentation).with_state(state)
}

fn init_tracing(config: &ServerConfig) {
    // Respect RUST_LOG if set, otherwise default to info for our crates.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,crewline_server=info,crewline=info"));

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = match config.log_format() {
        LogFormat::Json => Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json()),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer()),
        ),
    };

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}
