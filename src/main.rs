use anyhow::{Context, Result};
use brokerlink::api::{create_broker_router, BrokerAppState, RedirectTargets};
use brokerlink::auth::TokenIssuer;
use brokerlink::broker::KiteConnect;
use brokerlink::config::{AppConfig, StateBackend};
use brokerlink::credentials::{CredentialStore, SqliteCredentialStore};
use brokerlink::oauth::{
    run_state_cleanup, AuthorizationFlow, FlowSettings, MemoryStateStore, SqliteStateStore,
    StateCookie, StateStore,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "brokerlink=info".into()),
        )
        .init();

    info!("Brokerlink starting...");

    let config = AppConfig::load().context("Failed to load configuration")?;
    let secrets = config
        .secrets()
        .context("Invalid key material (BROKERLINK_ENCRYPTION_KEY / BROKERLINK_SIGNING_SECRET)")?;

    info!(
        bind_addr = %config.server.bind_addr,
        db_path = %config.database.path,
        state_backend = ?config.database.state_backend,
        "Configuration loaded"
    );

    let credential_store: Arc<dyn CredentialStore> = Arc::new(
        SqliteCredentialStore::new(&config.database.path, secrets.encryption_key)
            .context("Failed to initialize credential store")?
            .with_write_timeout(Duration::from_secs(config.oauth.store_timeout_seconds)),
    );
    info!("Credential store initialized");

    let state_store: Arc<dyn StateStore> = match config.database.state_backend {
        StateBackend::Sqlite => Arc::new(
            SqliteStateStore::new(&config.database.path)
                .context("Failed to initialize OAuth state store")?,
        ),
        StateBackend::Memory => Arc::new(MemoryStateStore::new()),
    };
    info!("OAuth state store initialized");

    let issuer = Arc::new(TokenIssuer::new(&secrets.signing_secret));

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.oauth.exchange_timeout_seconds))
        .build()
        .context("Failed to build HTTP client")?;

    let kite = Arc::new(KiteConnect::with_base_urls(
        config.kite.api_key.clone(),
        config.kite.login_url.clone(),
        config.kite.api_url.clone(),
        http_client,
    ));

    let state_ttl = chrono::Duration::seconds(config.oauth.state_ttl_seconds);
    let cookie = StateCookie::new(
        config.oauth.cookie_name.clone(),
        config.oauth.cookie_secure,
        state_ttl,
    )
    .context("Invalid OAuth cookie name")?;

    let kite_flow = Arc::new(AuthorizationFlow::new(
        kite,
        config.kite.api_secret.clone(),
        Arc::clone(&issuer),
        Arc::clone(&state_store),
        Arc::clone(&credential_store),
        cookie,
        FlowSettings {
            state_ttl,
            exchange_timeout: Duration::from_secs(config.oauth.exchange_timeout_seconds),
            store_timeout: Duration::from_secs(config.oauth.store_timeout_seconds),
        },
    ));

    // Purge abandoned flows
    tokio::spawn(run_state_cleanup(
        Arc::clone(&state_store),
        config.oauth.cleanup_interval_seconds,
    ));

    let app_state = BrokerAppState::new(
        issuer,
        credential_store,
        RedirectTargets::new(
            config.oauth.success_redirect.clone(),
            config.oauth.error_redirect_base.clone(),
        ),
    )
    .with_flow(kite_flow);

    let router = create_broker_router(app_state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "Brokerlink API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Brokerlink stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl_c signal");
    }
    info!("Shutdown signal received");
}
