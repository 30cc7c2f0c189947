mod accounts;
mod config;
mod coordinator;
mod error;
mod events;
mod handlers;
mod presence;
mod protocol;
mod relay;
mod sessions;
mod storage;
mod sweeper;
mod websocket;

#[cfg(test)]
mod testsupport;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    accounts::{HttpUserDirectory, PermissiveDirectory, UserDirectory},
    config::Config,
    coordinator::MatchCoordinator,
    events::{run_fanout_listener, ConnectionRegistry, RedisFanout},
    handlers::{
        end_match, health_check, ice_servers, ice_servers_from_config, presence_status,
        skip_match, start_match, AppState,
    },
    presence::PresenceService,
    relay::SignalingRelay,
    sessions::SessionStore,
    storage::{LockManager, MatchQueue, PresenceStore, ReconnectStore, RedisStore, SignalStore},
    sweeper::ReconnectSweeper,
    websocket::{websocket_handler, WsState},
};

#[derive(Debug, Parser)]
#[command(name = "matchwire", about = "Matchmaking and signaling server")]
struct Cli {
    /// Override MATCHWIRE_PORT
    #[arg(long)]
    port: Option<u16>,
    /// Override REDIS_URL
    #[arg(long)]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() {
    // Default to INFO unless the operator asked for something else
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(redis_url) = cli.redis_url {
        config.redis_url = redis_url;
    }
    let config = Arc::new(config);

    info!("Starting matchwire on port {}", config.port);
    info!("Redis URL: {}", config.redis_url);
    info!("Reconnect grace window: {} seconds", config.grace_seconds);

    let store = match RedisStore::connect(config.clone()).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("Failed to connect to Redis: {}", err);
            std::process::exit(1);
        }
    };

    let events = Arc::new(RedisFanout::new(store.connection()));
    let registry = ConnectionRegistry::default();

    // Every process listens for fanout envelopes and delivers to its own
    // connections; reconnect with backoff if the pub/sub stream drops.
    {
        let redis_url = config.redis_url.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            loop {
                match redis::Client::open(redis_url.as_str()) {
                    Ok(client) => match run_fanout_listener(client, registry.clone()).await {
                        Ok(()) => warn!("fanout listener stream ended, reconnecting"),
                        Err(err) => warn!(error = %err, "fanout listener failed, reconnecting"),
                    },
                    Err(err) => warn!(error = %err, "invalid redis url for fanout listener"),
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }

    let directory: Arc<dyn UserDirectory> = match &config.user_directory_url {
        Some(url) => {
            info!("User directory: {}", url);
            Arc::new(HttpUserDirectory::new(url.clone()))
        }
        None => {
            warn!("No user directory configured, admitting all users");
            Arc::new(PermissiveDirectory)
        }
    };

    let coordinator = Arc::new(MatchCoordinator::new(
        store.clone() as Arc<dyn MatchQueue>,
        store.clone() as Arc<dyn LockManager>,
        store.clone() as Arc<dyn SessionStore>,
        directory,
        events.clone(),
        config.lock_ttl_ms,
    ));
    let relay = Arc::new(SignalingRelay::new(
        store.clone() as Arc<dyn SessionStore>,
        store.clone() as Arc<dyn SignalStore>,
        events.clone(),
    ));
    let presence = Arc::new(PresenceService::new(
        store.clone() as Arc<dyn PresenceStore>,
        store.clone() as Arc<dyn ReconnectStore>,
        store.clone() as Arc<dyn SessionStore>,
        events.clone(),
        config.grace_seconds,
    ));

    let sweeper = ReconnectSweeper::new(
        store.clone() as Arc<dyn LockManager>,
        store.clone() as Arc<dyn SessionStore>,
        store.clone() as Arc<dyn ReconnectStore>,
        events.clone(),
        Duration::from_secs(config.sweep_interval_seconds),
        config.sweeper_lease_ms,
    );
    tokio::spawn(sweeper.run());

    let app_state = AppState {
        coordinator,
        presence: presence.clone(),
        ice_servers: Arc::new(ice_servers_from_config(&config)),
    };
    let ws_state = WsState {
        registry,
        relay,
        presence,
    };

    let http_routes = Router::new()
        .route("/health", get(health_check))
        .route("/match/start", post(start_match))
        .route("/match/skip", post(skip_match))
        .route("/match/end", post(end_match))
        .route("/webrtc/ice-servers", get(ice_servers))
        .route("/presence/:user_id", get(presence_status))
        .with_state(app_state);

    let ws_routes = Router::new()
        .route("/ws/:user_id", get(websocket_handler))
        .with_state(ws_state);

    let app = Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("matchwire listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
