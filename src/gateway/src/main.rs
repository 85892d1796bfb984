use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use deskchat_core::{build_router, ChatConfig, LocalBackend, ServerConfig, SqliteStore};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_filter())
        .init();

    let defaults = ServerConfig::default();
    let config = ServerConfig {
        bind: parse_socket("DESKCHAT_BIND", defaults.bind),
        heartbeat_interval: parse_duration("DESKCHAT_HEARTBEAT_SECS", defaults.heartbeat_interval),
        idle_timeout: parse_duration("DESKCHAT_IDLE_SECS", defaults.idle_timeout),
    };
    let chat = Arc::new(ChatConfig::load_or_default());

    let db_path = env::var("DESKCHAT_DB_PATH").unwrap_or_else(|_| "deskchat.db".to_string());
    let store = Arc::new(SqliteStore::open(Path::new(&db_path))?);
    let backend = Arc::new(LocalBackend::new(store, chat.channel_capacity));

    let app = build_router(config.clone(), chat, backend);

    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, db = %db_path, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn parse_socket(key: &str, default: SocketAddr) -> SocketAddr {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_duration(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map(Duration::from_secs).unwrap_or(default),
        Err(_) => default,
    }
}

fn tracing_filter() -> tracing_subscriber::EnvFilter {
    let explicit = env::var("DESKCHAT_LOG").or_else(|_| env::var("RUST_LOG")).ok();
    if let Some(filter) = explicit {
        return tracing_subscriber::EnvFilter::new(filter);
    }
    if matches!(
        env::var("DESKCHAT_DEBUG").as_deref(),
        Ok("1" | "true" | "TRUE" | "yes" | "YES")
    ) {
        return tracing_subscriber::EnvFilter::new("debug");
    }
    tracing_subscriber::EnvFilter::new("info")
}
