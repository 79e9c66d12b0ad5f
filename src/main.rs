use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden::aof::{Aof, replay_commands};
use warden::base::WardenResult;
use warden::config::ServerConfig;
use warden::{Warden, server};

#[tokio::main]
async fn main() -> WardenResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();

    let (aof, replayable) = match &config.aof_path {
        Some(path) => {
            let (aof, events) = Aof::open(path)?;
            (Some(aof), events)
        }
        None => (None, Vec::new()),
    };

    let warden = Warden::with_aof(config.clone(), aof);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_secs() as i64;
    warden.replay(replay_commands(replayable, now));

    let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
    info!(bind = %config.bind, port = config.port, "warden listening");

    tokio::select! {
        result = server::serve(warden.clone(), listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    warden.close();
    Ok(())
}
