use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use kswings::config::AgentConfig;
use kswings::docker::{RuntimeClient, VolumeManager};
use kswings::server;
use kswings::shared::{logging, models::AppState};
use kswings::state::StateStore;

#[derive(Parser)]
#[command(name = "kswings")]
#[command(about = "kswings - container host agent", long_about = None)]
struct Cli {
    /// Path to the configuration document
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let _ = logging::init_logging("./logs", "kswings");

    let cli = Cli::parse();
    let config = AgentConfig::load(&cli.config)?;

    info!(
        r#"
 _              _
| | _____      _(_)_ __   __ _ ___
| |/ / __\ \ /\ / / | '_ \ / _` / __|
|   <\__ \\ V  V /| | | | | (_| \__ \
|_|\_\___/ \_/\_/ |_|_| |_|\__, |___/
                           |___/
Starting kswings v{} on port {}
"#,
        config.version, config.port
    );

    std::fs::create_dir_all(config.storage_dir())
        .context("Failed to create storage directory")?;
    std::fs::create_dir_all(config.volumes_dir())
        .context("Failed to create volumes directory")?;

    let docker = RuntimeClient::new(AgentConfig::docker_socket())
        .await
        .context("Failed to construct container runtime client")?;
    docker
        .ping()
        .await
        .context("Container runtime is not reachable")?;

    if let Ok(version) = docker.version().await {
        info!(
            "Connected to container runtime {}",
            version.version.unwrap_or_default()
        );
    }

    let states = StateStore::new(config.states_file());
    let volumes = VolumeManager::new(config.volumes_dir());
    let port = config.port;

    let app = AppState::new(config, docker, states, volumes);
    let router = server::create_router(app);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    info!("Ready to accept requests on 0.0.0.0:{port}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down kswings...");
}
