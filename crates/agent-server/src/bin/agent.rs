//! Standalone Agent process.
//!
//! Binds the WebSocket server, advertises itself on the local network via
//! mDNS, and serves a single paired Hub at a time. Platform-specific duties
//! (Steam shortcuts, artwork, telemetry) are left to [`NullCollaborator`];
//! a real deployment swaps in its own [`capydeploy_agent_server::Collaborator`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use capydeploy_agent_server::auth::default_auth_path;
use capydeploy_agent_server::{AgentServer, App, AppConfig, NullCollaborator, ServerConfig};
use capydeploy_discovery::{ServiceInfo, detect_platform, get_hostname};

#[derive(Parser, Debug)]
#[command(
    name = "capydeploy-agent",
    version,
    about = "Accepts game uploads from a paired CapyDeploy Hub"
)]
struct Cli {
    /// TCP port to listen on (0 = OS-assigned).
    #[arg(long, default_value_t = 0)]
    port: u16,
    /// Display name advertised to Hubs (defaults to the local hostname).
    #[arg(long)]
    name: Option<String>,
    /// Raise logging to debug level.
    #[arg(long)]
    verbose: bool,
}

/// Reads the agent's persisted identifier, minting and saving one on first run.
///
/// Kept alongside the peer auth store so a reinstalled Hub still sees the
/// same `agent_id` it paired with.
fn load_or_create_agent_id(auth_path: &Path) -> std::io::Result<String> {
    let path = auth_path.with_file_name("agent_id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let id = existing.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &id)?;
    Ok(id)
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("agent exited with error: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let auth_path = default_auth_path().ok_or("could not determine a config directory")?;
    let agent_id = load_or_create_agent_id(&auth_path)?;
    let platform = detect_platform().to_string();
    let name = cli
        .name
        .unwrap_or_else(|| get_hostname().trim_end_matches(".local.").to_string());
    let version = env!("CARGO_PKG_VERSION").to_string();

    let staging_root: PathBuf = auth_path
        .parent()
        .map(|p| p.join("staging"))
        .ok_or("invalid config path")?;

    let accept = Arc::new(AtomicBool::new(true));
    let app = App::new(
        AppConfig {
            agent_id: agent_id.clone(),
            agent_name: name.clone(),
            platform: platform.clone(),
            version: version.clone(),
            staging_root,
            auth_path,
            accept_connections: accept.clone(),
        },
        NullCollaborator,
    )?;

    let server = AgentServer::new(ServerConfig { port: cli.port }, app, accept);
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    // The listener binds synchronously at the top of `run`; poll briefly
    // until the assigned port is visible so mDNS advertises the real one.
    let mut port = server.port().await;
    for _ in 0..100 {
        if port != 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        port = server.port().await;
    }
    if port == 0 {
        return Err("server did not bind a port in time".into());
    }

    let cancel = CancellationToken::new();
    let mut discovery = capydeploy_discovery::Server::new(ServiceInfo {
        id: agent_id,
        name,
        platform,
        version,
        port,
        ips: vec![],
    });
    let discovery_cancel = cancel.clone();
    let discovery_task =
        tokio::spawn(async move { discovery.run_context(discovery_cancel).await });

    tracing::info!(port, "agent ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    server.shutdown();
    cancel.cancel();
    let _ = server_task.await;
    let _ = discovery_task.await;
    Ok(())
}
