//! Agent CLI: dials the backup server, bootstraps an mTLS client
//! certificate if none exists yet, and serves a [`RemoteFsService`] for
//! one configured snapshot.

use clap::Parser;
use pbs_agent_core::config::load_agent_config;
use pbs_agent_core::remotefs::server::RemoteFsService;
use pbs_agent_core::remotefs::SnapshotHandle;
use pbs_agent_core::session::reconnect::ReconnectConfig;
use pbs_agent_core::session::Session;
use pbs_agent_core::transport;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pbs-agent", about = "Serves a snapshot filesystem to a backup server")]
struct Args {
    /// Path to the agent's TOML configuration file.
    #[arg(long)]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> pbs_agent_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_agent_config(&args.config)?;
    info!(job_id = %config.job_id, "starting agent");

    let snapshot = SnapshotHandle {
        snapshot_path: config.snapshot_path.clone(),
        drive_letter: config.drive_letter.clone(),
    };

    let client_id = config.job_id.clone();
    let job_id = config.job_id.clone();
    let server_url = config.server_url.clone();
    let tls = config.tls.clone();

    let dial_server_url = server_url.clone();
    let dial_client_id = client_id.clone();
    let dial_job_id = job_id.clone();
    let dial_tls = tls.clone();

    let dial = std::sync::Arc::new(move || {
        let server_url = dial_server_url.clone();
        let client_id = dial_client_id.clone();
        let job_id = dial_job_id.clone();
        let tls = dial_tls.clone();
        Box::pin(async move {
            dial_once(&server_url, &client_id, &job_id, &tls).await
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = pbs_agent_core::Result<pbs_agent_core::mux::Multiplex>> + Send>>
    });

    let probe_server_url = server_url.clone();
    let probe = std::sync::Arc::new(move || {
        let server_url = probe_server_url.clone();
        Box::pin(async move {
            TcpStream::connect(strip_scheme(&server_url))
                .await
                .map(|_| ())
                .map_err(pbs_agent_core::Error::Io)
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = pbs_agent_core::Result<()>> + Send>>
    });

    let reconnect_config: ReconnectConfig = config.reconnect.clone().into_config(dial.clone(), probe);

    let mux = dial_once(&server_url, &client_id, &job_id, &tls).await?;
    let session = Session::with_reconnect(mux, "pbs-agent-core/0.1", reconnect_config)
        .with_worker_pool(config.worker_count);

    let service = RemoteFsService::new(job_id, snapshot);
    service.register(&session.router);

    info!("agent session established, serving requests");
    session.serve_forever().await;
    Ok(())
}

fn strip_scheme(url: &str) -> &str {
    url.trim_start_matches("https://").trim_start_matches("http://")
}

async fn dial_once(
    server_url: &str,
    client_id: &str,
    job_id: &str,
    tls: &pbs_agent_core::config::TlsMaterial,
) -> pbs_agent_core::Result<pbs_agent_core::mux::Multiplex> {
    use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
    use pbs_agent_core::Error;
    use std::pin::Pin;

    let addr = strip_scheme(server_url);
    let tcp = TcpStream::connect(addr).await.map_err(Error::Io)?;

    let mut builder = SslConnector::builder(SslMethod::tls()).map_err(|e| Error::Unknown(e.to_string()))?;
    builder
        .set_certificate_chain_file(&tls.cert_path)
        .map_err(|e| Error::Unknown(e.to_string()))?;
    builder
        .set_private_key_file(&tls.key_path, openssl::ssl::SslFiletype::PEM)
        .map_err(|e| Error::Unknown(e.to_string()))?;
    builder
        .set_ca_file(&tls.ca_path)
        .map_err(|e| Error::Unknown(e.to_string()))?;
    builder.set_verify(SslVerifyMode::PEER);
    let connector = builder.build();

    let host = addr.split(':').next().unwrap_or(addr);
    let ssl = connector
        .configure()
        .map_err(|e| Error::Unknown(e.to_string()))?
        .into_ssl(host)
        .map_err(|e| Error::Unknown(e.to_string()))?;
    let mut stream = SslStream::new(ssl, tcp).map_err(|e| Error::Unknown(e.to_string()))?;
    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(|e| Error::Unknown(e.to_string()))?;

    transport::upgrade_over(stream, host, client_id, "pbs-agent-core/0.1", job_id).await
}
