//! Transport bring-up (C12): the `/plus/arpc` HTTP-upgrade handshake
//! that turns an accepted HTTPS request into a raw multiplexed
//! connection, handed off to the session manager.

use crate::manager::SessionManager;
use crate::mux::Multiplex;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::get;
use axum::Router as AxumRouter;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, Instrument};

pub const ARPC_PATH: &str = "/plus/arpc";
const AGENT_HEADER: &str = "X-PBS-Agent";
const VERSION_HEADER: &str = "X-PBS-Plus-Version";
const JOB_ID_HEADER: &str = "X-PBS-Plus-JobId";

#[derive(Clone)]
pub struct TransportState {
    pub manager: Arc<SessionManager>,
}

/// Build the axum router exposing the upgrade endpoint. Callers layer
/// their own TLS acceptor (mTLS) around the resulting service, per
/// SPEC_FULL.md's external-interfaces section.
pub fn router(manager: Arc<SessionManager>) -> AxumRouter {
    AxumRouter::new()
        .route(ARPC_PATH, get(arpc_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(TransportState { manager })
}

async fn arpc_upgrade(
    State(state): State<TransportState>,
    headers: HeaderMap,
    req: Request,
) -> impl IntoResponse {
    let Some(client_id) = headers
        .get(AGENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    else {
        return (StatusCode::BAD_REQUEST, "missing X-PBS-Agent header").into_response();
    };
    let version = headers
        .get(VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let job_id = headers
        .get(JOB_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let span = info_span!("agent_connection", client_id = %client_id, job_id = %job_id);
    tokio::spawn(
        async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    let (read, write) = tokio::io::split(io);
                    let mux = Multiplex::new(read, write, false);
                    info!(client_id, job_id, version, "agent connection upgraded");
                    let session = state.manager.get_or_create(&client_id, mux, &version).await;
                    session.serve_forever().await;
                }
                Err(e) => error!(error = %e, "failed to upgrade agent connection"),
            }
        }
        .instrument(span),
    );

    AxumResponse::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "arpc")
        .body(Body::empty())
        .unwrap()
        .into_response()
}

/// Client-side mirror: perform the HTTP upgrade against a TLS connection
/// already dialed by the caller, and return the raw multiplexed
/// connection. `job_id` is sent as an extra header so the server can tag
/// the connection per-job. The upgrade handshake is hand-rolled (a plain
/// request line plus headers, then a status-line parse) rather than
/// routed through a full HTTP client, since all that's needed here is
/// the one-shot 101 exchange before the connection becomes raw bytes.
pub async fn upgrade_over<S>(
    mut conn: S,
    host: &str,
    client_id: &str,
    version: &str,
    job_id: &str,
) -> crate::error::Result<Multiplex>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    use crate::error::Error;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         {agent_header}: {client_id}\r\n\
         {version_header}: {version}\r\n\
         X-PBS-Plus-JobId: {job_id}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: arpc\r\n\
         \r\n",
        path = ARPC_PATH,
        agent_header = AGENT_HEADER,
        version_header = VERSION_HEADER,
    );
    conn.write_all(request.as_bytes())
        .await
        .map_err(Error::Io)?;

    let mut buf = [0u8; 512];
    let n = conn.read(&mut buf).await.map_err(Error::Io)?;
    let response = String::from_utf8_lossy(&buf[..n]);
    if !response.starts_with("HTTP/1.1 101") {
        return Err(Error::ServerUnreachable);
    }

    let (read, write) = tokio::io::split(conn);
    Ok(Multiplex::new(read, write, true))
}
