//! Session & router (C5): client/server session wrapping one multiplexed
//! connection, method-name dispatch, and the `213` header-then-bulk
//! response convention.

pub mod reconnect;

use crate::bulk;
use crate::codec::{Decode, Encode};
use crate::error::{Error, Result};
use crate::frame;
use crate::mux::{Multiplex, MuxStream};
use crate::wire::{Request, Response, STATUS_BULK};
use crate::workerpool::WorkerPool;
use async_trait::async_trait;
use dashmap::DashMap;
use reconnect::{ConnectionState, ReconnectConfig, ReconnectController};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{debug, error};

/// A post-header bulk emitter, invoked by the dispatch loop after the
/// framed `213` response has been flushed.
pub type BulkFn = Box<
    dyn FnOnce(MuxStream) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send,
>;

/// What a handler returns: the framed header, plus an optional bulk body.
pub struct HandlerResponse {
    pub header: Response,
    pub bulk: Option<BulkFn>,
}

impl HandlerResponse {
    pub fn ok(data: Vec<u8>) -> Self {
        HandlerResponse {
            header: Response::ok(data),
            bulk: None,
        }
    }

    pub fn error(err: &Error) -> Self {
        HandlerResponse {
            header: Response::from_error(err),
            bulk: None,
        }
    }

    pub fn bulk(payload: Vec<u8>) -> Self {
        HandlerResponse {
            header: Response::bulk_header(),
            bulk: Some(Box::new(move |mut stream| {
                Box::pin(async move {
                    if let Err(e) = bulk::send_bulk(&mut stream, &payload).await {
                        error!(error = %e, "failed to send bulk payload");
                    }
                })
            })),
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request) -> HandlerResponse;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResponse> + Send + 'static,
{
    async fn handle(&self, req: Request) -> HandlerResponse {
        (self)(req).await
    }
}

/// `method -> handler` registry. Lock-free reads, serialized writes, per
/// the `dashmap`-backed design noted in DESIGN.md.
#[derive(Clone, Default)]
pub struct Router {
    handlers: Arc<DashMap<String, Arc<dyn Handler>>>,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(method.into(), handler);
    }

    pub async fn dispatch(&self, req: Request) -> HandlerResponse {
        let Some(handler) = self.handlers.get(&req.method).map(|h| h.value().clone()) else {
            return HandlerResponse::error(&Error::MethodNotFound(req.method.clone()));
        };
        handler.handle(req).await
    }
}

fn default_router() -> Router {
    let router = Router::new();
    router.register(
        "echo",
        Arc::new(|req: Request| async move { HandlerResponse::ok(req.payload) }),
    );
    router
}

/// One end of a session: wraps the current [`Multiplex`] (swapped out on
/// reconnect), a [`Router`] for incoming streams, and optionally a
/// [`ReconnectController`] plus a worker pool to dispatch accepted
/// streams.
pub struct Session {
    current: Arc<RwLock<Arc<Multiplex>>>,
    pub router: Router,
    reconnect: Option<Arc<ReconnectController>>,
    pool: Option<WorkerPool>,
    pub version: String,
}

impl Session {
    pub fn new(mux: Multiplex, version: impl Into<String>) -> Arc<Self> {
        Arc::new(Session {
            current: Arc::new(RwLock::new(Arc::new(mux))),
            router: default_router(),
            reconnect: None,
            pool: None,
            version: version.into(),
        })
    }

    pub fn with_reconnect(mux: Multiplex, version: impl Into<String>, config: ReconnectConfig) -> Arc<Self> {
        let current = Arc::new(RwLock::new(Arc::new(mux)));
        let controller = ReconnectController::new(config);
        controller.spawn_monitor(current.clone());
        Arc::new(Session {
            current,
            router: default_router(),
            reconnect: Some(controller),
            pool: None,
            version: version.into(),
        })
    }

    pub fn with_worker_pool(mut self: Arc<Self>, workers: usize) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .map(|s| s.pool = Some(WorkerPool::new(workers)))
            .unwrap_or(());
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.reconnect
            .as_ref()
            .map(|r| r.state())
            .unwrap_or(ConnectionState::Connected)
    }

    async fn current_mux(&self) -> Result<Arc<Multiplex>> {
        let mux = self.current.read().await.clone();
        if mux.is_closed() {
            if let Some(reconnect) = &self.reconnect {
                return reconnect.open_stream_with_reconnect(&self.current).await;
            }
            return Err(Error::Closed);
        }
        Ok(mux)
    }

    async fn open_stream(&self) -> Result<MuxStream> {
        let mux = self.current_mux().await?;
        match mux.open_stream().await {
            Ok(s) => Ok(s),
            Err(e) => {
                if let Some(reconnect) = &self.reconnect {
                    let mux = reconnect.open_stream_with_reconnect(&self.current).await?;
                    mux.open_stream().await
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Perform a unary call: send `Request{method, payload}`, return the
    /// decoded response payload (or the typed error for non-2xx/213).
    pub async fn call(&self, method: &str, payload: Vec<u8>, deadline: Option<Duration>) -> Result<Vec<u8>> {
        let mut stream = self.open_stream().await?;
        stream.set_deadline(deadline);
        let req = Request {
            method: method.to_string(),
            payload,
        };
        frame::write_frame(&mut stream, &req.encode_to_vec()).await?;
        let raw = frame::read_frame(&mut stream).await?;
        let resp = Response::decode_from_slice(&raw)?;
        resp.into_result()
    }

    /// Perform a call expected to produce a `213` bulk response; returns
    /// the bulk bytes.
    pub async fn call_binary(&self, method: &str, payload: Vec<u8>, deadline: Option<Duration>) -> Result<Vec<u8>> {
        let mut stream = self.open_stream().await?;
        stream.set_deadline(deadline);
        let req = Request {
            method: method.to_string(),
            payload,
        };
        frame::write_frame(&mut stream, &req.encode_to_vec()).await?;
        let raw = frame::read_frame(&mut stream).await?;
        let resp = Response::decode_from_slice(&raw)?;
        if resp.status != STATUS_BULK {
            return resp.into_result();
        }
        bulk::receive_bulk(&mut stream).await
    }

    /// Server-side accept loop: accept streams and submit them to the
    /// worker pool (or run inline if no pool is configured), dispatching
    /// through `router`.
    pub async fn serve_forever(self: Arc<Self>) {
        loop {
            let mux = match self.current.read().await.clone() {
                m if !m.is_closed() => m,
                _ => break,
            };
            let stream = match mux.accept_stream().await {
                Ok(s) => s,
                Err(_) => break,
            };
            let router = self.router.clone();
            if let Some(pool) = &self.pool {
                // The job only takes the stream out of this slot once it
                // actually runs, so a rejected submission still owns the
                // stream and can close it instead of silently dropping it.
                let slot = Arc::new(tokio::sync::Mutex::new(Some(stream)));
                let job_slot = slot.clone();
                let job: crate::workerpool::Job = Box::pin(async move {
                    if let Some(stream) = job_slot.lock().await.take() {
                        handle_stream(stream, router).await;
                    }
                });
                if !pool.submit(job).await {
                    debug!("stream rejected under backpressure, closing");
                    if let Some(mut stream) = slot.lock().await.take() {
                        let _ = stream.close().await;
                    }
                }
            } else {
                tokio::spawn(handle_stream(stream, router));
            }
        }
    }

    pub async fn close(&self) {
        if let Some(r) = &self.reconnect {
            r.cancel();
        }
        self.current.read().await.close();
    }
}

async fn handle_stream(mut stream: MuxStream, router: Router) {
    let raw = match frame::read_frame(&mut stream).await {
        Ok(r) => r,
        Err(_) => return,
    };
    let req = match Request::decode_from_slice(&raw) {
        Ok(r) => r,
        Err(e) => {
            let resp = Response::from_error(&e);
            let _ = frame::write_frame(&mut stream, &resp.encode_to_vec()).await;
            return;
        }
    };
    let HandlerResponse { header, bulk } = router.dispatch(req).await;
    if frame::write_frame(&mut stream, &header.encode_to_vec())
        .await
        .is_err()
    {
        return;
    }
    if let Some(bulk_fn) = bulk {
        bulk_fn(stream).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn make_pair() -> (Arc<Session>, Arc<Session>) {
        let (client_io, server_io) = duplex(1 << 20);
        let (c_read, c_write) = tokio::io::split(client_io);
        let (s_read, s_write) = tokio::io::split(server_io);
        let client_mux = Multiplex::new(c_read, c_write, true);
        let server_mux = Multiplex::new(s_read, s_write, false);
        let client = Session::new(client_mux, "test");
        let server = Session::new(server_mux, "test");
        (client, server)
    }

    #[tokio::test]
    async fn echo_round_trips() {
        let (client, server) = make_pair().await;
        let server_loop = tokio::spawn(server.clone().serve_forever());
        let resp = client
            .call("echo", b"hi there".to_vec(), Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(resp, b"hi there");
        server.close().await;
        let _ = server_loop.await;
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let (client, server) = make_pair().await;
        tokio::spawn(server.clone().serve_forever());
        let err = client
            .call("nope", vec![], Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn bulk_response_round_trips() {
        let (client, server) = make_pair().await;
        server.router.register(
            "bulk-echo",
            Arc::new(|req: Request| async move { HandlerResponse::bulk(req.payload) }),
        );
        tokio::spawn(server.clone().serve_forever());
        let payload = vec![7u8; 50_000];
        let got = client
            .call_binary("bulk-echo", payload.clone(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(got, payload);
    }
}
