//! HTTP listener and request routing
//!
//! `POST /token` goes to the token issuer; every other request must carry a
//! valid bearer token and is forwarded to the backend. Every response passes
//! through the access log.

use crate::access_log::{self, AccessLogEntry};
use crate::auth::TokenAuthority;
use crate::error::GatewayBody;
use crate::lifecycle::cancelled;
use crate::proxy::ProxyGateway;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Path of the unauthenticated token issuance endpoint
pub const TOKEN_PATH: &str = "/token";

/// Access log, then token issuance or bearer check plus proxying
pub struct Pipeline {
    authority: TokenAuthority,
    proxy: ProxyGateway,
}

impl Pipeline {
    pub fn new(authority: TokenAuthority, proxy: ProxyGateway) -> Self {
        Self { authority, proxy }
    }

    pub async fn handle(
        &self,
        req: Request<GatewayBody>,
        client_addr: SocketAddr,
    ) -> Response<GatewayBody> {
        let entry = AccessLogEntry::start(&req, client_addr);

        if req.method() == Method::POST && req.uri().path() == TOKEN_PATH {
            let response = self.authority.handle_issue(req).await;
            return access_log::wrap(response, entry);
        }

        match self.authority.authorize(&req, client_addr) {
            Ok(claims) => {
                let entry = entry.with_subject(claims.sub);
                let response = self.proxy.forward(req, client_addr).await;
                access_log::wrap(response, entry)
            }
            Err(rejection) => access_log::wrap(rejection, entry),
        }
    }
}

/// Accepts HTTP/1.1 and HTTP/2 connections and serves them through a [`Pipeline`]
pub struct GatewayServer {
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    drain_timeout: Duration,
    header_read_timeout: Duration,
}

impl GatewayServer {
    pub async fn bind(addr: SocketAddr, pipeline: Pipeline) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;

        Ok(Self {
            listener,
            pipeline: Arc::new(pipeline),
            drain_timeout: Duration::from_secs(10),
            header_read_timeout: Duration::from_secs(30),
        })
    }

    /// How long in-flight connections get to finish after shutdown
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` reads `true`, then drain
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout);
        builder.http2().max_concurrent_streams(250);

        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let pipeline = Arc::clone(&self.pipeline);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let pipeline = Arc::clone(&pipeline);
                                async move {
                                    let req = req.map(|body| body.boxed());
                                    Ok::<_, Infallible>(pipeline.handle(req, client_addr).await)
                                }
                            });

                            let conn = builder.serve_connection(TokioIo::new(stream), service);
                            let conn = graceful.watch(conn.into_owned());

                            tokio::spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = cancelled(&mut shutdown) => {
                    info!("Gateway shutting down, no longer accepting connections");
                    break;
                }
            }
        }

        drop(self.listener);

        tokio::select! {
            _ = graceful.shutdown() => {
                info!("All connections drained");
            }
            _ = tokio::time::sleep(self.drain_timeout) => {
                warn!(
                    drain_timeout_secs = self.drain_timeout.as_secs(),
                    "Drain window elapsed with connections still open"
                );
            }
        }

        Ok(())
    }
}
