//! HTTP API for requesting and managing demo sites
//!
//! JSON over hyper. Successful responses carry `"success": true`; failures
//! carry `"success": false` with an error message and code, and a non-2xx
//! status.

use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{json_error_response, ApiErrorCode, SiteError};
use crate::orchestrator::SiteOrchestrator;
use crate::pool::SitePool;
use crate::site::SiteDescriptor;
use crate::tasks::TaskRegistry;

const MAX_USERNAME_LEN: usize = 64;

/// Body of `POST /site`; an empty body is accepted
#[derive(Debug, Default, Deserialize)]
pub struct CreateSiteRequest {
    #[serde(default)]
    pub username: Option<String>,
}

impl CreateSiteRequest {
    fn parse(body: &[u8]) -> Result<Self, String> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let mut request: Self = serde_json::from_slice(body).map_err(|e| format!("Invalid JSON: {}", e))?;

        request.username = request
            .username
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        if let Some(name) = &request.username {
            if name.len() > MAX_USERNAME_LEN || name.chars().any(char::is_control) {
                return Err(format!(
                    "username must be at most {} printable characters",
                    MAX_USERNAME_LEN
                ));
            }
        }
        Ok(request)
    }
}

#[derive(Serialize)]
struct SiteCreated<'a> {
    success: bool,
    #[serde(flatten)]
    site: &'a SiteDescriptor,
}

pub struct DemoApi {
    orchestrator: Arc<SiteOrchestrator>,
    pool: Arc<SitePool>,
    tasks: Arc<TaskRegistry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DemoApi {
    pub fn new(
        orchestrator: Arc<SiteOrchestrator>,
        pool: Arc<SitePool>,
        tasks: Arc<TaskRegistry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            orchestrator,
            pool,
            tasks,
            shutdown_rx,
        }
    }

    /// Bind and serve until shutdown
    pub async fn run(self: Arc<Self>, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(addr = %listener.local_addr()?, "API server listening");
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, _addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().trim_end_matches('/').to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        let response = match (&method, path.as_str()) {
            (&Method::GET, "/health") => json_response(StatusCode::OK, r#"{"status":"ok"}"#),
            (&Method::GET, "/version") => {
                let version = serde_json::json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                });
                json_response(StatusCode::OK, version.to_string())
            }

            (&Method::GET, "/sites") => self.list_sites(),
            (&Method::POST, "/site") | (&Method::POST, "/create-site") => self.create_site(req).await,
            (&Method::POST, "/cleanup") => self.cleanup().await,
            (&Method::GET, "/containers") => self.list_containers().await,
            (&Method::GET, "/reconcile") => self.reconcile().await,
            (&Method::GET, "/pool") => self.pool_status(),
            (&Method::GET, "/tasks") => json_ok(serde_json::json!({
                "success": true,
                "tasks": self.tasks.snapshot(),
            })),

            (&Method::DELETE, path) if site_path(path).is_some_and(|(_, rest)| rest.is_empty()) => {
                let (site_id, _) = site_path(path).unwrap_or_default();
                self.destroy_site(site_id).await
            }
            (&Method::GET, path) if site_path(path).is_some_and(|(_, rest)| rest == "login") => {
                let (site_id, _) = site_path(path).unwrap_or_default();
                self.login_link(site_id).await
            }

            (_, "/health" | "/version" | "/sites" | "/site" | "/create-site" | "/cleanup" | "/containers"
                | "/reconcile" | "/pool" | "/tasks") => {
                json_error_response(ApiErrorCode::MethodNotAllowed, "Method not allowed")
            }
            _ => json_error_response(ApiErrorCode::NotFound, "Not found"),
        };

        Ok(response)
    }

    // ==================== Sites ====================

    fn list_sites(&self) -> Response<Full<Bytes>> {
        match self.orchestrator.list_sites() {
            Ok(sites) => json_ok(serde_json::json!({ "success": true, "sites": sites })),
            Err(e) => site_error(&e),
        }
    }

    async fn create_site(&self, req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        let body = match req.collect().await {
            Ok(body) => body.to_bytes(),
            Err(e) => return json_error_response(ApiErrorCode::BadRequest, format!("Failed to read body: {}", e)),
        };
        let request = match CreateSiteRequest::parse(&body) {
            Ok(request) => request,
            Err(message) => return json_error_response(ApiErrorCode::BadRequest, message),
        };

        match self.pool.allocate(request.username.as_deref()).await {
            Ok(site) => json_ok(SiteCreated {
                success: true,
                site: &site,
            }),
            Err(e) => site_error(&e),
        }
    }

    async fn destroy_site(&self, site_id: &str) -> Response<Full<Bytes>> {
        match self.orchestrator.destroy_site(site_id).await {
            Ok(()) => json_response(StatusCode::OK, r#"{"success":true}"#),
            Err(e) => site_error(&e),
        }
    }

    async fn login_link(&self, site_id: &str) -> Response<Full<Bytes>> {
        match self.orchestrator.login_link(site_id).await {
            Ok(url) => json_ok(serde_json::json!({ "success": true, "url": url })),
            Err(e) => site_error(&e),
        }
    }

    // ==================== Maintenance ====================

    async fn cleanup(&self) -> Response<Full<Bytes>> {
        match self.orchestrator.cleanup_expired().await {
            Ok(report) => json_ok(serde_json::json!({ "success": true, "report": report })),
            Err(e) => site_error(&e),
        }
    }

    async fn list_containers(&self) -> Response<Full<Bytes>> {
        match self.orchestrator.list_sites_from_labels().await {
            Ok(sites) => json_ok(serde_json::json!({ "success": true, "sites": sites })),
            Err(e) => site_error(&e),
        }
    }

    async fn reconcile(&self) -> Response<Full<Bytes>> {
        match self.orchestrator.reconcile().await {
            Ok(report) => json_ok(serde_json::json!({ "success": true, "report": report })),
            Err(e) => site_error(&e),
        }
    }

    fn pool_status(&self) -> Response<Full<Bytes>> {
        match self.pool.status() {
            Ok(status) => json_ok(serde_json::json!({ "success": true, "pool": status })),
            Err(e) => site_error(&e),
        }
    }
}

// ==================== Helper Functions ====================

/// Split `/sites/<id>[/<rest>]` into the id and the remainder
fn site_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/sites/")?;
    let (site_id, tail) = rest.split_once('/').unwrap_or((rest, ""));
    if site_id.is_empty() {
        return None;
    }
    Some((site_id, tail))
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}

fn json_ok<T: Serialize>(value: T) -> Response<Full<Bytes>> {
    match serde_json::to_string(&value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_error_response(ApiErrorCode::InternalError, format!("Failed to encode response: {}", e)),
    }
}

fn site_error(err: &SiteError) -> Response<Full<Bytes>> {
    let code = err.code();
    if code.status_code().is_server_error() {
        error!(error = %err, code = code.as_str(), "Request failed");
    } else {
        warn!(error = %err, code = code.as_str(), "Request rejected");
    }
    json_error_response(code, err.to_string())
}
