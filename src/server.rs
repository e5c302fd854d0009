//! HTTP Server
//!
//! Serves object, replication, health and metrics endpoints over hyper.
//! Each connection speaks HTTP/1.1 or cleartext HTTP/2, detected from its
//! preface, so peers can multiplex replication on one connection.
//!
//! # Routes
//!
//! ```text
//! GET    /healthz /livez            liveness
//! GET    /readyz                    readiness
//! GET    /health                    JSON health report
//! GET    /metrics                   Prometheus text format
//! GET    /objects?prefix=p          list          (x-tenant-id)
//! GET    /objects/{key}             read          (x-tenant-id)
//! PUT    /objects/{key}             write         (x-tenant-id)
//! DELETE /objects/{key}             delete        (x-tenant-id)
//! GET    /quota                     tenant usage  (x-tenant-id)
//! GET    /replication               engine status
//! PUT    /replicate/{tenant}/{key}  inbound peer write  (x-object-version)
//! DELETE /replicate/{tenant}/{key}  inbound peer delete (x-object-version)
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{PrometheusSink, ORIGIN_HEADER, VERSION_HEADER};
use crate::cache::RemoteApply;
use crate::domain::ports::Change;
use crate::error::{Error, Result};
use crate::monitoring::MetricsCollector;
use crate::service::{ObjectService, OpContext};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const CACHE_SOURCE_HEADER: &str = "x-cache-source";
/// Optional per-request deadline in milliseconds
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

const JSON: &str = "application/json";

/// Renders collected metrics for the `/metrics` endpoint.
pub trait MetricsExporter: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn export(&self) -> Result<String>;
}

impl MetricsExporter for PrometheusSink {
    fn content_type(&self) -> &'static str {
        PrometheusSink::content_type(self)
    }

    fn export(&self) -> Result<String> {
        self.encode()
    }
}

impl MetricsExporter for MetricsCollector {
    fn content_type(&self) -> &'static str {
        "text/plain; version=0.0.4"
    }

    fn export(&self) -> Result<String> {
        Ok(self.export_text())
    }
}

type HttpResponse = Response<Full<Bytes>>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::EntryTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::QuotaExceeded { .. } | Error::TenantNotFound(_) => StatusCode::FORBIDDEN,
        Error::Backpressure(_) | Error::ShuttingDown(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict { .. } => StatusCode::CONFLICT,
        Error::Config(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn text(status: StatusCode, body: &'static str) -> HttpResponse {
    respond(status, "text/plain", body)
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, JSON, body),
        Err(e) => {
            error!(error = %e, "Response serialization failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed")
        }
    }
}

fn error_response(error: &Error) -> HttpResponse {
    let status = status_for(error);
    if status.is_server_error() {
        warn!(error = %error, %status, "Request failed");
    } else {
        debug!(error = %error, %status, "Request rejected");
    }
    let mut response = json(
        status,
        &ErrorBody {
            error: error.kind().as_str(),
            message: error.to_string(),
        },
    );
    if error.is_retryable() {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from_static("1"));
    }
    response
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == name).then(|| {
            urlencoding::decode(v)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| v.to_string())
        })
    })
}

fn decode_segment(raw: &str) -> Result<String> {
    let decoded = urlencoding::decode(raw)
        .map_err(|e| Error::Serialization(format!("bad path segment: {}", e)))?;
    if decoded.is_empty() {
        return Err(Error::Serialization("empty path segment".into()));
    }
    Ok(decoded.into_owned())
}

/// Request handler shared by every connection.
pub struct Router {
    service: Arc<ObjectService>,
    exporter: Arc<dyn MetricsExporter>,
}

impl Router {
    pub fn new(service: Arc<ObjectService>, exporter: Arc<dyn MetricsExporter>) -> Self {
        Self { service, exporter }
    }

    fn context(&self, headers: &HeaderMap) -> OpContext {
        let default = self.service.config().request_timeout();
        let timeout = header(headers, TIMEOUT_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .map(|ms| Duration::from_millis(ms).min(default))
            .unwrap_or(default);
        OpContext::with_timeout(timeout)
    }

    async fn body(&self, body: Incoming) -> Result<Bytes> {
        let limit = self.service.cache().max_entry_size();
        let limited = Limited::new(body, limit as usize);
        match limited.collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.is::<http_body_util::LengthLimitError>() => Err(Error::EntryTooLarge {
                size: limit + 1,
                limit,
            }),
            Err(e) => Err(Error::Io(std::io::Error::other(e.to_string()))),
        }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> HttpResponse {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(%method, %path, "Request");

        let result = match (&method, path.as_str()) {
            (&Method::GET, "/healthz") | (&Method::GET, "/livez") => Ok(self.live()),
            (&Method::GET, "/readyz") => Ok(self.ready()),
            (&Method::GET, "/health") => Ok(self.health().await),
            (&Method::GET, "/metrics") => self.metrics(),
            (&Method::GET, "/replication") => {
                Ok(json(StatusCode::OK, &self.service.replication().status()))
            }
            (_, p) if p.starts_with("/replicate/") => self.replicate(req).await,
            _ => self.tenant_route(req).await,
        };
        result.unwrap_or_else(|e| error_response(&e))
    }

    fn live(&self) -> HttpResponse {
        if self.service.readiness().is_live() {
            text(StatusCode::OK, "ok")
        } else {
            text(StatusCode::SERVICE_UNAVAILABLE, "not live")
        }
    }

    fn ready(&self) -> HttpResponse {
        if self.service.readiness().is_ready() {
            text(StatusCode::OK, "ok")
        } else {
            text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
        }
    }

    async fn health(&self) -> HttpResponse {
        let report = self.service.health().await;
        let status = if report.status.is_operational() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        json(status, &report)
    }

    fn metrics(&self) -> Result<HttpResponse> {
        self.service.report_metrics();
        let body = self.exporter.export()?;
        Ok(respond(StatusCode::OK, self.exporter.content_type(), body))
    }

    async fn tenant_route(&self, req: Request<Incoming>) -> Result<HttpResponse> {
        let path = req.uri().path().to_string();
        if path != "/objects" && path != "/quota" && !path.starts_with("/objects/") {
            return Ok(text(StatusCode::NOT_FOUND, "not found"));
        }
        let Some(tenant) = header(req.headers(), TENANT_HEADER).map(str::to_string) else {
            return Ok(text(StatusCode::BAD_REQUEST, "missing x-tenant-id header"));
        };
        let ctx = self.context(req.headers());

        match (req.method().clone(), path.as_str()) {
            (Method::GET, "/quota") => Ok(json(StatusCode::OK, &self.service.usage(&tenant)?)),
            (Method::GET, "/objects") => {
                let prefix = query_param(req.uri().query(), "prefix").unwrap_or_default();
                let listed = self.service.list(&ctx, &tenant, &prefix).await?;
                Ok(json(StatusCode::OK, &listed))
            }
            (method, p) => {
                let key = decode_segment(p.trim_start_matches("/objects/"))?;
                match method {
                    Method::GET => self.get_object(&ctx, &tenant, &key).await,
                    Method::PUT => {
                        let value = self.body(req.into_body()).await?;
                        let receipt = self.service.put(&ctx, &tenant, &key, value).await?;
                        Ok(json(StatusCode::OK, &receipt))
                    }
                    Method::DELETE => {
                        if self.service.delete(&ctx, &tenant, &key).await? {
                            Ok(respond(StatusCode::NO_CONTENT, "text/plain", Bytes::new()))
                        } else {
                            Ok(text(StatusCode::NOT_FOUND, "not found"))
                        }
                    }
                    _ => Ok(text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")),
                }
            }
        }
    }

    async fn get_object(&self, ctx: &OpContext, tenant: &str, key: &str) -> Result<HttpResponse> {
        let Some(read) = self.service.get(ctx, tenant, key).await? else {
            return Ok(text(StatusCode::NOT_FOUND, "not found"));
        };
        let mut response = respond(StatusCode::OK, "application/octet-stream", read.value);
        let headers = response.headers_mut();
        headers.insert(VERSION_HEADER, HeaderValue::from(read.version));
        headers.insert(
            CACHE_SOURCE_HEADER,
            HeaderValue::from_static(read.source.as_str()),
        );
        Ok(response)
    }

    async fn replicate(&self, req: Request<Incoming>) -> Result<HttpResponse> {
        let path = req.uri().path().to_string();
        let Some((tenant, key)) = path
            .trim_start_matches("/replicate/")
            .split_once('/')
        else {
            return Ok(text(StatusCode::BAD_REQUEST, "expected /replicate/{tenant}/{key}"));
        };
        let (tenant, key) = (decode_segment(tenant)?, decode_segment(key)?);
        let Some(version) = header(req.headers(), VERSION_HEADER).and_then(|v| v.parse::<u64>().ok())
        else {
            return Ok(text(StatusCode::BAD_REQUEST, "missing x-object-version header"));
        };
        let origin = header(req.headers(), ORIGIN_HEADER)
            .unwrap_or("unknown")
            .to_string();
        let ctx = self.context(req.headers());

        let method = req.method().clone();
        let change = match method {
            Method::PUT => Change::Put {
                value: self.body(req.into_body()).await?,
                version,
            },
            Method::DELETE => Change::Delete { version },
            _ => return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")),
        };

        debug!(%tenant, %key, version, %origin, "Inbound replica");
        match self.service.apply_replica(&ctx, &tenant, &key, change).await? {
            RemoteApply::Applied => Ok(text(StatusCode::OK, "applied")),
            RemoteApply::Stale { current } => {
                let mut response = text(StatusCode::CONFLICT, "stale");
                response
                    .headers_mut()
                    .insert(VERSION_HEADER, HeaderValue::from(current));
                Ok(response)
            }
        }
    }
}

/// Bound listener serving a [`Router`].
pub struct Server {
    listener: TcpListener,
    router: Arc<Router>,
}

impl Server {
    pub async fn bind(addr: &str, router: Router) -> Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", addr, e)))?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: Arc::new(router),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires, then let open
    /// connections finish their in-flight request.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr()?, "HTTP server listening");

        loop {
            let (stream, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let router = self.router.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let router = router.clone();
                    async move { Ok::<_, Infallible>(router.handle(req).await) }
                });
                let builder = auto::Builder::new(TokioExecutor::new());
                let conn = builder.serve_connection(TokioIo::new(stream), service);
                tokio::pin!(conn);
                let result = tokio::select! {
                    res = conn.as_mut() => res,
                    _ = shutdown.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(e) = result {
                    debug!(%remote, error = %e, "Connection closed with error");
                }
            });
        }

        info!("HTTP server stopped accepting connections");
        Ok(())
    }
}
