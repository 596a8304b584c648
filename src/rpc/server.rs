//! Executor HTTP server
//!
//! Routes:
//! - `POST /v1/exec`: submit a RunRequest (optional `Idempotency-Key` header)
//! - `GET /v1/runs/{run_id}`: current view of a run
//! - `GET /healthz`: liveness

use anyhow::Result;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::errors::ApiError;
use crate::module::manager::ExecutionManager;
use crate::module::traits::RunRequest;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Header overriding the body's idempotency key
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

const RUNS_PREFIX: &str = "/v1/runs/";

pub struct ExecServer {
    addr: SocketAddr,
    manager: Arc<ExecutionManager>,
}

impl ExecServer {
    pub fn new(addr: SocketAddr, manager: Arc<ExecutionManager>) -> Self {
        Self { addr, manager }
    }

    /// Bind and serve until `shutdown` flips to `true`
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        Self::serve(listener, Arc::clone(&self.manager), shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        listener: TcpListener,
        manager: Arc<ExecutionManager>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Executor API listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New API connection from {}", addr);
                        tokio::spawn(Self::handle_connection(stream, addr, Arc::clone(&manager)));
                    }
                    Err(e) => {
                        error!("Failed to accept API connection: {}", e);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Executor API shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(stream: TcpStream, addr: SocketAddr, manager: Arc<ExecutionManager>) {
        let service = service_fn(move |req: Request<Incoming>| {
            let manager = Arc::clone(&manager);
            async move { Ok::<_, Infallible>(Self::handle_request(&manager, req).await) }
        });
        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            debug!("API connection {} closed: {}", addr, e);
        }
    }

    async fn handle_request(manager: &ExecutionManager, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let err = if e.downcast_ref::<LengthLimitError>().is_some() {
                    ApiError::payload_too_large(MAX_BODY_BYTES)
                } else {
                    ApiError::invalid_request(format!("Failed to read body: {}", e))
                };
                return json_response(err.status(), &err.to_json());
            }
        };

        let (status, value) =
            Self::process_request(manager, &parts.method, parts.uri.path(), &parts.headers, &body).await;
        json_response(status, &value)
    }

    /// Route one request; returns the status and JSON body
    pub async fn process_request(
        manager: &ExecutionManager,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> (StatusCode, Value) {
        match Self::route(manager, method, path, headers, body).await {
            Ok(ok) => ok,
            Err(err) => {
                warn!("{} {} failed: {}", method, path, err);
                (err.status(), err.to_json())
            }
        }
    }

    async fn route(
        manager: &ExecutionManager,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(StatusCode, Value), ApiError> {
        if path == "/healthz" {
            return match *method {
                Method::GET => Ok((StatusCode::OK, json!({ "ok": true }))),
                _ => Err(ApiError::method_not_allowed(method.as_str())),
            };
        }

        if path == "/v1/exec" {
            if *method != Method::POST {
                return Err(ApiError::method_not_allowed(method.as_str()));
            }
            let request = parse_run_request(headers, body)?;
            let outcome = manager.submit(request).await?;
            let value = serde_json::to_value(&outcome)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            return Ok((StatusCode::ACCEPTED, value));
        }

        if let Some(run_id) = path.strip_prefix(RUNS_PREFIX) {
            if *method != Method::GET {
                return Err(ApiError::method_not_allowed(method.as_str()));
            }
            if run_id.is_empty() || run_id.contains('/') {
                return Err(ApiError::not_found(format!("No route for {}", path)));
            }
            let view = manager
                .get(run_id)
                .await
                .ok_or_else(|| ApiError::not_found(format!("Run {} not found", run_id)))?;
            let value = serde_json::to_value(&view)
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            return Ok((StatusCode::OK, value));
        }

        Err(ApiError::not_found(format!("No route for {}", path)))
    }
}

/// Decode a RunRequest body; the `Idempotency-Key` header wins over the body
pub fn parse_run_request(headers: &HeaderMap, body: &[u8]) -> Result<RunRequest, ApiError> {
    let mut request: RunRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::invalid_request(format!("Invalid run request: {}", e)))?;

    if let Some(key) = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        request.idempotency_key = Some(key.to_string());
    }

    request
        .entry()
        .check_args(&request.args)
        .map_err(ApiError::invalid_request)?;
    if request.principal.trim().is_empty() {
        return Err(ApiError::invalid_request("principal must not be empty"));
    }
    Ok(request)
}

fn json_response(status: StatusCode, value: &Value) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}
