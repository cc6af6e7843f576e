//! Host-side router for the confidential-fetch fleet.
//!
//! Maps an inbound fetch request to an enclave by URL hostname, forwards
//! one framed request over vsock, and returns the enclave's reply
//! verbatim. Also reports fleet health and serves diagnostics. The router
//! is untrusted by design: everything of value in a reply is inside the
//! attestation the enclave produced.

use anyhow::{bail, Context, Result};
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use wire::EnclaveRequest;

mod enclave_client;
mod health;
mod metrics;
mod routes;

/// Inbound `/attest/fetch` bodies are small; anything bigger is abuse.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const DEFAULT_PORT: u16 = 5001;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // Trace = 0, Debug = 1, Info = 2, Warn = 3, Error = 4.
    #[arg(long, default_value_t = 2)]
    trace_level: usize,
}

fn main() {
    let args = Args::parse();
    let trace_level = match args.trace_level {
        0 => tracing::Level::TRACE,
        1 => tracing::Level::DEBUG,
        2 => tracing::Level::INFO,
        3 => tracing::Level::WARN,
        4 => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_max_level(trace_level)
        .init();

    if let Err(e) = router_main() {
        tracing::error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

struct Router {
    table: routes::RouteTable,
    metrics: metrics::Metrics,
}

#[tokio::main]
async fn router_main() -> Result<()> {
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let router =
        Arc::new(Router { table: routes::RouteTable::from_env(), metrics: metrics::Metrics::new() });
    for route in &router.table.routes {
        tracing::info!("route {} -> CID {} port {}", route.service, route.cid, route.port);
    }

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .context("failed to bind HTTP listener")?;
    tracing::info!("router listening on port {}", port);

    loop {
        let (stream, addr) = listener.accept().await?;
        let router = router.clone();
        tokio::spawn(async move {
            let io = hyper_util::rt::TokioIo::new(stream);
            let service_fn = hyper::service::service_fn(move |request| {
                let router = router.clone();
                async move { Ok::<_, hyper::Error>(router.serve(request).await) }
            });
            if let Err(e) =
                hyper::server::conn::http1::Builder::new().serve_connection(io, service_fn).await
            {
                tracing::debug!("connection from {} ended: {}", addr, e);
            }
        });
    }
}

impl Router {
    async fn serve(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        let time_start = Instant::now();
        let path = request.uri().path().to_string();
        let response = self.dispatch(request).await.unwrap_or_else(|e| {
            tracing::error!("request processing error: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        });
        let elapsed = time_start.elapsed().as_secs_f64();
        let metric_path = match path.as_str() {
            "/attest/fetch" | "/health" | "/routes" | "/metrics" => path.as_str(),
            _ => "other",
        };
        self.metrics
            .request_duration_seconds
            .with_label_values(&[metric_path, response.status().as_str()])
            .observe(elapsed);
        response
    }

    async fn dispatch(&self, request: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        match (request.method(), request.uri().path()) {
            (&Method::POST, "/attest/fetch") => self.attest_fetch(request).await,
            (&Method::GET, "/health") => self.health().await,
            (&Method::GET, "/routes") => self.routes(),
            (&Method::GET, "/metrics") => self.metrics_page(),
            _ => Ok(error_response(StatusCode::NOT_FOUND, "not found".to_string())),
        }
    }

    async fn attest_fetch(&self, request: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let body = match get_body(request.into_body(), MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, e.to_string())),
        };
        let forward = match parse_fetch_request(&body) {
            Ok(forward) => forward,
            Err(message) => return Ok(error_response(StatusCode::BAD_REQUEST, message)),
        };
        let hostname = match forward.url.parse::<hyper::Uri>().ok().and_then(|uri| {
            uri.host().map(str::to_string)
        }) {
            Some(hostname) => hostname,
            None => {
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid url: {}", forward.url),
                ))
            }
        };
        let Some(route) = self.table.lookup(&hostname) else {
            return Ok(error_response(
                StatusCode::NOT_FOUND,
                format!("no enclave route for host: {hostname}"),
            ));
        };

        tracing::info!(
            "request {}: forwarding {} {} to {} (CID {})",
            forward.id,
            forward.method,
            hostname,
            route.service,
            route.cid
        );
        match enclave_client::call(route.cid, route.port, &forward).await {
            Ok(reply) => Ok(Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(full(reply))
                .unwrap()),
            Err(e) => {
                tracing::error!("request {}: enclave transport failure: {}", forward.id, e);
                Ok(error_response(StatusCode::BAD_GATEWAY, e.to_string()))
            }
        }
    }

    async fn health(&self) -> Result<Response<Full<Bytes>>> {
        let report = health::check(&self.table).await;
        let status =
            if report.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
        Ok(Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(full(serde_json::to_vec(&report)?))
            .unwrap())
    }

    fn routes(&self) -> Result<Response<Full<Bytes>>> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(full(serde_json::to_vec(&self.table)?))
            .unwrap())
    }

    fn metrics_page(&self) -> Result<Response<Full<Bytes>>> {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(full(self.metrics.encode_text()?))
            .unwrap())
    }
}

/// Read at most `max_bytes` from the body; error if more arrive.
async fn get_body(mut body: Incoming, max_bytes: usize) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    let mut pos = 0;
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Some(data) = frame.data_ref() {
            if pos + data.len() > max_bytes {
                bail!("request body exceeds {} bytes", max_bytes);
            }
            result.extend_from_slice(data);
            pos += data.len();
        }
    }
    Ok(result)
}

/// Validate the caller's JSON and shape it into an enclave request. A
/// missing `id` gets a fresh one so enclave logs stay correlatable.
fn parse_fetch_request(body: &[u8]) -> Result<EnclaveRequest, String> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {e}"))?;
    for field in ["url", "method"] {
        if value.get(field).and_then(|v| v.as_str()).filter(|v| !v.is_empty()).is_none() {
            return Err(format!("missing field: {field}"));
        }
    }
    let mut request: EnclaveRequest =
        serde_json::from_value(value).map_err(|e| format!("invalid request: {e}"))?;
    if request.id.is_empty() {
        request.id = format!("req-{}", uuid::Uuid::new_v4());
    }
    Ok(request)
}

fn full<T: Into<Bytes>>(chunk: T) -> Full<Bytes> {
    Full::new(chunk.into())
}

/// Failure envelope in the same shape the enclaves use, so callers parse
/// one format regardless of where the failure happened.
fn error_response(status: StatusCode, message: String) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "success": false,
        "status": status.as_u16(),
        "error": message,
    });
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full(body.to_string()))
        .unwrap()
}
