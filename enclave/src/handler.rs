//! Request handling: the allowlist gate, dispatch to the service handler,
//! and the generic fetch-and-attest path.

use crate::attestor::Attestor;
use crate::http_client::{self, FetchError};
use crate::service::{AllowlistEntry, HandlerKind, Service};
use thiserror::Error;
use wire::{EnclaveRequest, EnclaveResponse};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Host not allowed: {0}")]
    HostNotAllowed(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Upstream(String),
    #[error("attestation failed: {0}")]
    Attestation(String),
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn status(&self) -> u16 {
        match self {
            HandlerError::BadRequest(_) => 400,
            HandlerError::HostNotAllowed(_) => 403,
            HandlerError::NotFound(_) => 404,
            HandlerError::Upstream(_) => 502,
            HandlerError::Attestation(_) | HandlerError::Internal(_) => 500,
        }
    }
}

impl From<FetchError> for HandlerError {
    fn from(e: FetchError) -> Self {
        HandlerError::Upstream(e.to_string())
    }
}

/// The parsed pieces of a request URL the handlers care about.
pub(crate) struct RequestUrl {
    pub hostname: String,
    pub pathname: String,
    pub query: Option<String>,
}

impl RequestUrl {
    /// Path plus query string, as sent on the wire.
    pub fn path(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.pathname, query),
            None => self.pathname.clone(),
        }
    }
}

pub(crate) fn parse_url(url: &str) -> Result<RequestUrl, HandlerError> {
    let uri: hyper::Uri =
        url.parse().map_err(|_| HandlerError::BadRequest(format!("invalid url: {url}")))?;
    let hostname = uri
        .host()
        .ok_or_else(|| HandlerError::BadRequest(format!("url has no host: {url}")))?
        .to_string();
    Ok(RequestUrl {
        hostname,
        pathname: uri.path().to_string(),
        query: uri.query().map(str::to_string),
    })
}

pub(crate) fn allow<'a>(
    service: &'a Service,
    hostname: &str,
) -> Result<&'a AllowlistEntry, HandlerError> {
    service
        .allowlist_entry(hostname)
        .ok_or_else(|| HandlerError::HostNotAllowed(hostname.to_string()))
}

/// Serve one request end-to-end, turning every error into the failure
/// envelope for its status. Failure envelopes never carry an attestation.
pub async fn handle(
    service: &Service,
    attestor: &Attestor,
    request: &EnclaveRequest,
) -> EnclaveResponse {
    match dispatch(service, attestor, request).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!("request {} failed: {}", request.id, e);
            EnclaveResponse::failure(e.status(), e.to_string())
        }
    }
}

async fn dispatch(
    service: &Service,
    attestor: &Attestor,
    request: &EnclaveRequest,
) -> Result<EnclaveResponse, HandlerError> {
    // Every request passes the gate on its own URL, custom handlers included.
    let url = parse_url(&request.url)?;
    let entry = allow(service, &url.hostname)?;

    match service.handler {
        HandlerKind::Generic => generic_fetch(attestor, request, &url, entry).await,
        HandlerKind::VatCheck => crate::handlers::vat::handle(service, attestor, request).await,
        HandlerKind::BusinessCode => {
            crate::handlers::business_code::handle(service, attestor, request).await
        }
        HandlerKind::Payments => {
            crate::handlers::payments::handle(service, attestor, request).await
        }
    }
}

/// The generic path: fetch the request URL as-is and attest whatever came
/// back, whatever its status code. Only transport-level failures error out.
async fn generic_fetch(
    attestor: &Attestor,
    request: &EnclaveRequest,
    url: &RequestUrl,
    entry: &AllowlistEntry,
) -> Result<EnclaveResponse, HandlerError> {
    let upstream = http_client::proxy_fetch(
        entry,
        &request.method,
        &url.path(),
        &request.headers,
        request.body.as_deref(),
    )
    .await?;

    // The attested endpoint is hostname plus pathname; query strings often
    // carry volatile material (keys, cursors) and stay out of the binding.
    let api_endpoint = format!("{}{}", url.hostname, url.pathname);
    let attestation = attestor
        .attest(&api_endpoint, &request.method, &upstream.body, &request.url, &request.headers)
        .await
        .map_err(|e| HandlerError::Attestation(e.to_string()))?;

    Ok(EnclaveResponse {
        success: true,
        status: upstream.status,
        headers: upstream.headers,
        raw_body: upstream.body,
        error: None,
        attestation: Some(attestation),
    })
}
