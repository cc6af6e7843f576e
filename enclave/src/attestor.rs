//! Builds the attestation envelope for a fetched response.
//!
//! The nonce handed to the hardware is deterministic: the hex SHA-256 of
//! the response hash, the API endpoint and the decimal timestamp,
//! concatenated. A verifier recomputes it from the public fields and
//! checks it against the nonce inside the signed COSE document; it binds
//! the signature to one observed response, it is not a freshness nonce.

use crate::nsm::{extract_pcrs, SecurityModule};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use wire::{AttestationDoc, Headers};

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub struct Attestor {
    secmod: Arc<dyn SecurityModule>,
}

impl Attestor {
    pub fn new(secmod: Arc<dyn SecurityModule>) -> Self {
        Self { secmod }
    }

    /// Attest that this enclave observed `raw_body` from `api_endpoint`.
    ///
    /// `url` and `request_headers` are the caller's original request; the
    /// request hash covers the serialised header map in the order the
    /// caller sent it.
    pub async fn attest(
        &self,
        api_endpoint: &str,
        api_method: &str,
        raw_body: &str,
        url: &str,
        request_headers: &Headers,
    ) -> Result<AttestationDoc> {
        let timestamp =
            SystemTime::now().duration_since(UNIX_EPOCH).context("clock before epoch")?.as_secs();
        let attestation_id = format!("enc-{}", uuid::Uuid::new_v4());

        let response_hash = sha256_hex(raw_body.as_bytes());
        let headers_json = serde_json::to_string(request_headers)?;
        let request_hash = sha256_hex(format!("{url}|{api_method}|{headers_json}").as_bytes());
        let nonce = sha256_hex(format!("{response_hash}{api_endpoint}{timestamp}").as_bytes());

        // The NSM wants the nonce bytes; we pass the ASCII hex so the value
        // inside the signed document matches the one in the envelope.
        let secmod = self.secmod.clone();
        let nonce_bytes = nonce.clone().into_bytes();
        let cose = tokio::task::spawn_blocking(move || secmod.attest(nonce_bytes))
            .await
            .context("attestation task")??;

        let pcrs = extract_pcrs(&cose).unwrap_or_default();
        let nsm_document =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &cose);

        Ok(AttestationDoc {
            attestation_id,
            response_hash,
            request_hash,
            api_endpoint: api_endpoint.to_string(),
            api_method: api_method.to_string(),
            timestamp,
            nsm_document,
            pcrs,
            nonce,
        })
    }
}
