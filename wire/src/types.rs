//! JSON payloads exchanged over the framed vsock connection.
//!
//! Header maps ride as `serde_json::Map`, which preserves insertion order
//! (the workspace builds `serde_json` with `preserve_order`). The request
//! hash covers the serialised header map, so the order a caller sent is the
//! order a verifier must reproduce.

use serde::{Deserialize, Serialize};

/// Every enclave serves its framed protocol on this vsock port.
pub const ENCLAVE_PORT: u32 = 5000;

/// Ordered header-name to value mapping.
pub type Headers = serde_json::Map<String, serde_json::Value>;

/// One fetch request, produced by the caller and forwarded verbatim by the
/// host router. `id` is caller-chosen and only used for log correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveRequest {
    #[serde(default)]
    pub id: String,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Reply frame. A failure reply never carries an attestation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveResponse {
    pub success: bool,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub raw_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<AttestationDoc>,
}

impl EnclaveResponse {
    pub fn failure(status: u16, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            headers: Headers::new(),
            raw_body: String::new(),
            error: Some(error.into()),
            attestation: None,
        }
    }
}

/// PCR values lifted out of the COSE payload, lowercase hex. Empty strings
/// when extraction failed; the COSE document itself stays authoritative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PcrValues {
    pub pcr0: String,
    pub pcr1: String,
    pub pcr2: String,
}

/// The attestation envelope returned alongside a successful fetch.
///
/// `nsm_document` is the base64 COSE_Sign1 blob signed by the hardware;
/// everything else is derivable convenience data a verifier re-checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationDoc {
    pub attestation_id: String,
    pub response_hash: String,
    pub request_hash: String,
    pub api_endpoint: String,
    pub api_method: String,
    pub timestamp: u64,
    pub nsm_document: String,
    pub pcrs: PcrValues,
    pub nonce: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: EnclaveRequest =
            serde_json::from_str(r#"{"url":"https://ec.europa.eu/a","method":"GET"}"#).unwrap();
        assert_eq!(request.id, "");
        assert!(request.headers.is_empty());
        assert!(request.body.is_none());
    }

    #[test]
    fn test_header_order_preserved() {
        let request: EnclaveRequest = serde_json::from_str(
            r#"{"url":"https://x/","method":"GET","headers":{"b":"2","a":"1","c":"3"}}"#,
        )
        .unwrap();
        let keys: Vec<&str> = request.headers.keys().map(String::as_str).collect();
        assert_eq!(keys, ["b", "a", "c"]);
        // Serialising back emits keys in the same order with no whitespace.
        assert_eq!(serde_json::to_string(&request.headers).unwrap(), r#"{"b":"2","a":"1","c":"3"}"#);
    }

    #[test]
    fn test_failure_envelope_has_no_attestation() {
        let reply = EnclaveResponse::failure(403, "Host not allowed: api.stripe.com");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["status"], 403);
        assert!(json.get("attestation").is_none());
        assert_eq!(json["error"], "Host not allowed: api.stripe.com");
    }
}
