//! Stripe listing/lookup operations. The enclave never interprets the
//! payment data beyond shape checks; what gets attested is a digest of the
//! exact response body plus the listing envelope (count, has_more).

use crate::attestor::{sha256_hex, Attestor};
use crate::handler::{allow, HandlerError};
use crate::handlers::{encode_form, percent_encode};
use crate::http_client;
use crate::service::{Service, STRIPE_HOST};
use field_codec::{Encoding, FieldDef};
use serde::Deserialize;
use serde_json::{json, Value};
use wire::{EnclaveRequest, EnclaveResponse, Headers};

pub const SCHEMA: &[FieldDef] = &[
    FieldDef { name: "operation", encoding: Encoding::ShortString, js_type: Some("string") },
    FieldDef { name: "accountId", encoding: Encoding::ShortString, js_type: Some("string") },
    FieldDef { name: "objectType", encoding: Encoding::ShortString, js_type: Some("string") },
    FieldDef { name: "dataHash", encoding: Encoding::Sha256, js_type: Some("string") },
    FieldDef { name: "totalCount", encoding: Encoding::Uint, js_type: Some("number") },
    FieldDef { name: "hasMore", encoding: Encoding::Uint, js_type: Some("boolean") },
];

/// Pinned so response shapes cannot drift under the attestation.
const STRIPE_VERSION: &str = "2023-10-16";

#[derive(Debug)]
struct Operation {
    name: &'static str,
    path: &'static str,
    needs_resource: bool,
    expected_object: &'static str,
}

/// The closed set of supported operations.
const OPERATIONS: &[Operation] = &[
    Operation {
        name: "list_charges",
        path: "/v1/charges",
        needs_resource: false,
        expected_object: "list",
    },
    Operation {
        name: "get_charge",
        path: "/v1/charges/{id}",
        needs_resource: true,
        expected_object: "charge",
    },
    Operation {
        name: "list_payment_intents",
        path: "/v1/payment_intents",
        needs_resource: false,
        expected_object: "list",
    },
    Operation {
        name: "get_payment_intent",
        path: "/v1/payment_intents/{id}",
        needs_resource: true,
        expected_object: "payment_intent",
    },
    Operation {
        name: "list_payouts",
        path: "/v1/payouts",
        needs_resource: false,
        expected_object: "list",
    },
    Operation {
        name: "get_balance",
        path: "/v1/balance",
        needs_resource: false,
        expected_object: "balance",
    },
];

#[derive(Debug, Deserialize)]
struct PaymentsQuery {
    operation: String,
    #[serde(rename = "apiKey")]
    api_key: String,
    #[serde(rename = "stripeAccount", default)]
    stripe_account: Option<String>,
    #[serde(rename = "queryParams", default)]
    query_params: Option<serde_json::Map<String, Value>>,
    #[serde(rename = "resourceId", default)]
    resource_id: Option<String>,
}

pub async fn handle(
    service: &Service,
    attestor: &Attestor,
    request: &EnclaveRequest,
) -> Result<EnclaveResponse, HandlerError> {
    let query = parse_query(request)?;
    let operation = lookup_operation(&query.operation)?;
    let entry = allow(service, STRIPE_HOST)?;

    let path = build_path(operation, &query)?;
    let mut headers = Headers::new();
    // The key never appears in logs or in the attested record.
    headers.insert("Authorization".into(), json!(format!("Bearer {}", query.api_key)));
    headers.insert("Stripe-Version".into(), json!(STRIPE_VERSION));
    if let Some(account) = &query.stripe_account {
        headers.insert("Stripe-Account".into(), json!(account));
    }
    let upstream = http_client::proxy_fetch(entry, "GET", &path, &headers, None).await?;
    if upstream.status != 200 {
        return Err(HandlerError::Upstream(format!(
            "Stripe returned status {}",
            upstream.status
        )));
    }
    let parsed: Value = serde_json::from_str(&upstream.body)
        .map_err(|e| HandlerError::Upstream(format!("invalid Stripe response: {e}")))?;
    let object_type = parsed["object"].as_str().unwrap_or_default().to_string();
    if object_type != operation.expected_object {
        return Err(HandlerError::Upstream(format!(
            "unexpected object type {:?}, expected {:?}",
            object_type, operation.expected_object
        )));
    }

    let record = project(operation, &query, &object_type, &upstream.body, &parsed);
    let block = field_codec::encode(SCHEMA, &record)
        .map_err(|e| HandlerError::Internal(e.to_string()))?;
    let raw_body = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, block);

    // The attested endpoint stays free of query parameters (cursors, limits).
    let endpoint_path = operation.path.replace(
        "{id}",
        &query.resource_id.as_deref().map(percent_encode).unwrap_or_default(),
    );
    let attestation = attestor
        .attest(
            &format!("{STRIPE_HOST}{endpoint_path}"),
            "GET",
            &raw_body,
            &request.url,
            &request.headers,
        )
        .await
        .map_err(|e| HandlerError::Attestation(e.to_string()))?;

    let mut reply_headers = Headers::new();
    reply_headers.insert("x-stripe-operation".into(), json!(operation.name));
    reply_headers
        .insert("x-stripe-account-id".into(), record["accountId"].clone());
    reply_headers.insert("x-stripe-object-type".into(), json!(object_type));
    reply_headers.insert("x-stripe-data-hash".into(), record["dataHash"].clone());
    reply_headers.insert("x-stripe-total-count".into(), record["totalCount"].clone());
    reply_headers.insert("x-stripe-has-more".into(), record["hasMore"].clone());

    Ok(EnclaveResponse {
        success: true,
        status: 200,
        headers: reply_headers,
        raw_body,
        error: None,
        attestation: Some(attestation),
    })
}

fn parse_query(request: &EnclaveRequest) -> Result<PaymentsQuery, HandlerError> {
    let body = request
        .body
        .as_deref()
        .ok_or_else(|| HandlerError::BadRequest("missing request body".into()))?;
    let query: PaymentsQuery = serde_json::from_str(body)
        .map_err(|e| HandlerError::BadRequest(format!("invalid request body: {e}")))?;
    if query.api_key.is_empty() {
        return Err(HandlerError::BadRequest("apiKey must not be empty".into()));
    }
    Ok(query)
}

fn lookup_operation(name: &str) -> Result<&'static Operation, HandlerError> {
    OPERATIONS
        .iter()
        .find(|op| op.name == name)
        .ok_or_else(|| HandlerError::BadRequest(format!("unknown operation: {name}")))
}

fn build_path(operation: &Operation, query: &PaymentsQuery) -> Result<String, HandlerError> {
    let mut path = operation.path.to_string();
    if operation.needs_resource {
        let resource_id = query
            .resource_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                HandlerError::BadRequest(format!("{} requires resourceId", operation.name))
            })?;
        path = path.replace("{id}", &percent_encode(resource_id));
    }
    if let Some(params) = query.query_params.as_ref().filter(|p| !p.is_empty()) {
        let pairs: Vec<(&str, String)> = params
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.as_str(), value)
            })
            .collect();
        let borrowed: Vec<(&str, &str)> =
            pairs.iter().map(|(name, value)| (*name, value.as_str())).collect();
        path.push('?');
        path.push_str(&encode_form(&borrowed));
    }
    Ok(path)
}

fn project(
    operation: &Operation,
    query: &PaymentsQuery,
    object_type: &str,
    body: &str,
    parsed: &Value,
) -> serde_json::Map<String, Value> {
    let total_count = parsed["data"].as_array().map(|data| data.len() as u64).unwrap_or(0);
    let has_more = u64::from(parsed["has_more"].as_bool().unwrap_or(false));
    let mut record = serde_json::Map::new();
    record.insert("operation".into(), json!(operation.name));
    record.insert(
        "accountId".into(),
        json!(query.stripe_account.clone().unwrap_or_default()),
    );
    record.insert("objectType".into(), json!(object_type));
    record.insert("dataHash".into(), json!(sha256_hex(body.as_bytes())));
    record.insert("totalCount".into(), json!(total_count));
    record.insert("hasMore".into(), json!(has_more));
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use field_codec::verify_sha256;

    fn q(body: &str) -> PaymentsQuery {
        serde_json::from_str(body).unwrap()
    }

    const LIST_BODY: &str = r#"{"object":"list","url":"/v1/charges","has_more":true,"data":[{"id":"ch_1"},{"id":"ch_2"},{"id":"ch_3"}]}"#;

    #[test]
    fn test_lookup_operation() {
        assert!(lookup_operation("list_charges").is_ok());
        let err = lookup_operation("delete_everything").unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_build_path_with_params_and_resource() {
        let query = q(r#"{"operation":"get_charge","apiKey":"sk_test_x","resourceId":"ch_1A b"}"#);
        let operation = lookup_operation("get_charge").unwrap();
        assert_eq!(build_path(operation, &query).unwrap(), "/v1/charges/ch_1A%20b");

        let query = q(
            r#"{"operation":"list_charges","apiKey":"sk_test_x","queryParams":{"limit":"5","customer":"cus_9"}}"#,
        );
        let operation = lookup_operation("list_charges").unwrap();
        assert_eq!(build_path(operation, &query).unwrap(), "/v1/charges?limit=5&customer=cus_9");
    }

    #[test]
    fn test_missing_resource_id_is_bad_request() {
        let query = q(r#"{"operation":"get_charge","apiKey":"sk_test_x"}"#);
        let operation = lookup_operation("get_charge").unwrap();
        let err = build_path(operation, &query).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_projection_block() {
        let query = q(r#"{"operation":"list_charges","apiKey":"sk_test_x","stripeAccount":"acct_123"}"#);
        let operation = lookup_operation("list_charges").unwrap();
        let parsed: Value = serde_json::from_str(LIST_BODY).unwrap();
        let record = project(operation, &query, "list", LIST_BODY, &parsed);
        let block = field_codec::encode(SCHEMA, &record).unwrap();
        assert_eq!(block.len(), 192);
        // operation, accountId and objectType are short strings.
        assert_eq!(&block[32 - 12..32], b"list_charges");
        assert_eq!(&block[64 - 8..64], b"acct_123");
        assert_eq!(&block[96 - 4..96], b"list");
        // dataHash is the hex digest of the exact body, hashed again mod p.
        assert!(verify_sha256(&sha256_hex(LIST_BODY.as_bytes()), &block[96..128]));
        // totalCount 3, hasMore 1.
        assert_eq!(block[159], 3);
        assert_eq!(block[191], 1);
        assert_eq!(&block[128..159], &[0u8; 31][..]);
    }

    #[test]
    fn test_non_list_projection_counts_zero() {
        let body = r#"{"object":"balance","available":[{"amount":100}]}"#;
        let parsed: Value = serde_json::from_str(body).unwrap();
        let query = q(r#"{"operation":"get_balance","apiKey":"sk_test_x"}"#);
        let operation = lookup_operation("get_balance").unwrap();
        let record = project(operation, &query, "balance", body, &parsed);
        assert_eq!(record["totalCount"], json!(0));
        assert_eq!(record["hasMore"], json!(0));
        assert_eq!(record["accountId"], json!(""));
    }
}
