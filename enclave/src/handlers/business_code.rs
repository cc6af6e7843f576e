//! Portuguese CAE business-code lookup against the SICAE registry.
//!
//! The registry is a classic ASP.NET postback form: fetch the landing page
//! for the `__VIEWSTATE`/`__EVENTVALIDATION` tokens and session cookie,
//! post the form with the NIF, then scrape the result table.

use crate::attestor::Attestor;
use crate::handler::{allow, HandlerError};
use crate::handlers::encode_form;
use crate::http_client;
use crate::service::{Service, SICAE_HOST};
use field_codec::{Encoding, FieldDef};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use wire::{EnclaveRequest, EnclaveResponse, Headers};

pub const SCHEMA: &[FieldDef] = &[
    FieldDef { name: "nif", encoding: Encoding::ShortString, js_type: Some("string") },
    FieldDef { name: "name", encoding: Encoding::Sha256, js_type: Some("string") },
    FieldDef { name: "cae1Code", encoding: Encoding::ShortString, js_type: Some("string") },
    FieldDef { name: "cae1Desc", encoding: Encoding::Sha256, js_type: Some("string") },
    FieldDef { name: "cae2Code", encoding: Encoding::ShortString, js_type: Some("string") },
    FieldDef { name: "cae2Desc", encoding: Encoding::Sha256, js_type: Some("string") },
];

const FORM_PATH: &str = "/Consulta.aspx";

/// NIF input and submit button names vary across registry deployments;
/// these are the pairs seen in the wild.
const FIELD_CANDIDATES: &[(&str, &str)] = &[
    ("ctl00$ContentPlaceHolder1$txtNif", "ctl00$ContentPlaceHolder1$btnConsultar"),
    ("ctl00$MainContent$txtNif", "ctl00$MainContent$btnConsultar"),
    ("txtNif", "btnConsultar"),
];

#[derive(Debug, Deserialize)]
struct CodeQuery {
    nif: String,
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct CaeRecord {
    pub official_name: String,
    pub cae1_code: String,
    pub cae1_desc: String,
    pub cae2_code: String,
    pub cae2_desc: String,
}

pub async fn handle(
    service: &Service,
    attestor: &Attestor,
    request: &EnclaveRequest,
) -> Result<EnclaveResponse, HandlerError> {
    let query = parse_query(request)?;
    let entry = allow(service, SICAE_HOST)?;

    let landing = http_client::proxy_fetch(entry, "GET", FORM_PATH, &Headers::new(), None).await?;
    if landing.status != 200 {
        return Err(HandlerError::Upstream(format!(
            "landing page returned status {}",
            landing.status
        )));
    }
    let tokens = extract_form_tokens(&landing.body)?;
    let cookie = session_cookie(&landing.headers);

    let mut record = None;
    for (nif_field, submit_field) in ordered_candidates(&landing.body) {
        let form = encode_form(&[
            ("__VIEWSTATE", &tokens.viewstate),
            ("__EVENTVALIDATION", &tokens.eventvalidation),
            (nif_field, &query.nif),
            (submit_field, "Consultar"),
        ]);
        let mut headers = Headers::new();
        headers.insert("Content-Type".into(), json!("application/x-www-form-urlencoded"));
        if let Some(cookie) = &cookie {
            headers.insert("Cookie".into(), json!(cookie));
        }
        let result_page =
            http_client::proxy_fetch(entry, "POST", FORM_PATH, &headers, Some(&form)).await?;
        if result_page.status != 200 {
            tracing::debug!("postback with {} returned status {}", nif_field, result_page.status);
            continue;
        }
        if let Some(found) = parse_result_html(&result_page.body, &query.nif) {
            record = Some(found);
            break;
        }
    }
    let record = record
        .ok_or_else(|| HandlerError::NotFound(format!("no CAE record for NIF {}", query.nif)))?;

    let projected = project(&query.nif, &record);
    let block = field_codec::encode(SCHEMA, &projected)
        .map_err(|e| HandlerError::Internal(e.to_string()))?;
    let raw_body = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, block);

    let attestation = attestor
        .attest(
            &format!("{SICAE_HOST}{FORM_PATH}"),
            "POST",
            &raw_body,
            &request.url,
            &request.headers,
        )
        .await
        .map_err(|e| HandlerError::Attestation(e.to_string()))?;

    let mut headers = Headers::new();
    headers.insert("x-sicae-nif".into(), json!(query.nif));
    headers.insert("x-sicae-name".into(), json!(record.official_name));
    headers.insert("x-sicae-cae1-code".into(), json!(record.cae1_code));
    headers.insert("x-sicae-cae1-desc".into(), json!(record.cae1_desc));
    headers.insert("x-sicae-cae2-code".into(), json!(record.cae2_code));
    headers.insert("x-sicae-cae2-desc".into(), json!(record.cae2_desc));

    Ok(EnclaveResponse {
        success: true,
        status: 200,
        headers,
        raw_body,
        error: None,
        attestation: Some(attestation),
    })
}

lazy_static! {
    static ref NIF_RE: Regex = Regex::new(r"^\d{9}$").unwrap();
    static ref TAG_RE: Regex = Regex::new(r"<[^>]+>").unwrap();
    static ref CELL_RE: Regex = Regex::new(r"(?s)<td[^>]*>(.*?)</td>").unwrap();
    static ref CODE_RE: Regex = Regex::new(r"\b(\d{5})\b").unwrap();
}

fn parse_query(request: &EnclaveRequest) -> Result<CodeQuery, HandlerError> {
    let body = request
        .body
        .as_deref()
        .ok_or_else(|| HandlerError::BadRequest("missing request body".into()))?;
    let query: CodeQuery = serde_json::from_str(body)
        .map_err(|e| HandlerError::BadRequest(format!("invalid request body: {e}")))?;
    if !NIF_RE.is_match(&query.nif) {
        return Err(HandlerError::BadRequest("nif must be exactly 9 digits".into()));
    }
    Ok(query)
}

#[derive(Debug)]
pub(crate) struct FormTokens {
    pub viewstate: String,
    pub eventvalidation: String,
}

pub(crate) fn extract_form_tokens(html: &str) -> Result<FormTokens, HandlerError> {
    let token = |name: &'static str| {
        extract_input_value(html, name)
            .ok_or_else(|| HandlerError::Upstream(format!("landing page missing {name} token")))
    };
    Ok(FormTokens { viewstate: token("__VIEWSTATE")?, eventvalidation: token("__EVENTVALIDATION")? })
}

/// ASP.NET renders hidden inputs with `name` before `value` or the other
/// way round depending on the control; accept both.
fn extract_input_value(html: &str, name: &str) -> Option<String> {
    let escaped = regex::escape(name);
    let name_first =
        Regex::new(&format!(r#"<input[^>]*name="{escaped}"[^>]*value="([^"]*)""#)).ok()?;
    if let Some(captures) = name_first.captures(html) {
        return Some(captures[1].to_string());
    }
    let value_first =
        Regex::new(&format!(r#"<input[^>]*value="([^"]*)"[^>]*name="{escaped}""#)).ok()?;
    value_first.captures(html).map(|captures| captures[1].to_string())
}

/// First cookie of the session, `NAME=VALUE` without attributes.
pub(crate) fn session_cookie(headers: &Headers) -> Option<String> {
    headers
        .get("set-cookie")
        .and_then(|v| v.as_str())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_string())
}

/// Candidates whose NIF field name appears in the landing page go first.
fn ordered_candidates(html: &str) -> Vec<(&'static str, &'static str)> {
    let (mut present, absent): (Vec<_>, Vec<_>) =
        FIELD_CANDIDATES.iter().copied().partition(|(nif_field, _)| html.contains(nif_field));
    present.extend(absent);
    present
}

pub(crate) fn parse_result_html(html: &str, nif: &str) -> Option<CaeRecord> {
    parse_result_table(html, nif).or_else(|| parse_result_fallback(html))
}

fn cell_texts(html: &str) -> Vec<String> {
    CELL_RE
        .captures_iter(html)
        .map(|c| TAG_RE.replace_all(&c[1], "").trim().to_string())
        .collect()
}

/// Structured pass: a result row reads
/// NIF | name | primary code | primary description | secondary code | secondary description.
fn parse_result_table(html: &str, nif: &str) -> Option<CaeRecord> {
    let cells = cell_texts(html);
    let at = cells.iter().position(|cell| cell == nif)?;
    let cell = |offset: usize| cells.get(at + offset).cloned().unwrap_or_default();
    let code = |text: &str| {
        CODE_RE.captures(text).map(|c| c[1].to_string()).unwrap_or_default()
    };
    let record = CaeRecord {
        official_name: cell(1),
        cae1_code: code(&cell(2)),
        cae1_desc: cell(3),
        cae2_code: code(&cell(4)),
        cae2_desc: cell(5),
    };
    if record.cae1_code.is_empty() {
        return None;
    }
    Some(record)
}

/// Fallback pass: any five-digit codes in the page text, in order. A
/// nine-digit NIF never matches, every five-digit window inside it is
/// flanked by more digits.
fn parse_result_fallback(html: &str) -> Option<CaeRecord> {
    let text = TAG_RE.replace_all(html, " ");
    let mut codes: Vec<String> = Vec::new();
    for captures in CODE_RE.captures_iter(&text) {
        let code = captures[1].to_string();
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    let mut codes = codes.into_iter();
    Some(CaeRecord {
        cae1_code: codes.next()?,
        cae2_code: codes.next().unwrap_or_default(),
        ..CaeRecord::default()
    })
}

fn project(nif: &str, record: &CaeRecord) -> serde_json::Map<String, Value> {
    let mut projected = serde_json::Map::new();
    projected.insert("nif".into(), json!(nif));
    projected.insert("name".into(), json!(record.official_name));
    projected.insert("cae1Code".into(), json!(record.cae1_code));
    projected.insert("cae1Desc".into(), json!(record.cae1_desc));
    projected.insert("cae2Code".into(), json!(record.cae2_code));
    projected.insert("cae2Desc".into(), json!(record.cae2_desc));
    projected
}
