//! Per-service handlers. Each one parses its own request body, drives the
//! HTTP client against hosts in its allowlist, projects the parsed result
//! into its field schema, and attests the encoded block. The friendly
//! `x-<service>-*` response headers are a caller convenience and are not
//! attested; the attested truth is always `raw_body`.

pub mod business_code;
pub mod payments;
pub mod vat;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Everything outside the unreserved set gets escaped, both in path
/// segments and form fields.
const STRICT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

pub(crate) fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, STRICT).to_string()
}

/// `application/x-www-form-urlencoded` body (spaces as `%20`).
pub(crate) fn encode_form(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(name, value)| format!("{}={}", percent_encode(name), percent_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}
