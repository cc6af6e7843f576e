//! Deterministic encoding of typed records into fixed-layout byte strings.
//!
//! A schema is an ordered list of fields; each field occupies exactly one
//! 32-byte slot holding the big-endian representation of a value strictly
//! below the BN254 scalar-field modulus. Downstream consumers interpret the
//! slots as field elements, so canonicity is not optional.
//!
//! A `null`, missing, or empty-string input encodes as an all-zero slot.
//! `uint` zero therefore collides with "absent"; callers that need a real
//! boolean use 1/0 and accept that 0 and absent are indistinguishable.

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use num_bigint::BigUint;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Bytes per field slot.
pub const SLOT_LEN: usize = 32;

/// Longest string admissible under `ShortString`: 31 bytes keeps the
/// big-endian integer below 2^248, comfortably inside the field.
pub const MAX_SHORT_STRING: usize = SLOT_LEN - 1;

lazy_static::lazy_static! {
    /// The BN254 scalar-field modulus as a big integer, for range checks.
    static ref MODULUS: BigUint = BigUint::from_bytes_be(&Fr::MODULUS.to_bytes_be());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// UTF-8 bytes interpreted as a big-endian integer, left-padded.
    ShortString,
    /// SHA-256 of the UTF-8 input, reduced modulo the field.
    Sha256,
    /// A non-negative integer below the modulus.
    Uint,
}

/// One field of a schema. `js_type` is a decoding hint for consumers and
/// does not affect the encoded bytes.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub encoding: Encoding,
    pub js_type: Option<&'static str>,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("field {field}: string of {len} bytes exceeds {MAX_SHORT_STRING}")]
    StringTooLong { field: String, len: usize },
    #[error("field {field}: uint {value} is out of range")]
    UIntOutOfRange { field: String, value: String },
    #[error("field {field}: expected {expected}")]
    InvalidValue { field: String, expected: &'static str },
    #[error("block is {actual} bytes, schema requires {expected}")]
    WrongLength { expected: usize, actual: usize },
    #[error("field {field}: slot is not a canonical field element")]
    NonCanonicalSlot { field: String },
}

/// Encoded size of a record under `schema`.
pub fn byte_length(schema: &[FieldDef]) -> usize {
    SLOT_LEN * schema.len()
}

/// Encode `record` under `schema`, concatenating per-field slots in schema
/// order. Fields absent from the record encode as zero slots.
pub fn encode(schema: &[FieldDef], record: &Map<String, Value>) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(byte_length(schema));
    for field in schema {
        out.extend_from_slice(&encode_field(field, record.get(field.name))?);
    }
    Ok(out)
}

fn encode_field(field: &FieldDef, value: Option<&Value>) -> Result<[u8; SLOT_LEN], CodecError> {
    let value = match value {
        None | Some(Value::Null) => return Ok([0u8; SLOT_LEN]),
        Some(Value::String(s)) if s.is_empty() => return Ok([0u8; SLOT_LEN]),
        Some(v) => v,
    };
    match field.encoding {
        Encoding::ShortString => {
            let s = value.as_str().ok_or_else(|| CodecError::InvalidValue {
                field: field.name.to_string(),
                expected: "a string",
            })?;
            let bytes = s.as_bytes();
            if bytes.len() > MAX_SHORT_STRING {
                return Err(CodecError::StringTooLong {
                    field: field.name.to_string(),
                    len: bytes.len(),
                });
            }
            let mut slot = [0u8; SLOT_LEN];
            slot[SLOT_LEN - bytes.len()..].copy_from_slice(bytes);
            Ok(slot)
        }
        Encoding::Sha256 => {
            let s = value.as_str().ok_or_else(|| CodecError::InvalidValue {
                field: field.name.to_string(),
                expected: "a string",
            })?;
            Ok(fr_slot(Fr::from_be_bytes_mod_order(&Sha256::digest(s.as_bytes()))))
        }
        Encoding::Uint => encode_uint(field, value),
    }
}

fn encode_uint(field: &FieldDef, value: &Value) -> Result<[u8; SLOT_LEN], CodecError> {
    let out_of_range = || CodecError::UIntOutOfRange {
        field: field.name.to_string(),
        value: value.to_string(),
    };
    match value {
        Value::Bool(b) => Ok(fr_slot(Fr::from(*b as u64))),
        Value::Number(n) => {
            // Negative and fractional numbers have no slot representation.
            let v = n.as_u64().ok_or_else(out_of_range)?;
            Ok(fr_slot(Fr::from(v)))
        }
        // Values above u64 travel as decimal strings.
        Value::String(s) => {
            let big = s
                .bytes()
                .all(|b| b.is_ascii_digit())
                .then(|| BigUint::parse_bytes(s.as_bytes(), 10))
                .flatten()
                .ok_or_else(out_of_range)?;
            if big >= *MODULUS {
                return Err(out_of_range());
            }
            Ok(pad_slot(&big.to_bytes_be()))
        }
        _ => Err(CodecError::InvalidValue {
            field: field.name.to_string(),
            expected: "an unsigned integer",
        }),
    }
}

fn fr_slot(fr: Fr) -> [u8; SLOT_LEN] {
    // BigInt<4>::to_bytes_be always yields 32 bytes, leading zeros included.
    let bytes = fr.into_bigint().to_bytes_be();
    let mut slot = [0u8; SLOT_LEN];
    slot.copy_from_slice(&bytes);
    slot
}

fn pad_slot(bytes: &[u8]) -> [u8; SLOT_LEN] {
    let mut slot = [0u8; SLOT_LEN];
    slot[SLOT_LEN - bytes.len()..].copy_from_slice(bytes);
    slot
}

/// Schema-directed inverse of [`encode`].
///
/// `shortString` slots decode back to their string (zero slot decodes to
/// `null`); `uint` slots decode to a number, or to a boolean when the
/// field's `js_type` hint says so; `sha256` slots are one-way and decode to
/// their hex representation, to be checked with [`verify_sha256`].
pub fn decode(schema: &[FieldDef], bytes: &[u8]) -> Result<Map<String, Value>, CodecError> {
    let expected = byte_length(schema);
    if bytes.len() != expected {
        return Err(CodecError::WrongLength { expected, actual: bytes.len() });
    }
    let mut record = Map::new();
    for (index, field) in schema.iter().enumerate() {
        let slot = &bytes[SLOT_LEN * index..SLOT_LEN * (index + 1)];
        if BigUint::from_bytes_be(slot) >= *MODULUS {
            return Err(CodecError::NonCanonicalSlot { field: field.name.to_string() });
        }
        record.insert(field.name.to_string(), decode_slot(field, slot)?);
    }
    Ok(record)
}

fn decode_slot(field: &FieldDef, slot: &[u8]) -> Result<Value, CodecError> {
    match field.encoding {
        Encoding::ShortString => {
            let start = slot.iter().position(|&b| b != 0);
            match start {
                None => Ok(Value::Null),
                Some(start) => {
                    let s = std::str::from_utf8(&slot[start..]).map_err(|_| {
                        CodecError::InvalidValue {
                            field: field.name.to_string(),
                            expected: "a UTF-8 short string slot",
                        }
                    })?;
                    Ok(Value::String(s.to_string()))
                }
            }
        }
        Encoding::Sha256 => Ok(Value::String(hex::encode(slot))),
        Encoding::Uint => {
            let big = BigUint::from_bytes_be(slot);
            let value = match u64::try_from(&big) {
                Ok(v) if field.js_type == Some("boolean") => Value::Bool(v != 0),
                Ok(v) => Value::from(v),
                Err(_) => Value::String(big.to_string()),
            };
            Ok(value)
        }
    }
}

/// True iff `slot` is the `sha256` encoding of `value`.
pub fn verify_sha256(value: &str, slot: &[u8]) -> bool {
    slot.len() == SLOT_LEN
        && fr_slot(Fr::from_be_bytes_mod_order(&Sha256::digest(value.as_bytes()))) == *slot
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: &[FieldDef] = &[
        FieldDef { name: "countryCode", encoding: Encoding::ShortString, js_type: Some("string") },
        FieldDef { name: "vatNumber", encoding: Encoding::ShortString, js_type: Some("string") },
        FieldDef { name: "valid", encoding: Encoding::Uint, js_type: Some("boolean") },
        FieldDef { name: "name", encoding: Encoding::Sha256, js_type: Some("string") },
        FieldDef { name: "address", encoding: Encoding::Sha256, js_type: Some("string") },
    ];

    fn record(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_block_length_matches_schema() {
        let block = encode(
            SCHEMA,
            &record(&[
                ("countryCode", json!("PT")),
                ("vatNumber", json!("507172230")),
                ("valid", json!(1)),
                ("name", json!("TYTLE LDA")),
                ("address", json!("RUA DO EXEMPLO 123")),
            ]),
        )
        .unwrap();
        assert_eq!(block.len(), 160);
        assert_eq!(byte_length(SCHEMA), 160);
    }

    #[test]
    fn test_short_string_layout() {
        let block =
            encode(SCHEMA, &record(&[("countryCode", json!("PT"))])).unwrap();
        // Left-padded big-endian: the two final bytes of slot 0 are "PT".
        assert_eq!(&block[..30], &[0u8; 30]);
        assert_eq!(&block[30..32], b"PT");
    }

    #[test]
    fn test_short_string_roundtrip() {
        let input = record(&[
            ("countryCode", json!("PT")),
            ("vatNumber", json!("507172230")),
            ("valid", json!(1)),
        ]);
        let block = encode(SCHEMA, &input).unwrap();
        let decoded = decode(SCHEMA, &block).unwrap();
        assert_eq!(decoded["countryCode"], json!("PT"));
        assert_eq!(decoded["vatNumber"], json!("507172230"));
        assert_eq!(decoded["valid"], json!(true));
        assert_eq!(decoded["name"], json!(hex::encode([0u8; 32])));
    }

    #[test]
    fn test_short_string_boundary() {
        let max = "x".repeat(31);
        let block = encode(SCHEMA, &record(&[("countryCode", json!(max.clone()))])).unwrap();
        assert_eq!(&block[1..32], max.as_bytes());

        let err = encode(SCHEMA, &record(&[("countryCode", json!("x".repeat(32)))])).unwrap_err();
        assert!(matches!(err, CodecError::StringTooLong { len: 32, .. }));
    }

    #[test]
    fn test_zero_and_absent_collide() {
        let explicit = encode(SCHEMA, &record(&[("valid", json!(0))])).unwrap();
        let absent = encode(SCHEMA, &record(&[])).unwrap();
        let null = encode(SCHEMA, &record(&[("valid", Value::Null)])).unwrap();
        let empty = encode(SCHEMA, &record(&[("valid", json!(""))])).unwrap();
        assert_eq!(explicit, absent);
        assert_eq!(absent, null);
        assert_eq!(null, empty);
        assert_eq!(explicit, vec![0u8; 160]);
    }

    #[test]
    fn test_sha256_slot_is_reduced_and_verifies() {
        let block = encode(SCHEMA, &record(&[("name", json!("TYTLE LDA"))])).unwrap();
        let slot = &block[96..128];
        assert!(BigUint::from_bytes_be(slot) < *MODULUS);
        assert!(verify_sha256("TYTLE LDA", slot));
        assert!(!verify_sha256("TYTLE SA", slot));
        // Raw digest differs from the reduced slot only when digest >= p,
        // but the mod-p relation always holds.
        let digest = Sha256::digest(b"TYTLE LDA");
        let expected = BigUint::from_bytes_be(&digest) % &*MODULUS;
        assert_eq!(BigUint::from_bytes_be(slot), expected);
    }

    #[test]
    fn test_uint_range() {
        let err = encode(SCHEMA, &record(&[("valid", json!(-1))])).unwrap_err();
        assert!(matches!(err, CodecError::UIntOutOfRange { .. }));

        // One above the modulus, as a decimal string.
        let above = (&*MODULUS + 1u32).to_string();
        let err = encode(SCHEMA, &record(&[("valid", json!(above))])).unwrap_err();
        assert!(matches!(err, CodecError::UIntOutOfRange { .. }));

        let below = (&*MODULUS - 1u32).to_string();
        let block = encode(SCHEMA, &record(&[("valid", json!(below.clone()))])).unwrap();
        assert_eq!(BigUint::from_bytes_be(&block[64..96]).to_string(), below);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let err = decode(SCHEMA, &[0u8; 159]).unwrap_err();
        assert!(matches!(err, CodecError::WrongLength { expected: 160, actual: 159 }));
    }

    #[test]
    fn test_decode_rejects_non_canonical_slot() {
        let mut block = vec![0u8; 160];
        block[64..96].copy_from_slice(&[0xff; 32]);
        let err = decode(SCHEMA, &block).unwrap_err();
        assert!(matches!(err, CodecError::NonCanonicalSlot { .. }));
    }
}
