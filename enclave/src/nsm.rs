//! Client for the Nitro Security Module: attestation requests over the
//! `/dev/nsm` ioctl, plus PCR lifting from the returned COSE_Sign1.

use anyhow::{bail, Result};
use wire::PcrValues;

/// The hardware attestation device, behind a trait so tests can swap in a
/// mock that produces structurally valid documents.
pub trait SecurityModule: Send + Sync {
    /// Produce a COSE_Sign1 attestation document bound to `nonce`.
    fn attest(&self, nonce: Vec<u8>) -> Result<Vec<u8>>;
}

#[cfg(feature = "nsm")]
pub struct Nsm {
    fd: i32,
}

#[cfg(feature = "nsm")]
impl Nsm {
    pub fn init() -> Result<Self> {
        tracing::info!("initializing NSM...");
        let fd = aws_nitro_enclaves_nsm_api::driver::nsm_init();
        if fd < 0 {
            bail!("failed to initialize NSM")
        }
        Ok(Self { fd })
    }
}

#[cfg(feature = "nsm")]
impl SecurityModule for Nsm {
    /// The ioctl is a blocking syscall; callers run this on the blocking
    /// thread pool. The kernel serialises access to the device.
    fn attest(&self, nonce: Vec<u8>) -> Result<Vec<u8>> {
        use aws_nitro_enclaves_nsm_api::api::{Request, Response};
        let request = Request::Attestation {
            nonce: Some(serde_bytes::ByteBuf::from(nonce)),
            user_data: None,
            public_key: None,
        };
        match aws_nitro_enclaves_nsm_api::driver::nsm_process_request(self.fd, request) {
            Response::Attestation { document } => Ok(document),
            Response::Error(code) => bail!("NSM attestation error: {:?}", code),
            _ => bail!("unexpected NSM response"),
        }
    }
}

#[cfg(feature = "nsm")]
impl Drop for Nsm {
    fn drop(&mut self) {
        aws_nitro_enclaves_nsm_api::driver::nsm_exit(self.fd);
    }
}

/// Lift PCR0-PCR2 out of a COSE_Sign1 attestation document as lowercase
/// hex. The COSE payload is itself CBOR; its `pcrs` entry maps small
/// integer indices to 48-byte digests.
///
/// Returns `None` on any structural mismatch: the caller then emits empty
/// PCR fields and the COSE document stays the authoritative record.
pub fn extract_pcrs(cose: &[u8]) -> Option<PcrValues> {
    use serde_cbor::Value;
    let value: Value = serde_cbor::from_slice(cose).ok()?;
    // The COSE_Sign1 tag (18) is optional on the wire.
    let value = match value {
        Value::Tag(18, inner) => *inner,
        other => other,
    };
    let Value::Array(envelope) = value else { return None };
    let Some(Value::Bytes(payload)) = envelope.get(2) else { return None };
    let payload: Value = serde_cbor::from_slice(payload).ok()?;
    let Value::Map(doc) = payload else { return None };
    let Value::Map(pcr_map) = doc.get(&Value::Text("pcrs".into()))? else { return None };
    let pcr = |index: i128| match pcr_map.get(&Value::Integer(index)) {
        Some(Value::Bytes(bytes)) => Some(hex::encode(bytes)),
        _ => None,
    };
    Some(PcrValues { pcr0: pcr(0)?, pcr1: pcr(1)?, pcr2: pcr(2)? })
}

/// Mock security module. Not secure, but good for testing: it emits a
/// COSE_Sign1-shaped document carrying the requested nonce and fixed PCRs.
#[cfg(any(test, feature = "test-utils"))]
pub struct MockSecurityModule;

#[cfg(any(test, feature = "test-utils"))]
impl MockSecurityModule {
    pub const PCR_FILL: [u8; 3] = [0xaa, 0xbb, 0xcc];

    pub fn cose_document(nonce: &[u8]) -> Vec<u8> {
        use serde_cbor::Value;
        use std::collections::BTreeMap;

        let mut pcrs = BTreeMap::new();
        for (index, fill) in Self::PCR_FILL.iter().enumerate() {
            pcrs.insert(Value::Integer(index as i128), Value::Bytes(vec![*fill; 48]));
        }
        let mut doc = BTreeMap::new();
        doc.insert(Value::Text("module_id".into()), Value::Text("mock-module".into()));
        doc.insert(Value::Text("digest".into()), Value::Text("SHA384".into()));
        doc.insert(Value::Text("pcrs".into()), Value::Map(pcrs));
        doc.insert(Value::Text("nonce".into()), Value::Bytes(nonce.to_vec()));
        let payload = serde_cbor::to_vec(&Value::Map(doc)).unwrap();

        let envelope = Value::Array(vec![
            Value::Bytes(vec![0xa0]),
            Value::Map(BTreeMap::new()),
            Value::Bytes(payload),
            Value::Bytes(vec![0u8; 96]),
        ]);
        serde_cbor::to_vec(&Value::Tag(18, Box::new(envelope))).unwrap()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SecurityModule for MockSecurityModule {
    fn attest(&self, nonce: Vec<u8>) -> Result<Vec<u8>> {
        Ok(Self::cose_document(&nonce))
    }
}
