//! One framed request/reply exchange with an enclave over vsock. Each call
//! dials a fresh connection; there is no shared state between callers.

use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio_vsock::{VsockAddr, VsockStream};
use wire::{read_frame, write_frame, EnclaveRequest};

/// Wall-clock budget for a host-to-enclave call: the enclave's own
/// 25-second upstream budget plus handshake and attestation headroom.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Returns the enclave's reply frame verbatim.
pub async fn call(cid: u32, port: u32, request: &EnclaveRequest) -> Result<Vec<u8>> {
    let exchange = async {
        let addr = VsockAddr::new(cid, port);
        let mut stream = VsockStream::connect(addr)
            .await
            .map_err(|e| anyhow!("failed to connect to VSOCK {}: {}", addr, e))?;
        write_frame(&mut stream, &serde_json::to_vec(request)?).await?;
        let reply = read_frame(&mut stream).await?;
        let _ = stream.shutdown(std::net::Shutdown::Both);
        Ok(reply)
    };
    match tokio::time::timeout(CALL_TIMEOUT, exchange).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("enclave call timed out after {}s", CALL_TIMEOUT.as_secs())),
    }
}
