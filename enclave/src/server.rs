//! The accept loop: one framed request per accepted vsock connection,
//! served end-to-end before the next accept. Requests never interleave, so
//! the NSM device and the upstream proxy see strictly ordered traffic.

use crate::attestor::Attestor;
use crate::handler;
use crate::service::Service;
use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use wire::{read_frame, write_frame, EnclaveRequest, EnclaveResponse, ENCLAVE_PORT};

pub async fn serve(service: &'static Service, attestor: Attestor) -> Result<()> {
    let listener = crate::transport::listen(ENCLAVE_PORT)?;
    tracing::info!("serving {} on VSOCK port {}", service.name, ENCLAVE_PORT);
    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                tracing::debug!("connection accepted from {}", addr);
                if let Err(e) = serve_connection(&mut stream, service, &attestor).await {
                    tracing::error!("connection error: {}", e);
                    let reply = EnclaveResponse::failure(500, e.to_string());
                    if let Ok(bytes) = serde_json::to_vec(&reply) {
                        let _ = write_frame(&mut stream, &bytes).await;
                    }
                }
                // Close errors are uninteresting; the reply is already out.
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            Err(e) => {
                tracing::error!("accept: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

pub(crate) async fn serve_connection<S>(
    stream: &mut S,
    service: &Service,
    attestor: &Attestor,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = read_frame(stream).await?;
    let reply = match serde_json::from_slice::<EnclaveRequest>(&frame) {
        Ok(request) => {
            tracing::info!("request {}: {} {}", request.id, request.method, request.url);
            let reply = handler::handle(service, attestor, &request).await;
            tracing::info!(
                "request {}: done, success={} status={}",
                request.id,
                reply.success,
                reply.status
            );
            reply
        }
        Err(e) => EnclaveResponse::failure(400, format!("invalid request frame: {e}")),
    };
    write_frame(stream, &serde_json::to_vec(&reply)?).await?;
    Ok(())
}
