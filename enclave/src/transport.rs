//! AF_VSOCK transport. Inside an enclave the only network is vsock: the
//! framed request listener binds here, and every outbound connection goes
//! through the host's vsock-proxy, one proxy port per allowed upstream.

use anyhow::{anyhow, Result};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};

/// From inside an enclave, the host is reachable at CID 3.
pub const HOST_CID: u32 = 3;

pub fn listen(port: u32) -> Result<VsockListener> {
    let addr = VsockAddr::new(tokio_vsock::VMADDR_CID_ANY, port);
    let listener = VsockListener::bind(addr)?;
    Ok(listener)
}

pub async fn connect_host(port: u32) -> Result<VsockStream> {
    let addr = VsockAddr::new(HOST_CID, port);
    let stream = VsockStream::connect(addr)
        .await
        .map_err(|e| anyhow!("failed to connect to VSOCK {}: {}", addr, e))?;
    Ok(stream)
}

/// Negotiate TLS with the remote endpoint over an established vsock stream.
/// Certificate verification against the bundled webpki roots is always on.
pub async fn wrap_tls(stream: VsockStream, hostname: &str) -> Result<ProxyStream> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));
    let server_name = pki_types::ServerName::try_from(hostname.to_string())
        .map_err(|e| anyhow!("invalid server name {}: {}", hostname, e))?;
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| anyhow!("TLS handshake with {} failed: {}", hostname, e))?;
    Ok(ProxyStream::Tls(Box::new(tls_stream)))
}

/// A proxied upstream connection, with or without TLS on top. Both arms are
/// plain byte-duplexes; the HTTP client does not care which it got.
pub enum ProxyStream {
    Tls(Box<TlsStream<VsockStream>>),
    Plain(VsockStream),
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            ProxyStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            ProxyStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            ProxyStream::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            ProxyStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
