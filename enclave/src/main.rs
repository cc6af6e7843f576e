//! Confidential-fetch enclave.
//!
//! An untrusted caller on the host asks this service to fetch a resource
//! from a well-known third-party API. The fetch happens entirely inside
//! the isolation boundary (TLS included), the interesting parts of the
//! response are canonicalised, and the result is bound to this image's
//! PCRs by a hardware attestation. One service variant (allowlist plus
//! handler) is compiled into each image; see `service.rs`.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;

mod attestor;
mod handler;
mod handlers;
mod http_client;
mod nsm;
mod server;
mod service;
mod transport;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // Trace = 0, Debug = 1, Info = 2, Warn = 3, Error = 4.
    #[arg(long, default_value_t = 2)]
    trace_level: usize,
}

fn main() {
    let args = Args::parse();
    let trace_level = match args.trace_level {
        0 => tracing::Level::TRACE,
        1 => tracing::Level::DEBUG,
        2 => tracing::Level::INFO,
        3 => tracing::Level::WARN,
        4 => tracing::Level::ERROR,
        _ => tracing::Level::INFO, // default to INFO for unknown values
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_max_level(trace_level)
        .init();

    if let Err(e) = enclave_main() {
        tracing::error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

#[tokio::main]
async fn enclave_main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow!("failed to install rustls crypto provider: {:?}", e))?;

    #[cfg(feature = "nsm")]
    let secmod: Arc<dyn nsm::SecurityModule> = Arc::new(nsm::Nsm::init()?);

    #[cfg(all(not(feature = "nsm"), feature = "test-utils"))]
    let secmod: Arc<dyn nsm::SecurityModule> = Arc::new(nsm::MockSecurityModule);

    #[cfg(all(not(feature = "nsm"), not(feature = "test-utils")))]
    compile_error!("no security module configured; enable `nsm` or `test-utils`");

    let service = service::active();
    tracing::info!("starting {} enclave...", service.name);
    server::serve(service, attestor::Attestor::new(secmod)).await
}
