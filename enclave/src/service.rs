//! Compile-time service definitions.
//!
//! Each enclave image bakes in exactly one service: its name, its host
//! allowlist, and which handler serves it. The choice is made with cargo
//! features at build time, never at runtime, so the handler identity is
//! measured into PCR0 along with everything else.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tls,
    Plain,
}

/// One allowed upstream: the exact hostname, the host-side vsock-proxy
/// port that tunnels to it, and whether TLS is spoken through the tunnel.
pub struct AllowlistEntry {
    pub hostname: &'static str,
    pub proxy_port: u32,
    pub transport: Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Generic,
    VatCheck,
    BusinessCode,
    Payments,
}

pub struct Service {
    pub name: &'static str,
    pub allowlist: &'static [AllowlistEntry],
    pub handler: HandlerKind,
}

impl Service {
    /// Exact, case-sensitive hostname match. The allowlist is the primary
    /// isolation mechanism; no normalisation happens here.
    pub fn allowlist_entry(&self, hostname: &str) -> Option<&AllowlistEntry> {
        self.allowlist.iter().find(|e| e.hostname == hostname)
    }
}

pub const VIES_HOST: &str = "ec.europa.eu";
pub const HMRC_HOST: &str = "api.service.hmrc.gov.uk";
pub const SICAE_HOST: &str = "www.sicae.pt";
pub const STRIPE_HOST: &str = "api.stripe.com";
pub const FETCH_HOST: &str = "api.coingecko.com";

pub static VIES: Service = Service {
    name: "vies",
    allowlist: &[
        AllowlistEntry { hostname: VIES_HOST, proxy_port: 8443, transport: Transport::Tls },
        AllowlistEntry { hostname: HMRC_HOST, proxy_port: 8444, transport: Transport::Tls },
    ],
    handler: HandlerKind::VatCheck,
};

// SICAE serves public registry data over plain HTTP; the attestation then
// proves only that this code ran, not what the server said.
pub static SICAE: Service = Service {
    name: "sicae",
    allowlist: &[AllowlistEntry {
        hostname: SICAE_HOST,
        proxy_port: 8445,
        transport: Transport::Plain,
    }],
    handler: HandlerKind::BusinessCode,
};

pub static STRIPE: Service = Service {
    name: "stripe",
    allowlist: &[AllowlistEntry {
        hostname: STRIPE_HOST,
        proxy_port: 8446,
        transport: Transport::Tls,
    }],
    handler: HandlerKind::Payments,
};

pub static FETCH: Service = Service {
    name: "fetch",
    allowlist: &[AllowlistEntry {
        hostname: FETCH_HOST,
        proxy_port: 8447,
        transport: Transport::Tls,
    }],
    handler: HandlerKind::Generic,
};

/// The service compiled into this image.
#[cfg(feature = "svc-vies")]
pub fn active() -> &'static Service {
    &VIES
}

#[cfg(all(feature = "svc-sicae", not(feature = "svc-vies")))]
pub fn active() -> &'static Service {
    &SICAE
}

#[cfg(all(feature = "svc-stripe", not(any(feature = "svc-vies", feature = "svc-sicae"))))]
pub fn active() -> &'static Service {
    &STRIPE
}

#[cfg(all(
    feature = "svc-fetch",
    not(any(feature = "svc-vies", feature = "svc-sicae", feature = "svc-stripe"))
))]
pub fn active() -> &'static Service {
    &FETCH
}

#[cfg(not(any(
    feature = "svc-vies",
    feature = "svc-sicae",
    feature = "svc-stripe",
    feature = "svc-fetch"
)))]
compile_error!("select a service: svc-vies, svc-sicae, svc-stripe or svc-fetch");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowlist_match_is_exact_and_case_sensitive() {
        assert!(VIES.allowlist_entry("ec.europa.eu").is_some());
        assert!(VIES.allowlist_entry("EC.EUROPA.EU").is_none());
        assert!(VIES.allowlist_entry("ec.europa.eu.evil.example").is_none());
        assert!(VIES.allowlist_entry("api.stripe.com").is_none());
    }

    #[test]
    fn test_per_host_proxy_ports_are_distinct() {
        let mut ports: Vec<u32> = [&VIES, &SICAE, &STRIPE, &FETCH]
            .iter()
            .flat_map(|s| s.allowlist.iter().map(|e| e.proxy_port))
            .collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 5);
    }
}
