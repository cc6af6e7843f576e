//! The static routing table: which upstream hostnames belong to which
//! enclave, and the CID the enclave was launched with. CIDs come from the
//! environment at startup; everything else is fixed.

use serde::Serialize;
use wire::ENCLAVE_PORT;

/// `(service, CID env var, default CID, hosts served)`. Every host in every
/// enclave allowlist must appear in exactly one row.
const SERVICES: &[(&str, &str, u32, &[&str])] = &[
    ("vies", "VIES_CID", 16, &["ec.europa.eu", "api.service.hmrc.gov.uk"]),
    ("sicae", "SICAE_CID", 17, &["www.sicae.pt"]),
    ("stripe", "STRIPE_CID", 18, &["api.stripe.com"]),
    ("fetch", "FETCH_CID", 19, &["api.coingecko.com"]),
];

#[derive(Debug, Clone, Serialize)]
pub struct Route {
    pub service: &'static str,
    pub cid: u32,
    pub port: u32,
    pub hosts: &'static [&'static str],
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteTable {
    pub routes: Vec<Route>,
}

impl RouteTable {
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let routes = SERVICES
            .iter()
            .map(|(service, var, default_cid, hosts)| {
                let cid = lookup(var).and_then(|v| v.parse().ok()).unwrap_or(*default_cid);
                Route { service, cid, port: ENCLAVE_PORT, hosts }
            })
            .collect();
        Self { routes }
    }

    /// Exact hostname match, mirroring the enclave-side allowlist gate.
    pub fn lookup(&self, hostname: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.hosts.contains(&hostname))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let table = RouteTable::from_lookup(|var| match var {
            "STRIPE_CID" => Some("42".to_string()),
            "VIES_CID" => Some("junk".to_string()),
            _ => None,
        });
        let stripe = table.lookup("api.stripe.com").unwrap();
        assert_eq!(stripe.cid, 42);
        // Unparseable override falls back to the default.
        let vies = table.lookup("ec.europa.eu").unwrap();
        assert_eq!(vies.cid, 16);
        assert_eq!(vies.port, 5000);
    }

    #[test]
    fn test_lookup_by_any_host_of_a_service() {
        let table = RouteTable::from_lookup(|_| None);
        assert_eq!(table.lookup("api.service.hmrc.gov.uk").unwrap().service, "vies");
        assert_eq!(table.lookup("www.sicae.pt").unwrap().service, "sicae");
        assert!(table.lookup("unknown.example").is_none());
    }

    #[test]
    fn test_hosts_are_unique_across_services() {
        let table = RouteTable::from_lookup(|_| None);
        let mut hosts: Vec<&str> =
            table.routes.iter().flat_map(|r| r.hosts.iter().copied()).collect();
        let total = hosts.len();
        hosts.sort_unstable();
        hosts.dedup();
        assert_eq!(hosts.len(), total);
    }
}
