//! Fleet health: cross-check the routing table against the enclaves the
//! platform CLI reports as running.

use crate::routes::RouteTable;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::time::Duration;

const CLI_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
pub struct EnclaveHealth {
    pub service: &'static str,
    pub cid: u32,
    pub state: String,
    pub healthy: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub enclaves: Vec<EnclaveHealth>,
}

pub async fn check(table: &RouteTable) -> HealthReport {
    match describe_enclaves().await {
        Ok(described) => report(table, &described),
        Err(e) => {
            tracing::error!("nitro-cli probe failed: {}", e);
            let enclaves = table
                .routes
                .iter()
                .map(|route| EnclaveHealth {
                    service: route.service,
                    cid: route.cid,
                    state: "NOT_FOUND".to_string(),
                    healthy: false,
                })
                .collect();
            HealthReport { healthy: false, enclaves }
        }
    }
}

async fn describe_enclaves() -> Result<Vec<serde_json::Value>> {
    let output = tokio::time::timeout(
        CLI_TIMEOUT,
        tokio::process::Command::new("nitro-cli").arg("describe-enclaves").output(),
    )
    .await
    .context("nitro-cli timed out")?
    .context("failed to run nitro-cli")?;
    if !output.status.success() {
        bail!("nitro-cli exited with {}", output.status);
    }
    serde_json::from_slice(&output.stdout).context("nitro-cli output is not a JSON array")
}

fn report(table: &RouteTable, described: &[serde_json::Value]) -> HealthReport {
    let enclaves: Vec<EnclaveHealth> = table
        .routes
        .iter()
        .map(|route| {
            let state = described
                .iter()
                .find(|enclave| enclave["EnclaveCID"].as_u64() == Some(route.cid as u64))
                .and_then(|enclave| enclave["State"].as_str())
                .unwrap_or("NOT_FOUND")
                .to_string();
            let healthy = state == "RUNNING";
            EnclaveHealth { service: route.service, cid: route.cid, state, healthy }
        })
        .collect();
    HealthReport { healthy: enclaves.iter().all(|enclave| enclave.healthy), enclaves }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::from_lookup(|_| None)
    }

    #[test]
    fn test_all_running_is_healthy() {
        let described: Vec<serde_json::Value> = [16, 17, 18, 19]
            .iter()
            .map(|cid| {
                serde_json::json!({"EnclaveID": format!("i-{cid}"), "EnclaveCID": cid, "State": "RUNNING"})
            })
            .collect();
        let report = report(&table(), &described);
        assert!(report.healthy);
        assert!(report.enclaves.iter().all(|e| e.state == "RUNNING"));
    }

    #[test]
    fn test_missing_or_stopped_enclave_is_unhealthy() {
        let described = vec![
            serde_json::json!({"EnclaveCID": 16, "State": "RUNNING"}),
            serde_json::json!({"EnclaveCID": 17, "State": "TERMINATING"}),
        ];
        let report = report(&table(), &described);
        assert!(!report.healthy);
        let by_service: std::collections::HashMap<&str, &EnclaveHealth> =
            report.enclaves.iter().map(|e| (e.service, e)).collect();
        assert!(by_service["vies"].healthy);
        assert_eq!(by_service["sicae"].state, "TERMINATING");
        assert_eq!(by_service["stripe"].state, "NOT_FOUND");
    }
}
