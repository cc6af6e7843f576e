//! Prometheus metrics for the router endpoints.

use prometheus::{HistogramOpts, HistogramVec, Registry, TextEncoder};

pub struct Metrics {
    pub registry: Registry,
    pub request_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let buckets = vec![0.001, 0.01, 0.1, 1.0, 10.0, 30.0];
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "HTTP request duration in seconds")
                .buckets(buckets),
            &["path", "status"],
        )
        .expect("metric can be created");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("collector can be registered");
        Self { registry, request_duration_seconds }
    }

    pub fn encode_text(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_requests_show_up_in_exposition() {
        let metrics = Metrics::new();
        metrics
            .request_duration_seconds
            .with_label_values(&["/attest/fetch", "200"])
            .observe(0.25);
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("request_duration_seconds"));
        assert!(text.contains("/attest/fetch"));
    }
}
