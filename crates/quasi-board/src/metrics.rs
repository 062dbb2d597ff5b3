use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    pub activities_received: IntCounter,
    pub claims_recorded: IntCounter,
    pub completions_recorded: IntCounter,
    pub claim_conflicts: IntCounter,

    pub signature_verifications: IntCounter,
    pub signature_failures: IntCounter,

    pub webhook_received: IntCounter,
    pub webhook_ignored: IntCounter,
    pub webhook_rejected: IntCounter,

    pub deliveries_attempted: IntCounter,
    pub deliveries_failed: IntCounter,
    pub delivery_retries: IntCounter,

    pub followers: IntGauge,
    pub ledger_entries: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let activities_received = IntCounter::new(
            "quasi_activities_received_total",
            "Total activities posted to the inbox",
        )
        .unwrap();
        let claims_recorded =
            IntCounter::new("quasi_claims_recorded_total", "Total claim entries appended").unwrap();
        let completions_recorded = IntCounter::new(
            "quasi_completions_recorded_total",
            "Total completion entries appended",
        )
        .unwrap();
        let claim_conflicts = IntCounter::new(
            "quasi_claim_conflicts_total",
            "Claims rejected because another agent holds the task",
        )
        .unwrap();

        let signature_verifications = IntCounter::new(
            "quasi_signature_verifications_total",
            "Total inbound signature verifications",
        )
        .unwrap();
        let signature_failures = IntCounter::new(
            "quasi_signature_failures_total",
            "Total inbound signature failures",
        )
        .unwrap();

        let webhook_received = IntCounter::new(
            "quasi_webhook_received_total",
            "Webhook deliveries accepted for processing",
        )
        .unwrap();
        let webhook_ignored = IntCounter::new(
            "quasi_webhook_ignored_total",
            "Webhook deliveries ignored (wrong event, unmerged, or no footer)",
        )
        .unwrap();
        let webhook_rejected = IntCounter::new(
            "quasi_webhook_rejected_total",
            "Webhook deliveries rejected (bad signature or malformed body)",
        )
        .unwrap();

        let deliveries_attempted = IntCounter::new(
            "quasi_deliveries_attempted_total",
            "Outbound activity deliveries attempted",
        )
        .unwrap();
        let deliveries_failed = IntCounter::new(
            "quasi_deliveries_failed_total",
            "Outbound deliveries dropped after exhausting retries",
        )
        .unwrap();
        let delivery_retries = IntCounter::new(
            "quasi_delivery_retries_total",
            "Outbound delivery retry attempts",
        )
        .unwrap();

        let followers = IntGauge::new("quasi_followers", "Current follower count").unwrap();
        let ledger_entries =
            IntGauge::new("quasi_ledger_entries", "Current ledger length").unwrap();

        for collector in [
            &activities_received,
            &claims_recorded,
            &completions_recorded,
            &claim_conflicts,
            &signature_verifications,
            &signature_failures,
            &webhook_received,
            &webhook_ignored,
            &webhook_rejected,
            &deliveries_attempted,
            &deliveries_failed,
            &delivery_retries,
        ] {
            registry.register(Box::new(collector.clone())).unwrap();
        }
        registry.register(Box::new(followers.clone())).unwrap();
        registry.register(Box::new(ledger_entries.clone())).unwrap();

        Self {
            registry,
            activities_received,
            claims_recorded,
            completions_recorded,
            claim_conflicts,
            signature_verifications,
            signature_failures,
            webhook_received,
            webhook_ignored,
            webhook_rejected,
            deliveries_attempted,
            deliveries_failed,
            delivery_retries,
            followers,
            ledger_entries,
        }
    }

    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_gather() {
        let m = Metrics::new();
        m.claims_recorded.inc();
        m.followers.set(3);

        let text = m.gather();
        assert!(text.contains("quasi_claims_recorded_total"));
        assert!(text.contains("quasi_followers 3"));
    }
}
