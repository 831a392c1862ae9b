//! Process-scoped ingestion metrics.
//!
//! A single [`IngestMetrics`] is created at startup and shared with the components updating it.
//! Exposing the rendered text is left to the embedding application.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::{errors::ErrorKind, types::SequenceUnit};

#[derive(Debug, Clone)]
pub struct IngestMetrics {
    registry: Registry,
    units_committed: IntCounter,
    units_failed: IntCounterVec,
    units_absent: IntCounter,
    watermark: IntGauge,
    chain_height: IntGauge,
    batches: IntCounter,
}

impl IngestMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let units_committed = IntCounter::new(
            "beacon_units_committed_total",
            "Number of blocks fully stored",
        )?;
        let units_failed = IntCounterVec::new(
            Opts::new(
                "beacon_units_failed_total",
                "Number of blocks skipped because of an error",
            ),
            &["kind"],
        )?;
        let units_absent = IntCounter::new(
            "beacon_units_absent_total",
            "Number of block requests answered with a not yet produced block",
        )?;
        let watermark = IntGauge::new(
            "beacon_watermark_height",
            "Highest block height fully committed",
        )?;
        let chain_height = IntGauge::new(
            "beacon_chain_height",
            "Latest block height reported by the chain",
        )?;
        let batches = IntCounter::new("beacon_batches_total", "Number of sub-ranges processed")?;

        registry.register(Box::new(units_committed.clone()))?;
        registry.register(Box::new(units_failed.clone()))?;
        registry.register(Box::new(units_absent.clone()))?;
        registry.register(Box::new(watermark.clone()))?;
        registry.register(Box::new(chain_height.clone()))?;
        registry.register(Box::new(batches.clone()))?;

        Ok(Self {
            registry,
            units_committed,
            units_failed,
            units_absent,
            watermark,
            chain_height,
            batches,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn unit_committed(&self) {
        self.units_committed.inc();
    }

    pub fn unit_failed(&self, kind: ErrorKind) {
        self.units_failed.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn unit_absent(&self) {
        self.units_absent.inc();
    }

    pub fn batch_processed(&self) {
        self.batches.inc();
    }

    pub fn set_watermark(&self, unit: SequenceUnit) {
        self.watermark.set(gauge_value(unit));
    }

    pub fn set_chain_height(&self, unit: SequenceUnit) {
        self.chain_height.set(gauge_value(unit));
    }

    pub fn committed_count(&self) -> u64 {
        self.units_committed.get()
    }

    pub fn failed_count(&self, kind: ErrorKind) -> u64 {
        self.units_failed.with_label_values(&[kind.as_str()]).get()
    }

    /// Renders every series in the Prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

fn gauge_value(unit: SequenceUnit) -> i64 {
    i64::try_from(unit).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_series() {
        let metrics = IngestMetrics::new().unwrap();
        metrics.unit_committed();
        metrics.unit_committed();
        metrics.unit_failed(ErrorKind::Malformed);
        metrics.set_watermark(57);
        metrics.set_chain_height(100);

        let text = metrics.render().unwrap();
        assert!(text.contains("beacon_units_committed_total 2"));
        assert!(text.contains("beacon_units_failed_total{kind=\"malformed\"} 1"));
        assert!(text.contains("beacon_watermark_height 57"));
        assert!(text.contains("beacon_chain_height 100"));
        assert_eq!(metrics.committed_count(), 2);
        assert_eq!(metrics.failed_count(ErrorKind::Transport), 0);
    }

    #[test]
    fn registries_are_independent() {
        let first = IngestMetrics::new().unwrap();
        let second = IngestMetrics::new().unwrap();
        first.unit_absent();

        assert!(first.render().unwrap().contains("beacon_units_absent_total 1"));
        assert!(second.render().unwrap().contains("beacon_units_absent_total 0"));
    }
}
