use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use tracing::debug;

use crate::models::{LabelDeclaration, ResolvedSample, INTERVAL_LABEL, REPO_LABEL};
use crate::{ExporterError, Result};

const GAUGE_HELP: &str = "Gauge for humio query";

#[derive(Debug, Clone, Copy)]
pub enum PollOutcome {
    Done,
    Pending,
    Error,
}

impl PollOutcome {
    fn as_str(self) -> &'static str {
        match self {
            PollOutcome::Done => "done",
            PollOutcome::Pending => "pending",
            PollOutcome::Error => "error",
        }
    }
}

struct GaugeFamily {
    schema: Vec<String>,
    gauge: GaugeVec,
}

/// Owns every published gauge plus the exporter's own counters.
///
/// Metrics are declared once at startup through `&mut self`; afterwards the
/// registry is shared read-only and `set` relies on the per-series locking
/// inside the prometheus collectors.
pub struct MetricRegistry {
    registry: Registry,
    families: HashMap<String, GaugeFamily>,
    polls: IntCounterVec,
    samples: IntCounter,
    skipped_rows: IntCounter,
}

impl MetricRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let polls = IntCounterVec::new(
            Opts::new("humio_exporter_polls_total", "Query job polls by outcome"),
            &["outcome"],
        )?;
        let samples = IntCounter::new(
            "humio_exporter_samples_total",
            "Samples written into query gauges",
        )?;
        let skipped_rows = IntCounter::new(
            "humio_exporter_skipped_rows_total",
            "Table rows skipped because no value field parsed",
        )?;

        registry.register(Box::new(polls.clone()))?;
        registry.register(Box::new(samples.clone()))?;
        registry.register(Box::new(skipped_rows.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            families: HashMap::new(),
            polls,
            samples,
            skipped_rows,
        })
    }

    /// Label-key schema for a metric: the fixed labels followed by the
    /// declared keys in declaration order.
    pub fn schema_for(labels: &[LabelDeclaration]) -> Vec<String> {
        let mut schema = vec![INTERVAL_LABEL.to_string(), REPO_LABEL.to_string()];
        schema.extend(labels.iter().map(|l| l.key.clone()));
        schema
    }

    /// Creates the gauge collection for `metric_name`. Redeclaring a name
    /// with the same schema shares the existing collection.
    pub fn declare(&mut self, metric_name: &str, labels: &[LabelDeclaration]) -> Result<()> {
        let schema = Self::schema_for(labels);

        if let Some(existing) = self.families.get(metric_name) {
            if existing.schema != schema {
                return Err(ExporterError::Configuration(format!(
                    "metric {} declared with label keys {:?} and {:?}",
                    metric_name, existing.schema, schema
                )));
            }
            debug!(metric = metric_name, "Sharing gauge between queries");
            return Ok(());
        }

        let keys: Vec<&str> = schema.iter().map(String::as_str).collect();
        let gauge = GaugeVec::new(Opts::new(metric_name, GAUGE_HELP), &keys)
            .map_err(|e| ExporterError::Configuration(format!("metric {}: {}", metric_name, e)))?;
        self.registry
            .register(Box::new(gauge.clone()))
            .map_err(|e| ExporterError::Configuration(format!("metric {}: {}", metric_name, e)))?;

        debug!(metric = metric_name, labels = ?schema, "Declared gauge");
        self.families
            .insert(metric_name.to_string(), GaugeFamily { schema, gauge });
        Ok(())
    }

    pub fn schema(&self, metric_name: &str) -> Option<&[String]> {
        self.families.get(metric_name).map(|f| f.schema.as_slice())
    }

    /// Overwrites the series addressed by the sample's labels.
    pub fn set(&self, sample: &ResolvedSample) -> Result<()> {
        let family = self.families.get(&sample.metric_name).ok_or_else(|| {
            ExporterError::Internal(format!("metric {} was never declared", sample.metric_name))
        })?;

        if sample.labels.len() != family.schema.len() {
            return Err(ExporterError::Internal(format!(
                "metric {} expects labels {:?}, got {:?}",
                sample.metric_name,
                family.schema,
                sample.labels.keys().collect::<Vec<_>>()
            )));
        }

        let values = family
            .schema
            .iter()
            .map(|key| {
                sample.labels.get(key).map(String::as_str).ok_or_else(|| {
                    ExporterError::Internal(format!(
                        "metric {} sample is missing label {}",
                        sample.metric_name, key
                    ))
                })
            })
            .collect::<Result<Vec<&str>>>()?;

        family
            .gauge
            .get_metric_with_label_values(&values)?
            .set(sample.value);
        self.samples.inc();
        Ok(())
    }

    pub fn record_poll(&self, outcome: PollOutcome) {
        self.polls.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn record_skipped_rows(&self, count: usize) {
        self.skipped_rows.inc_by(count as u64);
    }

    /// Current value of one series, if it has been written.
    pub fn value(&self, metric_name: &str, labels: &HashMap<String, String>) -> Option<f64> {
        self.registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == metric_name)?
            .get_metric()
            .iter()
            .find(|metric| {
                let pairs = metric.get_label();
                pairs.len() == labels.len()
                    && pairs
                        .iter()
                        .all(|p| labels.get(p.get_name()).map(String::as_str) == Some(p.get_value()))
            })
            .map(|metric| metric.get_gauge().get_value())
    }

    /// Number of series currently exported for a metric.
    pub fn series_count(&self, metric_name: &str) -> usize {
        self.registry
            .gather()
            .iter()
            .find(|family| family.get_name() == metric_name)
            .map(|family| family.get_metric().len())
            .unwrap_or(0)
    }

    /// Text exposition of everything in the registry.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ExporterError::Metrics(e.to_string()))
    }
}
