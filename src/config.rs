use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::logging::LogFormat;
use crate::models::{LabelDeclaration, QuerySpec, TimeWindow, INTERVAL_LABEL, REPO_LABEL};
use crate::poller::{FailurePolicy, PollSettings};
use crate::{ExporterError, Result};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "humio_exporter",
    version,
    about = "Humio exporter for Prometheus. Provide your Humio API token and configuration file with queries to expose as Prometheus metrics."
)]
pub struct Cli {
    /// The humio_exporter configuration file to be used
    #[arg(long = "config", env = "HUMIO_EXPORTER_CONFIG")]
    pub config: PathBuf,

    /// Humio base API url
    #[arg(long = "humio.url", env = "HUMIO_URL")]
    pub humio_url: String,

    /// Humio API token
    #[arg(long = "humio.api-token", env = "HUMIO_API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    /// Timeout for requests against the Humio API, in seconds
    #[arg(long = "humio.timeout", env = "HUMIO_TIMEOUT", default_value_t = 10)]
    pub timeout_secs: u64,

    /// Address on which to expose metrics
    #[arg(long = "web.listen-address", env = "WEB_LISTEN_ADDRESS", default_value = ":9534")]
    pub listen_address: String,

    /// Seconds between polling passes
    #[arg(long = "poll.interval", env = "POLL_INTERVAL", default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Maximum number of concurrent polls per pass
    #[arg(long = "poll.concurrency", env = "POLL_CONCURRENCY", default_value_t = 4)]
    pub poll_concurrency: usize,

    /// Keep polling the other queries when one query job fails
    #[arg(long = "poll.isolate-failures", env = "POLL_ISOLATE_FAILURES")]
    pub isolate_failures: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long = "log.level", env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long = "log.format", env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Logfmt)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Listen address; `:port` binds every interface.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let address = if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        };
        address.parse().map_err(|e| {
            ExporterError::Configuration(format!(
                "invalid listen address {}: {}",
                self.listen_address, e
            ))
        })
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        if self.timeout_secs == 0 {
            return Err(ExporterError::Configuration(
                "humio.timeout must be at least one second".to_string(),
            ));
        }
        Ok(Duration::from_secs(self.timeout_secs))
    }

    pub fn poll_settings(&self) -> Result<PollSettings> {
        if self.poll_interval_secs == 0 {
            return Err(ExporterError::Configuration(
                "poll.interval must be at least one second".to_string(),
            ));
        }
        if self.poll_concurrency == 0 {
            return Err(ExporterError::Configuration(
                "poll.concurrency must be at least 1".to_string(),
            ));
        }

        Ok(PollSettings {
            interval: Duration::from_secs(self.poll_interval_secs),
            concurrency: self.poll_concurrency,
            cancel_timeout: self.request_timeout()?,
            policy: if self.isolate_failures {
                FailurePolicy::Isolate
            } else {
                FailurePolicy::Fatal
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    queries: Vec<QueryConfig>,
}

#[derive(Debug, Deserialize)]
struct QueryConfig {
    query: String,
    repo: String,
    interval: String,
    metric_name: String,
    #[serde(default)]
    metric_labels: Vec<LabelConfig>,
}

#[derive(Debug, Deserialize)]
struct LabelConfig {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default, rename = "valueFromTable")]
    value_from_table: Option<String>,
}

pub fn load(path: &Path) -> Result<Vec<QuerySpec>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ExporterError::Configuration(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Vec<QuerySpec>> {
    let file: FileConfig = serde_yaml::from_str(content)?;
    if file.queries.is_empty() {
        return Err(ExporterError::Configuration(
            "no queries configured".to_string(),
        ));
    }

    file.queries
        .into_iter()
        .enumerate()
        .map(|(index, query)| query.into_spec(index))
        .collect()
}

impl QueryConfig {
    fn into_spec(self, index: usize) -> Result<QuerySpec> {
        let invalid = |msg: String| ExporterError::Configuration(format!("query #{}: {}", index + 1, msg));

        for (field, value) in [
            ("query", &self.query),
            ("repo", &self.repo),
            ("interval", &self.interval),
            ("metric_name", &self.metric_name),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("{} must not be empty", field)));
            }
        }

        let mut seen = HashSet::new();
        let mut labels = Vec::with_capacity(self.metric_labels.len());
        for label in self.metric_labels {
            if label.key.is_empty() {
                return Err(invalid("label key must not be empty".to_string()));
            }
            if label.key == INTERVAL_LABEL || label.key == REPO_LABEL {
                return Err(invalid(format!("label key {} is reserved", label.key)));
            }
            if !seen.insert(label.key.clone()) {
                return Err(invalid(format!("label key {} declared twice", label.key)));
            }

            match (label.value, label.value_from_table) {
                (Some(_), Some(_)) => {
                    return Err(invalid(format!(
                        "label {} sets both value and valueFromTable",
                        label.key
                    )))
                }
                (None, None) => {
                    return Err(invalid(format!(
                        "label {} needs value or valueFromTable",
                        label.key
                    )))
                }
                (Some(value), None) if value.is_empty() => {
                    warn!(
                        metric = %self.metric_name,
                        label = %label.key,
                        "Ignoring label with empty value"
                    );
                }
                (Some(value), None) => labels.push(LabelDeclaration::fixed(label.key, value)),
                (None, Some(column)) if column.is_empty() => {
                    return Err(invalid(format!(
                        "label {} has an empty valueFromTable",
                        label.key
                    )))
                }
                (None, Some(column)) => labels.push(LabelDeclaration::from_column(label.key, column)),
            }
        }

        Ok(QuerySpec {
            query: self.query,
            repo: self.repo,
            window: TimeWindow::live(self.interval),
            metric_name: self.metric_name,
            labels,
        })
    }
}
