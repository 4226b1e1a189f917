use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Fixed label carrying the query's time window.
pub const INTERVAL_LABEL: &str = "interval";
/// Fixed label carrying the repository the query runs against.
pub const REPO_LABEL: &str = "repo";

/// Window a live query job covers, e.g. `5m` up to `now`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
    pub live: bool,
}

impl TimeWindow {
    /// Open-ended window starting `interval` ago.
    pub fn live(interval: impl Into<String>) -> Self {
        Self {
            start: interval.into(),
            end: "now".to_string(),
            live: true,
        }
    }

    /// Identifier published as the `interval` label.
    pub fn label(&self) -> &str {
        &self.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelSource {
    Static(String),
    Column(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelDeclaration {
    pub key: String,
    pub source: LabelSource,
}

impl LabelDeclaration {
    pub fn fixed(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            source: LabelSource::Static(value.into()),
        }
    }

    pub fn from_column(key: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            source: LabelSource::Column(column.into()),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.source, LabelSource::Column(_))
    }
}

/// One configured query, before it has been submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub query: String,
    pub repo: String,
    pub window: TimeWindow,
    pub metric_name: String,
    pub labels: Vec<LabelDeclaration>,
}

impl QuerySpec {
    /// Table mode as soon as any label is sourced from a result column.
    pub fn extraction_mode(&self) -> ExtractionMode {
        if self.labels.iter().any(LabelDeclaration::is_dynamic) {
            ExtractionMode::Table
        } else {
            ExtractionMode::SingleRow
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    SingleRow,
    Table,
}

/// A submitted query job. The id is issued by the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryJob {
    pub id: String,
    pub spec: QuerySpec,
}

impl QueryJob {
    pub fn repo(&self) -> &str {
        &self.spec.repo
    }

    pub fn metric_name(&self) -> &str {
        &self.spec.metric_name
    }
}

/// Loosely-typed scalar from a result row.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "serde_json::Value")]
pub enum FieldValue {
    Text(String),
    Number(serde_json::Number),
    Null,
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::String(s) => FieldValue::Text(s),
            serde_json::Value::Number(n) => FieldValue::Number(n),
            other => FieldValue::Text(other.to_string()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Null => Ok(()),
        }
    }
}

impl FieldValue {
    /// Textual label value; `None` when null or empty.
    pub fn as_label(&self) -> Option<String> {
        let text = self.to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn to_f64(&self) -> std::result::Result<f64, String> {
        match self {
            FieldValue::Number(n) => n
                .as_f64()
                .ok_or_else(|| format!("cannot represent {} as float", n)),
            FieldValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| format!("cannot parse {:?} as float: {}", s, e)),
            FieldValue::Null => Err("value is null".to_string()),
        }
    }
}

pub type Row = HashMap<String, FieldValue>;

/// Body returned when polling a query job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub done: bool,
    #[serde(default)]
    pub events: Vec<Row>,
    #[serde(default)]
    pub field_order: Vec<String>,
    #[serde(default)]
    pub meta_data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartQueryPayload<'a> {
    pub query_string: &'a str,
    pub start: &'a str,
    pub end: &'a str,
    pub is_live: bool,
}

#[derive(Debug, Deserialize)]
pub struct StartQueryResponse {
    pub id: String,
}

/// One value ready to be written to a gauge series.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSample {
    pub metric_name: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_job_result_decodes_mixed_rows() {
        let body = r#"{
            "done": true,
            "events": [{"_count": "42", "n": 7, "missing": null, "flag": true}],
            "fieldOrder": ["_count"],
            "metaData": {"eventCount": 1}
        }"#;
        let result: JobResult = serde_json::from_str(body).unwrap();
        assert!(result.done);
        assert_eq!(result.field_order, vec!["_count".to_string()]);
        let row = &result.events[0];
        assert_eq!(row["_count"], FieldValue::Text("42".into()));
        assert_eq!(row["n"], FieldValue::Number(7u64.into()));
        assert_eq!(row["missing"], FieldValue::Null);
        assert_eq!(row["flag"], FieldValue::Text("true".into()));
    }

    #[test]
    fn test_pending_result_without_events() {
        let result: JobResult = serde_json::from_str(r#"{"done": false}"#).unwrap();
        assert!(!result.done);
        assert!(result.events.is_empty());
    }

    #[test]
    fn test_field_value_label_fallbacks() {
        assert_eq!(FieldValue::Null.as_label(), None);
        assert_eq!(FieldValue::Text(String::new()).as_label(), None);
        assert_eq!(FieldValue::Number(3u64.into()).as_label(), Some("3".into()));
        assert_eq!(FieldValue::from("web-1").as_label(), Some("web-1".into()));
    }

    #[test]
    fn test_large_integers_keep_their_digits() {
        let rows: Vec<Row> =
            serde_json::from_str(r#"[{"id": 9007199254740993}, {"id": 9007199254740992}]"#).unwrap();
        let a = rows[0]["id"].as_label().unwrap();
        let b = rows[1]["id"].as_label().unwrap();
        assert_eq!(a, "9007199254740993");
        assert_eq!(b, "9007199254740992");
        assert_ne!(a, b);
    }

    #[test]
    fn test_field_value_to_f64() {
        assert_eq!(FieldValue::from(" 3.25 ").to_f64(), Ok(3.25));
        let number = serde_json::Number::from_f64(1.5).unwrap();
        assert_eq!(FieldValue::Number(number).to_f64(), Ok(1.5));
        assert!(FieldValue::from("abc").to_f64().is_err());
        assert!(FieldValue::Null.to_f64().is_err());
    }

    #[test]
    fn test_extraction_mode_follows_labels() {
        let mut spec = QuerySpec {
            query: "count()".into(),
            repo: "sandbox".into(),
            window: TimeWindow::live("5m"),
            metric_name: "errors_total".into(),
            labels: vec![LabelDeclaration::fixed("env", "prod")],
        };
        assert_eq!(spec.extraction_mode(), ExtractionMode::SingleRow);
        spec.labels.push(LabelDeclaration::from_column("host", "hostname"));
        assert_eq!(spec.extraction_mode(), ExtractionMode::Table);
    }
}
