use std::collections::HashMap;

use crate::models::{LabelSource, QuerySpec, Row, INTERVAL_LABEL, REPO_LABEL};

/// Value used for a column-sourced label the row cannot provide.
pub const UNKNOWN_LABEL_VALUE: &str = "unknown";

/// Label set for one sample of `spec`.
///
/// `row` is the current result row in table mode and `None` in single-row
/// mode, where column-sourced labels do not occur.
pub fn resolve(spec: &QuerySpec, row: Option<&Row>) -> HashMap<String, String> {
    let mut labels = HashMap::with_capacity(spec.labels.len() + 2);
    labels.insert(INTERVAL_LABEL.to_string(), spec.window.label().to_string());
    labels.insert(REPO_LABEL.to_string(), spec.repo.clone());

    for declaration in &spec.labels {
        match &declaration.source {
            LabelSource::Static(value) => {
                if !value.is_empty() {
                    labels.insert(declaration.key.clone(), value.clone());
                }
            }
            LabelSource::Column(column) => {
                let Some(row) = row else { continue };
                let value = row
                    .get(column)
                    .and_then(|v| v.as_label())
                    .unwrap_or_else(|| UNKNOWN_LABEL_VALUE.to_string());
                labels.insert(declaration.key.clone(), value);
            }
        }
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldValue, LabelDeclaration, TimeWindow};
    use pretty_assertions::assert_eq;

    fn spec(labels: Vec<LabelDeclaration>) -> QuerySpec {
        QuerySpec {
            query: "groupby(hostname)".into(),
            repo: "sandbox".into(),
            window: TimeWindow::live("5m"),
            metric_name: "requests".into(),
            labels,
        }
    }

    fn expected(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fixed_labels_always_present() {
        let labels = resolve(&spec(vec![]), None);
        assert_eq!(labels, expected(&[("interval", "5m"), ("repo", "sandbox")]));
    }

    #[test]
    fn test_static_labels_verbatim_and_empty_skipped() {
        let labels = resolve(
            &spec(vec![
                LabelDeclaration::fixed("env", "prod"),
                LabelDeclaration::fixed("team", ""),
            ]),
            None,
        );
        assert_eq!(
            labels,
            expected(&[("interval", "5m"), ("repo", "sandbox"), ("env", "prod")])
        );
    }

    #[test]
    fn test_dynamic_label_fallbacks() {
        let spec = spec(vec![LabelDeclaration::from_column("host", "hostname")]);

        let mut row = Row::new();
        row.insert("hostname".into(), FieldValue::from("a"));
        assert_eq!(resolve(&spec, Some(&row))["host"], "a");

        row.insert("hostname".into(), FieldValue::from(""));
        assert_eq!(resolve(&spec, Some(&row))["host"], UNKNOWN_LABEL_VALUE);

        row.insert("hostname".into(), FieldValue::Null);
        assert_eq!(resolve(&spec, Some(&row))["host"], UNKNOWN_LABEL_VALUE);

        row.remove("hostname");
        assert_eq!(resolve(&spec, Some(&row))["host"], UNKNOWN_LABEL_VALUE);
    }

    #[test]
    fn test_dynamic_label_stringifies_numbers() {
        let spec = spec(vec![LabelDeclaration::from_column("code", "statuscode")]);
        let mut row = Row::new();
        row.insert("statuscode".into(), FieldValue::Number(503u64.into()));
        assert_eq!(resolve(&spec, Some(&row))["code"], "503");
    }

    #[test]
    fn test_large_numeric_ids_stay_distinct() {
        let spec = spec(vec![LabelDeclaration::from_column("id", "id")]);
        let rows: Vec<Row> = serde_json::from_str(
            r#"[{"id": 9007199254740993, "value": "1"}, {"id": 9007199254740992, "value": "2"}]"#,
        )
        .unwrap();

        let first = resolve(&spec, Some(&rows[0]));
        let second = resolve(&spec, Some(&rows[1]));
        assert_eq!(first["id"], "9007199254740993");
        assert_eq!(second["id"], "9007199254740992");
        assert_ne!(first, second);
    }
}
