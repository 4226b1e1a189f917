//! Resolves the numeric value(s) to publish from a completed job's rows.

use tracing::{debug, warn};

use crate::models::Row;
use crate::{ExporterError, Result};

/// Aggregate fields checked on the first row, in precedence order.
pub const SINGLE_ROW_FIELDS: [&str; 8] = [
    "_count", "_min", "_max", "_avg", "_rate", "_range", "_stddev", "_sum",
];

/// Per-row value fields for table results, in precedence order.
pub const TABLE_FIELDS: [&str; 4] = ["value", "_value", "count", "_count"];

/// Value of the first row's highest-precedence aggregate field.
///
/// Zero rows or no candidate field yields `Ok(None)`. A candidate that is
/// present but not numeric is an error.
pub fn single_row_value(rows: &[Row]) -> Result<Option<f64>> {
    let Some(row) = rows.first() else {
        debug!("Query returned no rows; nothing to publish");
        return Ok(None);
    };

    for field in SINGLE_ROW_FIELDS {
        if let Some(raw) = row.get(field) {
            return raw
                .to_f64()
                .map(Some)
                .map_err(|e| ExporterError::Extraction(format!("field {}: {}", field, e)));
        }
    }

    debug!(
        fields = ?row.keys().collect::<Vec<_>>(),
        "No supported aggregate field in result row"
    );
    Ok(None)
}

/// Value for one table row: the first candidate field that parses.
pub fn table_row_value(row: &Row) -> Option<f64> {
    TABLE_FIELDS
        .iter()
        .filter_map(|field| row.get(*field))
        .find_map(|raw| raw.to_f64().ok())
}

/// Pairs every parseable row with its value; other rows are skipped.
pub fn table_values(rows: &[Row]) -> (Vec<(&Row, f64)>, usize) {
    let mut values = Vec::with_capacity(rows.len());
    let mut skipped = 0;

    for (index, row) in rows.iter().enumerate() {
        match table_row_value(row) {
            Some(value) => values.push((row, value)),
            None => {
                warn!(row = index, "Skipping table row without a numeric value field");
                skipped += 1;
            }
        }
    }

    (values, skipped)
}
