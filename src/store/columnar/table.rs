use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::row::SummaryRow;
use crate::model::AggregationKey;

pub const TABLE_FORMAT: &str = "evalstore-columnar";
pub const TABLE_VERSION: u32 = 1;

/// On-disk, column-major layout of a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableFile {
    format: String,
    version: u32,
    row_count: usize,
    columns: BTreeMap<String, Vec<Value>>,
    /// Side files already folded into this table.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    ingested: BTreeSet<String>,
}

/// A columnar table held row-wise in memory, one row per key.
///
/// Serialized column-major; a file that cannot be pivoted back into rows fails to
/// deserialize, which the loader treats as corruption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TableFile", into = "TableFile")]
pub struct Table {
    rows: BTreeMap<AggregationKey, SummaryRow>,
    ingested: BTreeSet<String>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = SummaryRow>) -> Self {
        let mut table = Self::new();
        for row in rows {
            table.merge_row(row);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &AggregationKey) -> Option<&SummaryRow> {
        self.rows.get(key)
    }

    pub fn rows(&self) -> impl Iterator<Item = &SummaryRow> {
        self.rows.values()
    }

    pub fn into_rows(self) -> impl Iterator<Item = SummaryRow> {
        self.rows.into_values()
    }

    /// Inserts an absent key or adds into the existing row.
    pub fn merge_row(&mut self, row: SummaryRow) {
        match self.rows.get_mut(&row.key) {
            Some(existing) => existing.absorb(&row),
            None => {
                self.rows.insert(row.key.clone(), row);
            }
        }
    }

    /// Folds another table's rows in, dropping their producer marker.
    pub fn merge_table(&mut self, other: Table) {
        for mut row in other.into_rows() {
            row.producer_pid = None;
            self.merge_row(row);
        }
    }

    pub fn is_ingested(&self, name: &str) -> bool {
        self.ingested.contains(name)
    }

    pub fn mark_ingested(&mut self, name: impl Into<String>) {
        self.ingested.insert(name.into());
    }

    /// Forgets ingested names that no longer exist on disk.
    pub fn retain_ingested(&mut self, mut exists: impl FnMut(&str) -> bool) {
        self.ingested.retain(|name| exists(name));
    }
}

impl From<Table> for TableFile {
    fn from(table: Table) -> Self {
        let row_count = table.rows.len();
        let values: Vec<Map<String, Value>> = table
            .rows
            .into_values()
            .map(|row| match serde_json::to_value(row) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            })
            .collect();

        let names: BTreeSet<&String> = values.iter().flat_map(|m| m.keys()).collect();
        let mut columns: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for name in names {
            let column = values
                .iter()
                .map(|m| m.get(name).cloned().unwrap_or(Value::Null))
                .collect();
            columns.insert(name.clone(), column);
        }

        Self {
            format: TABLE_FORMAT.to_string(),
            version: TABLE_VERSION,
            row_count,
            columns,
            ingested: table.ingested,
        }
    }
}

impl TryFrom<TableFile> for Table {
    type Error = String;

    fn try_from(file: TableFile) -> Result<Self, Self::Error> {
        if file.format != TABLE_FORMAT {
            return Err(format!("unexpected table format {:?}", file.format));
        }
        if file.version > TABLE_VERSION {
            return Err(format!("unsupported table version {}", file.version));
        }
        for (name, column) in &file.columns {
            if column.len() != file.row_count {
                return Err(format!(
                    "column {name} has {} values, expected {}",
                    column.len(),
                    file.row_count
                ));
            }
        }

        let mut table = Table {
            rows: BTreeMap::new(),
            ingested: file.ingested,
        };
        for i in 0..file.row_count {
            let mut object = Map::new();
            for (name, column) in &file.columns {
                if !column[i].is_null() {
                    object.insert(name.clone(), column[i].clone());
                }
            }
            let row: SummaryRow = serde_json::from_value(Value::Object(object))
                .map_err(|e| format!("row {i}: {e}"))?;
            table.merge_row(row);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OutcomeRecord, ToolReliability};
    use crate::store::columnar::accumulator::Accumulator;
    use chrono::Utc;

    fn row(model: &str, n: usize) -> SummaryRow {
        let mut acc = Accumulator::new();
        for i in 0..n {
            acc.record(
                &OutcomeRecord {
                    model: model.into(),
                    success: i % 2 == 0,
                    duration_secs: 2.0,
                    overall_score: (i == 0).then_some(0.75),
                    ..Default::default()
                },
                None,
            );
        }
        SummaryRow::from_accumulator(
            AggregationKey {
                model: model.into(),
                prompt_variant: "baseline".into(),
                tool_reliability: ToolReliability::from_f64(0.9),
                difficulty: "easy".into(),
                task_type: "search".into(),
            },
            &acc,
            Utc::now(),
        )
    }

    #[test]
    fn test_file_is_column_major() {
        let table = Table::from_rows([row("a", 2), row("b", 3)]);
        let json = serde_json::to_value(&table).expect("serialize");

        assert_eq!(json["format"], TABLE_FORMAT);
        assert_eq!(json["rowCount"], 2);
        assert_eq!(json["columns"]["model"], serde_json::json!(["a", "b"]));
        assert_eq!(json["columns"]["total"], serde_json::json!([2, 3]));
        assert_eq!(json["columns"]["toolReliability"], serde_json::json!([0.9, 0.9]));
        assert!(json["columns"].get("lastUpdated").is_some());
        assert!(json.get("ingested").is_none());
    }

    #[test]
    fn test_pivot_back_to_rows() {
        let mut table = Table::from_rows([row("a", 2), row("b", 3)]);
        table.mark_ingested("incremental_1_2.json");
        let text = serde_json::to_string(&table).expect("serialize");
        let back: Table = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back.len(), 2);
        assert!(back.is_ingested("incremental_1_2.json"));
        let a = back.rows().next().expect("row a");
        assert_eq!(a.key.model, "a");
        assert_eq!(a.stats.total, 2);
        assert_eq!(a.stats.means.overall_score_samples, 1);
    }

    #[test]
    fn test_duplicate_keys_merge_additively() {
        let table = Table::from_rows([row("a", 2), row("a", 4)]);
        assert_eq!(table.len(), 1);
        let merged = table.rows().next().expect("row");
        assert_eq!(merged.stats.total, 6);
        assert!(merged.stats.is_conserved());
    }

    #[test]
    fn test_structural_errors_fail_to_parse() {
        let ragged = serde_json::json!({
            "format": TABLE_FORMAT,
            "version": 1,
            "rowCount": 2,
            "columns": {"model": ["a"]},
        });
        assert!(serde_json::from_value::<Table>(ragged).is_err());

        let foreign = serde_json::json!({
            "format": "parquet",
            "version": 1,
            "rowCount": 0,
            "columns": {},
        });
        assert!(serde_json::from_value::<Table>(foreign).is_err());
    }

    #[test]
    fn test_empty_table_round_trip() {
        let text = serde_json::to_string(&Table::new()).expect("serialize");
        let back: Table = serde_json::from_str(&text).expect("deserialize");
        assert!(back.is_empty());
    }
}
