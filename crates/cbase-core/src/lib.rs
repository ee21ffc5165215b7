//! Core domain model for the client-base reconciliation service.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cbase-core";

/// One cell of a tabular dataset. Kinds map 1:1 onto the destination
/// column types the batch writer creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Flag(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Null,
}

impl CellValue {
    /// Render the cell as the string used for business-key comparison.
    pub fn as_key(&self) -> String {
        match self {
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) => n.to_string(),
            CellValue::Flag(b) => b.to_string(),
            CellValue::Date(d) => d.to_string(),
            CellValue::Timestamp(t) => t.to_rfc3339(),
            CellValue::Null => String::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// Ordered columns plus rows of cells. The column count, not a fixed
/// schema, drives bind-parameter batch sizing downstream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl DataTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&CellValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Re-shape the table onto `columns`, in that order. Columns the table
    /// does not carry come back as `Null`; extra columns are dropped.
    pub fn conform(&self, columns: &[String]) -> DataTable {
        let indices: Vec<Option<usize>> =
            columns.iter().map(|c| self.column_index(c)).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|idx| match idx {
                        Some(i) => row.get(*i).cloned().unwrap_or(CellValue::Null),
                        None => CellValue::Null,
                    })
                    .collect()
            })
            .collect();
        DataTable {
            columns: columns.to_vec(),
            rows,
        }
    }

    /// Append a column with one cell per existing row.
    pub fn push_column(&mut self, name: impl Into<String>, cells: Vec<CellValue>) {
        debug_assert_eq!(cells.len(), self.rows.len());
        self.columns.push(name.into());
        for (row, cell) in self.rows.iter_mut().zip(cells) {
            row.push(cell);
        }
    }
}

/// Semantic kind of a destination column; coercion in the normalizer and
/// SQL typing in the batch writer both key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Text,
    Decimal,
    Flag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Fixed, per-report destination description: canonical column set, the
/// partner-header rename map, and the business-key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub destination: String,
    pub key_column: String,
    /// Column the advisor-correction rules rewrite, when the report has one.
    pub label_column: Option<String>,
    /// Headline measure carried into the historical snapshot.
    pub measure_column: Option<String>,
    pub columns: Vec<ColumnSpec>,
    pub renames: Vec<(String, String)>,
}

impl TableSpec {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn kind_of(&self, name: &str) -> Option<ColumnKind> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.kind)
    }

    pub fn canonical_name<'a>(&'a self, raw: &'a str) -> &'a str {
        self.renames
            .iter()
            .find(|(from, _)| from == raw)
            .map(|(_, to)| to.as_str())
            .unwrap_or(raw)
    }
}

/// How an advisor-correction rule matches the label column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Contains,
}

/// One declarative label correction. Rules apply in declaration order and
/// are not mutually exclusive: a later rule may overwrite an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisorRule {
    #[serde(rename = "match")]
    pub match_kind: MatchKind,
    pub pattern: String,
    pub replacement: String,
}

impl AdvisorRule {
    pub fn applies_to(&self, label: &str) -> bool {
        match self.match_kind {
            MatchKind::Exact => label == self.pattern,
            MatchKind::Contains => label.contains(&self.pattern),
        }
    }
}

/// Terminal status of one pipeline run, mirrored into the audit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Warning,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Warning => "warning",
            RunStatus::Error => "error",
        }
    }
}

/// The single structured result every pipeline invocation returns.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub rows: u64,
    pub message: String,
}

impl RunOutcome {
    pub fn success(run_id: Uuid, rows: u64, message: impl Into<String>) -> Self {
        Self {
            run_id,
            status: RunStatus::Success,
            rows,
            message: message.into(),
        }
    }

    pub fn warning(run_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            run_id,
            status: RunStatus::Warning,
            rows: 0,
            message: message.into(),
        }
    }

    pub fn error(run_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            run_id,
            status: RunStatus::Error,
            rows: 0,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conform_reorders_and_nulls_missing_columns() {
        let table = DataTable {
            columns: vec!["b".into(), "a".into()],
            rows: vec![vec![
                CellValue::Number(2.0),
                CellValue::Text("one".into()),
            ]],
        };
        let conformed = table.conform(&["a".into(), "b".into(), "c".into()]);
        assert_eq!(conformed.columns, vec!["a", "b", "c"]);
        assert_eq!(
            conformed.rows[0],
            vec![
                CellValue::Text("one".into()),
                CellValue::Number(2.0),
                CellValue::Null,
            ]
        );
    }

    #[test]
    fn advisor_rules_match_exact_and_contains() {
        let exact = AdvisorRule {
            match_kind: MatchKind::Exact,
            pattern: "A. Moreira".into(),
            replacement: "Alexandre Moreira".into(),
        };
        assert!(exact.applies_to("A. Moreira"));
        assert!(!exact.applies_to("A. Moreira Jr"));

        let contains = AdvisorRule {
            match_kind: MatchKind::Contains,
            pattern: "Mesa".into(),
            replacement: "Mesa Institucional".into(),
        };
        assert!(contains.applies_to("Mesa RJ"));
        assert!(!contains.applies_to("Institucional"));
    }

    #[test]
    fn key_rendering_covers_all_cell_kinds() {
        assert_eq!(CellValue::Text("123".into()).as_key(), "123");
        assert_eq!(CellValue::Number(42.0).as_key(), "42");
        assert_eq!(CellValue::Null.as_key(), "");
    }
}
