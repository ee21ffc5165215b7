//! Delimited-extract parsing and normalization into canonical records.

use cbase_core::{CellValue, ColumnKind, DataTable, TableSpec};
use thiserror::Error;

pub const CRATE_NAME: &str = "cbase-ingest";

/// Raw tabular extract as delivered by the partner: header-keyed string
/// cells, one `Extract` per webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extract {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Extract {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not valid utf-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("payload has no header line")]
    MissingHeader,
    #[error("malformed delimited payload: {0}")]
    Csv(#[from] csv::Error),
}

/// Pick the field delimiter from the header line. Partner extracts arrive
/// either semicolon- or comma-separated.
pub fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or_default();
    if header.contains(';') {
        b';'
    } else {
        b','
    }
}

/// Parse a downloaded payload into an [`Extract`]. Rows shorter than the
/// header are padded so downstream lookups never index out of bounds.
pub fn parse_extract(bytes: &[u8]) -> Result<Extract, ParseError> {
    let text = std::str::from_utf8(bytes)?;
    if text.trim().is_empty() {
        return Err(ParseError::MissingHeader);
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(text))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() {
        return Err(ParseError::MissingHeader);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row: Vec<String> = record.iter().map(|f| f.to_string()).collect();
        row.resize(headers.len(), String::new());
        rows.push(row);
    }

    Ok(Extract { headers, rows })
}

/// Coerce a locale-formatted decimal. A string carrying both separators is
/// read as thousands-dot/decimal-comma; a lone comma is the decimal point.
/// Anything unparsable coerces to `0.0` -- a bad cell never aborts a run.
pub fn parse_decimal(raw: &str) -> f64 {
    let value = raw.trim();
    if value.is_empty() {
        return 0.0;
    }
    let normalized = if value.contains('.') && value.contains(',') {
        value.replace('.', "").replace(',', ".")
    } else if value.contains(',') {
        value.replace(',', ".")
    } else {
        value.to_string()
    };
    normalized.parse::<f64>().unwrap_or(0.0)
}

/// The literal text "true" in any case is set; everything else is unset.
pub fn parse_flag(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true")
}

/// Normalize a raw extract onto the destination's canonical column set.
///
/// Columns are renamed per the spec's map; output columns are exactly the
/// configured set intersected with what the extract actually carried, in
/// spec order. Unmapped extra columns are dropped, missing ones are simply
/// absent rather than an error. The business-key column is always coerced
/// to text. Pure function over its input.
pub fn normalize(extract: &Extract, spec: &TableSpec) -> DataTable {
    let canonical_headers: Vec<String> = extract
        .headers
        .iter()
        .map(|h| spec.canonical_name(h).to_string())
        .collect();

    let mut columns = Vec::new();
    let mut sources = Vec::new();
    for column in &spec.columns {
        if let Some(idx) = canonical_headers.iter().position(|h| *h == column.name) {
            columns.push(column.name.clone());
            sources.push((idx, column.kind, column.name == spec.key_column));
        }
    }

    let rows = extract
        .rows
        .iter()
        .map(|row| {
            sources
                .iter()
                .map(|(idx, kind, is_key)| {
                    let raw = row.get(*idx).map(String::as_str).unwrap_or_default();
                    if *is_key {
                        return CellValue::Text(raw.trim().to_string());
                    }
                    match kind {
                        ColumnKind::Text => CellValue::Text(raw.trim().to_string()),
                        ColumnKind::Decimal => CellValue::Number(parse_decimal(raw)),
                        ColumnKind::Flag => CellValue::Flag(parse_flag(raw)),
                    }
                })
                .collect()
        })
        .collect();

    DataTable { columns, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbase_core::ColumnSpec;

    fn spec() -> TableSpec {
        TableSpec {
            destination: "client_base".into(),
            key_column: "account_code".into(),
            label_column: Some("advisor".into()),
            measure_column: Some("net_worth".into()),
            columns: vec![
                ColumnSpec::new("account_code", ColumnKind::Text),
                ColumnSpec::new("advisor", ColumnKind::Text),
                ColumnSpec::new("net_worth", ColumnKind::Decimal),
                ColumnSpec::new("qualified_investor", ColumnKind::Flag),
            ],
            renames: vec![
                ("nr_conta".into(), "account_code".into()),
                ("assessor".into(), "advisor".into()),
                ("patrimonio_total".into(), "net_worth".into()),
                ("investidor_qualificado".into(), "qualified_investor".into()),
            ],
        }
    }

    #[test]
    fn decimal_comma_is_decimal_point() {
        assert_eq!(parse_decimal("1000,50"), 1000.50);
        assert_eq!(parse_decimal("0,5"), 0.5);
    }

    #[test]
    fn decimal_both_separators_reads_dot_as_grouping() {
        assert_eq!(parse_decimal("1.234,56"), 1234.56);
        assert_eq!(parse_decimal("12.345.678,90"), 12_345_678.90);
    }

    #[test]
    fn decimal_plain_dot_and_garbage() {
        assert_eq!(parse_decimal("1234.56"), 1234.56);
        assert_eq!(parse_decimal(""), 0.0);
        assert_eq!(parse_decimal("n/a"), 0.0);
    }

    #[test]
    fn flag_only_literal_true_sets() {
        assert!(parse_flag("True"));
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("true"));
        assert!(!parse_flag(""));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("1"));
    }

    #[test]
    fn sniffs_semicolon_then_falls_back_to_comma() {
        assert_eq!(sniff_delimiter("a;b;c\n1;2;3"), b';');
        assert_eq!(sniff_delimiter("a,b,c\n1,2,3"), b',');
    }

    #[test]
    fn parse_pads_short_rows() {
        let extract = parse_extract(b"a;b;c\n1;2\n").unwrap();
        assert_eq!(extract.rows[0], vec!["1", "2", ""]);
    }

    #[test]
    fn parse_rejects_empty_payload() {
        assert!(matches!(
            parse_extract(b"  \n"),
            Err(ParseError::MissingHeader)
        ));
    }

    #[test]
    fn normalize_renames_coerces_and_drops_extras() {
        let extract = parse_extract(
            b"nr_conta;assessor;patrimonio_total;investidor_qualificado;lixo\n\
              12345;Mesa RJ;1.234,56;True;x\n",
        )
        .unwrap();
        let table = normalize(&extract, &spec());
        assert_eq!(
            table.columns,
            vec!["account_code", "advisor", "net_worth", "qualified_investor"]
        );
        assert_eq!(
            table.rows[0],
            vec![
                CellValue::Text("12345".into()),
                CellValue::Text("Mesa RJ".into()),
                CellValue::Number(1234.56),
                CellValue::Flag(true),
            ]
        );
    }

    #[test]
    fn normalize_tolerates_missing_columns() {
        let extract = parse_extract(b"nr_conta,assessor\n77,Mesa SP\n").unwrap();
        let table = normalize(&extract, &spec());
        assert_eq!(table.columns, vec!["account_code", "advisor"]);
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn normalize_keeps_numeric_keys_textual() {
        let extract = parse_extract(b"nr_conta;patrimonio_total\n00123;10\n").unwrap();
        let table = normalize(&extract, &spec());
        assert_eq!(
            table.cell(0, "account_code"),
            Some(&CellValue::Text("00123".into()))
        );
    }
}
