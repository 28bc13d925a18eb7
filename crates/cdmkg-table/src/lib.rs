//! cdmkg Table - Persisted triple result table
//!
//! The result table is the single source of truth shared by extraction,
//! manual annotation and evaluation. It is stored as CSV with the header
//! `row_id,segment_id,subject,predicate,object,good,source_text,char_start,char_end,alignment`.
//! Columns added by hand after those are carried through every rewrite.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cdmkg_core::{Alignment, KgError, Result, RowFilter, TripleRow};
use serde::Deserialize;

pub mod aggregator;
pub mod annotation;

pub use aggregator::{Aggregator, Manifest};
pub use annotation::{AnnotationSummary, LabelCounts};

/// Column order of the persisted table
pub const HEADER: [&str; 10] = [
    "row_id",
    "segment_id",
    "subject",
    "predicate",
    "object",
    "good",
    "source_text",
    "char_start",
    "char_end",
    "alignment",
];

// ============================================================================
// Good Column
// ============================================================================

/// Parse a `good` cell; empty means not yet annotated
pub fn parse_good(cell: &str) -> Result<Option<bool>> {
    match cell.trim().to_lowercase().as_str() {
        "" => Ok(None),
        "true" | "1" | "yes" | "y" => Ok(Some(true)),
        "false" | "0" | "no" | "n" => Ok(Some(false)),
        other => Err(KgError::MalformedResultTable(format!(
            "invalid good value: {other:?}"
        ))),
    }
}

pub fn format_good(good: Option<bool>) -> &'static str {
    match good {
        None => "",
        Some(true) => "true",
        Some(false) => "false",
    }
}

/// On-disk record; `good` is kept as text so every accepted spelling parses
#[derive(Debug, Deserialize)]
struct CsvRecord {
    row_id: u64,
    segment_id: usize,
    subject: String,
    predicate: String,
    object: String,
    #[serde(default)]
    good: String,
    #[serde(default)]
    source_text: String,
    #[serde(default)]
    char_start: Option<usize>,
    #[serde(default)]
    char_end: Option<usize>,
    #[serde(default)]
    alignment: String,
}

impl CsvRecord {
    fn into_row(self) -> Result<TripleRow> {
        let row_id = self.row_id;
        let in_row = |e: KgError| match e {
            KgError::MalformedResultTable(msg) => {
                KgError::MalformedResultTable(format!("row {row_id}: {msg}"))
            }
            other => other,
        };

        let good = parse_good(&self.good).map_err(in_row)?;
        let alignment: Alignment = self.alignment.parse().map_err(in_row)?;
        Ok(TripleRow {
            row_id,
            segment_id: self.segment_id,
            subject: self.subject,
            predicate: self.predicate,
            object: self.object,
            good,
            source_text: self.source_text,
            char_start: self.char_start,
            char_end: self.char_end,
            alignment,
        })
    }
}

fn format_offset(offset: Option<usize>) -> String {
    offset.map(|o| o.to_string()).unwrap_or_default()
}

/// Cells of `row` in `HEADER` order
fn row_cells(row: &TripleRow) -> Vec<String> {
    vec![
        row.row_id.to_string(),
        row.segment_id.to_string(),
        row.subject.clone(),
        row.predicate.clone(),
        row.object.clone(),
        format_good(row.good).to_string(),
        row.source_text.clone(),
        format_offset(row.char_start),
        format_offset(row.char_end),
        row.alignment.to_string(),
    ]
}

// ============================================================================
// Result Table
// ============================================================================

/// Ordered rows with unique, strictly increasing row ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultTable {
    rows: Vec<TripleRow>,

    /// Names of columns outside `HEADER`, in file order
    extra_columns: Vec<String>,

    /// Values of the extra columns, by row id
    extra_values: BTreeMap<u64, Vec<String>>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table, rejecting duplicate or out-of-order row ids
    pub fn from_rows(rows: Vec<TripleRow>) -> Result<Self> {
        for pair in rows.windows(2) {
            if pair[1].row_id == pair[0].row_id {
                return Err(KgError::MalformedResultTable(format!(
                    "duplicate row id {}",
                    pair[1].row_id
                )));
            }
            if pair[1].row_id < pair[0].row_id {
                return Err(KgError::MalformedResultTable(format!(
                    "row id {} follows {}",
                    pair[1].row_id, pair[0].row_id
                )));
            }
        }
        Ok(Self {
            rows,
            ..Self::default()
        })
    }

    /// Read a table from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KgError::MalformedResultTable(format!(
                "table not found: {}",
                path.display()
            )),
            _ => KgError::io(path, e),
        })?;
        Self::from_reader(file)
    }

    /// Read a table from any CSV source
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::None)
            .from_reader(reader);

        let headers = reader
            .headers()
            .map_err(|e| KgError::MalformedResultTable(format!("header: {e}")))?
            .clone();
        let extra_indices: Vec<usize> = headers
            .iter()
            .enumerate()
            .filter(|(_, name)| !HEADER.contains(name))
            .map(|(i, _)| i)
            .collect();

        let mut rows = Vec::new();
        let mut extra_values = BTreeMap::new();
        for (line, record) in reader.records().enumerate() {
            let malformed =
                |e: csv::Error| KgError::MalformedResultTable(format!("record {}: {e}", line + 1));
            let record = record.map_err(malformed)?;
            let row = record
                .deserialize::<CsvRecord>(Some(&headers))
                .map_err(malformed)?
                .into_row()?;

            if !extra_indices.is_empty() {
                let values = extra_indices
                    .iter()
                    .map(|&i| record.get(i).unwrap_or_default().to_string())
                    .collect();
                extra_values.insert(row.row_id, values);
            }
            rows.push(row);
        }

        let mut table = Self::from_rows(rows)?;
        table.extra_columns = extra_indices.iter().map(|&i| headers[i].to_string()).collect();
        table.extra_values = extra_values;
        tracing::debug!(
            rows = table.len(),
            extra_columns = table.extra_columns.len(),
            "Result table loaded"
        );
        Ok(table)
    }

    /// Write the table atomically (temporary file, then rename)
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write_atomic(path, &self.to_csv()?)?;
        tracing::debug!(path = %path.display(), rows = self.len(), "Result table saved");
        Ok(())
    }

    /// Render the table as CSV bytes, header included
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());

        writer
            .write_record(HEADER.iter().copied().chain(self.extra_columns.iter().map(String::as_str)))
            .map_err(csv_error)?;
        for row in &self.rows {
            let mut cells = row_cells(row);
            let extras = self.extra_values.get(&row.row_id);
            cells.extend((0..self.extra_columns.len()).map(|i| {
                extras
                    .and_then(|values| values.get(i))
                    .cloned()
                    .unwrap_or_default()
            }));
            writer.write_record(&cells).map_err(csv_error)?;
        }
        writer
            .into_inner()
            .map_err(|e| KgError::Other(e.into_error().into()))
    }

    pub fn rows(&self) -> &[TripleRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Find a row by id
    pub fn get(&self, row_id: u64) -> Option<&TripleRow> {
        self.position(row_id).map(|i| &self.rows[i])
    }

    pub(crate) fn position(&self, row_id: u64) -> Option<usize> {
        self.rows.binary_search_by_key(&row_id, |r| r.row_id).ok()
    }

    pub(crate) fn rows_mut(&mut self) -> &mut Vec<TripleRow> {
        &mut self.rows
    }

    /// Drop every row of `segment_id`, returning how many were removed
    pub(crate) fn remove_segment(&mut self, segment_id: usize) -> usize {
        let before = self.rows.len();
        let extra_values = &mut self.extra_values;
        self.rows.retain(|row| {
            let keep = row.segment_id != segment_id;
            if !keep {
                extra_values.remove(&row.row_id);
            }
            keep
        });
        before - self.rows.len()
    }

    /// Hand-added columns carried alongside the fixed header
    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    /// Value of a hand-added column for one row
    pub fn extra_value(&self, row_id: u64, column: &str) -> Option<&str> {
        let index = self.extra_columns.iter().position(|c| c == column)?;
        self.extra_values
            .get(&row_id)
            .and_then(|values| values.get(index))
            .map(String::as_str)
    }

    /// Largest row id in the table
    pub fn max_row_id(&self) -> Option<u64> {
        self.rows.last().map(|r| r.row_id)
    }

    pub fn rows_for_segment(&self, segment_id: usize) -> impl Iterator<Item = &TripleRow> {
        self.rows.iter().filter(move |r| r.segment_id == segment_id)
    }

    /// Rows eligible for retrieval under `filter`, in table order
    pub fn select(&self, filter: RowFilter) -> Vec<&TripleRow> {
        self.rows
            .iter()
            .filter(|r| match filter {
                RowFilter::All => true,
                RowFilter::GoodOnly => r.good == Some(true),
            })
            .collect()
    }
}

fn csv_error(e: csv::Error) -> KgError {
    KgError::Other(e.into())
}

/// Replace `path` with `contents` via a sibling temporary file
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| KgError::io(parent, e))?;
    }

    let tmp = tmp_path(path);
    std::fs::write(&tmp, contents).map_err(|e| KgError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| KgError::io(path, e))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(row_id: u64, segment_id: usize, good: Option<bool>) -> TripleRow {
        TripleRow {
            row_id,
            segment_id,
            subject: format!("step {row_id}"),
            predicate: "hasNext".to_string(),
            object: format!("step {}", row_id + 1),
            good,
            source_text: String::new(),
            char_start: None,
            char_end: None,
            alignment: Default::default(),
        }
    }

    #[test]
    fn test_parse_good_spellings() {
        assert_eq!(parse_good("").unwrap(), None);
        assert_eq!(parse_good("  ").unwrap(), None);
        for yes in ["true", "TRUE", "1", "yes", "Y"] {
            assert_eq!(parse_good(yes).unwrap(), Some(true), "{yes}");
        }
        for no in ["false", "False", "0", "no", "n"] {
            assert_eq!(parse_good(no).unwrap(), Some(false), "{no}");
        }
        assert!(matches!(
            parse_good("maybe"),
            Err(KgError::MalformedResultTable(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triples.csv");

        let mut first = row(0, 0, Some(true));
        first.subject = "Update TOBT, TTOT".to_string();
        first.source_text = "quoted \"text\"".to_string();
        first.char_start = Some(14);
        first.char_end = Some(27);
        first.alignment = Alignment::Fuzzy;
        let table = ResultTable::from_rows(vec![first, row(1, 0, None), row(4, 2, Some(false))])
            .unwrap();

        table.save(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(
            "row_id,segment_id,subject,predicate,object,good,source_text,char_start,char_end,alignment\n"
        ));
        assert!(!dir.path().join("triples.csv.tmp").exists());

        assert_eq!(ResultTable::load(&path).unwrap(), table);
    }

    #[test]
    fn test_load_hand_edited_annotations() {
        let csv = "row_id,segment_id,subject,predicate,object,good,source_text\n\
                   0,0,a,hasNext,b,Yes,\n\
                   1,0,b,hasNext,c,n,\n\
                   2,1,c,hasStakeholder,ATC,,\n";
        let table = ResultTable::from_reader(csv.as_bytes()).unwrap();
        let labels: Vec<_> = table.rows().iter().map(|r| r.good).collect();
        assert_eq!(labels, vec![Some(true), Some(false), None]);
    }

    #[test]
    fn test_source_text_column_optional() {
        let csv = "row_id,segment_id,subject,predicate,object,good\n0,0,a,hasNext,b,\n";
        let table = ResultTable::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(table.rows()[0].source_text, "");
        assert_eq!(table.rows()[0].char_start, None);
        assert_eq!(table.rows()[0].alignment, Alignment::Unaligned);
        assert!(table.extra_columns().is_empty());
    }

    #[test]
    fn test_hand_added_columns_survive_annotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triples.csv");
        std::fs::write(
            &path,
            "row_id,segment_id,subject,predicate,object,good,source_text,reviewer_note\n\
             0,0,Plane in-block observed,hasStakeholder,ATC,,,check with ATC\n\
             1,0,ACARS status set to IN,hasStakeholder,Airline,,,\n",
        )
        .unwrap();

        let mut table = ResultTable::load(&path).unwrap();
        assert_eq!(table.extra_columns(), ["reviewer_note".to_string()]);
        table.annotate(1, true).unwrap();
        table.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(
            "row_id,segment_id,subject,predicate,object,good,source_text,\
             char_start,char_end,alignment,reviewer_note\n"
        ));

        let reloaded = ResultTable::load(&path).unwrap();
        assert_eq!(reloaded.extra_value(0, "reviewer_note"), Some("check with ATC"));
        assert_eq!(reloaded.extra_value(1, "reviewer_note"), Some(""));
        assert_eq!(reloaded.get(1).unwrap().good, Some(true));
    }

    #[test]
    fn test_remove_segment_drops_extra_values() {
        let csv = "row_id,segment_id,subject,predicate,object,good,note\n\
                   0,0,a,hasNext,b,,first\n\
                   1,1,b,hasNext,c,,second\n";
        let mut table = ResultTable::from_reader(csv.as_bytes()).unwrap();

        assert_eq!(table.remove_segment(0), 1);
        assert_eq!(table.extra_value(0, "note"), None);
        assert_eq!(table.extra_value(1, "note"), Some("second"));

        let rendered = String::from_utf8(table.to_csv().unwrap()).unwrap();
        assert!(rendered.ends_with("1,1,b,hasNext,c,,,,,unaligned,second\n"));
    }

    #[test]
    fn test_load_rejects_malformed() {
        let cases = [
            // duplicate id
            "row_id,segment_id,subject,predicate,object,good\n0,0,a,p,b,\n0,0,c,p,d,\n",
            // decreasing id
            "row_id,segment_id,subject,predicate,object,good\n3,0,a,p,b,\n1,0,c,p,d,\n",
            // bad good value
            "row_id,segment_id,subject,predicate,object,good\n0,0,a,p,b,perhaps\n",
            // bad alignment value
            "row_id,segment_id,subject,predicate,object,good,alignment\n0,0,a,p,b,,close\n",
            // non-numeric id
            "row_id,segment_id,subject,predicate,object,good\nx,0,a,p,b,\n",
            // missing column
            "row_id,segment_id,subject,object\n0,0,a,b\n",
        ];
        for csv in cases {
            let err = ResultTable::from_reader(csv.as_bytes()).unwrap_err();
            assert!(matches!(err, KgError::MalformedResultTable(_)), "{csv}: {err:?}");
        }
    }

    #[test]
    fn test_missing_table() {
        let err = ResultTable::load("/nonexistent/triples.csv").unwrap_err();
        assert!(matches!(err, KgError::MalformedResultTable(_)));
    }

    #[test]
    fn test_select_good_only() {
        let table = ResultTable::from_rows(vec![
            row(0, 0, Some(true)),
            row(1, 0, Some(false)),
            row(2, 1, None),
            row(3, 1, Some(true)),
        ])
        .unwrap();

        let good: Vec<u64> = table.select(RowFilter::GoodOnly).iter().map(|r| r.row_id).collect();
        assert_eq!(good, vec![0, 3]);
        assert_eq!(table.select(RowFilter::All).len(), 4);
        assert_eq!(table.get(3).unwrap().segment_id, 1);
        assert!(table.get(5).is_none());
    }
}
