//! The result table: one row per document, one column per query.

use serde::{Serializer, ser::SerializeMap as _};

use crate::prelude::*;

/// The value of a field no page could answer.
pub const NOT_FOUND: &str = "Not Found";

/// The name of the first column.
pub const FILENAME_COLUMN: &str = "Filename";

/// Query alias to value, in query declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
}

impl FieldMap {
    /// Build a field map from `(alias, value)` pairs, keeping their order.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Look up the value for an alias.
    pub fn get(&self, alias: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(a, _)| a == alias)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over `(alias, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(a, v)| (a.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The fields extracted from one uploaded document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentResult {
    pub filename: String,
    pub fields: FieldMap,
}

/// Serialized as a flat object: `Filename` first, then each alias in order.
impl Serialize for DocumentResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry(FILENAME_COLUMN, &self.filename)?;
        for (alias, value) in self.fields.iter() {
            map.serialize_entry(alias, value)?;
        }
        map.end()
    }
}

/// All document results, in upload order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultTable {
    columns: Vec<String>,
    rows: Vec<DocumentResult>,
}

impl ResultTable {
    /// Create an empty table with `Filename` plus the given aliases as columns.
    pub fn new<'a>(aliases: impl IntoIterator<Item = &'a str>) -> Self {
        let columns = std::iter::once(FILENAME_COLUMN)
            .chain(aliases)
            .map(str::to_owned)
            .collect();
        Self {
            columns,
            rows: vec![],
        }
    }

    /// Append a row.
    pub fn push(&mut self, row: DocumentResult) {
        self.rows.push(row);
    }

    /// Column names, starting with `Filename`.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[DocumentResult] {
        &self.rows
    }

    /// Render the table as CSV, with a header row.
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record(self.columns())
            .context("failed to write CSV header")?;
        for row in &self.rows {
            let values = self.columns[1..]
                .iter()
                .map(|alias| row.fields.get(alias).unwrap_or(NOT_FOUND));
            wtr.write_record(std::iter::once(row.filename.as_str()).chain(values))
                .with_context(|| format!("failed to write CSV row for {:?}", row.filename))?;
        }
        wtr.into_inner().context("failed to flush CSV output")
    }

    /// Render the table as JSON Lines, one object per row.
    pub fn to_jsonl(&self) -> Result<Vec<u8>> {
        let mut out = vec![];
        for row in &self.rows {
            serde_json::to_writer(&mut out, row)
                .with_context(|| format!("failed to serialize row for {:?}", row.filename))?;
            out.push(b'\n');
        }
        Ok(out)
    }
}
