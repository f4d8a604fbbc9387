use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::StatsResult;

/// One row of a participant's statistics table, keyed by column header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawSample {
    line: usize,
    fields: BTreeMap<String, String>,
}

impl RawSample {
    pub fn new(line: usize) -> Self {
        Self {
            line,
            fields: BTreeMap::new(),
        }
    }

    pub fn from_pairs<I, K, V>(line: usize, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            line,
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    /// 1-based line of the source table this sample was read from.
    pub fn line(&self) -> usize {
        self.line
    }
}

/// Reads a whole participant table. The file handle is released before returning.
pub fn read_samples(path: &Path) -> StatsResult<Vec<RawSample>> {
    let file = File::open(path)?;
    parse_samples(BufReader::new(file))
}

/// Parses header-delimited comma separated text. Rows shorter than the header
/// simply lack the trailing columns; cells beyond the header are dropped.
pub fn parse_samples<R: BufRead>(reader: R) -> StatsResult<Vec<RawSample>> {
    let mut header: Option<Vec<String>> = None;
    let mut samples = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let cells = split_record(line);
        match header.as_ref() {
            None => header = Some(cells),
            Some(columns) => {
                let mut sample = RawSample::new(idx + 1);
                for (column, cell) in columns.iter().zip(cells) {
                    sample.insert(column.clone(), cell);
                }
                samples.push(sample);
            }
        }
    }
    Ok(samples)
}

/// Splits one record, honouring double-quoted cells with `""` escapes.
pub fn split_record(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    cell.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' if cell.is_empty() => quoted = true,
            ',' if !quoted => cells.push(std::mem::take(&mut cell)),
            _ => cell.push(c),
        }
    }
    cells.push(cell);
    cells
}

pub fn quote_cell(cell: &str) -> Cow<'_, str> {
    if cell.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", cell.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(cell)
    }
}
