use std::io::{self, Write};

use serde_json::{Map, Value};

use crate::aggregate::SummaryRecord;
use crate::params::ExperimentParameters;
use crate::table::quote_cell;

/// Index written for the experiment-wide aggregate row.
pub const AGGREGATE_INDEX: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Csv,
    /// One JSON object per row; NaN becomes `null`.
    JsonLines,
}

/// One participant (or the aggregate) merged with the experiment parameters.
#[derive(Debug, Clone, Copy)]
pub struct ReportRow<'a> {
    pub index: i64,
    pub params: &'a ExperimentParameters,
    pub summary: &'a SummaryRecord,
}

impl<'a> ReportRow<'a> {
    /// Cell text for a column; unknown columns render empty.
    pub fn cell(&self, column: &str, index_column: &str) -> String {
        if column == index_column {
            return self.index.to_string();
        }
        if let Some(value) = self.summary.get(column) {
            return value.to_string();
        }
        self.params
            .get(column)
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    pub fn project(&self, columns: &[String], index_column: &str) -> Vec<String> {
        columns
            .iter()
            .map(|c| self.cell(c, index_column))
            .collect()
    }

    pub fn to_json(&self, columns: &[String], index_column: &str) -> Value {
        let mut obj = Map::new();
        for column in columns {
            let value = if column == index_column {
                Value::from(self.index)
            } else if let Some(v) = self.summary.get(column) {
                v.to_json()
            } else {
                self.params
                    .get(column)
                    .map(|p| p.to_json())
                    .unwrap_or(Value::Null)
            };
            obj.insert(column.clone(), value);
        }
        Value::Object(obj)
    }
}

/// Writes report rows projected onto a fixed column list.
pub struct ReportWriter<W: Write> {
    out: W,
    columns: Vec<String>,
    index_column: String,
    format: ReportFormat,
    header_written: bool,
}

impl<W: Write> ReportWriter<W> {
    pub fn new<I, S>(out: W, columns: I, index_column: &str, format: ReportFormat) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            out,
            columns: columns.into_iter().map(Into::into).collect(),
            index_column: index_column.to_string(),
            format,
            header_written: false,
        }
    }

    /// Writes the CSV header once; JSON lines carry no header.
    pub fn write_header(&mut self) -> io::Result<()> {
        if self.header_written {
            return Ok(());
        }
        self.header_written = true;
        if self.format == ReportFormat::Csv {
            let line = self
                .columns
                .iter()
                .map(|c| quote_cell(c))
                .collect::<Vec<_>>()
                .join(",");
            writeln!(self.out, "{}", line)?;
        }
        Ok(())
    }

    pub fn write_row(&mut self, row: &ReportRow<'_>) -> io::Result<()> {
        self.write_header()?;
        match self.format {
            ReportFormat::Csv => {
                let cells = row.project(&self.columns, &self.index_column);
                let line = cells
                    .iter()
                    .map(|c| quote_cell(c))
                    .collect::<Vec<_>>()
                    .join(",");
                writeln!(self.out, "{}", line)
            }
            ReportFormat::JsonLines => {
                let value = row.to_json(&self.columns, &self.index_column);
                serde_json::to_writer(&mut self.out, &value)?;
                writeln!(self.out)
            }
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
