//! Reduction of distributed-protocol load test statistics.
//!
//! A results root holds one directory per experiment run, named after its
//! parameters (`p=pbft,f=1,l=8192,b=1024`). Each directory holds one CSV table
//! per participant. Every table is trimmed to the steady-state window, reduced
//! to a per-participant summary, and all summaries are combined into one
//! experiment-level row.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod fields;
pub mod params;
pub mod profile;
pub mod report;
pub mod table;
pub mod window;

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use aggregate::{combine, reduce, SummaryRecord};
pub use config::StatsConfig;
pub use error::{StatsError, StatsResult};
pub use fields::{FieldRegistry, FieldSpec, StatValue, Strategy, ValueKind};
pub use params::{ExperimentParameters, ParamValue, ParameterTable};
pub use profile::{Profile, Variant};
pub use report::{ReportFormat, ReportRow, ReportWriter, AGGREGATE_INDEX};
pub use table::RawSample;

/// Reduced statistics of one experiment directory.
#[derive(Debug, Clone)]
pub struct ExperimentReport {
    pub name: String,
    pub parameters: ExperimentParameters,
    pub participants: Vec<SummaryRecord>,
    pub aggregate: SummaryRecord,
}

impl ExperimentReport {
    /// Participant rows in index order, then the aggregate row.
    pub fn rows(&self) -> Vec<ReportRow<'_>> {
        let mut rows: Vec<ReportRow<'_>> = self
            .participants
            .iter()
            .enumerate()
            .map(|(idx, summary)| ReportRow {
                index: idx as i64,
                params: &self.parameters,
                summary,
            })
            .collect();
        rows.push(ReportRow {
            index: AGGREGATE_INDEX,
            params: &self.parameters,
            summary: &self.aggregate,
        });
        rows
    }
}

pub fn process_experiment(dir: &Path, profile: &Profile) -> StatsResult<ExperimentReport> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let parameters = profile.parameters.decode(&name)?;
    let count = profile.participant_count(&parameters)?;
    let ts_column = profile.timestamp_column()?;

    let mut tables = Vec::new();
    for idx in 0..count {
        let samples = table::read_samples(&dir.join(profile.participant_file(idx)))?;
        let samples = match &profile.load_start {
            Some(detector) => detector.filter(samples)?,
            None => samples,
        };
        tables.push(samples);
    }

    let first = window::first_timestamp(&tables, ts_column)?.ok_or(StatsError::NoSamples)?;
    let duration = parameters.int(params::LOAD_DURATION_SEC)?;
    let window = profile.window.window(first, duration)?;
    debug!(
        experiment = %name,
        participants = count,
        start = window.start,
        end = window.end,
        "computed steady-state window"
    );

    let mut participants = Vec::new();
    for (idx, samples) in tables.into_iter().enumerate() {
        let in_window = window.retain(samples, ts_column)?;
        let summary = reduce(&in_window, &profile.participant)?;
        if summary.samples() == 0 {
            warn!(experiment = %name, participant = idx, "no samples inside the window");
        }
        participants.push(summary);
    }
    let aggregate = combine(&participants, &profile.combined)?;

    Ok(ExperimentReport {
        name,
        parameters,
        participants,
        aggregate,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedExperiment {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub processed: usize,
    pub skipped: Vec<SkippedExperiment>,
}

/// Processes every experiment directory directly under `root` and writes its
/// rows. A directory that fails, or an entry that cannot be read (such as a
/// dangling symlink), is logged and skipped; only write failures and an
/// unreadable root abort the run.
pub fn process_root<W: Write>(
    root: &Path,
    profile: &Profile,
    writer: &mut ReportWriter<W>,
) -> Result<ProcessSummary> {
    writer.write_header()?;
    let mut summary = ProcessSummary::default();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(err.into()),
            Err(err) => {
                let name = err
                    .path()
                    .and_then(Path::file_name)
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                warn!("skipping {} due to {}", name, err);
                summary.skipped.push(SkippedExperiment {
                    name,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        match process_experiment(entry.path(), profile) {
            Ok(report) => {
                for row in report.rows() {
                    writer.write_row(&row)?;
                }
                summary.processed += 1;
            }
            Err(err) => {
                warn!("skipping {} due to {}", name, err);
                summary.skipped.push(SkippedExperiment {
                    name,
                    reason: err.to_string(),
                });
            }
        }
    }
    writer.flush()?;
    info!(
        processed = summary.processed,
        skipped = summary.skipped.len(),
        "finished processing results"
    );
    Ok(summary)
}
