//! Flattened task rows, trace files, and trace-vs-trace equivalence.
//!
//! A replay's output is a list of [`TraceRow`]s in a fixed column order. Two replays
//! of the same input are expected to schedule identically *relative to their own
//! start*, so [`equivalent`] normalizes each trace by its minimum submit time before
//! comparing per-job submit and start offsets.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::error::Result;
use crate::error::TraceCsvSnafu;
use crate::error::TraceIoSnafu;
use crate::types::TaskRecord;

/// Column names, in file order.
pub const TRACE_COLUMNS: [&str; 17] = [
    "job_id",
    "instance_id",
    "group_id",
    "submit_time_ms",
    "start_time_ms",
    "end_time_ms",
    "expected_run_time_ms",
    "run_time_ms",
    "hostname",
    "slave_id",
    "status",
    "reason",
    "user",
    "mem",
    "cpus",
    "gpus",
    "name",
];

/// One task instance flattened with its job and group.
///
/// Field order matches [`TRACE_COLUMNS`]. Absent resource amounts are `-1`; absent
/// names, reasons and groups are empty strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRow {
    pub job_id: String,
    pub instance_id: String,
    pub group_id: String,
    pub submit_time_ms: u64,
    pub start_time_ms: u64,
    pub end_time_ms: Option<u64>,
    pub expected_run_time_ms: Option<u64>,
    pub run_time_ms: Option<u64>,
    pub hostname: String,
    pub slave_id: String,
    pub status: String,
    pub reason: String,
    pub user: String,
    pub mem: f64,
    pub cpus: f64,
    pub gpus: f64,
    pub name: String,
}

const ABSENT_RESOURCE: f64 = -1.0;

/// Flatten a task record into a row.
pub fn to_row(record: &TaskRecord) -> TraceRow {
    let job = &record.job;
    let instance = &record.instance;
    TraceRow {
        job_id: job.id.clone(),
        instance_id: instance.task_id.clone(),
        group_id: job.group.clone().unwrap_or_default(),
        submit_time_ms: job.submit_time_ms,
        start_time_ms: instance.start_time_ms,
        end_time_ms: instance.end_time_ms,
        expected_run_time_ms: job.expected_runtime_ms,
        run_time_ms: job.sim_run_time_ms(),
        hostname: instance.hostname.clone(),
        slave_id: instance.slave_id.clone(),
        status: instance.status.as_str().to_string(),
        reason: instance.reason.clone().unwrap_or_default(),
        user: job.user.clone(),
        mem: job.resources.mem,
        cpus: job.resources.cpus,
        gpus: job.resources.gpus.unwrap_or(ABSENT_RESOURCE),
        name: job.name.clone().unwrap_or_default(),
    }
}

/// Flatten many records, ordered by job id then start time for stable output.
pub fn to_rows(records: &[TaskRecord]) -> Vec<TraceRow> {
    let mut rows: Vec<TraceRow> = records.iter().map(to_row).collect();
    rows.sort_by(|a, b| {
        a.job_id
            .cmp(&b.job_id)
            .then(a.start_time_ms.cmp(&b.start_time_ms))
            .then_with(|| a.instance_id.cmp(&b.instance_id))
    });
    rows
}

// ============================================================================
// Trace files
// ============================================================================

/// Write `rows` to `path`, replacing any existing file. Always writes the header.
pub fn write_rows(path: &Path, rows: &[TraceRow]) -> Result<()> {
    let file = File::create(path).context(TraceIoSnafu { path })?;
    write_to(path, file, rows, true)
}

/// Append `rows` to `path`, creating it if needed.
///
/// The header is written only when the file is new or empty, so repeated appends build
/// one well-formed file. Returns the number of rows written.
pub fn append_rows(path: &Path, rows: &[TraceRow]) -> Result<usize> {
    let file = OpenOptions::new().create(true).append(true).open(path).context(TraceIoSnafu { path })?;
    let is_empty = file.metadata().context(TraceIoSnafu { path })?.len() == 0;
    if rows.is_empty() && !is_empty {
        return Ok(0);
    }
    write_to(path, file, rows, is_empty)?;
    Ok(rows.len())
}

fn write_to(path: &Path, file: File, rows: &[TraceRow], header: bool) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if header {
        writer.write_record(TRACE_COLUMNS).context(TraceCsvSnafu { path })?;
    }
    for row in rows {
        writer.serialize(row).context(TraceCsvSnafu { path })?;
    }
    writer.flush().context(TraceIoSnafu { path })?;
    Ok(())
}

/// Read rows previously written by [`write_rows`] or [`append_rows`].
pub fn read_rows(path: &Path) -> Result<Vec<TraceRow>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path).context(TraceCsvSnafu { path })?;
    reader
        .deserialize()
        .collect::<std::result::Result<Vec<TraceRow>, csv::Error>>()
        .context(TraceCsvSnafu { path })
}

// ============================================================================
// Equivalence
// ============================================================================

/// Subtract the trace's minimum submit time from every submit, start and end time.
pub fn normalize_rows(rows: &[TraceRow]) -> Vec<TraceRow> {
    let base = rows.iter().map(|r| r.submit_time_ms).min().unwrap_or(0);
    rows.iter()
        .map(|row| TraceRow {
            submit_time_ms: row.submit_time_ms.saturating_sub(base),
            start_time_ms: row.start_time_ms.saturating_sub(base),
            end_time_ms: row.end_time_ms.map(|t| t.saturating_sub(base)),
            ..row.clone()
        })
        .collect()
}

/// A job reduced to the parts that must match between equivalent traces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducedJob {
    /// Job id.
    pub job_id: String,
    /// Submit time relative to the trace's first submission.
    pub submit_offset_ms: u64,
    /// Start times of every instance, relative and sorted.
    pub start_offsets_ms: Vec<u64>,
}

/// Which of the two compared traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceSide {
    /// The first trace.
    Left,
    /// The second trace.
    Right,
}

impl fmt::Display for TraceSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceSide::Left => f.write_str("left"),
            TraceSide::Right => f.write_str("right"),
        }
    }
}

/// One reason two traces are not equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceDiff {
    /// A job appears in only one trace.
    MissingJob {
        /// Job id.
        job_id: String,
        /// Trace the job is missing from.
        missing_from: TraceSide,
    },
    /// A job's rows disagree on its submit time within one trace.
    DuplicateJob {
        /// Job id.
        job_id: String,
        /// Trace holding the duplicate groups.
        side: TraceSide,
        /// Number of distinct groups found.
        groups: usize,
    },
    /// A job was scheduled differently.
    Mismatch {
        /// Reduction from the left trace.
        left: ReducedJob,
        /// Reduction from the right trace.
        right: ReducedJob,
    },
}

impl fmt::Display for TraceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceDiff::MissingJob { job_id, missing_from } => {
                write!(f, "job {job_id} missing from {missing_from} trace")
            }
            TraceDiff::DuplicateJob { job_id, side, groups } => {
                write!(f, "job {job_id} has {groups} submit times in {side} trace")
            }
            TraceDiff::Mismatch { left, right } => write!(
                f,
                "job {}: left submit +{}ms starts {:?}, right submit +{}ms starts {:?}",
                left.job_id, left.submit_offset_ms, left.start_offsets_ms, right.submit_offset_ms, right.start_offsets_ms
            ),
        }
    }
}

/// Result of comparing two traces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceComparison {
    /// Every difference found, ordered by job id.
    pub diffs: Vec<TraceDiff>,
}

impl TraceComparison {
    /// Whether the traces scheduled every job identically.
    pub fn is_equivalent(&self) -> bool {
        self.diffs.is_empty()
    }
}

/// Group normalized rows by job id, then by submit offset within each job.
fn reduce(rows: &[TraceRow]) -> BTreeMap<String, Vec<ReducedJob>> {
    let mut grouped: BTreeMap<String, BTreeMap<u64, Vec<u64>>> = BTreeMap::new();
    for row in normalize_rows(rows) {
        grouped
            .entry(row.job_id)
            .or_default()
            .entry(row.submit_time_ms)
            .or_default()
            .push(row.start_time_ms);
    }

    grouped
        .into_iter()
        .map(|(job_id, by_submit)| {
            let reduced = by_submit
                .into_iter()
                .map(|(submit_offset_ms, mut start_offsets_ms)| {
                    start_offsets_ms.sort_unstable();
                    ReducedJob {
                        job_id: job_id.clone(),
                        submit_offset_ms,
                        start_offsets_ms,
                    }
                })
                .collect();
            (job_id, reduced)
        })
        .collect()
}

/// Compare two traces for relative scheduling equivalence.
///
/// Equivalent iff every job id appears in both traces with exactly one
/// `(submit offset, sorted start offsets)` reduction, and the reductions match.
pub fn equivalent(left: &[TraceRow], right: &[TraceRow]) -> TraceComparison {
    let left = reduce(left);
    let right = reduce(right);
    let mut diffs = Vec::new();

    let job_ids: std::collections::BTreeSet<&String> = left.keys().chain(right.keys()).collect();
    for job_id in job_ids {
        match (left.get(job_id), right.get(job_id)) {
            (None, _) => diffs.push(TraceDiff::MissingJob {
                job_id: job_id.clone(),
                missing_from: TraceSide::Left,
            }),
            (_, None) => diffs.push(TraceDiff::MissingJob {
                job_id: job_id.clone(),
                missing_from: TraceSide::Right,
            }),
            (Some(l), Some(r)) => {
                let mut duplicated = false;
                for (side, groups) in [(TraceSide::Left, l), (TraceSide::Right, r)] {
                    if groups.len() > 1 {
                        duplicated = true;
                        diffs.push(TraceDiff::DuplicateJob {
                            job_id: job_id.clone(),
                            side,
                            groups: groups.len(),
                        });
                    }
                }
                if !duplicated && l[0] != r[0] {
                    diffs.push(TraceDiff::Mismatch {
                        left: l[0].clone(),
                        right: r[0].clone(),
                    });
                }
            }
        }
    }

    TraceComparison { diffs }
}

/// [`equivalent`] over task records.
pub fn equivalent_records(left: &[TaskRecord], right: &[TaskRecord]) -> TraceComparison {
    equivalent(&to_rows(left), &to_rows(right))
}
