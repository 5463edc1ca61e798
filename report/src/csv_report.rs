//! CSV export
//!
//! Three files share one path prefix:
//!
//! - `{prefix}_stats.csv`: one row per entry plus the aggregate, rewritten
//!   on every frame
//! - `{prefix}_stats_history.csv`: one aggregate row appended per frame
//! - `{prefix}_failures.csv`: distinct errors, rewritten on every frame

use anyhow::{Context, Result};
use csv::Writer;
use std::fs::File;
use std::path::{Path, PathBuf};

use loadhive_core::stats::{EntrySnapshot, ReportFrame, ResponseTimePercentiles};
use loadhive_core::StatsSnapshot;

const PERCENTILE_HEADERS: [&str; 7] = ["50%", "66%", "75%", "90%", "95%", "99%", "100%"];

const STATS_HEADERS: [&str; 10] = [
    "Type",
    "Name",
    "Request Count",
    "Failure Count",
    "Median Response Time",
    "Average Response Time",
    "Min Response Time",
    "Max Response Time",
    "Average Content Size",
    "Requests/s",
];

const HISTORY_HEADERS: [&str; 5] = ["Timestamp", "State", "User Count", "Type", "Name"];

const FAILURE_HEADERS: [&str; 4] = ["Method", "Name", "Error", "Occurrences"];

fn ms(value: f64) -> String {
    format!("{value:.2}")
}

fn percentile_fields(p: &ResponseTimePercentiles) -> Vec<String> {
    [p.p50, p.p66, p.p75, p.p90, p.p95, p.p99, p.max]
        .into_iter()
        .map(ms)
        .collect()
}

fn stats_row(entry: &EntrySnapshot) -> Vec<String> {
    let mut row = vec![
        entry.request_type.clone(),
        entry.name.clone(),
        entry.num_requests.to_string(),
        entry.num_failures.to_string(),
        ms(entry.cumulative_percentiles.p50),
        ms(entry.avg_response_time),
        ms(entry.min_response_time),
        ms(entry.max_response_time),
        ms(entry.avg_content_length),
        ms(entry.total_rps),
        ms(entry.current_fail_per_sec),
    ];
    row.extend(percentile_fields(&entry.cumulative_percentiles));
    row
}

/// Writes report frames as CSV files under one prefix
pub struct CsvStatsWriter {
    prefix: PathBuf,
    history: Option<Writer<File>>,
}

impl CsvStatsWriter {
    /// Writer for files named `{prefix}_*.csv`
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            history: None,
        }
    }

    fn path(&self, suffix: &str) -> PathBuf {
        let mut name = self.prefix.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Path of the per-entry stats file
    pub fn stats_path(&self) -> PathBuf {
        self.path("_stats.csv")
    }

    /// Path of the history file
    pub fn history_path(&self) -> PathBuf {
        self.path("_stats_history.csv")
    }

    /// Path of the failures file
    pub fn failures_path(&self) -> PathBuf {
        self.path("_failures.csv")
    }

    /// Record one frame in all three files
    pub fn write_frame(&mut self, frame: &ReportFrame) -> Result<()> {
        self.write_stats(&frame.snapshot)?;
        self.write_failures(&frame.snapshot)?;
        self.append_history(frame)
    }

    /// Rewrite the stats file from `snapshot`
    pub fn write_stats(&self, snapshot: &StatsSnapshot) -> Result<()> {
        let path = self.stats_path();
        let mut writer = create(&path)?;

        let mut headers: Vec<&str> = STATS_HEADERS.to_vec();
        headers.push("Failures/s");
        headers.extend(PERCENTILE_HEADERS);
        writer.write_record(&headers)?;

        for entry in snapshot.entries.iter().chain(std::iter::once(&snapshot.total)) {
            writer.write_record(stats_row(entry))?;
        }
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", path.display()))?;
        Ok(())
    }

    /// Rewrite the failures file from `snapshot`
    pub fn write_failures(&self, snapshot: &StatsSnapshot) -> Result<()> {
        let path = self.failures_path();
        let mut writer = create(&path)?;
        writer.write_record(FAILURE_HEADERS)?;
        for error in &snapshot.errors {
            writer.write_record([
                error.request_type.as_str(),
                error.name.as_str(),
                error.error.as_str(),
                error.occurrences.to_string().as_str(),
            ])?;
        }
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", path.display()))?;
        Ok(())
    }

    /// Append the aggregate row of `frame` to the history file
    ///
    /// The file is truncated and given a header on the first call.
    pub fn append_history(&mut self, frame: &ReportFrame) -> Result<()> {
        if self.history.is_none() {
            let mut writer = create(&self.history_path())?;
            let mut headers: Vec<&str> = HISTORY_HEADERS.to_vec();
            headers.extend([
                "Requests/s",
                "Failures/s",
                "Total Request Count",
                "Total Failure Count",
                "Total Average Response Time",
                "Total Min Response Time",
                "Total Max Response Time",
                "Total Average Content Size",
            ]);
            headers.extend(PERCENTILE_HEADERS);
            writer.write_record(&headers)?;
            self.history = Some(writer);
        }

        let total = &frame.snapshot.total;
        let mut row = vec![
            frame.snapshot.timestamp.timestamp().to_string(),
            frame.state.to_string(),
            frame.user_count.to_string(),
            String::new(),
            total.name.clone(),
            ms(total.current_rps),
            ms(total.current_fail_per_sec),
            total.num_requests.to_string(),
            total.num_failures.to_string(),
            ms(total.avg_response_time),
            ms(total.min_response_time),
            ms(total.max_response_time),
            ms(total.avg_content_length),
        ];
        row.extend(percentile_fields(&total.percentiles));

        if let Some(writer) = self.history.as_mut() {
            writer.write_record(&row)?;
            writer.flush().context("failed to flush stats history")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CsvStatsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvStatsWriter")
            .field("prefix", &self.prefix)
            .field("history_open", &self.history.is_some())
            .finish()
    }
}

fn create(path: &Path) -> Result<Writer<File>> {
    Writer::from_path(path).with_context(|| format!("failed to create {}", path.display()))
}
