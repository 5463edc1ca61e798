//! JSON export of the final frame

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use loadhive_core::stats::ReportFrame;

/// Writes a frame as pretty-printed JSON
#[derive(Debug, Clone)]
pub struct JsonExporter {
    path: PathBuf,
}

impl JsonExporter {
    /// Exporter writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Output path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file with `frame`
    pub fn write(&self, frame: &ReportFrame) -> Result<()> {
        let file = File::create(&self.path)
            .with_context(|| format!("failed to create {}", self.path.display()))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, frame)
            .with_context(|| format!("failed to serialize report to {}", self.path.display()))?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    /// Read a frame written by [`JsonExporter::write`]
    pub fn read(path: impl AsRef<Path>) -> Result<ReportFrame> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("invalid report in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadhive_core::stats::RequestStats;
    use loadhive_core::{RequestEvent, RunConfig, RunState};

    #[test]
    fn test_written_report_reads_back() {
        let stats = RequestStats::new(RunConfig::default().stats.entry_settings());
        stats.record(&RequestEvent::new("GET", "/").with_response_time(8.0));
        let frame = ReportFrame {
            state: RunState::Stopped,
            user_count: 0,
            snapshot: stats.snapshot(),
        };

        let dir = tempfile::tempdir().unwrap();
        let exporter = JsonExporter::new(dir.path().join("report.json"));
        exporter.write(&frame).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(exporter.path()).unwrap()).unwrap();
        assert_eq!(raw["state"], "stopped");
        assert_eq!(raw["snapshot"]["total"]["num_requests"], 1);

        let back = JsonExporter::read(exporter.path()).unwrap();
        assert_eq!(back.snapshot.total.num_requests, 1);
        assert_eq!(back.state, RunState::Stopped);
    }

    #[test]
    fn test_read_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonExporter::read(dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("absent.json"));
    }
}
