use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

use crate::bulk::BulkReport;

/// Destination for bulk run reports. Writing is best-effort from the
/// caller's point of view; a sink failure never fails the run.
pub trait ReportSink {
    /// Returns the artifact path when one was produced.
    fn write(&self, report: &BulkReport) -> anyhow::Result<Option<PathBuf>>;
}

/// Writes each report as pretty-printed JSON under a reports directory,
/// named `<entity>_stats_update_<timestamp>.json`. Colons in the timestamp
/// are replaced so the name stays portable.
pub struct FileReportSink {
    dir: PathBuf,
}

impl FileReportSink {
    pub fn new(dir: &Path) -> FileReportSink {
        FileReportSink {
            dir: dir.to_path_buf(),
        }
    }

    fn file_name(report: &BulkReport) -> String {
        let timestamp = report
            .generated_at
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string()
            .replace(':', "-");
        format!(
            "{}_stats_update_{}.json",
            report.entity_label.to_lowercase(),
            timestamp
        )
    }
}

impl ReportSink for FileReportSink {
    fn write(&self, report: &BulkReport) -> anyhow::Result<Option<PathBuf>> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating reports dir {}", self.dir.display()))?;
        let path = self.dir.join(Self::file_name(report));
        let body = serde_json::to_string_pretty(&report.to_json())?;
        fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "run report written");
        Ok(Some(path))
    }
}

/// Sink that drops reports, for callers that only want the in-memory
/// summary.
pub struct NoopReportSink;

impl ReportSink for NoopReportSink {
    fn write(&self, _report: &BulkReport) -> anyhow::Result<Option<PathBuf>> {
        Ok(None)
    }
}
