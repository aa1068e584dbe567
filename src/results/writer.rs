use chrono::{DateTime, Utc};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use crate::lifecycle::types::SuiteID;
use crate::results::types::SuiteReport;

/// Writes suite reports and decides where log files live.
///
/// Reports are written to a temporary sibling first and renamed into
/// place, so readers never observe a partially written document.
#[derive(Clone, Debug)]
pub struct ResultWriter {
    root: PathBuf,
}

impl ResultWriter {
    pub fn new<P: AsRef<Path>>(root: P) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Log file capturing a node container's output.
    pub fn node_log_path(&self, container_id: &str) -> PathBuf {
        self.root.join(format!("{}.log", container_id))
    }

    /// Log file capturing a simulator container's output.
    pub fn simulator_log_path(&self, sim_name: &str) -> PathBuf {
        self.root
            .join(format!("{}-simulator.log", sanitize(sim_name)))
    }

    pub fn write_suite(
        &self,
        suite_id: SuiteID,
        started_at: DateTime<Utc>,
        report: &SuiteReport,
    ) -> std::io::Result<PathBuf> {
        let filename = format!("{}-{}.json", started_at.format("%Y%m%d-%H%M%S"), suite_id);
        let target = self.root.join(&filename);
        let tmp = self.root.join(format!(".{}.tmp", filename));

        let body = serde_json::to_vec_pretty(report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &target)?;

        info!("suite {} report written to {}", suite_id, target.display());
        Ok(target)
    }
}

/// File-name-safe rendition of a simulator name like `ethereum/sync`.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::types::TestResult;
    use crate::results::types::TestCaseReport;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn sample_report() -> SuiteReport {
        let mut versions = BTreeMap::new();
        versions.insert("go-ethereum_latest".to_string(), "1.10.3".to_string());
        let mut cases = BTreeMap::new();
        cases.insert(
            1,
            TestCaseReport {
                name: "lifecycle".to_string(),
                description: String::new(),
                start: Utc::now(),
                end: Utc::now(),
                summary_result: TestResult {
                    pass: true,
                    details: "ok".to_string(),
                },
            },
        );
        SuiteReport {
            name: "smoke".to_string(),
            description: "smoke suite".to_string(),
            client_versions: versions,
            test_cases: cases,
        }
    }

    #[test]
    fn test_report_roundtrip() {
        let dir = TempDir::new().unwrap();
        let writer = ResultWriter::new(dir.path()).unwrap();
        let report = sample_report();

        let path = writer.write_suite(7, Utc::now(), &report).unwrap();
        let raw = fs::read(&path).unwrap();
        let parsed: SuiteReport = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed, report);

        // The spec's wire names must appear literally.
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("clientVersions"));
        assert!(text.contains("testCases"));
        assert!(text.contains("summaryResult"));
    }

    #[test]
    fn test_write_is_atomic() {
        let dir = TempDir::new().unwrap();
        let writer = ResultWriter::new(dir.path()).unwrap();
        writer.write_suite(1, Utc::now(), &sample_report()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_log_paths() {
        let dir = TempDir::new().unwrap();
        let writer = ResultWriter::new(dir.path()).unwrap();
        assert!(writer
            .node_log_path("abc123")
            .to_string_lossy()
            .ends_with("abc123.log"));
        assert!(writer
            .simulator_log_path("ethereum/sync")
            .to_string_lossy()
            .ends_with("ethereum-sync-simulator.log"));
    }
}
