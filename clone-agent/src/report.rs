//! Per-step outcomes of a backup or restore run.
//!
//! Soft errors never abort a run; they are logged and recorded here so the
//! operator (and tests) can see exactly what did not make it across.

use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::utils::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum StepStatus {
    Done,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub phase: String,
    pub subject: String,
    #[serde(flatten)]
    pub status: StepStatus,
}

#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub records: Vec<StepRecord>,
    /// Free-form operator output (listening ports, running units)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub verification: Vec<String>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, phase: &str, subject: &str, status: StepStatus) {
        self.records.push(StepRecord {
            phase: phase.to_string(),
            subject: subject.to_string(),
            status,
        });
    }

    pub fn done(&mut self, phase: &str, subject: &str) {
        info!("[{}] {}", phase, subject);
        self.push(phase, subject, StepStatus::Done);
    }

    pub fn skipped(&mut self, phase: &str, subject: &str, reason: impl Into<String>) {
        let reason = reason.into();
        info!("[{}] {} skipped: {}", phase, subject, reason);
        self.push(phase, subject, StepStatus::Skipped(reason));
    }

    pub fn failed(&mut self, phase: &str, subject: &str, error: impl fmt::Display) {
        warn!("[{}] {} failed: {}", phase, subject, error);
        self.push(phase, subject, StepStatus::Failed(error.to_string()));
    }

    /// Record the outcome of a fallible step and swallow its error.
    pub fn soft<T>(&mut self, phase: &str, subject: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.done(phase, subject);
                Some(value)
            }
            Err(e) => {
                self.failed(phase, subject, e);
                None
            }
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.status, StepStatus::Failed(_)))
    }

    pub fn count(&self, phase: &str) -> usize {
        self.records.iter().filter(|r| r.phase == phase).count()
    }

    pub fn has(&self, phase: &str, subject: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.phase == phase && r.subject == subject && r.status == StepStatus::Done)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = self
            .records
            .iter()
            .filter(|r| r.status == StepStatus::Done)
            .count();
        let skipped = self
            .records
            .iter()
            .filter(|r| matches!(r.status, StepStatus::Skipped(_)))
            .count();
        let failed = self.failures().count();

        writeln!(f, "{} done, {} skipped, {} failed", done, skipped, failed)?;
        for record in self.failures() {
            if let StepStatus::Failed(e) = &record.status {
                writeln!(f, "  FAILED [{}] {}: {}", record.phase, record.subject, e)?;
            }
        }
        for line in &self.verification {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::CloneError;

    #[test]
    fn test_soft_swallows_errors() {
        let mut report = RunReport::new();
        let ok: Option<u32> = report.soft("databases", "mysql-shop", Ok(1));
        let err: Option<u32> = report.soft(
            "databases",
            "postgres-shop",
            Err(CloneError::Unknown("boom".into())),
        );

        assert_eq!(ok, Some(1));
        assert_eq!(err, None);
        assert_eq!(report.count("databases"), 2);
        assert_eq!(report.failures().count(), 1);
        assert!(report.has("databases", "mysql-shop"));
    }

    #[test]
    fn test_json_shape() -> Result<()> {
        let mut report = RunReport::new();
        report.skipped("runtimes", "python", "no requirements.txt");

        let json = serde_json::to_value(&report)?;
        assert_eq!(json["records"][0]["status"], "skipped");
        assert_eq!(json["records"][0]["detail"], "no requirements.txt");
        assert_eq!(json["records"][0]["phase"], "runtimes");
        Ok(())
    }

    #[test]
    fn test_display_lists_failures() {
        let mut report = RunReport::new();
        report.done("users", "alice");
        report.failed("services", "api", "exit 5");

        let text = report.to_string();
        assert!(text.starts_with("1 done, 0 skipped, 1 failed"));
        assert!(text.contains("FAILED [services] api: exit 5"));
    }
}
