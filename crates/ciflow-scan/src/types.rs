use async_trait::async_trait;
use ciflow_core::{Dependency, DependencyVariant, ReportId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scanning service not configured: {0}")]
    NotConfigured(String),
    #[error("scanning service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("scanning service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected verdict status '{0}'")]
    UnknownStatus(String),
    #[error("no verdict for report {report_id} after {waited_ms} ms")]
    Timeout { report_id: String, waited_ms: u64 },
}

/// Dependency list submitted for one variant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanReport {
    pub project: String,
    pub revision: String,
    pub variant: DependencyVariant,
    pub dependencies: Vec<Dependency>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    pub dependency: String,
    pub license: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Passed,
    Failed { violations: Vec<Violation> },
}

/// Wire shape of `GET .../verdict`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerdictBody {
    pub status: String,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

impl TryFrom<VerdictBody> for Verdict {
    type Error = ScanError;

    fn try_from(b: VerdictBody) -> Result<Self, Self::Error> {
        match b.status.to_ascii_lowercase().as_str() {
            "pending" | "queued" | "running" => Ok(Verdict::Pending),
            "passed" | "pass" => Ok(Verdict::Passed),
            "failed" | "fail" => Ok(Verdict::Failed { violations: b.violations }),
            other => Err(ScanError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub report_id: String,
}

/// External license scanning service: submit a dependency list, then ask for
/// a verdict on it.
#[async_trait]
pub trait LicenseScanner: Send + Sync {
    async fn submit(&self, report: &ScanReport) -> Result<ReportId, ScanError>;
    async fn verdict(&self, report_id: &ReportId) -> Result<Verdict, ScanError>;
}
