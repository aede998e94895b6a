use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ciflow_core::ReportId;

use crate::types::{LicenseScanner, ScanError, ScanReport, Verdict};

/// In-process scanner that records submissions and replays a scripted
/// sequence of verdicts; the last verdict repeats once the script runs out.
pub struct MemoryScanner {
    verdicts: Vec<Verdict>,
    calls: AtomicUsize,
    submitted: Mutex<Vec<ScanReport>>,
}

impl MemoryScanner {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        Self {
            verdicts,
            calls: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn passing() -> Self {
        Self::new(vec![Verdict::Passed])
    }

    pub fn submitted(&self) -> Vec<ScanReport> {
        self.submitted.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn verdict_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LicenseScanner for MemoryScanner {
    async fn submit(&self, report: &ScanReport) -> Result<ReportId, ScanError> {
        let mut guard = self
            .submitted
            .lock()
            .map_err(|_| ScanError::NotConfigured("memory scanner poisoned".into()))?;
        guard.push(report.clone());
        Ok(ReportId::from_str(format!("mem-{}", guard.len())))
    }

    async fn verdict(&self, _report_id: &ReportId) -> Result<Verdict, ScanError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let v = self
            .verdicts
            .get(n)
            .or_else(|| self.verdicts.last())
            .cloned()
            .unwrap_or(Verdict::Passed);
        Ok(v)
    }
}
