use std::time::{Duration, Instant};

use ciflow_core::{poll_backoff_ms, ReportId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{LicenseScanner, ScanError, Verdict};

/// Bounds for polling a verdict.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            max_interval_ms: 30_000,
            timeout_ms: 15 * 60 * 1_000,
        }
    }
}

/// Polls until the service reports anything other than pending, or the
/// policy's timeout would be exceeded by the next wait.
pub async fn wait_for_verdict(
    scanner: &dyn LicenseScanner,
    report_id: &ReportId,
    policy: &PollPolicy,
) -> Result<Verdict, ScanError> {
    let started = Instant::now();
    let timeout = Duration::from_millis(policy.timeout_ms);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let verdict = scanner.verdict(report_id).await?;
        if verdict != Verdict::Pending {
            debug!(report = report_id.as_str(), attempt, "verdict ready");
            return Ok(verdict);
        }

        let delay = Duration::from_millis(poll_backoff_ms(attempt, policy.interval_ms, policy.max_interval_ms));
        if started.elapsed() + delay > timeout {
            return Err(ScanError::Timeout {
                report_id: report_id.as_str().to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }
        debug!(report = report_id.as_str(), attempt, delay_ms = delay.as_millis() as u64, "verdict pending");
        tokio::time::sleep(delay).await;
    }
}
