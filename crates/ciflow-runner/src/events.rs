use std::sync::{Arc, Mutex};

use ciflow_core::Outcome;

/// Shared, append-only record of lifecycle events for one pipeline run.
#[derive(Clone, Default)]
pub struct OutcomeLog {
    inner: Arc<Mutex<Vec<Outcome>>>,
}

impl OutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: Outcome) {
        if let Ok(mut v) = self.inner.lock() {
            v.push(outcome);
        }
    }

    pub fn snapshot(&self) -> Vec<Outcome> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }
}
