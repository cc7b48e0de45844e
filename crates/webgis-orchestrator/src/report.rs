//! Batch results handed back to the caller once every job has resolved

use crate::job::{BatchId, JobId};
use serde::Serialize;
use webgis_core::{Error, ResourceId};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailureEntry {
    pub job: JobId,
    pub target: ResourceId,
    /// Item label: the layer name for imports, the resource name otherwise.
    pub item: String,
    pub error: Error,
}

/// Ordered `(target, error)` pairs accumulated across a batch. Empty means full success.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FailureReport {
    entries: Vec<FailureEntry>,
}

impl FailureReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: FailureEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FailureEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[FailureEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<FailureEntry> {
        self.entries
    }

    /// Whether any failure asks the user to authenticate again.
    pub fn requires_reauthentication(&self) -> bool {
        self.entries.iter().any(|e| e.error.requires_reauthentication())
    }

    /// One-line count for the "operation exceptions" header.
    pub fn summary(&self) -> String {
        match self.entries.len() {
            0 => "all operations succeeded".to_string(),
            1 => "1 operation failed".to_string(),
            n => format!("{} operations failed", n),
        }
    }
}

impl<'a> IntoIterator for &'a FailureReport {
    type Item = &'a FailureEntry;
    type IntoIter = std::slice::Iter<'a, FailureEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobSuccess {
    pub job: JobId,
    pub item: String,
    pub resource: Option<ResourceId>,
    /// The user cancelled after the remote call was issued; the result was still reconciled.
    pub cancelled_late: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Cancelled,
    Aborted,
    /// An earlier stage of the same batch failed.
    DependencyFailed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SkippedJob {
    /// `None` for second-stage items that were never turned into jobs.
    pub job: Option<JobId>,
    pub item: String,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch: BatchId,
    pub intent: String,
    pub succeeded: Vec<JobSuccess>,
    pub failures: FailureReport,
    pub skipped: Vec<SkippedJob>,
    /// Reconciliation anomalies that did not fail the job.
    pub warnings: Vec<String>,
}

impl BatchReport {
    pub fn new(batch: BatchId, intent: impl Into<String>) -> Self {
        Self {
            batch,
            intent: intent.into(),
            succeeded: Vec::new(),
            failures: FailureReport::new(),
            skipped: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }

    pub fn is_partial_success(&self) -> bool {
        !self.succeeded.is_empty() && !self.is_success()
    }

    /// First resource created or edited by the batch, if any.
    pub fn main_resource(&self) -> Option<ResourceId> {
        self.succeeded.iter().find_map(|s| s.resource)
    }

    pub fn total_jobs(&self) -> usize {
        self.succeeded.len() + self.failures.len() + self.skipped.len()
    }
}
