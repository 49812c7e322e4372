use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

/// Summary of one poll cycle, one entry per configured vendor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollReport {
    pub started_at: DateTime<Utc>,
    pub quick: bool,
    pub cancelled: bool,
    pub total_ms: u64,
    pub vendors: Vec<VendorReport>,
}

impl PollReport {
    pub fn vendor(&self, name: &str) -> Option<&VendorReport> {
        self.vendors.iter().find(|v| v.vendor == name)
    }

    /// Commands enqueued across all vendors.
    pub fn enqueued(&self) -> usize {
        self.vendors
            .iter()
            .map(|v| match &v.outcome {
                VendorOutcome::Completed(stats) => stats.enqueued,
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VendorReport {
    pub vendor: String,
    pub duration_ms: u64,
    pub outcome: VendorOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum VendorOutcome {
    Completed(MergeStats),
    Skipped { reason: String },
    Failed { error: String },
}

/// Per-vendor device counts for a completed merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub seen: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Devices whose state fetch or store merge failed
    pub failed: usize,
    pub enqueued: usize,
}
