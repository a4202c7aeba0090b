use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::{LineId, StationId};
use crate::store::PollId;

/// What one poll cycle fetched and stored.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub poll_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,

    /// `(line, station)` pairs polled.
    pub stations: usize,
    /// Requests stored, one per station that was not missing.
    pub requests: usize,
    /// Train records stored.
    pub records: usize,
    /// Arriving records dropped before storage.
    pub arriving_skipped: usize,

    #[serde(skip)]
    pub missing: Vec<(LineId, StationId)>,
}

impl CycleSummary {
    pub fn new(poll_id: PollId, started_at: DateTime<Utc>, stations: usize) -> Self {
        Self {
            poll_id: poll_id.0,
            started_at,
            ended_at: None,
            stations,
            requests: 0,
            records: 0,
            arriving_skipped: 0,
            missing: Vec::new(),
        }
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    /// Share of stations that produced a stored request.
    pub fn coverage_pct(&self) -> f64 {
        Self::pct(self.requests, self.stations)
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pct_with_zero_total() {
        assert_eq!(CycleSummary::pct(10, 0), 0.0);
    }

    #[test]
    fn test_pct_normal_values() {
        assert_eq!(CycleSummary::pct(50, 100), 50.0);
        assert_eq!(CycleSummary::pct(1, 4), 25.0);
    }

    #[test]
    fn test_coverage_pct() {
        let mut summary = CycleSummary::new(PollId(1), Utc::now(), 4);
        summary.requests = 3;
        summary.missing.push((LineId::Sheppard, 66));

        assert_eq!(summary.coverage_pct(), 75.0);
        assert!(!summary.is_complete());
    }

    #[test]
    fn test_new_summary_is_empty() {
        let summary = CycleSummary::new(PollId(7), Utc::now(), 68);
        assert_eq!(summary.poll_id, 7);
        assert_eq!(summary.requests, 0);
        assert!(summary.ended_at.is_none());
        assert!(summary.is_complete());
    }
}
