//! Status timelines.
//!
//! A timeline is an ordered run of segments: strictly increasing start
//! times, no two adjacent segments sharing a status, plus an `until`
//! high-water mark recording how far observations reach.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probe::ServiceStatus;

/// A contiguous run of time sharing one status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineSegment {
    /// When the run began
    pub from: DateTime<Utc>,

    pub status: ServiceStatus,
}

/// Ordered status history for one monitor.
///
/// The owner guards each timeline with its own single-writer lock;
/// readers acquire it too.
#[derive(Debug, Default, Clone)]
pub struct Timeline {
    segments: Vec<TimelineSegment>,
    until: Option<DateTime<Utc>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[TimelineSegment] {
        &self.segments
    }

    pub fn latest(&self) -> Option<&TimelineSegment> {
        self.segments.last()
    }

    /// High-water mark of observations, independent of segment boundaries
    pub fn until(&self) -> Option<DateTime<Utc>> {
        self.until
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Record an observation.
    ///
    /// Appends a segment only when the status differs from the latest one
    /// (and time moves forward); the high-water mark always advances.
    /// Returns whether a segment was appended.
    pub fn record(&mut self, from: DateTime<Utc>, status: ServiceStatus) -> bool {
        let appended = match self.segments.last() {
            None => true,
            Some(last) => last.status != status && from > last.from,
        };
        if appended {
            self.segments.push(TimelineSegment { from, status });
        }
        self.until = Some(self.until.map_or(from, |u| u.max(from)));
        appended
    }

    /// Status of the last segment at or before `at`
    pub fn status_at(&self, at: DateTime<Utc>) -> Option<ServiceStatus> {
        self.segments.iter().rev().find(|s| s.from <= at).map(|s| s.status)
    }

    /// Whether observations cover `at`
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        match (self.segments.first(), self.until) {
            (Some(first), Some(until)) => first.from <= at && at <= until,
            _ => false,
        }
    }

    /// Oldest segment starting after `mark` (all of them when `mark` is
    /// None); what a sender loop still has to forward
    pub fn pending_after(&self, mark: Option<DateTime<Utc>>) -> Option<&TimelineSegment> {
        match mark {
            None => self.segments.first(),
            Some(mark) => self.segments.iter().find(|s| s.from > mark),
        }
    }

    /// Truncate so the timeline starts no earlier than `at`
    pub fn truncate_before(&mut self, at: DateTime<Utc>) {
        while self.segments.len() > 1 && self.segments[1].from <= at {
            self.segments.remove(0);
        }
        if let Some(first) = self.segments.first_mut() {
            if first.from < at {
                first.from = at;
            }
        }
    }

    /// Drop history older than `cutoff`, never the last segment
    pub fn trim_retention(&mut self, cutoff: DateTime<Utc>) {
        while self.segments.len() > 1 && self.segments[0].from < cutoff {
            // Keep the boundary accurate: the successor inherits coverage
            if self.segments[1].from < cutoff {
                self.segments.remove(0);
            } else {
                break;
            }
        }
        if self.segments.len() == 1 {
            return;
        }
        if let Some(first) = self.segments.first_mut() {
            if first.from < cutoff {
                first.from = cutoff;
            }
        }
    }
}
