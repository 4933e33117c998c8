//! Sweep accounting and the ranked view of a result store.
//!
//! Rendering (tables, JSON) is left to the caller; this module only decides
//! what is counted and in which order results are listed.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SweepError};
use crate::models::{Configuration, MeasurementOutcome, Sample, StoredResult, SweepProgress};
use crate::storage::ResultStore;

/// Why a configuration was skipped without a stored result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Spawn,
    Parse,
    EarlyExit,
    Timeout,
    /// Waiting on the process itself failed.
    Monitor,
}

impl FailureKind {
    /// Kind of a per-configuration error; `None` for errors that end the sweep.
    pub fn of_error(error: &SweepError) -> Option<Self> {
        if !error.is_per_configuration() {
            return None;
        }
        Some(match error {
            SweepError::Spawn { .. } => FailureKind::Spawn,
            SweepError::Parse { .. } => FailureKind::Parse,
            _ => FailureKind::Monitor,
        })
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Spawn => "spawn",
            FailureKind::Parse => "parse",
            FailureKind::EarlyExit => "early-exit",
            FailureKind::Timeout => "timeout",
            FailureKind::Monitor => "monitor",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedConfiguration {
    pub configuration: Configuration,
    pub kind: FailureKind,
    pub reason: String,
}

/// What one call to the controller did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub total: u64,
    /// Store size at the end of the run.
    pub tested: u64,
    /// Configurations measured successfully in this run.
    pub succeeded: u64,
    /// Configurations skipped because the store already had them.
    pub resumed: u64,
    pub spawn_failures: u64,
    pub parse_failures: u64,
    pub early_exits: u64,
    pub timeouts: u64,
    pub monitor_failures: u64,
    pub cancelled: bool,
    pub failures: Vec<FailedConfiguration>,
}

impl SweepSummary {
    /// Summary of a run that starts with `tested` results already stored.
    pub fn new(total: u64, tested: u64) -> Self {
        Self {
            total,
            tested,
            ..Default::default()
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.succeeded += 1;
        self.tested += 1;
    }

    pub(crate) fn record_failure(
        &mut self,
        configuration: Configuration,
        kind: FailureKind,
        reason: impl Into<String>,
    ) {
        match kind {
            FailureKind::Spawn => self.spawn_failures += 1,
            FailureKind::Parse => self.parse_failures += 1,
            FailureKind::EarlyExit => self.early_exits += 1,
            FailureKind::Timeout => self.timeouts += 1,
            FailureKind::Monitor => self.monitor_failures += 1,
        }
        self.failures.push(FailedConfiguration {
            configuration,
            kind,
            reason: reason.into(),
        });
    }

    /// Configurations that failed in this run, all kinds together.
    pub fn failed(&self) -> u64 {
        self.spawn_failures
            + self.parse_failures
            + self.early_exits
            + self.timeouts
            + self.monitor_failures
    }

    /// Configurations of the space without a stored result.
    pub fn untested(&self) -> u64 {
        self.total.saturating_sub(self.tested)
    }

    /// Progress as reported to the callback.
    pub fn progress(&self) -> SweepProgress {
        SweepProgress {
            tested: self.tested,
            total: self.total,
        }
    }
}

impl fmt::Display for SweepSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tested {}/{} ({} new, {} resumed, {} failed: {} spawn, {} parse, {} early-exit, {} timeout, {} monitor){}",
            self.tested,
            self.total,
            self.succeeded,
            self.resumed,
            self.failed(),
            self.spawn_failures,
            self.parse_failures,
            self.early_exits,
            self.timeouts,
            self.monitor_failures,
            if self.cancelled { ", cancelled" } else { "" }
        )
    }
}

/// One ranked row: a successful configuration and what it measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub aggregate: f64,
    pub samples: Vec<Sample>,
    pub configuration: Configuration,
    pub recorded_at: DateTime<Utc>,
}

/// Successful results sorted by aggregate, ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    rows: Vec<RankedResult>,
    /// Stored entries that carry a failed outcome and are not ranked.
    failed_entries: u64,
}

impl Ranking {
    /// Rank every entry of `store`.
    pub fn from_store(store: &ResultStore) -> Result<Self> {
        Ok(Self::from_entries(store.entries()?))
    }

    /// Ties keep insertion order.
    pub fn from_entries(entries: Vec<StoredResult>) -> Self {
        let mut failed_entries = 0;
        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.outcome {
                MeasurementOutcome::Success { samples, aggregate } => rows.push(RankedResult {
                    aggregate,
                    samples,
                    configuration: entry.configuration,
                    recorded_at: entry.recorded_at,
                }),
                MeasurementOutcome::Failed { .. } => failed_entries += 1,
            }
        }
        rows.sort_by(|a, b| a.aggregate.total_cmp(&b.aggregate));
        Self {
            rows,
            failed_entries,
        }
    }

    /// Best first.
    pub fn reversed(mut self) -> Self {
        self.rows.reverse();
        self
    }

    /// Ranked rows in the current order.
    pub fn rows(&self) -> &[RankedResult] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Stored entries skipped because they hold a failure.
    pub fn failed_entries(&self) -> u64 {
        self.failed_entries
    }

    /// Highest aggregate.
    pub fn best(&self) -> Option<&RankedResult> {
        self.rows
            .iter()
            .max_by(|a, b| a.aggregate.total_cmp(&b.aggregate))
    }
}
