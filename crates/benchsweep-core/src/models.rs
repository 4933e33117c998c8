//! Data models for benchsweep.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One named dimension of the space. The name is the flag handed to the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub values: Vec<String>,
}

impl Axis {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// One concrete value per axis, in axis declaration order.
///
/// Equality of stored results is decided by [`Configuration::key`], which
/// does not depend on the order of the pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    pairs: Vec<(String, String)>,
}

impl Configuration {
    /// Build from `(flag, value)` pairs, keeping their order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Pairs in axis declaration order.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Value chosen for `axis`, if the configuration has that axis.
    pub fn get(&self, axis: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Canonical store key: a JSON object with keys sorted by axis name.
    pub fn key(&self) -> String {
        let sorted: BTreeMap<&str, &str> = self
            .pairs
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let object: serde_json::Map<String, serde_json::Value> = sorted
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect();
        serde_json::Value::Object(object).to_string()
    }

    /// Flattened `flag value flag value ...` argument list.
    pub fn arguments(&self) -> Vec<String> {
        self.pairs
            .iter()
            .flat_map(|(k, v)| [k.clone(), v.clone()])
            .collect()
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.arguments().join(" "))
    }
}

/// A single measurement taken from the binary's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub magnitude: f64,
    pub unit: String,
}

impl Sample {
    pub fn new(magnitude: f64, unit: impl Into<String>) -> Self {
        Self {
            magnitude,
            unit: unit.into(),
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.magnitude, self.unit)
    }
}

/// What a configuration measured. Untested configurations have no outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MeasurementOutcome {
    Success { samples: Vec<Sample>, aggregate: f64 },
    Failed { reason: String },
}

impl MeasurementOutcome {
    /// Builds a success whose aggregate is the arithmetic mean of the
    /// magnitudes. Units are kept per sample and never converted.
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        let aggregate = mean(&samples);
        MeasurementOutcome::Success { samples, aggregate }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        MeasurementOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn aggregate(&self) -> Option<f64> {
        match self {
            MeasurementOutcome::Success { aggregate, .. } => Some(*aggregate),
            MeasurementOutcome::Failed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MeasurementOutcome::Success { .. })
    }
}

impl fmt::Display for MeasurementOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementOutcome::Success { samples, aggregate } => {
                let units: Vec<&str> = samples.iter().map(|s| s.unit.as_str()).collect();
                write!(f, "{aggregate} ({} samples, units: {})", samples.len(), units.join(","))
            }
            MeasurementOutcome::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Arithmetic mean of the sample magnitudes; `0.0` when there are none.
pub fn mean(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.magnitude).sum::<f64>() / samples.len() as f64
}

/// A persisted store entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub configuration: Configuration,
    pub outcome: MeasurementOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Progress of one sweep: `tested` counts stored results, `total` is the
/// size of the space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepProgress {
    pub tested: u64,
    pub total: u64,
}

impl SweepProgress {
    /// Share of the space already tested, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.tested as f64 / self.total as f64).min(1.0)
    }
}

impl fmt::Display for SweepProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tested, self.total)
    }
}
