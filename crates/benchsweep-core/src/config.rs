//! Sweep configuration file (YAML).
//!
//! ```yaml
//! binary: ./cudaminer
//! prefix: [nice, -n, "10"]
//! extra_flags: [--algo, scrypt]
//! required_samples: 2
//! store: results.db
//! axes:
//!   - name: --launch-config
//!     values: [L1x1, L2x1, L4x2]
//!   - name: --texture-cache
//!     values: [0, 1]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SweepError};
use crate::models::Axis;
use crate::monitor::{CommandLine, MonitorSettings, ProcessMonitor};
use crate::space::ConfigurationSpace;
use crate::storage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    pub binary: String,
    #[serde(default)]
    pub prefix: Vec<String>,
    #[serde(default = "default_mode_flags")]
    pub mode_flags: Vec<String>,
    #[serde(default)]
    pub extra_flags: Vec<String>,
    #[serde(default = "default_marker")]
    pub marker: String,
    #[serde(default = "default_required_samples")]
    pub required_samples: usize,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_max_scans")]
    pub max_scans: u32,
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,
    #[serde(default = "default_store")]
    pub store: PathBuf,
    pub axes: Vec<AxisConfig>,
}

/// One axis as written in the file. Values may be any YAML scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxisConfig {
    pub name: String,
    pub values: Vec<serde_yaml::Value>,
}

fn default_mode_flags() -> Vec<String> {
    vec!["--benchmark".to_string(), "--no-autotune".to_string()]
}

fn default_marker() -> String {
    MonitorSettings::default().marker
}

fn default_required_samples() -> usize {
    1
}

fn default_scan_interval_ms() -> u64 {
    1000
}

fn default_max_scans() -> u32 {
    120
}

fn default_termination_grace_ms() -> u64 {
    2000
}

fn default_store() -> PathBuf {
    PathBuf::from(storage::DEFAULT_STORE_FILE)
}

impl SweepConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from disk. A relative `store` is resolved against the file's
    /// directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SweepError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_yaml_str(&text)?;
        if config.store.is_relative() {
            if let Some(dir) = path.parent() {
                config.store = dir.join(&config.store);
            }
        }
        Ok(config)
    }

    /// Check every knob and build the space once to surface axis errors.
    pub fn validate(&self) -> Result<()> {
        if self.binary.trim().is_empty() {
            return Err(SweepError::Config("`binary` must not be empty".to_string()));
        }
        if self.marker.is_empty() {
            return Err(SweepError::Config("`marker` must not be empty".to_string()));
        }
        if self.required_samples == 0 {
            return Err(SweepError::Config("`required_samples` must be at least 1".to_string()));
        }
        if self.scan_interval_ms == 0 {
            return Err(SweepError::Config("`scan_interval_ms` must be positive".to_string()));
        }
        // Surfaces empty axes, duplicate names and non-scalar values.
        self.space().map(|_| ())
    }

    /// The configuration space spanned by `axes`, in file order.
    pub fn space(&self) -> Result<ConfigurationSpace> {
        let axes = self
            .axes
            .iter()
            .map(|axis| {
                let values = axis
                    .values
                    .iter()
                    .map(|v| scalar_to_string(&axis.name, v))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Axis::new(axis.name.clone(), values))
            })
            .collect::<Result<Vec<_>>>()?;
        ConfigurationSpace::new(axes)
    }

    /// Invocation without the per-configuration flags.
    pub fn command_line(&self) -> CommandLine {
        CommandLine {
            prefix: self.prefix.clone(),
            binary: self.binary.clone(),
            mode_flags: self.mode_flags.clone(),
            extra_flags: self.extra_flags.clone(),
        }
    }

    /// Scan knobs with the millisecond fields turned into durations.
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            marker: self.marker.clone(),
            required_samples: self.required_samples,
            scan_interval: Duration::from_millis(self.scan_interval_ms),
            max_scans: self.max_scans,
            termination_grace: Duration::from_millis(self.termination_grace_ms),
        }
    }

    /// A ready-to-use monitor for the configured binary.
    pub fn monitor(&self) -> Result<ProcessMonitor> {
        ProcessMonitor::new(self.command_line(), self.monitor_settings())
    }

    /// Upper bound on how long one configuration can take: every scan up to
    /// the timeout plus the termination grace.
    pub fn worst_case_per_configuration(&self) -> Duration {
        let scans = u64::from(self.max_scans) + 1;
        Duration::from_millis(
            scans
                .saturating_mul(self.scan_interval_ms)
                .saturating_add(self.termination_grace_ms),
        )
    }

    /// Upper bound for the whole sweep, ignoring already-stored results.
    pub fn worst_case_duration(&self) -> Result<Duration> {
        let total = self.space()?.total();
        let per = self.worst_case_per_configuration();
        let total = u32::try_from(total).unwrap_or(u32::MAX);
        Ok(per.saturating_mul(total))
    }
}

fn scalar_to_string(axis: &str, value: &serde_yaml::Value) -> Result<String> {
    use serde_yaml::Value;
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(SweepError::InvalidSpace(format!(
            "axis `{axis}` has a non-scalar value: {other:?}"
        ))),
    }
}
