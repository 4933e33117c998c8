//! benchsweep-core: resumable parameter sweeps over an external benchmark.
//!
//! A sweep enumerates the cartesian product of a few command-line axes,
//! launches the benchmark binary once per configuration, scans its output
//! for a throughput marker and records the result in a SQLite store. Re-running
//! the same sweep against the same store skips everything already measured,
//! so an interrupted sweep just picks up where it stopped.

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod monitor;
pub mod report;
pub mod scanner;
pub mod space;
pub mod storage;

pub use config::{AxisConfig, SweepConfig};
pub use engine::{CancelFlag, CompletedSweep, SweepController, SweepEngine};
pub use error::{Result, SweepError};
pub use models::{Axis, Configuration, MeasurementOutcome, Sample, StoredResult, SweepProgress};
pub use monitor::{Benchmark, CommandLine, MonitorSettings, ProcessMonitor, RunOutcome};
pub use report::{FailedConfiguration, FailureKind, RankedResult, Ranking, SweepSummary};
pub use scanner::{MarkerScanner, Stream, StreamScanner};
pub use space::ConfigurationSpace;
pub use storage::ResultStore;
