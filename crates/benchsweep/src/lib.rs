//! benchsweep: resumable parameter sweeps over external benchmark binaries.
//!
//! This crate re-exports the library side of the `sweep` command line tool.
//!
//! ```no_run
//! use benchsweep::{ResultStore, SweepConfig, SweepEngine};
//!
//! # fn main() -> benchsweep::Result<()> {
//! let config = SweepConfig::load("sweep.yaml")?;
//! let store = ResultStore::open(&config.store)?;
//! let engine = SweepEngine::start(config.space()?, store, config.monitor()?, |p| {
//!     println!("{p}");
//! })?;
//! let completed = engine.wait()?;
//! println!("{}", completed.summary);
//! completed.store.close()?;
//! # Ok(())
//! # }
//! ```

pub use benchsweep_core::*;
