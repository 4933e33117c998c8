//! Example of driving a sweep directly from Rust.
//!
//! Uses `/bin/sh` as a stand-in benchmark that reports a made-up throughput.

use std::time::Duration;

use benchsweep_core::{
    Axis, CommandLine, ConfigurationSpace, MonitorSettings, ProcessMonitor, Ranking, ResultStore,
    SweepEngine,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. The space: every launch config crossed with every cache mode
    let space = ConfigurationSpace::new(vec![
        Axis::new("--launch-config", ["L1x1", "L2x1", "L4x1"]),
        Axis::new("--texture-cache", ["0", "1"]),
    ])?;

    // 2. A fake miner: throughput derived from the argument lengths
    let command = CommandLine {
        binary: "/bin/sh".to_string(),
        extra_flags: vec![
            "-c".to_string(),
            r#"echo "GPU #0: $((${#2} * 10 + $4)) khash/s"; sleep 5"#.to_string(),
            "sh".to_string(),
        ],
        ..Default::default()
    };
    let settings = MonitorSettings {
        scan_interval: Duration::from_millis(100),
        max_scans: 20,
        ..Default::default()
    };
    let monitor = ProcessMonitor::new(command, settings)?;

    // 3. Run on the worker thread; a second run of this example resumes
    let store = ResultStore::open("example-sweep.db")?;
    let engine = SweepEngine::start(space, store, monitor, |p| println!("progress: {p}"))?;
    let completed = engine.wait()?;
    println!("{}", completed.summary);

    // 4. Best configuration
    let ranking = Ranking::from_store(&completed.store)?;
    if let Some(best) = ranking.best() {
        println!("best: {} at {:.1}", best.configuration, best.aggregate);
    }
    completed.store.close()?;

    Ok(())
}
