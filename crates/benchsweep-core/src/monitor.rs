//! Process monitor: runs the benchmark binary for one configuration.
//!
//! Each invocation goes `Starting → Scanning → {Succeeded, FailedEarlyExit,
//! FailedTimeout, Cancelled}`. The binary is started in its own process
//! group so that the whole tree (including anything a prefix command such as
//! `nice` or `sudo` forks) can be signalled at once. Whatever happens, the
//! group is terminated before [`ProcessMonitor::run`] returns; a drop guard
//! covers the paths where the future itself is abandoned.

use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::engine::CancelFlag;
use crate::error::{Result, SweepError};
use crate::models::{Configuration, MeasurementOutcome, Sample};
use crate::scanner::{Stream, StreamScanner};

/// Raw output kept for diagnostics when a configuration fails.
const DIAGNOSTIC_TAIL_BYTES: usize = 4 * 1024;
const READ_CHUNK_BYTES: usize = 4096;
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How to invoke the binary, minus the per-configuration flags.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandLine {
    /// Commands placed before the binary, e.g. `["nice", "-n", "10"]`.
    pub prefix: Vec<String>,
    pub binary: String,
    /// Fixed flags that put the binary in benchmark mode.
    pub mode_flags: Vec<String>,
    /// User-supplied flags appended before the configuration's own.
    pub extra_flags: Vec<String>,
}

impl CommandLine {
    /// Full argument vector for `configuration`. No shell is involved.
    pub fn argv(&self, configuration: &Configuration) -> Vec<String> {
        let mut argv = Vec::with_capacity(
            self.prefix.len() + 1 + self.mode_flags.len() + self.extra_flags.len() + 2 * configuration.len(),
        );
        argv.extend(self.prefix.iter().cloned());
        argv.push(self.binary.clone());
        argv.extend(self.mode_flags.iter().cloned());
        argv.extend(self.extra_flags.iter().cloned());
        argv.extend(configuration.arguments());
        argv
    }

    pub fn display(&self, configuration: &Configuration) -> String {
        self.argv(configuration).join(" ")
    }
}

/// Scanning knobs for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub marker: String,
    pub required_samples: usize,
    pub scan_interval: Duration,
    pub max_scans: u32,
    /// Time between SIGTERM and SIGKILL when tearing the process group down.
    pub termination_grace: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            marker: "hash/s".to_string(),
            required_samples: 1,
            scan_interval: Duration::from_secs(1),
            max_scans: 120,
            termination_grace: Duration::from_secs(2),
        }
    }
}

/// Terminal state of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded { samples: Vec<Sample> },
    /// The process exited before printing enough markers. `exit` is the exit
    /// code, or `signal-<n>` when it was killed by a signal.
    FailedEarlyExit { exit: String, output: String },
    /// More than `max_scans` scans passed with the process still alive.
    FailedTimeout { scans: u32, output: String },
    Cancelled,
}

impl RunOutcome {
    /// The outcome to persist. `Cancelled` has none.
    pub fn measurement(&self) -> Option<MeasurementOutcome> {
        match self {
            RunOutcome::Succeeded { samples } => {
                Some(MeasurementOutcome::from_samples(samples.clone()))
            }
            RunOutcome::Cancelled => None,
            failed => failed.failure_reason().map(MeasurementOutcome::failed),
        }
    }

    pub fn failure_reason(&self) -> Option<String> {
        match self {
            RunOutcome::FailedEarlyExit { exit, .. } => Some(format!("early-exit:{exit}")),
            RunOutcome::FailedTimeout { .. } => Some("timeout".to_string()),
            RunOutcome::Succeeded { .. } | RunOutcome::Cancelled => None,
        }
    }

    /// Captured output attached to a failure, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            RunOutcome::FailedEarlyExit { output, .. } | RunOutcome::FailedTimeout { output, .. } => {
                Some(output)
            }
            _ => None,
        }
    }
}

/// Something that can measure one configuration.
///
/// [`ProcessMonitor`] is the real thing; the controller only sees this trait.
pub trait Benchmark {
    fn measure(
        &self,
        configuration: &Configuration,
        cancel: &CancelFlag,
    ) -> impl Future<Output = Result<RunOutcome>> + Send;

    /// Human-readable command line, used in logs.
    fn describe(&self, configuration: &Configuration) -> String {
        configuration.to_string()
    }
}

/// Runs the external binary and scans its output for the marker.
#[derive(Debug, Clone)]
pub struct ProcessMonitor {
    command: CommandLine,
    settings: MonitorSettings,
}

impl ProcessMonitor {
    pub fn new(command: CommandLine, settings: MonitorSettings) -> Result<Self> {
        if command.binary.is_empty() {
            return Err(SweepError::Config("binary path must not be empty".to_string()));
        }
        if settings.marker.is_empty() {
            return Err(SweepError::Config("marker must not be empty".to_string()));
        }
        if settings.required_samples == 0 {
            return Err(SweepError::Config(
                "required sample count must be at least 1".to_string(),
            ));
        }
        Ok(Self { command, settings })
    }

    /// Invocation shared by every configuration.
    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    /// Scan and termination knobs.
    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Run one configuration to a terminal state.
    ///
    /// `Spawn`, `Parse` and `Monitor` errors only concern this configuration.
    pub async fn run(&self, configuration: &Configuration, cancel: &CancelFlag) -> Result<RunOutcome> {
        let argv = self.command.argv(configuration);
        let command = argv.join(" ");
        debug!(command = %command, "Starting benchmark");

        let mut group = ProcessGroup::spawn(&argv).map_err(|source| SweepError::Spawn {
            command: command.clone(),
            source,
        })?;
        let mut output = OutputReaders::attach(&mut group.child);

        let result = self.scan(configuration, &mut group, &mut output, cancel).await;
        group.terminate(self.settings.termination_grace).await;

        match &result {
            Ok(outcome) => debug!(command = %command, outcome = outcome_name(outcome), "Benchmark finished"),
            Err(e) => debug!(command = %command, error = %e, "Benchmark failed"),
        }
        result
    }

    async fn scan(
        &self,
        configuration: &Configuration,
        group: &mut ProcessGroup,
        output: &mut OutputReaders,
        cancel: &CancelFlag,
    ) -> Result<RunOutcome> {
        let settings = &self.settings;
        let mut scanner = StreamScanner::new(&settings.marker, settings.required_samples)?;
        let mut tail = OutputTail::new(DIAGNOSTIC_TAIL_BYTES);
        let mut scans: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            tokio::time::sleep(settings.scan_interval).await;
            scans = scans.saturating_add(1);

            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            output.drain_into(&mut scanner, &mut tail);
            trace!(scans, markers = scanner.markers_seen(), "Scanned output");
            if scanner.markers_seen() >= settings.required_samples {
                return Ok(RunOutcome::Succeeded {
                    samples: scanner.samples()?,
                });
            }

            if let Some(status) = group.child.try_wait().map_err(|source| SweepError::Monitor {
                command: self.command.display(configuration),
                source,
            })? {
                // Descendants may still hold the pipes open; take the group
                // down first so the readers see EOF.
                group.terminate(settings.termination_grace).await;
                output
                    .finish(settings.termination_grace, &mut scanner, &mut tail)
                    .await;
                if scanner.markers_seen() >= settings.required_samples {
                    return Ok(RunOutcome::Succeeded {
                        samples: scanner.samples()?,
                    });
                }
                return Ok(RunOutcome::FailedEarlyExit {
                    exit: describe_exit(status),
                    output: tail.text(),
                });
            }

            if scans > settings.max_scans {
                return Ok(RunOutcome::FailedTimeout {
                    scans,
                    output: tail.text(),
                });
            }
        }
    }
}

impl Benchmark for ProcessMonitor {
    async fn measure(&self, configuration: &Configuration, cancel: &CancelFlag) -> Result<RunOutcome> {
        self.run(configuration, cancel).await
    }

    fn describe(&self, configuration: &Configuration) -> String {
        self.command.display(configuration)
    }
}

fn outcome_name(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Succeeded { .. } => "succeeded",
        RunOutcome::FailedEarlyExit { .. } => "early-exit",
        RunOutcome::FailedTimeout { .. } => "timeout",
        RunOutcome::Cancelled => "cancelled",
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return code.to_string();
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal-{signal}");
        }
    }
    "unknown".to_string()
}

// ─── Process group ───────────────────────────────────────────────────────────

/// The spawned binary plus its process group.
///
/// `terminate` is the orderly path (SIGTERM, grace period, SIGKILL, reap).
/// `Drop` sends SIGKILL if `terminate` never ran.
struct ProcessGroup {
    child: Child,
    pgid: i32,
    terminated: bool,
}

impl ProcessGroup {
    fn spawn(argv: &[String]) -> std::io::Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line")
        })?;

        let mut command = std::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);
        let child = command.spawn()?;
        let pgid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or_else(|| std::io::Error::other("spawned process has no pid"))?;

        Ok(Self {
            child,
            pgid,
            terminated: false,
        })
    }

    async fn terminate(&mut self, grace: Duration) {
        if self.terminated {
            return;
        }
        signal_group(self.pgid, GroupSignal::Terminate);

        let deadline = Instant::now() + grace;
        loop {
            // Reap the leader as soon as it exits so it does not linger as a
            // zombie member of the group.
            let _ = self.child.try_wait();
            if !group_alive(self.pgid) {
                break;
            }
            if Instant::now() >= deadline {
                debug!(pgid = self.pgid, "Process group ignored SIGTERM, sending SIGKILL");
                signal_group(self.pgid, GroupSignal::Kill);
                break;
            }
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }

        if let Err(e) = self.child.kill().await {
            trace!(error = %e, "Leader already gone");
        }
        self.terminated = true;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if !self.terminated {
            signal_group(self.pgid, GroupSignal::Kill);
            let _ = self.child.start_kill();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: GroupSignal) {
    let signal = match signal {
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    // ESRCH just means the group is already gone.
    unsafe {
        libc::killpg(pgid, signal);
    }
}

#[cfg(unix)]
fn group_alive(pgid: i32) -> bool {
    let ret = unsafe { libc::killpg(pgid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: GroupSignal) {}

#[cfg(not(unix))]
fn group_alive(_pgid: i32) -> bool {
    false
}

// ─── Output collection ───────────────────────────────────────────────────────

/// Reader tasks for stdout and stderr, merged into one channel of tagged
/// chunks.
struct OutputReaders {
    rx: mpsc::UnboundedReceiver<(Stream, Vec<u8>)>,
    handles: Vec<JoinHandle<()>>,
}

impl OutputReaders {
    fn attach(child: &mut Child) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            handles.push(spawn_reader(Stream::Stdout, stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            handles.push(spawn_reader(Stream::Stderr, stderr, tx));
        }
        Self { rx, handles }
    }

    /// Move whatever has been read so far into the scanner.
    fn drain_into(&mut self, scanner: &mut StreamScanner, tail: &mut OutputTail) {
        while let Ok((stream, chunk)) = self.rx.try_recv() {
            scanner.feed(stream, &chunk);
            tail.push(&chunk);
        }
    }

    /// Wait (bounded) for the readers to hit EOF, then drain the rest.
    async fn finish(&mut self, wait: Duration, scanner: &mut StreamScanner, tail: &mut OutputTail) {
        let handles = &mut self.handles;
        let joined = tokio::time::timeout(wait, async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;
        if joined.is_err() {
            debug!("Output readers did not reach EOF in time");
        }
        self.drain_into(scanner, tail);
    }
}

impl Drop for OutputReaders {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn spawn_reader<R>(
    stream: Stream,
    mut reader: R,
    tx: mpsc::UnboundedSender<(Stream, Vec<u8>)>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Last `capacity` bytes of raw output.
struct OutputTail {
    bytes: Vec<u8>,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.capacity {
            let excess = self.bytes.len() - self.capacity;
            self.bytes.drain(..excess);
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_order() {
        let command = CommandLine {
            prefix: vec!["nice".into(), "-n".into(), "10".into()],
            binary: "cudaminer".into(),
            mode_flags: vec!["--benchmark".into(), "--no-autotune".into()],
            extra_flags: vec!["--algo".into(), "scrypt".into()],
        };
        let cfg = Configuration::from_pairs([("--launch-config", "L1x1")]);
        assert_eq!(
            command.display(&cfg),
            "nice -n 10 cudaminer --benchmark --no-autotune --algo scrypt --launch-config L1x1"
        );
    }

    #[test]
    fn test_failure_reasons() {
        let early = RunOutcome::FailedEarlyExit {
            exit: "3".into(),
            output: "boom".into(),
        };
        assert_eq!(early.failure_reason().as_deref(), Some("early-exit:3"));
        assert_eq!(early.measurement(), Some(MeasurementOutcome::failed("early-exit:3")));
        assert_eq!(early.output(), Some("boom"));

        let timeout = RunOutcome::FailedTimeout {
            scans: 5,
            output: String::new(),
        };
        assert_eq!(timeout.failure_reason().as_deref(), Some("timeout"));
        assert_eq!(RunOutcome::Cancelled.measurement(), None);
    }

    #[test]
    fn test_success_measurement_aggregates() {
        let outcome = RunOutcome::Succeeded {
            samples: vec![Sample::new(10.0, "k"), Sample::new(20.0, "k")],
        };
        assert_eq!(outcome.measurement().and_then(|m| m.aggregate()), Some(15.0));
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let command = CommandLine {
            binary: "bench".into(),
            ..Default::default()
        };
        let settings = MonitorSettings {
            required_samples: 0,
            ..Default::default()
        };
        assert!(ProcessMonitor::new(command.clone(), settings).is_err());
        assert!(ProcessMonitor::new(CommandLine::default(), MonitorSettings::default()).is_err());
        assert!(ProcessMonitor::new(command, MonitorSettings::default()).is_ok());
    }

    #[test]
    fn test_output_tail_keeps_last_bytes() {
        let mut tail = OutputTail::new(4);
        tail.push(b"abc");
        tail.push(b"defg");
        assert_eq!(tail.text(), "defg");
    }
}
