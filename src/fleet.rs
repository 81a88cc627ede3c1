//! Manages the fleet of workload sub-processes.
//!
//! The fleet is the set of external workload processes that push load into
//! the cache server, one OS process per [`WorkerSpec`]. Every worker is
//! spawned before any wait begins so the whole fleet runs concurrently, then
//! the fleet is drained by waiting on each worker in turn. Waiting is
//! unbounded by default; callers may opt into a fleet-wide deadline with
//! [`Fleet::wait_timeout`].
//!
//! A worker that exits non-zero does not cancel its siblings. Its exit
//! status is recorded in the [`RunSummary`] and left to the caller to fold
//! into the harness exit status. A worker that cannot be started at all is
//! fatal for the run: a partially-launched fleet would invalidate the
//! aggregate-rate experiment, so survivors are terminated and this run's
//! capture files removed.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use is_executable::IsExecutable;
use nix::{
    errno::Errno,
    sys::signal::{SIGTERM, kill},
    unistd::Pid,
};
use rustc_hash::FxHashMap;
use tokio::{
    process::{Child, Command},
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use crate::planner::WorkerSpec;

/// Errors produced by [`Fleet`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The worker binary is missing or not executable
    #[error("worker binary is missing or not executable: {path:?}")]
    NoSuchBinary {
        /// Path to the configured worker binary
        path: PathBuf,
    },
    /// Unable to open a capture file for a worker
    #[error("unable to open capture file {path:?} for worker {index}: {source}")]
    CaptureOpen {
        /// Worker ordinal
        index: u32,
        /// Capture file path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Unable to spawn a worker
    #[error("unable to spawn worker {index}: {source}")]
    Spawn {
        /// Worker ordinal
        index: u32,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Unable to await a worker's exit
    #[error("unable to wait for worker {index} exit: {source}")]
    Wait {
        /// Worker ordinal
        index: u32,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// SIGTERM error
    #[error("unable to terminate worker {index}: {source}")]
    SigTerm {
        /// Worker ordinal
        index: u32,
        /// Underlying errno
        source: Errno,
    },
    /// The fleet did not drain before the configured deadline
    #[error("fleet did not drain before the wait deadline")]
    WaitTimeout,
}

/// Exit record for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOutcome {
    /// Worker ordinal.
    pub index: u32,
    /// The worker's exit status.
    pub status: ExitStatus,
}

/// Result of a fully-drained fleet run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    outcomes: Vec<WorkerOutcome>,
}

impl RunSummary {
    /// Whether every worker exited zero.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.status.success())
    }

    /// Outcomes of workers that exited non-zero.
    pub fn failed(&self) -> impl Iterator<Item = &WorkerOutcome> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.status.success())
    }

    /// Every worker's outcome, in worker-index order.
    #[must_use]
    pub fn outcomes(&self) -> &[WorkerOutcome] {
        &self.outcomes
    }
}

#[derive(Debug)]
/// The worker fleet.
///
/// No process is created until [`Fleet::run`] is called. It is assumed that
/// only one instance of this struct will ever exist at a time, although
/// there are no protections for that.
pub struct Fleet {
    command: PathBuf,
    specs: Vec<WorkerSpec>,
    environment_variables: FxHashMap<String, String>,
    wait_timeout: Option<Duration>,
}

impl Fleet {
    /// Create a new [`Fleet`] instance
    #[must_use]
    pub fn new(command: PathBuf, specs: Vec<WorkerSpec>) -> Self {
        Self {
            command,
            specs,
            environment_variables: FxHashMap::default(),
            wait_timeout: None,
        }
    }

    /// Set additional environment variables for every worker
    ///
    /// Workers inherit the harness environment; these are set on top of it.
    #[must_use]
    pub fn environment_variables(mut self, variables: FxHashMap<String, String>) -> Self {
        self.environment_variables = variables;
        self
    }

    /// Bound the drain phase by a fleet-wide deadline
    ///
    /// The default is to wait indefinitely, as the single-shot benchmark
    /// semantics call for. On expiry surviving workers are sent SIGTERM and
    /// the run fails with [`Error::WaitTimeout`].
    #[must_use]
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Run this [`Fleet`] to completion
    ///
    /// Spawns every worker, then waits for every worker to exit. Worker exit
    /// statuses are captured into the returned [`RunSummary`]; a non-zero
    /// worker is not an `Err` here.
    ///
    /// # Errors
    ///
    /// Function will return an error if the worker binary is not executable,
    /// if any worker or its capture file cannot be created, or if a
    /// configured wait deadline expires.
    pub async fn run(self) -> Result<RunSummary, Error> {
        if !self.command.is_executable() {
            return Err(Error::NoSuchBinary { path: self.command });
        }

        // Spawn phase. Every worker must be running before we wait on any of
        // them. A spawn failure here aborts the whole run.
        let mut children: Vec<(u32, Child)> = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            match spawn_worker(&self.command, spec, &self.environment_variables) {
                Ok(child) => {
                    info!(
                        "started worker {index} at {rate} req/s against {addr}",
                        index = spec.index,
                        rate = spec.rate_share,
                        addr = spec.target_addr,
                    );
                    children.push((spec.index, child));
                }
                Err(err) => {
                    error!("aborting fleet start: {err}");
                    abort_fleet(children, &self.specs).await;
                    return Err(err);
                }
            }
        }

        // Drain phase. Wait order does not matter for correctness, it only
        // gates harness exit.
        let deadline = self.wait_timeout.map(|timeout| Instant::now() + timeout);
        let mut outcomes = Vec::with_capacity(children.len());
        children.reverse();
        while let Some((index, mut child)) = children.pop() {
            let status = match deadline {
                None => child.wait().await.map_err(|source| Error::Wait {
                    index,
                    source: Box::new(source),
                })?,
                Some(deadline) => match time::timeout_at(deadline, child.wait()).await {
                    Ok(res) => res.map_err(|source| Error::Wait {
                        index,
                        source: Box::new(source),
                    })?,
                    Err(_elapsed) => {
                        warn!("wait deadline expired, terminating surviving workers");
                        children.push((index, child));
                        for (survivor, mut child) in children.drain(..) {
                            if let Err(err) = terminate(survivor, &mut child).await {
                                warn!("unable to reap worker {survivor}: {err}");
                            }
                        }
                        return Err(Error::WaitTimeout);
                    }
                },
            };
            if status.success() {
                debug!("worker {index} exited cleanly");
            } else {
                error!("worker {index} exited with {status}");
            }
            outcomes.push(WorkerOutcome { index, status });
        }

        Ok(RunSummary { outcomes })
    }
}

/// Build the workload binary's argument vector for one worker.
fn invocation_args(spec: &WorkerSpec) -> Vec<String> {
    let mut args = vec![
        spec.target_addr.clone(),
        spec.rate_share.to_string(),
        String::from("-w"),
        spec.warmup_seconds.to_string(),
        String::from("-W"),
        spec.window_size.to_string(),
        String::from("-x"),
        spec.index.to_string(),
    ];
    if spec.capture_path.is_some() {
        // `-r` asks the worker to emit its report on stdout, which we have
        // redirected to the capture file.
        args.push(String::from("-r"));
    }
    args
}

/// Stdout routing for one worker: the capture file when assigned, the
/// harness's own stdout otherwise.
fn capture_stdio(spec: &WorkerSpec) -> Result<Stdio, Error> {
    match &spec.capture_path {
        None => Ok(Stdio::inherit()),
        Some(path) => {
            let fp = File::create(path).map_err(|source| Error::CaptureOpen {
                index: spec.index,
                path: path.clone(),
                source: Box::new(source),
            })?;
            Ok(Stdio::from(fp))
        }
    }
}

fn spawn_worker(
    command: &Path,
    spec: &WorkerSpec,
    environment_variables: &FxHashMap<String, String>,
) -> Result<Child, Error> {
    let mut worker_cmd = Command::new(command);
    worker_cmd
        .stdin(Stdio::null())
        .stdout(capture_stdio(spec)?)
        .kill_on_drop(true)
        .args(invocation_args(spec))
        .envs(environment_variables.iter());
    worker_cmd.spawn().map_err(|source| Error::Spawn {
        index: spec.index,
        source: Box::new(source),
    })
}

async fn terminate(index: u32, child: &mut Child) -> Result<(), Error> {
    // Note that `Child::kill` sends SIGKILL which is not what we want. We
    // instead send SIGTERM so that the worker has a chance to clean up.
    if let Some(id) = child.id() {
        let pid = Pid::from_raw(i32::try_from(id).expect("could not convert worker pid to i32"));
        kill(pid, SIGTERM).map_err(|source| Error::SigTerm { index, source })?;
    }
    child.wait().await.map_err(|source| Error::Wait {
        index,
        source: Box::new(source),
    })?;
    Ok(())
}

/// Tear down a partially-started fleet: reap whatever was spawned and remove
/// this run's capture files so no partially-written captures survive.
async fn abort_fleet(children: Vec<(u32, Child)>, specs: &[WorkerSpec]) {
    for (index, mut child) in children {
        if let Err(err) = terminate(index, &mut child).await {
            warn!("unable to terminate worker {index} during abort: {err}");
        }
    }
    for spec in specs {
        if let Some(path) = &spec.capture_path {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("removed capture file {}", path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(
                    "unable to remove capture file {path}: {err}",
                    path = path.display()
                ),
            }
        }
    }
}
