//! Multi-process worker topology.
//!
//! A [`Supervisor`] runs `n` copies of the current executable as worker
//! processes. Each worker binds the same port with `SO_REUSEPORT` and the
//! kernel spreads connections between them.
//!
//! The control channel is the worker's standard streams:
//!
//! - **worker → supervisor**: a `disconnect` line on stdout. The worker is
//!   compromised and draining; the supervisor forks a replacement right away
//!   instead of waiting for it to exit. Logs therefore go to stderr.
//! - **supervisor → worker**: closing the worker's stdin. The worker should
//!   drain and exit (see [`released`]).
//!
//! A worker that exits without disconnecting first is replaced too, unless it
//! died within [`MIN_UPTIME`] of starting: that is a crash loop, and the
//! supervisor gives up on that slot rather than fork forever.

use std::collections::HashMap;
use std::ffi::OsString;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::server::shutdown_signal;

/// Set on every worker process to its worker id.
pub const WORKER_ID_ENV: &str = "MEADOWLARK_WORKER_ID";

/// A worker that exits sooner than this after starting is not replaced.
pub const MIN_UPTIME: Duration = Duration::from_secs(1);

const DISCONNECT: &str = "disconnect";

// ── Worker side ───────────────────────────────────────────────────────────────

/// A worker's end of the control channel.
#[derive(Clone)]
pub struct WorkerLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    id: usize,
    control: Mutex<Box<dyn Write + Send>>,
    disconnected: AtomicBool,
}

impl WorkerLink {
    /// The link for this process, if a supervisor started it.
    pub fn from_env() -> Result<Option<Self>, Error> {
        match std::env::var(WORKER_ID_ENV) {
            Ok(raw) => {
                let id = raw
                    .parse()
                    .map_err(|_| Error::Worker(format!("invalid {WORKER_ID_ENV} `{raw}`")))?;
                Ok(Some(Self::new(id, std::io::stdout())))
            }
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(Error::Worker(e.to_string())),
        }
    }

    /// A link writing control messages to `control`.
    pub fn new(id: usize, control: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                id,
                control: Mutex::new(Box::new(control)),
                disconnected: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::Acquire)
    }

    /// Tells the supervisor to stop counting on this worker. Idempotent.
    pub fn disconnect(&self) -> Result<(), Error> {
        if self.inner.disconnected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut control = self.inner.control.lock();
        writeln!(control, "{DISCONNECT}")?;
        control.flush()?;
        warn!(worker = self.inner.id, "worker disconnected from supervisor");
        Ok(())
    }
}

/// Resolves when the supervisor closes this process's stdin.
///
/// Reads on a dedicated thread: a blocking stdin read on the runtime's
/// blocking pool would hold up runtime shutdown.
pub async fn released() {
    let (tx, rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("supervisor-link".to_owned())
        .spawn(move || {
            let _ = std::io::copy(&mut std::io::stdin().lock(), &mut std::io::sink());
            let _ = tx.send(());
        });
    match spawned {
        Ok(_) => {
            let _ = rx.await;
        }
        Err(e) => {
            error!("failed to watch supervisor link: {e}");
            std::future::pending::<()>().await;
        }
    }
}

// ── Supervisor side ───────────────────────────────────────────────────────────

#[derive(Debug)]
enum WorkerEvent {
    Disconnected(usize),
    Exited(usize, Option<i32>),
}

struct Worker {
    stdin: Option<ChildStdin>,
    started: Instant,
    disconnected: bool,
}

/// Forks and babysits worker processes.
pub struct Supervisor {
    workers: usize,
    program: PathBuf,
    args: Vec<OsString>,
}

impl Supervisor {
    /// Supervises `workers` copies of the running executable, with the same
    /// arguments.
    pub fn new(workers: usize) -> Result<Self, Error> {
        let program = std::env::current_exe()?;
        let args = std::env::args_os().skip(1).collect();
        Ok(Self::with_command(workers, program, args))
    }

    pub fn with_command(workers: usize, program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self { workers, program: program.into(), args }
    }

    /// Runs until SIGTERM / Ctrl-C, then releases every worker and waits for
    /// them to exit.
    pub async fn run(self) -> Result<(), Error> {
        self.run_until(shutdown_signal()).await.map(drop)
    }

    /// Runs until `shutdown` resolves. Returns how many workers were started
    /// in total, replacements included.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<usize, Error> {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut live: HashMap<usize, Worker> = HashMap::new();
        let mut next_id = 0;

        for _ in 0..self.workers {
            live.insert(next_id, self.spawn(next_id, &events_tx)?);
            next_id += 1;
        }
        info!(workers = self.workers, "supervisor started");

        tokio::pin!(shutdown);
        let mut stopping = false;

        while !(stopping && live.is_empty()) {
            tokio::select! {
                () = &mut shutdown, if !stopping => {
                    stopping = true;
                    info!(live = live.len(), "supervisor shutting down, releasing workers");
                    for worker in live.values_mut() {
                        worker.stdin.take();
                    }
                }

                Some(event) = events.recv() => match event {
                    WorkerEvent::Disconnected(id) => {
                        if let Some(worker) = live.get_mut(&id) {
                            worker.disconnected = true;
                        }
                        if !stopping {
                            info!(worker = id, replacement = next_id, "worker disconnected, forking replacement");
                            live.insert(next_id, self.spawn(next_id, &events_tx)?);
                            next_id += 1;
                        }
                    }
                    WorkerEvent::Exited(id, code) => {
                        let Some(worker) = live.remove(&id) else { continue };
                        info!(worker = id, ?code, "worker exited");
                        if stopping || worker.disconnected {
                            continue;
                        }
                        if worker.started.elapsed() < MIN_UPTIME {
                            error!(worker = id, ?code, "worker died during startup, not replacing it");
                        } else {
                            warn!(worker = id, replacement = next_id, "worker died unexpectedly, forking replacement");
                            live.insert(next_id, self.spawn(next_id, &events_tx)?);
                            next_id += 1;
                        }
                        if live.is_empty() {
                            return Err(Error::Worker("every worker exited".to_owned()));
                        }
                    }
                },
            }
        }

        info!(started = next_id, "supervisor stopped");
        Ok(next_id)
    }

    fn spawn(&self, id: usize, events: &mpsc::UnboundedSender<WorkerEvent>) -> Result<Worker, Error> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ID_ENV, id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Worker(format!("failed to fork worker {id}: {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Worker(format!("worker {id} stdout not captured")))?;
        info!(worker = id, pid = child.id(), "worker started");

        let events = events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim() == DISCONNECT {
                    let _ = events.send(WorkerEvent::Disconnected(id));
                } else {
                    debug!(worker = id, "unexpected control line `{line}`");
                }
            }

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    error!(worker = id, "failed to reap worker: {e}");
                    None
                }
            };
            let _ = events.send(WorkerEvent::Exited(id, code));
        });

        Ok(Worker { stdin, started: Instant::now(), disconnected: false })
    }
}
