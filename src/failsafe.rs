//! Process failsafe timer.
//!
//! Once any request faults, the process is considered compromised. The
//! failsafe is a one-shot deadline armed on the first fault: when it elapses
//! the process exits with status [`EXIT_CODE`], however far graceful recovery
//! got. It cannot be disarmed.
//!
//! The timer runs on a dedicated OS thread rather than the tokio runtime so
//! that it still fires when the runtime itself is wedged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, warn};

use crate::error::Error;

/// Exit status used when the failsafe terminates the process.
pub const EXIT_CODE: i32 = 1;

/// Default delay between the first fault and process exit.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

/// What the failsafe does when it fires.
pub trait Terminator: Send + Sync + 'static {
    fn terminate(&self, code: i32);
}

/// Exits the process. The production [`Terminator`].
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Shared handle to the process failsafe. Clones arm the same timer.
#[derive(Clone)]
pub struct Failsafe {
    inner: Arc<Inner>,
}

struct Inner {
    delay: Duration,
    armed: AtomicBool,
    terminator: Arc<dyn Terminator>,
}

impl Failsafe {
    /// A failsafe that exits the process `delay` after being armed.
    pub fn new(delay: Duration) -> Self {
        Self::with_terminator(delay, ProcessExit)
    }

    pub fn with_terminator(delay: Duration, terminator: impl Terminator) -> Self {
        Self {
            inner: Arc::new(Inner {
                delay,
                armed: AtomicBool::new(false),
                terminator: Arc::new(terminator),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::Acquire)
    }

    /// Starts the countdown. Returns `Ok(false)` if it was already running.
    pub fn arm(&self) -> Result<bool, Error> {
        if self
            .inner
            .armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        let delay = self.inner.delay;
        let terminator = Arc::clone(&self.inner.terminator);
        let spawned = std::thread::Builder::new()
            .name("failsafe".to_owned())
            .spawn(move || {
                std::thread::sleep(delay);
                error!(?delay, code = EXIT_CODE, "fault isolation: failsafe elapsed, terminating process");
                terminator.terminate(EXIT_CODE);
            });

        match spawned {
            Ok(_) => {
                warn!(?delay, "fault isolation: failsafe armed");
                Ok(true)
            }
            Err(e) => {
                // Leave it disarmed so the next fault tries again.
                self.inner.armed.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Terminates now instead of waiting out the delay. Used once the server
    /// has drained after a fault and there is nothing left to wait for.
    pub fn expedite(&self) {
        error!(code = EXIT_CODE, "fault isolation: drained after fault, terminating process");
        self.inner.terminator.terminate(EXIT_CODE);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;

    /// Records terminations instead of exiting.
    #[derive(Clone, Default)]
    pub(crate) struct Recorder {
        pub(crate) calls: Arc<Mutex<Vec<(i32, Instant)>>>,
    }

    impl Terminator for Recorder {
        fn terminate(&self, code: i32) {
            self.calls.lock().push((code, Instant::now()));
        }
    }
}
