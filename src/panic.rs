//! Panic capture.
//!
//! Two jobs:
//!
//! 1. [`catch`] runs a future inside a fault boundary and turns a panic into
//!    a [`Fault`]. Every boundary marks the current thread while it polls, so
//!    the hook knows the panic will be handled.
//! 2. [`install`] replaces the process panic hook. Inside a boundary it only
//!    records location and backtrace for the [`Fault`] about to be built.
//!    Outside every boundary it is the last-resort backstop: it logs the
//!    panic at `error` level, since nothing else will, and runs the
//!    registered backstop (see `FaultIsolationBuilder::backstop`).

use std::backtrace::Backtrace;
use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, Once};
use std::task::{Context, Poll};
use std::thread::ThreadId;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::error;

use crate::fault::Fault;

/// Reports older than this many uncollected panics are dropped.
const MAX_PENDING_REPORTS: usize = 256;

thread_local! {
    static BOUNDARY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Where the hook saw a panic. Reports are keyed by tokio task when there is
/// one, so a boundary collects the report of its own task only.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
enum ReportKey {
    Task(tokio::task::Id),
    Thread(ThreadId),
}

impl ReportKey {
    fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Self::Task(id),
            None => Self::Thread(std::thread::current().id()),
        }
    }
}

pub(crate) struct PanicReport {
    pub(crate) location: String,
    pub(crate) backtrace: Backtrace,
}

static REPORTS: LazyLock<Mutex<HashMap<ReportKey, PanicReport>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static INSTALL: Once = Once::new();

type Backstop = Arc<dyn Fn() + Send + Sync>;

static BACKSTOP: LazyLock<Mutex<Option<Backstop>>> = LazyLock::new(|| Mutex::new(None));

/// Runs `contain` for every panic outside a boundary. Replaces any previous
/// backstop.
pub(crate) fn set_backstop(contain: impl Fn() + Send + Sync + 'static) {
    *BACKSTOP.lock() = Some(Arc::new(contain));
}

/// Installs the process-wide panic hook. Idempotent.
pub fn install() {
    INSTALL.call_once(|| {
        std::panic::set_hook(Box::new(|info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_owned());
            let backtrace = Backtrace::force_capture();

            if BOUNDARY_DEPTH.with(Cell::get) > 0 {
                let mut reports = REPORTS.lock();
                if reports.len() >= MAX_PENDING_REPORTS {
                    reports.clear();
                }
                reports.insert(ReportKey::current(), PanicReport { location, backtrace });
                return;
            }

            let message = info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(
                %location,
                backtrace = %backtrace,
                "fault isolation: panic outside any request scope: {message}"
            );

            let backstop = BACKSTOP.lock().clone();
            if let Some(contain) = backstop {
                contain();
            }
        }));
    });
}

/// Takes the report the hook recorded for the current task or thread.
pub(crate) fn take_report() -> Option<PanicReport> {
    REPORTS.lock().remove(&ReportKey::current())
}

/// Polls `fut` inside a fault boundary.
pub(crate) async fn catch<F>(fut: F) -> Result<F::Output, Fault>
where
    F: Future,
{
    AssertUnwindSafe(Guarded { inner: Box::pin(fut) })
        .catch_unwind()
        .await
        .map_err(Fault::from_panic)
}

/// Runs `f` inside a fault boundary.
pub(crate) fn catch_sync<T>(f: impl FnOnce() -> T) -> Result<T, Fault> {
    let _depth = DepthGuard::enter();
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(Fault::from_panic)
}

/// Marks the thread as inside a boundary for the duration of every poll.
struct Guarded<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Guarded<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _depth = DepthGuard::enter();
        self.inner.as_mut().poll(cx)
    }
}

/// Decrements the depth on drop, including while unwinding.
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        BOUNDARY_DEPTH.with(|d| d.set(d.get() + 1));
        Self
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        BOUNDARY_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}
