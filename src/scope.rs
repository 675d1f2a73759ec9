//! Per-request fault isolation scope.
//!
//! Every request carries a [`Scope`]. Work that outlives the handler's own
//! future (a task that finishes after the handler returned, or that the
//! handler is waiting on) is spawned through [`Scope::spawn`] so its failure
//! lands in the same per-request fault sink as the handler's own.
//!
//! ```rust,no_run
//! use meadowlark::{Request, Response};
//!
//! async fn send_receipt(req: Request) -> Response {
//!     req.scope().spawn(async {
//!         // a panic here is reported to this request's scope,
//!         // not lost to the runtime
//!     });
//!     Response::text("queued")
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::fault::Fault;
use crate::panic;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Where a request's scope is in the fault protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScopeState {
    /// Normal processing.
    Active,
    /// A fault was observed; drain and listener stop were issued.
    Faulted,
    /// Rendering the framework error page.
    Recovering,
    /// The error page failed; writing the raw protocol response.
    DegradedResponse,
    /// A response left the scope, normally or through recovery.
    Completed,
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Faulted => "faulted",
            Self::Recovering => "recovering",
            Self::DegradedResponse => "degraded_response",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Handle to a request's fault isolation scope.
///
/// Cheap to clone. The scope's fault sink stays open for as long as any clone
/// is alive, so tasks spawned through it keep reporting after the handler
/// returned.
#[derive(Clone)]
pub struct Scope {
    monitor: ScopeMonitor,
    sink: Option<mpsc::UnboundedSender<Fault>>,
}

impl Scope {
    /// A scope whose faults are delivered to the returned receiver.
    pub(crate) fn isolated() -> (Self, mpsc::UnboundedReceiver<Fault>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { monitor: ScopeMonitor::new(), sink: Some(tx) }, rx)
    }

    /// A scope with no observer. Faults are logged and otherwise dropped.
    pub(crate) fn detached() -> Self {
        Self { monitor: ScopeMonitor::new(), sink: None }
    }

    /// Process-unique request id, used in log fields.
    pub fn id(&self) -> u64 {
        self.monitor.id
    }

    pub fn state(&self) -> ScopeState {
        self.monitor.state()
    }

    /// Runs `fut` on the runtime, reporting a panic to this scope.
    ///
    /// A bare `tokio::spawn` from a handler is outside the scope: its panic
    /// only reaches the process backstop, with no response recovered.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_fallible(async move {
            fut.await;
            Ok::<(), Fault>(())
        })
    }

    /// Runs `fut` on the runtime, reporting an `Err` or a panic to this scope.
    pub fn spawn_fallible<F, E>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Fault> + 'static,
    {
        let scope = self.clone();
        tokio::spawn(async move {
            let fault = match panic::catch(fut).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.into(),
                Err(fault) => fault,
            };
            scope.report(fault);
        })
    }

    /// Hands `fault` to the scope's observer.
    pub fn report(&self, fault: Fault) {
        let Some(sink) = &self.sink else {
            error!(
                request_id = self.id(),
                "fault isolation: fault in a request without isolation: {fault}{}",
                fault.detail()
            );
            return;
        };
        if let Err(mpsc::error::SendError(fault)) = sink.send(fault) {
            error!(
                request_id = self.id(),
                "fault isolation: fault after the scope closed: {fault}{}",
                fault.detail()
            );
        }
    }

    pub(crate) fn monitor(&self) -> ScopeMonitor {
        self.monitor.clone()
    }
}

/// Read/transition access to a scope's state that does not hold its sink
/// open.
#[derive(Clone)]
pub(crate) struct ScopeMonitor {
    id: u64,
    state: Arc<Mutex<ScopeState>>,
}

impl ScopeMonitor {
    fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(ScopeState::Active)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> ScopeState {
        *self.state.lock()
    }

    pub(crate) fn transition(&self, to: ScopeState) {
        let from = std::mem::replace(&mut *self.state.lock(), to);
        if from != to {
            debug!(request_id = self.id, %from, %to, "scope transition");
        }
    }
}
