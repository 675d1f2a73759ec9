//! Per-request fault isolation.
//!
//! Every request runs inside its own [`Scope`]. A fault observed in that
//! scope (the handler returning `Err`, the handler panicking, or a task
//! spawned through the scope failing, before or after the response went out)
//! never escapes it. Instead the observer:
//!
//! 1. arms the process [`Failsafe`],
//! 2. disconnects the cluster worker, if this process is one,
//! 3. stops the listener accepting new connections (in-flight ones finish),
//! 4. walks the [`Recovery`] chain until one strategy produces a response.
//!
//! When every strategy fails the connection is dropped and the failsafe is
//! the only thing left. Nothing raised while recovering propagates: each step
//! runs in its own fault boundary and a failure is logged and skipped.

use std::convert::identity;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{error, warn};

use super::recovery::{ErrorPage, PlainText, RawResponse, Recovery};
use crate::cluster::WorkerLink;
use crate::error::Error;
use crate::failsafe::Failsafe;
use crate::fault::Fault;
use crate::handler::Handler;
use crate::panic;
use crate::request::{Request, RequestHead};
use crate::response::Response;
use crate::router::Router;
use crate::scope::{Scope, ScopeMonitor, ScopeState};
use crate::server::ServerHandle;

/// Request id logged for panics outside every request. Scope ids start at 1.
const ESCAPED: u64 = 0;

/// Returned to hyper when no recovery strategy produced a response. hyper
/// closes the connection.
#[derive(Debug, thiserror::Error)]
#[error("faulted request left unanswered")]
pub struct Unanswered;

/// The fault isolation layer. Register it with
/// [`Router::isolate`](crate::Router::isolate).
///
/// ```rust,no_run
/// use std::time::Duration;
/// use meadowlark::{Failsafe, Request, Response, Router, Server};
/// use meadowlark::middleware::FaultIsolation;
///
/// # async fn run() -> Result<(), meadowlark::Error> {
/// let server = Server::bind("0.0.0.0:3000")?;
/// let isolation = FaultIsolation::builder(server.handle(), Failsafe::new(Duration::from_secs(5)))
///     .error_page(|_req: Request| async { Response::html("<h1>500</h1>") })
///     .build();
///
/// server.serve(Router::new().isolate(isolation)).await
/// # }
/// ```
#[derive(Clone)]
pub struct FaultIsolation {
    inner: Arc<Inner>,
}

struct Inner {
    server: ServerHandle,
    failsafe: Failsafe,
    worker: Option<WorkerLink>,
    recovery: Vec<Box<dyn Recovery>>,
}

pub struct FaultIsolationBuilder {
    server: ServerHandle,
    failsafe: Failsafe,
    worker: Option<WorkerLink>,
    error_page: Option<ErrorPage>,
    recovery: Option<Vec<Box<dyn Recovery>>>,
    backstop: bool,
}

impl FaultIsolationBuilder {
    /// Disconnect this cluster worker on fault.
    pub fn worker(mut self, link: WorkerLink) -> Self {
        self.worker = Some(link);
        self
    }

    /// The framework-level error page, tried before the plain-text fallback.
    pub fn error_page(mut self, handler: impl Handler) -> Self {
        self.error_page = Some(ErrorPage::new(handler));
        self
    }

    /// Replaces the default recovery chain entirely.
    pub fn recovery(mut self, chain: Vec<Box<dyn Recovery>>) -> Self {
        self.recovery = Some(chain);
        self
    }

    /// Also contains panics that escape every request scope, such as one in
    /// a bare `tokio::spawn`: the process panic hook arms the failsafe,
    /// disconnects the worker and stops the listener. There is no request to
    /// answer. The hook holds one backstop; the last one built wins.
    pub fn backstop(mut self) -> Self {
        self.backstop = true;
        self
    }

    pub fn build(self) -> FaultIsolation {
        panic::install();

        let recovery = self.recovery.unwrap_or_else(|| {
            let mut chain: Vec<Box<dyn Recovery>> = Vec::new();
            if let Some(page) = self.error_page {
                chain.push(Box::new(page));
            }
            chain.push(Box::new(PlainText));
            chain
        });

        let isolation = FaultIsolation {
            inner: Arc::new(Inner {
                server: self.server,
                failsafe: self.failsafe,
                worker: self.worker,
                recovery,
            }),
        };
        if self.backstop {
            let contained = isolation.clone();
            panic::set_backstop(move || contained.contain(ESCAPED));
        }
        isolation
    }
}

impl FaultIsolation {
    pub fn builder(server: ServerHandle, failsafe: Failsafe) -> FaultIsolationBuilder {
        FaultIsolationBuilder {
            server,
            failsafe,
            worker: None,
            error_page: None,
            recovery: None,
            backstop: false,
        }
    }

    /// Serves one request inside a fresh scope.
    pub(crate) async fn serve<B>(
        &self,
        req: http::Request<B>,
        router: Arc<Router>,
    ) -> Result<RawResponse, Unanswered>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (scope, mut faults) = Scope::isolated();
        let monitor = scope.monitor();
        let head = RequestHead::of(&req);

        let mut work = Box::pin(panic::catch(async move {
            let req = match Request::read(req, scope).await {
                Ok(req) => req,
                Err(e) => {
                    warn!("{e}");
                    return Ok::<_, Fault>(Response::status(e.status()).into_inner()?);
                }
            };
            Ok::<_, Fault>(router.run(req).await?.into_inner()?)
        }));

        let outcome = tokio::select! {
            biased;
            Some(fault) = faults.recv() => Err(fault),
            outcome = &mut work => outcome.and_then(identity),
        };
        // Cancels the handler if it was still running.
        drop(work);

        let fault = match outcome {
            Ok(resp) => {
                monitor.transition(ScopeState::Completed);
                self.watch_late_faults(faults, monitor);
                return Ok(resp);
            }
            Err(fault) => fault,
        };

        self.observe(&monitor, &fault);
        let answer = self.recover(&monitor, head, fault).await;
        self.watch_late_faults(faults, monitor);
        answer
    }

    /// Records the fault on the scope, then contains it.
    fn observe(&self, monitor: &ScopeMonitor, fault: &Fault) {
        monitor.transition(ScopeState::Faulted);
        error!(
            request_id = monitor.id(),
            kind = %fault.kind(),
            location = fault.location().unwrap_or("-"),
            "fault isolation: {fault}{}",
            fault.detail()
        );

        self.contain(monitor.id());
    }

    /// Steps 1 to 3 of the protocol. Each step is isolated from the others.
    fn contain(&self, request_id: u64) {
        let inner = &self.inner;
        step(request_id, "arm failsafe", || inner.failsafe.arm().map(drop));
        if let Some(worker) = &inner.worker {
            step(request_id, "disconnect worker", || worker.disconnect());
        }
        step(request_id, "stop accepting", || {
            inner.server.stop_accepting();
            Ok(())
        });
    }

    async fn recover(
        &self,
        monitor: &ScopeMonitor,
        head: RequestHead,
        fault: Fault,
    ) -> Result<RawResponse, Unanswered> {
        let fault = Arc::new(fault);

        for (attempt, strategy) in self.inner.recovery.iter().enumerate() {
            monitor.transition(if attempt == 0 {
                ScopeState::Recovering
            } else {
                ScopeState::DegradedResponse
            });

            let head = head.clone();
            let fault = Arc::clone(&fault);
            let outcome = panic::catch(async move { strategy.recover(head, fault).await })
                .await
                .and_then(identity);

            match outcome {
                Ok(resp) => {
                    monitor.transition(ScopeState::Completed);
                    return Ok(resp);
                }
                Err(e) => error!(
                    request_id = monitor.id(),
                    strategy = strategy.name(),
                    "fault isolation: recovery failed: {e}{}",
                    e.detail()
                ),
            }
        }

        error!(
            request_id = monitor.id(),
            "fault isolation: no recovery succeeded, dropping the connection"
        );
        Err(Unanswered)
    }

    /// Keeps observing the scope until its last task is gone.
    fn watch_late_faults(&self, mut faults: mpsc::UnboundedReceiver<Fault>, monitor: ScopeMonitor) {
        loop {
            match faults.try_recv() {
                Ok(fault) => self.late_fault(&monitor, &fault),
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => break,
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(fault) = faults.recv().await {
                this.late_fault(&monitor, &fault);
            }
        });
    }

    fn late_fault(&self, monitor: &ScopeMonitor, fault: &Fault) {
        self.observe(monitor, fault);
        error!(
            request_id = monitor.id(),
            "fault isolation: response already sent, nothing left to recover"
        );
    }
}

fn step(request_id: u64, name: &str, f: impl FnOnce() -> Result<(), Error>) {
    match panic::catch_sync(f) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(request_id, "fault isolation: {name} failed: {e}"),
        Err(fault) => error!(
            request_id,
            "fault isolation: {name} panicked: {fault}{}",
            fault.detail()
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::StatusCode;
    use http_body_util::{BodyExt, Full};
    use parking_lot::Mutex;

    use super::*;
    use crate::failsafe::testing::Recorder;
    use crate::middleware::recovery::{RecoveryFuture, SERVER_ERROR_BODY};

    struct Harness {
        isolation: FaultIsolation,
        server: ServerHandle,
        failsafe: Failsafe,
    }

    fn harness(configure: impl FnOnce(FaultIsolationBuilder) -> FaultIsolationBuilder) -> Harness {
        let server = ServerHandle::new();
        let failsafe = Failsafe::with_terminator(Duration::from_secs(60), Recorder::default());
        let isolation = configure(FaultIsolation::builder(server.clone(), failsafe.clone())).build();
        Harness { isolation, server, failsafe }
    }

    fn get(path: &str) -> http::Request<Full<Bytes>> {
        http::Request::get(path).body(Full::new(Bytes::new())).unwrap()
    }

    async fn body(resp: RawResponse) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn error_page(req: Request) -> Response {
        let message = req.fault().map(|f| f.message().to_owned()).unwrap_or_default();
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .html(format!("<h1>500</h1><p>{message}</p>"))
    }

    struct Broken;

    impl Recovery for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn recover(&self, _head: RequestHead, _fault: Arc<Fault>) -> RecoveryFuture {
            panic!("recovery itself is broken")
        }
    }

    #[tokio::test]
    async fn healthy_requests_complete_without_side_effects() {
        let h = harness(|b| b);
        let router = Arc::new(Router::new().get("/", |_req: Request| async { "home" }));

        let resp = h.isolation.serve(get("/"), router).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(resp).await, "home");
        assert!(h.server.is_accepting());
        assert!(!h.failsafe.is_armed());
    }

    #[tokio::test]
    async fn scope_state_ends_completed_for_healthy_requests() {
        let h = harness(|b| b);
        let seen = Arc::new(Mutex::new(None));
        let seen_in_handler = Arc::clone(&seen);
        let router = Arc::new(Router::new().get("/", move |req: Request| {
            let seen = Arc::clone(&seen_in_handler);
            async move {
                *seen.lock() = Some(req.scope().clone());
                "ok"
            }
        }));

        h.isolation.serve(get("/"), router).await.unwrap();

        let scope = seen.lock().take().unwrap();
        assert_eq!(scope.state(), ScopeState::Completed);
    }

    #[tokio::test]
    async fn handler_errors_render_the_error_page_and_drain() {
        let h = harness(|b| b.error_page(error_page));
        let router = Arc::new(Router::new().get("/fail", |_req: Request| async {
            Err::<Response, _>(Fault::msg("boom"))
        }));

        let resp = h.isolation.serve(get("/fail"), router).await.unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(resp).await, "<h1>500</h1><p>boom</p>");
        assert!(!h.server.is_accepting());
        assert!(h.failsafe.is_armed());
    }

    #[tokio::test]
    async fn handler_panics_are_contained() {
        let h = harness(|b| b.error_page(error_page));
        let router = Arc::new(Router::new().get("/panic", |_req: Request| async {
            if true {
                panic!("boom");
            }
            "unreachable"
        }));

        let resp = h.isolation.serve(get("/panic"), router).await.unwrap();

        assert_eq!(body(resp).await, "<h1>500</h1><p>boom</p>");
        assert!(h.failsafe.is_armed());
    }

    #[tokio::test]
    async fn faults_after_the_handler_returned_control_are_captured() {
        let h = harness(|b| b.error_page(error_page));
        let router = Arc::new(Router::new().get("/epic-fail", |req: Request| async move {
            req.scope().spawn(async {
                tokio::task::yield_now().await;
                panic!("late boom");
            });
            std::future::pending::<Response>().await
        }));

        let resp = h.isolation.serve(get("/epic-fail"), router).await.unwrap();

        assert_eq!(body(resp).await, "<h1>500</h1><p>late boom</p>");
        assert!(!h.server.is_accepting());
    }

    #[tokio::test]
    async fn broken_error_page_falls_back_to_plain_text() {
        let h = harness(|b| {
            b.error_page(|_req: Request| async { Err::<Response, _>(Fault::msg("template missing")) })
        });
        let router = Arc::new(Router::new().get("/fail", |_req: Request| async {
            Err::<Response, _>(Fault::msg("boom"))
        }));

        let resp = h.isolation.serve(get("/fail"), router).await.unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers()[http::header::CONTENT_TYPE], "text/plain");
        assert_eq!(body(resp).await, SERVER_ERROR_BODY);
    }

    #[tokio::test]
    async fn every_recovery_failing_leaves_the_request_unanswered() {
        let h = harness(|b| b.recovery(vec![Box::new(Broken), Box::new(Broken)]));
        let router = Arc::new(Router::new().get("/fail", |_req: Request| async {
            Err::<Response, _>(Fault::msg("boom"))
        }));

        let outcome = h.isolation.serve(get("/fail"), router).await;

        assert!(outcome.is_err());
        assert!(h.failsafe.is_armed(), "failsafe is the backstop");
        assert!(!h.server.is_accepting());
    }

    #[tokio::test]
    async fn faults_after_the_response_still_drain() {
        let h = harness(|b| b);
        let router = Arc::new(Router::new().get("/", |req: Request| async move {
            req.scope().spawn(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                panic!("after response");
            });
            "sent"
        }));

        let resp = h.isolation.serve(get("/"), router).await.unwrap();
        assert_eq!(body(resp).await, "sent");
        assert!(h.server.is_accepting());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!h.server.is_accepting());
        assert!(h.failsafe.is_armed());
    }

    #[tokio::test]
    async fn sibling_requests_are_unaffected() {
        let h = harness(|b| b.error_page(error_page));
        let router = Arc::new(
            Router::new()
                .get("/slow", |_req: Request| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    "slow done"
                })
                .get("/fail", |_req: Request| async { Err::<Response, _>(Fault::msg("boom")) }),
        );

        let (slow, fail) = tokio::join!(
            h.isolation.serve(get("/slow"), Arc::clone(&router)),
            h.isolation.serve(get("/fail"), Arc::clone(&router)),
        );

        assert_eq!(body(slow.unwrap()).await, "slow done");
        assert_eq!(fail.unwrap().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    /// Collects everything logged on this thread while the guard lives.
    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Logs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Logs {
        fn capture() -> (Self, tracing::subscriber::DefaultGuard) {
            let logs = Self::default();
            let writer = logs.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .with_max_level(tracing::Level::INFO)
                .finish();
            (logs, tracing::subscriber::set_default(subscriber))
        }

        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[tokio::test]
    async fn healthy_requests_log_nothing_at_error_level() {
        let (logs, _guard) = Logs::capture();
        let h = harness(|b| b.error_page(error_page));
        let router = Arc::new(Router::new().get("/", |_req: Request| async { "home" }));

        h.isolation.serve(get("/"), router).await.unwrap();

        assert!(!logs.text().contains("ERROR"), "{}", logs.text());
    }

    #[tokio::test]
    async fn faults_and_failed_recoveries_are_logged_with_their_stack() {
        let (logs, _guard) = Logs::capture();
        let h = harness(|b| {
            b.error_page(|_req: Request| async { Err::<Response, _>(Fault::msg("template missing")) })
        });
        let router = Arc::new(Router::new().get("/fail", |_req: Request| async {
            Err::<Response, _>(Fault::msg("boom"))
        }));

        let resp = h.isolation.serve(get("/fail"), router).await.unwrap();
        assert_eq!(body(resp).await, SERVER_ERROR_BODY);

        let text = logs.text();
        assert!(text.contains("ERROR"), "{text}");
        assert!(text.contains("fault isolation: boom"), "{text}");
        assert!(text.contains("stack backtrace"), "{text}");
        assert!(text.contains("fault isolation: recovery failed: template missing"), "{text}");
    }

    #[tokio::test]
    async fn panics_outside_every_scope_reach_the_backstop() {
        let h = harness(|b| b.backstop());

        let escaped = std::thread::spawn(|| panic!("bare spawn blew up")).join();

        assert!(escaped.is_err());
        assert!(h.failsafe.is_armed());
        assert!(!h.server.is_accepting());
    }
}
