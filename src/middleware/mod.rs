//! Middleware layer.
//!
//! Middleware intercepts requests and responses and is the right place for
//! cross-cutting concerns: structured tracing, flash messages, request-id
//! injection, authentication-header inspection.
//!
//! Layers run in registration order, outermost first. Each receives the
//! request and a [`Next`] that runs the rest of the chain and finally the
//! routed handler. The chain's output is `Result<Response, Fault>`: a layer
//! may inspect or rewrite a response, or a fault on its way out.
//!
//! [`FaultIsolation`] is not an ordinary layer: it sits at the protocol
//! boundary, ahead of body parsing and of every layer, and is registered with
//! [`Router::isolate`](crate::Router::isolate).
//!
//! Built-in middleware:
//! - [`Trace`]: per-request span with method, path, status, latency
//! - [`FaultIsolation`]: per-request fault scope and layered recovery

mod fault_isolation;
mod recovery;
mod trace;

use std::sync::Arc;

pub use fault_isolation::{FaultIsolation, FaultIsolationBuilder, Unanswered};
pub use recovery::{ErrorPage, PlainText, RawResponse, Recovery, RecoveryFuture, SERVER_ERROR_BODY};
pub use trace::Trace;

use crate::handler::BoxFuture;
use crate::request::Request;
use crate::router::Router;

/// A request/response interceptor.
///
/// ```rust,no_run
/// use meadowlark::Request;
/// use meadowlark::middleware::{Middleware, Next, MiddlewareFuture};
///
/// struct PoweredBy;
///
/// impl Middleware for PoweredBy {
///     fn handle(&self, req: Request, next: Next) -> MiddlewareFuture {
///         Box::pin(async move {
///             let resp = next.run(req).await?;
///             Ok(resp.with_header("x-powered-by", "meadowlark"))
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, req: Request, next: Next) -> MiddlewareFuture;
}

/// The future a [`Middleware`] returns.
pub type MiddlewareFuture = BoxFuture;

/// The remainder of the middleware chain.
pub struct Next {
    router: Arc<Router>,
    index: usize,
}

impl Next {
    pub(crate) fn new(router: Arc<Router>) -> Self {
        Self { router, index: 0 }
    }

    /// Runs the remaining layers, then the routed handler.
    pub fn run(mut self, req: Request) -> MiddlewareFuture {
        match self.router.layer_at(self.index) {
            Some(layer) => {
                self.index += 1;
                layer.handle(req, self)
            }
            None => self.router.route(req),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::Response;

    struct Record(&'static str, Arc<Mutex<Vec<&'static str>>>);

    impl Middleware for Record {
        fn handle(&self, req: Request, next: Next) -> MiddlewareFuture {
            let (name, log) = (self.0, Arc::clone(&self.1));
            Box::pin(async move {
                log.lock().push(name);
                let resp = next.run(req).await?;
                log.lock().push(name);
                Ok(resp.with_header("x-layer", name))
            })
        }
    }

    #[tokio::test]
    async fn layers_run_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let router = Arc::new(
            Router::new()
                .layer(Record("outer", Arc::clone(&log)))
                .layer(Record("inner", Arc::clone(&log)))
                .get("/", |_req: Request| async { Response::text("hi") }),
        );

        let resp = Next::new(router).run(Request::test("GET", "/")).await.unwrap();

        assert_eq!(*log.lock(), ["outer", "inner", "inner", "outer"]);
        let layers: Vec<_> = resp.header_values("x-layer").collect();
        assert_eq!(layers, ["inner", "outer"]);
    }
}
