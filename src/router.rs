//! Radix-tree request router.
//!
//! One tree per HTTP method. O(path-length) lookup. You register a path, you
//! get a handler. Middleware layers and the fault isolation boundary wrap the
//! lookup; they never change how it works.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode};
use matchit::Router as MatchitRouter;
use tracing::{error, warn};

use crate::fault::Fault;
use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::middleware::{FaultIsolation, Middleware, Next, PlainText, RawResponse, Unanswered};
use crate::request::Request;
use crate::response::Response;
use crate::scope::Scope;

/// The application router.
///
/// Build it once at startup; pass it to [`Server::serve`](crate::Server::serve).
/// Every builder method returns `self` so registrations chain naturally.
pub struct Router {
    routes: HashMap<Method, MatchitRouter<BoxedHandler>>,
    fallback: Option<BoxedHandler>,
    layers: Vec<Arc<dyn Middleware>>,
    isolation: Option<FaultIsolation>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new(), fallback: None, layers: Vec::new(), isolation: None }
    }

    /// Register a handler for a method + path pair.
    ///
    /// Path parameters use `{name}` syntax; `req.param("name")` retrieves them:
    ///
    /// ```rust,no_run
    /// # use meadowlark::{Method, Request, Response, Router};
    /// # async fn get_user(_: Request) -> Response { Response::text("") }
    /// # async fn create_user(_: Request) -> Response { Response::text("") }
    /// Router::new()
    ///     .on(Method::GET,  "/users/{id}", get_user)
    ///     .on(Method::POST, "/users",      create_user);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid route or conflicts with one already
    /// registered for `method`. Routes are fixed at startup.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, handler.into_boxed_handler())
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::POST, path, handler)
    }

    /// Handler for requests no route matched. Defaults to a bare `404`.
    pub fn fallback(mut self, handler: impl Handler) -> Self {
        self.fallback = Some(handler.into_boxed_handler());
        self
    }

    /// Appends a middleware layer. Layers run in registration order.
    pub fn layer(mut self, middleware: impl Middleware) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Wraps every request, ahead of body parsing and all layers, in a fault
    /// isolation scope.
    pub fn isolate(mut self, isolation: FaultIsolation) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub(crate) fn layer_at(&self, index: usize) -> Option<Arc<dyn Middleware>> {
        self.layers.get(index).cloned()
    }

    /// Runs the middleware chain and the routed handler.
    pub(crate) fn run(self: &Arc<Self>, req: Request) -> BoxFuture {
        Next::new(Arc::clone(self)).run(req)
    }

    /// Looks up and calls the handler for `req`, bypassing middleware.
    pub(crate) fn route(&self, mut req: Request) -> BoxFuture {
        match self.lookup(req.method(), req.path()) {
            Some((handler, params)) => {
                req.set_params(params);
                handler.call(req)
            }
            None => match &self.fallback {
                Some(fallback) => fallback.call(req),
                None => Box::pin(async { Ok(Response::status(StatusCode::NOT_FOUND)) }),
            },
        }
    }

    fn lookup(&self, method: &Method, path: &str) -> Option<(BoxedHandler, HashMap<String, String>)> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let handler = Arc::clone(matched.value);
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((handler, params))
    }

    /// Protocol-level entry point: one hyper request in, one response out.
    pub(crate) async fn dispatch<B>(self: Arc<Self>, req: http::Request<B>) -> Result<RawResponse, Unanswered>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if let Some(isolation) = &self.isolation {
            return isolation.serve(req, Arc::clone(&self)).await;
        }

        let req = match Request::read(req, Scope::detached()).await {
            Ok(req) => req,
            Err(e) => {
                warn!("{e}");
                return Response::status(e.status()).into_inner().map_err(|_| Unanswered);
            }
        };

        let outcome = match self.run(req).await {
            Ok(resp) => resp.into_inner().map_err(Fault::from),
            Err(fault) => Err(fault),
        };

        outcome.or_else(|fault| {
            error!("unhandled fault without isolation: {fault}{}", fault.detail());
            PlainText::response().map_err(|_| Unanswered)
        })
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use http_body_util::{BodyExt, Full};

    use super::*;

    async fn user(req: Request) -> String {
        format!("user {}", req.param("id").unwrap_or("?"))
    }

    fn get(path: &str) -> http::Request<Full<Bytes>> {
        http::Request::get(path).body(Full::new(Bytes::new())).unwrap()
    }

    async fn body(resp: RawResponse) -> Bytes {
        resp.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn params_are_extracted() {
        let router = Arc::new(Router::new().get("/users/{id}", user));
        let resp = router.dispatch(get("/users/42")).await.unwrap();
        assert_eq!(body(resp).await, "user 42");
    }

    #[tokio::test]
    async fn unmatched_paths_and_methods_use_the_fallback() {
        let router = Arc::new(Router::new().get("/users/{id}", user));
        let resp = Arc::clone(&router).dispatch(get("/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let router = Arc::new(
            Router::new()
                .get("/users/{id}", user)
                .fallback(|_req: Request| async {
                    Response::builder().status(StatusCode::NOT_FOUND).html("<h1>404</h1>")
                }),
        );
        let post = http::Request::post("/users/1").body(Full::new(Bytes::new())).unwrap();
        let resp = router.dispatch(post).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(resp).await, "<h1>404</h1>");
    }

    #[tokio::test]
    async fn faults_without_isolation_become_a_bare_500() {
        let router = Arc::new(Router::new().get("/fail", |_req: Request| async {
            Err::<Response, _>(Fault::msg("boom"))
        }));
        let resp = router.dispatch(get("/fail")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn oversized_bodies_get_413_before_any_handler() {
        let router = Arc::new(Router::new().post("/newsletter", |_req: Request| async { "read it" }));
        let body = Bytes::from(vec![b'x'; crate::request::MAX_BODY_BYTES + 1]);
        let req = http::Request::post("/newsletter").body(Full::new(body)).unwrap();

        let resp = router.dispatch(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    #[should_panic(expected = "invalid route")]
    fn conflicting_routes_panic_at_startup() {
        let _ = Router::new().get("/a/{x}", user).get("/a/{y}", user);
    }
}
