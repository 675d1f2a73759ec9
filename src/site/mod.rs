//! The Meadowlark Travel site.
//!
//! Plain pages, a newsletter signup with flash messages, and two routes that
//! fail on purpose to exercise fault isolation:
//!
//! - `/fail`: the handler returns an error.
//! - `/epic-fail`: the handler hands control to a spawned task that panics,
//!   and never answers itself.

pub mod flash;
pub mod fortune;
pub mod newsletter;
pub mod views;

use http::StatusCode;

use self::flash::{Flash, FlashMessages};
use self::views::{escape, page};
use crate::middleware::{FaultIsolation, Trace};
use crate::server::ServerHandle;
use crate::{Fault, Request, Response, Router, health};

/// Every site route, behind request tracing and flash messages, isolated by
/// `isolation`.
pub fn router(isolation: FaultIsolation, server: ServerHandle) -> Router {
    Router::new()
        .isolate(isolation)
        .layer(Trace)
        .layer(FlashMessages)
        .get("/", home)
        .get("/about", about)
        .get("/newsletter", newsletter::form)
        .post("/newsletter", newsletter::subscribe)
        .get("/thank-you", newsletter::thank_you)
        .get("/fail", fail)
        .get("/epic-fail", epic_fail)
        .get("/healthz", health::liveness)
        .get("/readyz", health::readiness(server))
        .fallback(not_found)
}

async fn home(req: Request) -> Response {
    Response::html(page("Home", Flash::of(&req), "<h1>Welcome to Meadowlark Travel</h1>"))
}

async fn about(req: Request) -> Response {
    let content = format!(
        "<h1>About Meadowlark Travel</h1>\n<p>Your fortune for the day:</p>\n<blockquote>{}</blockquote>",
        escape(fortune::random()),
    );
    Response::html(page("About", Flash::of(&req), &content))
}

async fn fail(_req: Request) -> Result<Response, Fault> {
    Err(Fault::msg("Nope!"))
}

async fn epic_fail(req: Request) -> Response {
    req.scope().spawn(async {
        panic!("Kaboom!");
    });
    std::future::pending().await
}

async fn not_found(req: Request) -> Response {
    let content = "<h1>404 - Not Found</h1>\n<p>Couldn't find that page.</p>";
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .html(page("Not Found", Flash::of(&req), content))
}

/// The 500 page. Registered as the fault isolation error page.
pub async fn server_error(_req: Request) -> Response {
    let content = "<h1>500 - Server Error</h1>\n<p>We're sorry, something went wrong. Please try again later.</p>";
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .html(page("Server Error", None, content))
}
