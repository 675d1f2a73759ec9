//! Built-in health-check handlers.
//!
//! | Probe | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the process alive? Failure → restart. |
//! | **Readiness** | `/readyz` | Should it get new traffic? Failure → pulled from the load balancer. |
//!
//! Readiness flips to `503` as soon as the server stops accepting
//! connections, which after a fault is the whole remaining life of the
//! process.
//!
//! ```rust,no_run
//! use meadowlark::{Router, Server, health};
//!
//! # fn build(server: &Server) -> Router {
//! Router::new()
//!     .get("/healthz", health::liveness)
//!     .get("/readyz", health::readiness(server.handle()))
//! # }
//! ```

use http::StatusCode;

use crate::handler::Handler;
use crate::server::ServerHandle;
use crate::{Request, Response};

/// Always `200 OK` with body `"ok"`. If the process can respond to HTTP at
/// all, it is alive.
pub async fn liveness(_req: Request) -> Response {
    Response::text("ok")
}

/// `200 ready` while `server` accepts connections, `503 draining` after.
pub fn readiness(server: ServerHandle) -> impl Handler {
    move |_req: Request| {
        let accepting = server.is_accepting();
        async move {
            if accepting {
                Response::text("ready")
            } else {
                Response::builder().status(StatusCode::SERVICE_UNAVAILABLE).text("draining")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readiness_follows_the_listener() {
        let server = ServerHandle::new();
        let probe = readiness(server.clone()).into_boxed_handler();

        let resp = probe.call(Request::test("GET", "/readyz")).await.unwrap();
        assert_eq!(resp.status_code(), StatusCode::OK);

        server.stop_accepting();
        let resp = probe.call(Request::test("GET", "/readyz")).await.unwrap();
        assert_eq!(resp.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.body(), b"draining");
    }
}
