//! Request logging.

use std::time::Instant;

use tracing::{Instrument, info, info_span, warn};

use super::{Middleware, MiddlewareFuture, Next};
use crate::request::Request;

/// Opens a span per request and logs status and latency when it completes.
pub struct Trace;

impl Middleware for Trace {
    fn handle(&self, req: Request, next: Next) -> MiddlewareFuture {
        let span = info_span!(
            "request",
            id = req.scope().id(),
            method = %req.method(),
            path = %req.path(),
        );

        Box::pin(
            async move {
                let started = Instant::now();
                let outcome = next.run(req).await;
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                match &outcome {
                    Ok(resp) => info!(status = resp.status_code().as_u16(), elapsed_ms, "request completed"),
                    Err(fault) => warn!(elapsed_ms, "request faulted: {fault}"),
                }
                outcome
            }
            .instrument(span),
        )
    }
}
