//! Recovery strategies for a faulted request.
//!
//! [`FaultIsolation`](super::FaultIsolation) tries its strategies in order,
//! each inside its own fault boundary, until one produces a response. The
//! default chain is [`ErrorPage`] (when one is registered) followed by
//! [`PlainText`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use http_body_util::Full;

use crate::fault::Fault;
use crate::handler::{BoxedHandler, Handler};
use crate::request::{Request, RequestHead};
use crate::scope::Scope;

/// A response in hyper's terms, past every framework layer.
pub type RawResponse = http::Response<Full<Bytes>>;

pub type RecoveryFuture = Pin<Box<dyn Future<Output = Result<RawResponse, Fault>> + Send + 'static>>;

/// Body of the last-resort response.
pub const SERVER_ERROR_BODY: &str = "Server error.";

/// One way of answering a faulted request.
pub trait Recovery: Send + Sync + 'static {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    fn recover(&self, head: RequestHead, fault: Arc<Fault>) -> RecoveryFuture;
}

/// Renders the error through a regular framework handler, e.g. a templated
/// 500 page. The handler sees the fault via [`Request::fault`].
///
/// A handler that answers with a non-error status is overridden to `500`:
/// a faulted request never looks successful.
pub struct ErrorPage {
    handler: BoxedHandler,
}

impl ErrorPage {
    pub fn new(handler: impl Handler) -> Self {
        Self { handler: handler.into_boxed_handler() }
    }
}

impl Recovery for ErrorPage {
    fn name(&self) -> &'static str {
        "error page"
    }

    fn recover(&self, head: RequestHead, fault: Arc<Fault>) -> RecoveryFuture {
        let fut = self.handler.call(Request::for_fault(head, fault, Scope::detached()));
        Box::pin(async move {
            let resp = fut.await?;
            let status = resp.status_code();
            let resp = if status.is_client_error() || status.is_server_error() {
                resp
            } else {
                resp.with_status(StatusCode::INTERNAL_SERVER_ERROR)
            };
            Ok(resp.into_inner()?)
        })
    }
}

/// `500`, `text/plain`, `Server error.`, built straight on the `http` crate
/// with no framework code involved.
pub struct PlainText;

impl PlainText {
    pub fn response() -> Result<RawResponse, http::Error> {
        http::Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header(CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from_static(SERVER_ERROR_BODY.as_bytes())))
    }
}

impl Recovery for PlainText {
    fn name(&self) -> &'static str {
        "plain text"
    }

    fn recover(&self, _head: RequestHead, _fault: Arc<Fault>) -> RecoveryFuture {
        Box::pin(async { Ok(Self::response()?) })
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;
    use crate::Response;

    fn head() -> RequestHead {
        RequestHead {
            method: http::Method::GET,
            uri: "/fail".parse().unwrap(),
            headers: http::HeaderMap::new(),
        }
    }

    async fn body(resp: RawResponse) -> Bytes {
        resp.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn plain_text_is_the_fixed_500() {
        let resp = PlainText.recover(head(), Arc::new(Fault::msg("boom"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(body(resp).await, SERVER_ERROR_BODY.as_bytes());
    }

    #[tokio::test]
    async fn error_page_sees_the_fault_and_is_forced_to_500() {
        let page = ErrorPage::new(|req: Request| async move {
            let message = req.fault().map(|f| f.message().to_owned()).unwrap_or_default();
            Response::html(format!("<h1>Oops: {message}</h1>"))
        });

        let resp = page.recover(head(), Arc::new(Fault::msg("boom"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(resp).await, "<h1>Oops: boom</h1>".as_bytes());
    }

    #[tokio::test]
    async fn error_page_keeps_an_explicit_error_status() {
        let page = ErrorPage::new(|_req: Request| async { Response::status(StatusCode::SERVICE_UNAVAILABLE) });
        let resp = page.recover(head(), Arc::new(Fault::msg("boom"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn error_page_failures_surface_as_faults() {
        let page = ErrorPage::new(|_req: Request| async {
            Err::<Response, _>(Fault::msg("template missing"))
        });
        let fault = page.recover(head(), Arc::new(Fault::msg("boom"))).await.unwrap_err();
        assert_eq!(fault.message(), "template missing");
    }
}
