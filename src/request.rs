//! Incoming HTTP request type.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http::{Extensions, HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, LengthLimitError, Limited};

use crate::fault::Fault;
use crate::scope::Scope;

/// The parts of a request that survive a fault: enough to render an error
/// page after the handler's own `Request` is gone.
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub(crate) fn of<B>(req: &http::Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
        }
    }
}

/// Largest request body read into memory.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Why a request body could not be read. Answered directly, never a fault.
#[derive(Debug, thiserror::Error)]
pub(crate) enum BodyError {
    #[error("request body exceeds {MAX_BODY_BYTES} bytes")]
    TooLarge,
    #[error("failed to read request body: {0}")]
    Read(String),
}

impl BodyError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            Self::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Read(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// An incoming HTTP request with its body fully read.
pub struct Request {
    head: RequestHead,
    body: Bytes,
    params: HashMap<String, String>,
    extensions: Extensions,
    scope: Scope,
    fault: Option<Arc<Fault>>,
}

impl Request {
    /// Reads the whole body of `req`, up to [`MAX_BODY_BYTES`], and attaches
    /// it to `scope`.
    pub(crate) async fn read<B>(req: http::Request<B>, scope: Scope) -> Result<Self, BodyError>
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let head = RequestHead::of(&req);
        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => return Err(BodyError::TooLarge),
            Err(e) => return Err(BodyError::Read(e.to_string())),
        };
        Ok(Self::new(head, body, scope))
    }

    pub(crate) fn new(head: RequestHead, body: Bytes, scope: Scope) -> Self {
        Self {
            head,
            body,
            params: HashMap::new(),
            extensions: Extensions::new(),
            scope,
            fault: None,
        }
    }

    /// A body-less request describing `fault`, handed to error page handlers.
    pub(crate) fn for_fault(head: RequestHead, fault: Arc<Fault>, scope: Scope) -> Self {
        let mut req = Self::new(head, Bytes::new(), scope);
        req.fault = Some(fault);
        req
    }

    pub(crate) fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    pub fn method(&self) -> &Method { &self.head.method }
    pub fn uri(&self) -> &Uri { &self.head.uri }
    pub fn path(&self) -> &str { self.head.uri.path() }
    pub fn query(&self) -> Option<&str> { self.head.uri.query() }
    pub fn headers(&self) -> &HeaderMap { &self.head.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn head(&self) -> &RequestHead { &self.head }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Value of the first cookie called `name`.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.head
            .headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    /// Decodes an `application/x-www-form-urlencoded` body. Later duplicates
    /// win.
    pub fn form(&self) -> HashMap<String, String> {
        url::form_urlencoded::parse(&self.body).into_owned().collect()
    }

    pub fn extensions(&self) -> &Extensions { &self.extensions }
    pub fn extensions_mut(&mut self) -> &mut Extensions { &mut self.extensions }

    /// The fault isolation scope this request runs in.
    pub fn scope(&self) -> &Scope { &self.scope }

    /// The fault being rendered, when this request was given to an error
    /// page handler.
    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn test(method: &str, uri: &str) -> Self {
        let head = RequestHead {
            method: method.parse().unwrap(),
            uri: uri.parse().unwrap(),
            headers: HeaderMap::new(),
        };
        Self::new(head, Bytes::new(), Scope::detached())
    }

    #[cfg(test)]
    pub(crate) fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.head.headers.append(name, value.parse().unwrap());
        self
    }

    #[cfg(test)]
    pub(crate) fn with_body(mut self, body: &'static str) -> Self {
        self.body = Bytes::from_static(body.as_bytes());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookies_are_split_and_trimmed() {
        let req = Request::test("GET", "/")
            .with_header("cookie", "theme=dark; flash=abc")
            .with_header("cookie", "other=1");
        assert_eq!(req.cookie("flash"), Some("abc"));
        assert_eq!(req.cookie("other"), Some("1"));
        assert_eq!(req.cookie("missing"), None);
    }

    #[test]
    fn form_bodies_decode() {
        let req = Request::test("POST", "/newsletter").with_body("name=Ada+L&email=ada%40example.com");
        let form = req.form();
        assert_eq!(form["name"], "Ada L");
        assert_eq!(form["email"], "ada@example.com");
    }

    #[tokio::test]
    async fn read_collects_the_body() {
        let req = http::Request::post("/x?a=1")
            .header("x-trace", "7")
            .body(http_body_util::Full::new(Bytes::from_static(b"payload")))
            .unwrap();
        let req = Request::read(req, Scope::detached()).await.unwrap();
        assert_eq!(req.path(), "/x");
        assert_eq!(req.query(), Some("a=1"));
        assert_eq!(req.header("X-Trace"), Some("7"));
        assert_eq!(req.body(), b"payload");
        assert!(req.fault().is_none());
    }

    #[tokio::test]
    async fn oversized_bodies_are_refused() {
        let body = Bytes::from(vec![b'x'; MAX_BODY_BYTES + 1]);
        let req = http::Request::post("/newsletter").body(http_body_util::Full::new(body)).unwrap();

        let err = Request::read(req, Scope::detached()).await.err().unwrap();

        assert!(matches!(err, BodyError::TooLarge));
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
