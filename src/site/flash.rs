//! One-shot flash messages carried in a cookie across a redirect.
//!
//! A handler attaches a flash to its (redirect) response with
//! [`Flash::set_on`]. On the next request [`FlashMessages`] decodes the
//! cookie into the request extensions, where pages read it with
//! [`Flash::of`], and expires the cookie on the way out.

use std::fmt;

use crate::middleware::{Middleware, MiddlewareFuture, Next};
use crate::{Request, Response};

const COOKIE: &str = "flash";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlashKind {
    Success,
    Info,
    Warning,
    Danger,
}

impl FlashKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(Self::Success),
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "danger" => Some(Self::Danger),
            _ => None,
        }
    }
}

impl fmt::Display for FlashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Danger => "danger",
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Flash {
    pub kind: FlashKind,
    pub intro: String,
    pub message: String,
}

impl Flash {
    pub fn new(kind: FlashKind, intro: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, intro: intro.into(), message: message.into() }
    }

    /// The flash delivered with `req`, if any.
    pub fn of(req: &Request) -> Option<&Flash> {
        req.extensions().get::<Flash>()
    }

    /// Adds the `Set-Cookie` header carrying this flash to `resp`.
    pub fn set_on(&self, resp: Response) -> Response {
        resp.with_header("set-cookie", &format!("{COOKIE}={}; Path=/; HttpOnly; SameSite=Lax", self.encode()))
    }

    fn encode(&self) -> String {
        // Form encoding escapes `;`, `,` and whitespace, which cookie values
        // may not contain.
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("kind", &self.kind.to_string())
            .append_pair("intro", &self.intro)
            .append_pair("message", &self.message)
            .finish()
    }

    fn decode(raw: &str) -> Option<Self> {
        let (mut kind, mut intro, mut message) = (None, None, None);
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            match &*key {
                "kind" => kind = FlashKind::parse(&value),
                "intro" => intro = Some(value.into_owned()),
                "message" => message = Some(value.into_owned()),
                _ => {}
            }
        }
        Some(Self { kind: kind?, intro: intro.unwrap_or_default(), message: message? })
    }
}

/// Moves the flash cookie into the request and expires it once shown.
pub struct FlashMessages;

impl Middleware for FlashMessages {
    fn handle(&self, mut req: Request, next: Next) -> MiddlewareFuture {
        let delivered = req.cookie(COOKIE).and_then(Flash::decode);
        let had_cookie = req.cookie(COOKIE).is_some();
        if let Some(flash) = delivered {
            req.extensions_mut().insert(flash);
        }

        Box::pin(async move {
            let resp = next.run(req).await?;
            let prefix = format!("{COOKIE}=");
            let replaced = resp.header_values("set-cookie").any(|c| c.starts_with(&prefix));
            if had_cookie && !replaced {
                return Ok(resp.with_header("set-cookie", &format!("{COOKIE}=; Path=/; Max-Age=0")));
            }
            Ok(resp)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::Router;

    #[test]
    fn cookie_value_survives_punctuation() {
        let flash = Flash::new(FlashKind::Danger, "Validation error!", "a; b, c = d & e");
        let encoded = flash.encode();
        assert!(!encoded.contains([';', ',', ' ']));
        assert_eq!(Flash::decode(&encoded), Some(flash));
    }

    #[test]
    fn garbage_cookies_are_ignored() {
        assert_eq!(Flash::decode("kind=sparkly&message=hi"), None);
        assert_eq!(Flash::decode("%%%"), None);
    }

    fn app() -> Arc<Router> {
        Arc::new(
            Router::new()
                .layer(FlashMessages)
                .get("/", |req: Request| async move {
                    Response::text(Flash::of(&req).map(|f| f.message.clone()).unwrap_or_default())
                })
                .get("/set", |_req: Request| async {
                    Flash::new(FlashKind::Success, "Thank you!", "again").set_on(Response::redirect("/"))
                }),
        )
    }

    #[tokio::test]
    async fn flash_is_shown_once_then_cleared() {
        let flash = Flash::new(FlashKind::Success, "Thank you!", "signed up");
        let req = Request::test("GET", "/").with_header("cookie", &format!("flash={}", flash.encode()));

        let resp = Next::new(app()).run(req).await.unwrap();

        assert_eq!(resp.body(), b"signed up");
        assert_eq!(resp.header("set-cookie"), Some("flash=; Path=/; Max-Age=0"));
    }

    #[tokio::test]
    async fn a_new_flash_is_not_cleared() {
        let old = Flash::new(FlashKind::Info, "", "old");
        let req = Request::test("GET", "/set").with_header("cookie", &format!("flash={}", old.encode()));

        let resp = Next::new(app()).run(req).await.unwrap();

        let cookies: Vec<_> = resp.header_values("set-cookie").collect();
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].contains("again"));
    }

    #[tokio::test]
    async fn requests_without_flash_are_untouched() {
        let resp = Next::new(app()).run(Request::test("GET", "/")).await.unwrap();
        assert!(resp.body().is_empty());
        assert_eq!(resp.header("set-cookie"), None);
    }
}
