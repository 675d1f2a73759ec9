//! Request-level faults.
//!
//! A [`Fault`] is what a request produces when it fails in a way nobody
//! planned for: a handler returning `Err`, a handler panicking, or a task the
//! handler spawned into its [`Scope`](crate::Scope) failing after the handler
//! already returned. Expected failures (bad input, missing records) are
//! ordinary responses and never become faults.
//!
//! `Fault` deliberately does not implement [`std::error::Error`] so that any
//! error type converts into it with `?`, the same trade-off `eyre::Report`
//! makes.
//!
//! Every fault records where it was raised and a stack backtrace, whether or
//! not `RUST_BACKTRACE` is set: faults are rare and each one ends the process.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::Location;

use crate::panic;

/// How a fault was raised.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultKind {
    /// A handler or scoped task returned an error value.
    Error,
    /// A handler or scoped task panicked.
    Panic,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => f.write_str("error"),
            Self::Panic => f.write_str("panic"),
        }
    }
}

/// An unhandled failure raised while producing a response.
pub struct Fault {
    kind: FaultKind,
    message: String,
    causes: Vec<String>,
    location: Option<String>,
    backtrace: Backtrace,
}

impl Fault {
    /// A fault carrying only a message.
    #[track_caller]
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Error,
            message: message.into(),
            causes: Vec::new(),
            location: Some(caller()),
            backtrace: Backtrace::force_capture(),
        }
    }

    /// Builds a fault from a payload caught by `catch_unwind`.
    ///
    /// Location and backtrace come from the panic hook when it was installed
    /// and saw the panic on this task or thread.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with a non-string payload".to_owned()
        };

        let (location, backtrace) = match panic::take_report() {
            Some(report) => (Some(report.location), report.backtrace),
            None => (None, Backtrace::disabled()),
        };

        Self { kind: FaultKind::Panic, message, causes: Vec::new(), location, backtrace }
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// `file:line:col` where the fault was raised: the panic site, or the
    /// `?` / [`Fault::msg`] call that produced an error fault.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Display strings of the error's `source()` chain, outermost first.
    pub fn causes(&self) -> &[String] {
        &self.causes
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Cause chain and backtrace rendered for a log line.
    pub fn detail(&self) -> String {
        let mut out = String::new();
        for (i, cause) in self.causes.iter().enumerate() {
            out.push_str(&format!("\n  {i}: {cause}"));
        }
        if self.backtrace.status() == BacktraceStatus::Captured {
            out.push_str(&format!("\nstack backtrace:\n{}", self.backtrace));
        }
        out
    }
}

impl<E> From<E> for Fault
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[track_caller]
    fn from(e: E) -> Self {
        let mut causes = Vec::new();
        let mut source = e.source();
        while let Some(s) = source {
            causes.push(s.to_string());
            source = s.source();
        }
        Self {
            kind: FaultKind::Error,
            message: e.to_string(),
            causes,
            location: Some(caller()),
            backtrace: Backtrace::force_capture(),
        }
    }
}

#[track_caller]
fn caller() -> String {
    let at = Location::caller();
    format!("{}:{}:{}", at.file(), at.line(), at.column())
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("causes", &self.causes)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("render failed")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn errors_keep_their_source_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "template missing");
        let fault = Fault::from(Outer(inner));
        assert_eq!(fault.kind(), FaultKind::Error);
        assert_eq!(fault.message(), "render failed");
        assert_eq!(fault.causes(), ["template missing".to_owned()]);
        assert!(fault.detail().contains("0: template missing"));
    }

    fn read_template() -> Result<(), Fault> {
        Err(std::io::Error::other("boom"))?;
        Ok(())
    }

    #[test]
    fn error_faults_carry_location_and_stack_without_env_vars() {
        let fault = read_template().unwrap_err();
        assert!(fault.location().is_some_and(|l| l.contains("fault.rs")), "{:?}", fault.location());
        assert_eq!(fault.backtrace().status(), BacktraceStatus::Captured);
        assert!(fault.detail().contains("stack backtrace"));

        let fault = Fault::msg("Nope!");
        assert!(fault.location().is_some_and(|l| l.contains("fault.rs")));
        assert!(!fault.detail().is_empty());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let fault = Fault::from_panic(Box::new("boom"));
        assert_eq!(fault.kind(), FaultKind::Panic);
        assert_eq!(fault.message(), "boom");

        let fault = Fault::from_panic(Box::new(String::from("owned boom")));
        assert_eq!(fault.to_string(), "owned boom");

        let fault = Fault::from_panic(Box::new(42_u8));
        assert!(fault.message().contains("non-string"));
    }
}
