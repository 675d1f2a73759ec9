//! # meadowlark
//!
//! A small server-rendered site on a minimal HTTP framework, with per-request
//! fault isolation.
//!
//! ## Fault isolation
//!
//! Every request runs in its own [`Scope`]. A fault anywhere in that request
//! (a handler `Err`, a panic in the handler, or a panic in a task it spawned
//! through [`Scope::spawn`]) is contained to the scope and triggers, in
//! order:
//!
//! 1. a [`Failsafe`] that force-exits the process after a grace period,
//! 2. disconnecting this worker from its cluster supervisor, if any,
//! 3. closing the listener, so in-flight requests drain and nothing new
//!    arrives,
//! 4. the best response still possible: the site's error page, else a raw
//!    `500 Server error.`, else a dropped connection.
//!
//! A faulted process is treated as compromised: it finishes what it has and
//! goes away. Sibling requests are never answered with the fault.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use meadowlark::middleware::FaultIsolation;
//! use meadowlark::{Failsafe, Request, Response, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meadowlark::Error> {
//!     let server = Server::bind("0.0.0.0:3000")?;
//!     let isolation = FaultIsolation::builder(server.handle(), Failsafe::new(Duration::from_secs(5)))
//!         .error_page(|_req: Request| async { Response::html("<h1>500</h1>") })
//!         .build();
//!
//!     let app = Router::new()
//!         .isolate(isolation)
//!         .get("/users/{id}", |req: Request| async move {
//!             format!("user {}", req.param("id").unwrap_or("?"))
//!         });
//!
//!     server.serve(app).await
//! }
//! ```

mod error;
mod failsafe;
mod fault;
mod handler;
mod panic;
mod request;
mod response;
mod router;
mod scope;
mod server;

pub mod cluster;
pub mod config;
pub mod health;
pub mod middleware;
pub mod site;
pub mod telemetry;

pub use error::Error;
pub use failsafe::{DEFAULT_DELAY, EXIT_CODE, Failsafe, ProcessExit, Terminator};
pub use fault::{Fault, FaultKind};
pub use handler::{Handler, Reply};
pub use http::{Method, StatusCode};
pub use request::{Request, RequestHead};
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use scope::{Scope, ScopeState};
pub use server::{Server, ServerHandle};
