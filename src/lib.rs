//! `httpstub` is an HTTP stub server to embed in automated tests.
//!
//! A [StubServer] binds a local port, answers the requests of the code under test with
//! responses scripted by the test, and records every request it receives so the test can make
//! assertions about them afterwards. Each server runs on its own thread with its own
//! single-threaded Tokio runtime, so it works the same in synchronous and asynchronous tests.
//!
//! # Getting Started
//! ```rust
//! use httpstub::prelude::*;
//!
//! // Start a server on an OS-assigned port.
//! let server = StubServer::start_new().unwrap();
//!
//! // Script a response.
//! let hello = server.rule(|when, then| {
//!     when.method(GET).path("/hello");
//!     then.status(200).header("content-type", "text/plain").body("hi");
//! });
//!
//! // Let the code under test talk to the server.
//! let response = reqwest::blocking::get(server.url("/hello")).unwrap();
//! assert_eq!(response.status(), 200);
//!
//! // Inspect what the server received.
//! server.assert_rule_hits(hello, 1).unwrap();
//! server.assert_last_request_path("/hello").unwrap();
//! assert_eq!(server.requests().len(), 1);
//! ```
//!
//! # Rules
//! Rules are evaluated in registration order; the first rule whose matcher accepts a request
//! answers it. Requests no rule matches receive the default response (`404` with an empty body
//! unless configured otherwise). A rule answers either with a fixed [ResponseTemplate] or with
//! a function computing one from the [RequestRecord]:
//!
//! ```rust
//! use httpstub::prelude::*;
//!
//! let server = StubServer::start_new().unwrap();
//!
//! server.rule_fn(
//!     |when| {
//!         when.path_pattern("/echo/*");
//!     },
//!     |req| Ok(ResponseTemplate::ok().body(req.path().trim_start_matches("/echo/").to_string())),
//! );
//!
//! let body = reqwest::blocking::get(server.url("/echo/ping")).unwrap().text().unwrap();
//! assert_eq!(body, "ping");
//! ```
//!
//! # Lifecycle
//! A server is created stopped ([StubServer::new], [StubServerBuilder::build]) or running
//! ([StubServer::start_new], [StubServerBuilder::start]). [StubServer::stop] lets in-flight
//! exchanges finish within the shutdown timeout and closes the rest; dropping the server stops
//! it as well. A stopped server can be started again and keeps its rules and history.
//!
//! # Logging
//! The crate logs through `tracing`. Without a `tracing` subscriber the events are forwarded to
//! the `log` crate, so `env_logger` or any other logger shows them. Enable
//! [StubServerBuilder::access_log] to log one line per answered request.
mod api;
mod common;
mod server;

pub use api::{
    output::AssertionFailure,
    rule::{Then, When},
    server::{Error, StubServer},
};
pub use common::data::{
    BoxError, Exchange, Method, Outcome, RecordedResponse, RequestRecord, Responder,
    ResponseTemplate, RuleId, ServerState,
};
pub use regex::Regex;
pub use server::{
    builder::StubServerBuilder,
    matchers::{PathPattern, RequestMatcher},
};

pub mod prelude {
    #[doc(no_inline)]
    pub use crate::{
        AssertionFailure, Method::*, RequestMatcher, RequestRecord, Responder, ResponseTemplate,
        StubServer, StubServerBuilder,
    };
}
