use std::{cell::Cell, rc::Rc, time::Duration};

use bytes::Bytes;
use regex::Regex;
use serde_json::Value;

use crate::{
    common::{
        data::{RequestRecord, ResponseTemplate},
        util::update_cell,
    },
    server::matchers::RequestMatcher,
};

/// The request side of a rule declared with [StubServer::rule](crate::StubServer::rule).
///
/// Every method adds a requirement; a request must satisfy all of them for the rule to apply.
/// A `When` without requirements matches every request.
///
/// # Example
/// ```rust
/// use httpstub::prelude::*;
///
/// let server = StubServer::start_new().unwrap();
///
/// server.rule(|when, then| {
///     when.method(GET).path("/hello").query_param("name", "world");
///     then.status(200).body("hello world");
/// });
///
/// let response = reqwest::blocking::get(server.url("/hello?name=world")).unwrap();
/// assert_eq!(response.text().unwrap(), "hello world");
/// ```
pub struct When {
    pub(crate) matcher: Rc<Cell<RequestMatcher>>,
}

impl When {
    fn update<F>(self, f: F) -> Self
    where
        F: FnOnce(RequestMatcher) -> RequestMatcher,
    {
        update_cell(&self.matcher, |m| *m = f(std::mem::take(m)));
        self
    }

    /// Matches any request. Only states intent; a `When` without requirements already does.
    pub fn any_request(self) -> Self {
        self
    }

    /// Requires the request method. Compared case-insensitively.
    pub fn method<M: ToString>(self, method: M) -> Self {
        self.update(|m| m.method(method))
    }

    /// Requires the path to be exactly `path`.
    pub fn path<S: Into<String>>(self, path: S) -> Self {
        self.update(|m| m.path(path))
    }

    /// Requires the path to start with `prefix`.
    pub fn path_prefix<S: Into<String>>(self, prefix: S) -> Self {
        self.update(|m| m.path_prefix(prefix))
    }

    /// Requires the path to match a wildcard pattern: `/api/*` matches everything below
    /// `/api/`, `*` matches every path.
    pub fn path_pattern(self, pattern: &str) -> Self {
        self.update(|m| m.path_pattern(pattern))
    }

    /// Requires the path to match a regular expression.
    pub fn path_matches(self, regex: Regex) -> Self {
        self.update(|m| m.path_matches(regex))
    }

    pub fn query_param<K: Into<String>, V: Into<String>>(self, name: K, value: V) -> Self {
        self.update(|m| m.query_param(name, value))
    }

    pub fn query_param_exists<K: Into<String>>(self, name: K) -> Self {
        self.update(|m| m.query_param_exists(name))
    }

    /// Requires a header with the given value. Header names are case-insensitive.
    pub fn header<K: Into<String>, V: Into<String>>(self, name: K, value: V) -> Self {
        self.update(|m| m.header(name, value))
    }

    pub fn header_exists<K: Into<String>>(self, name: K) -> Self {
        self.update(|m| m.header_exists(name))
    }

    /// Adds a custom predicate over all request headers.
    pub fn headers_match<F>(self, predicate: F) -> Self
    where
        F: Fn(&[(String, String)]) -> bool + Send + Sync + 'static,
    {
        self.update(|m| m.headers_match(predicate))
    }

    /// Requires the body to be exactly `body`.
    pub fn body<B: Into<Bytes>>(self, body: B) -> Self {
        self.update(|m| m.body(body))
    }

    pub fn body_includes<B: AsRef<[u8]>>(self, part: B) -> Self {
        self.update(|m| m.body_includes(part))
    }

    /// Requires the body to be JSON equal to `value`, regardless of formatting and key order.
    pub fn json_body<V: Into<Value>>(self, value: V) -> Self {
        self.update(|m| m.json_body(value))
    }

    /// Adds a custom predicate over the request body.
    pub fn body_matches<F>(self, predicate: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.update(|m| m.body_matches(predicate))
    }

    /// Adds a custom predicate over the whole request, evaluated after all other requirements.
    pub fn is_true<F>(self, predicate: F) -> Self
    where
        F: Fn(&RequestRecord) -> bool + Send + Sync + 'static,
    {
        self.update(|m| m.is_true(predicate))
    }
}

/// The response side of a rule declared with [StubServer::rule](crate::StubServer::rule).
/// Starts out as `200 OK` with an empty body.
pub struct Then {
    pub(crate) response: Rc<Cell<ResponseTemplate>>,
}

impl Then {
    fn update<F>(self, f: F) -> Self
    where
        F: FnOnce(ResponseTemplate) -> ResponseTemplate,
    {
        update_cell(&self.response, |r| *r = f(std::mem::take(r)));
        self
    }

    /// Sets the status code. Codes outside `100..=999` are answered with `500` instead.
    pub fn status(self, status: u16) -> Self {
        self.update(|mut r| {
            r.status = status;
            r
        })
    }

    pub fn header<K: Into<String>, V: Into<String>>(self, name: K, value: V) -> Self {
        self.update(|r| r.header(name, value))
    }

    pub fn body<B: Into<Bytes>>(self, body: B) -> Self {
        self.update(|r| r.body(body))
    }

    /// Sets a JSON body and a matching `content-type` header.
    pub fn json_body<V: Into<Value>>(self, value: V) -> Self {
        self.update(|r| r.json_body(value))
    }

    /// Holds the response back for `delay`.
    pub fn delay(self, delay: Duration) -> Self {
        self.update(|r| r.delay(delay))
    }

    /// Replaces everything configured so far with `template`.
    pub fn template(self, template: ResponseTemplate) -> Self {
        self.update(|_| template)
    }
}
