use std::{fmt, sync::Arc};

use bytes::Bytes;
use regex::Regex;
use serde_json::Value;

use crate::common::data::RequestRecord;

pub type HeaderPredicate = Arc<dyn Fn(&[(String, String)]) -> bool + Send + Sync>;
pub type BodyPredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;
pub type RequestPredicate = Arc<dyn Fn(&RequestRecord) -> bool + Send + Sync>;

/// How a rule matches the request path.
#[derive(Clone, Debug)]
pub enum PathPattern {
    /// Matches every path.
    Any,
    /// Matches exactly this path.
    Exact(String),
    /// Matches every path starting with this prefix.
    Prefix(String),
    /// Matches every path the regular expression finds a match in.
    Regex(Regex),
}

impl PathPattern {
    /// Parses the simple wildcard syntax: a trailing `*` turns the pattern into a prefix match
    /// (`/api/*` matches `/api/` and everything below it), a lone `*` matches any path, and
    /// anything else is an exact match.
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some("") => PathPattern::Any,
            Some(prefix) => PathPattern::Prefix(prefix.to_string()),
            None => PathPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Any => true,
            PathPattern::Exact(expected) => expected == path,
            PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathPattern::Regex(regex) => regex.is_match(path),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Any => f.write_str("*"),
            PathPattern::Exact(path) => f.write_str(path),
            PathPattern::Prefix(prefix) => write!(f, "{}*", prefix),
            PathPattern::Regex(regex) => write!(f, "~{}", regex.as_str()),
        }
    }
}

/// A header or query parameter requirement: the name must be present and, if a value is given,
/// at least one occurrence must carry exactly that value.
#[derive(Clone, Debug)]
struct KeyValue {
    name: String,
    value: Option<String>,
}

/// Decides whether a rule applies to a request.
///
/// Requirements are checked in a fixed order: method, path, query, headers, body, and finally
/// the whole-request predicates registered with [is_true](RequestMatcher::is_true). The first
/// failing requirement short-circuits the rest. An empty matcher accepts every request.
#[derive(Clone, Default)]
pub struct RequestMatcher {
    method: Option<String>,
    path: Option<PathPattern>,
    query: Vec<KeyValue>,
    headers: Vec<KeyValue>,
    header_predicates: Vec<HeaderPredicate>,
    body: Option<Bytes>,
    body_includes: Vec<Vec<u8>>,
    json_body: Option<Value>,
    body_predicates: Vec<BodyPredicate>,
    request_predicates: Vec<RequestPredicate>,
}

impl RequestMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires the request method, compared case-insensitively.
    pub fn method<M: ToString>(mut self, method: M) -> Self {
        self.method = Some(method.to_string().to_ascii_uppercase());
        self
    }

    /// Requires the path to equal `path` exactly.
    pub fn path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = Some(PathPattern::Exact(path.into()));
        self
    }

    /// Requires the path to start with `prefix`.
    pub fn path_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.path = Some(PathPattern::Prefix(prefix.into()));
        self
    }

    /// Requires the path to match a wildcard pattern, see [PathPattern::parse].
    pub fn path_pattern(mut self, pattern: &str) -> Self {
        self.path = Some(PathPattern::parse(pattern));
        self
    }

    /// Requires the path to match a regular expression.
    pub fn path_matches(mut self, regex: Regex) -> Self {
        self.path = Some(PathPattern::Regex(regex));
        self
    }

    /// Requires the decoded query parameter `name` to have the value `value`.
    pub fn query_param<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.query.push(KeyValue {
            name: name.into(),
            value: Some(value.into()),
        });
        self
    }

    /// Requires the query parameter `name` to be present.
    pub fn query_param_exists<K: Into<String>>(mut self, name: K) -> Self {
        self.query.push(KeyValue {
            name: name.into(),
            value: None,
        });
        self
    }

    /// Requires a header `name` (case-insensitive) with value `value`.
    pub fn header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push(KeyValue {
            name: name.into(),
            value: Some(value.into()),
        });
        self
    }

    /// Requires a header `name` (case-insensitive) to be present.
    pub fn header_exists<K: Into<String>>(mut self, name: K) -> Self {
        self.headers.push(KeyValue {
            name: name.into(),
            value: None,
        });
        self
    }

    /// Adds an arbitrary predicate over all request headers.
    pub fn headers_match<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&[(String, String)]) -> bool + Send + Sync + 'static,
    {
        self.header_predicates.push(Arc::new(predicate));
        self
    }

    /// Requires the body to equal `body` byte for byte.
    pub fn body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Requires the body to contain `part`.
    pub fn body_includes<B: AsRef<[u8]>>(mut self, part: B) -> Self {
        self.body_includes.push(part.as_ref().to_vec());
        self
    }

    /// Requires the body to be JSON equal to `value`.
    pub fn json_body<V: Into<Value>>(mut self, value: V) -> Self {
        self.json_body = Some(value.into());
        self
    }

    /// Adds an arbitrary predicate over the request body.
    pub fn body_matches<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.body_predicates.push(Arc::new(predicate));
        self
    }

    /// Adds an arbitrary predicate over the whole request. Evaluated after all other
    /// requirements.
    pub fn is_true<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestRecord) -> bool + Send + Sync + 'static,
    {
        self.request_predicates.push(Arc::new(predicate));
        self
    }

    pub fn matches(&self, req: &RequestRecord) -> bool {
        self.method_matches(req)
            && self.path_matches_request(req)
            && self.query_matches(req)
            && self.headers_match_request(req)
            && self.body_matches_request(req)
            && self.request_predicates.iter().all(|p| p(req))
    }

    fn method_matches(&self, req: &RequestRecord) -> bool {
        self.method
            .as_ref()
            .map_or(true, |m| m.eq_ignore_ascii_case(req.method()))
    }

    fn path_matches_request(&self, req: &RequestRecord) -> bool {
        self.path.as_ref().map_or(true, |p| p.matches(req.path()))
    }

    fn query_matches(&self, req: &RequestRecord) -> bool {
        self.query.iter().all(|kv| match req.query().get(&kv.name) {
            None => false,
            Some(values) => kv
                .value
                .as_ref()
                .map_or(true, |expected| values.iter().any(|v| v == expected)),
        })
    }

    fn headers_match_request(&self, req: &RequestRecord) -> bool {
        self.headers.iter().all(|kv| {
            let values = req.header_values(&kv.name);
            match &kv.value {
                None => !values.is_empty(),
                Some(expected) => values.iter().any(|v| v == expected),
            }
        }) && self.header_predicates.iter().all(|p| p(req.headers()))
    }

    fn body_matches_request(&self, req: &RequestRecord) -> bool {
        let body: &[u8] = req.body();

        self.body.as_ref().map_or(true, |expected| expected == body)
            && self
                .body_includes
                .iter()
                .all(|part| contains_slice(body, part))
            && self.json_body.as_ref().map_or(true, |expected| {
                serde_json::from_slice::<Value>(body).map_or(false, |actual| &actual == expected)
            })
            && self.body_predicates.iter().all(|p| p(body))
    }
}

impl fmt::Debug for RequestMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMatcher")
            .field("method", &self.method)
            .field("path", &self.path.as_ref().map(|p| p.to_string()))
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("header_predicates", &self.header_predicates.len())
            .field("body", &self.body)
            .field("body_predicates", &self.body_predicates.len())
            .field("request_predicates", &self.request_predicates.len())
            .finish()
    }
}

fn contains_slice(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}
