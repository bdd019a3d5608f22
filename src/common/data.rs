use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    str::FromStr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Boxed error type that dynamic responders return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The function signature of a dynamic responder.
pub type ResponderFn = dyn Fn(&RequestRecord) -> Result<ResponseTemplate, BoxError> + Send + Sync;

/// Lifecycle state of a [StubServer](crate::StubServer).
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// HTTP methods for use in request matchers. Any type implementing `ToString` is accepted by
/// [RequestMatcher::method](crate::RequestMatcher::method), so this enum is only a convenience.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Method {
    GET,
    HEAD,
    POST,
    PUT,
    DELETE,
    CONNECT,
    OPTIONS,
    TRACE,
    PATCH,
}

impl FromStr for Method {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::GET),
            "HEAD" => Ok(Method::HEAD),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            "DELETE" => Ok(Method::DELETE),
            "CONNECT" => Ok(Method::CONNECT),
            "OPTIONS" => Ok(Method::OPTIONS),
            "TRACE" => Ok(Method::TRACE),
            "PATCH" => Ok(Method::PATCH),
            _ => Err(format!("Invalid HTTP method {}", input)),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identifies a rule registered on a stub server. Returned by `add_rule` and friends and
/// accepted by `remove_rule`.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId(pub(crate) usize);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An immutable snapshot of one HTTP request received by the stub server.
///
/// Records are created by the connection that parsed the request and are shared with the
/// test code as `Arc<RequestRecord>`. Malformed requests are recorded too; for those
/// [parse_error](RequestRecord::parse_error) returns the reason and all fields the server
/// could not determine are left empty.
#[derive(Serialize, Debug, Clone)]
pub struct RequestRecord {
    sequence: usize,
    method: String,
    path: String,
    raw_query: Option<String>,
    query: BTreeMap<String, Vec<String>>,
    version: String,
    headers: Vec<(String, String)>,
    body: Bytes,
    received_at: SystemTime,
    remote_addr: Option<SocketAddr>,
    parse_error: Option<String>,
}

impl RequestRecord {
    pub(crate) fn new(
        method: String,
        path: String,
        raw_query: Option<String>,
        version: String,
        headers: Vec<(String, String)>,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let query = raw_query
            .as_deref()
            .map(parse_query)
            .unwrap_or_default();

        Self {
            sequence: 0,
            method,
            path,
            raw_query,
            query,
            version,
            headers,
            body,
            received_at: SystemTime::now(),
            remote_addr,
            parse_error: None,
        }
    }

    /// A record for a request that could not be parsed at all.
    pub(crate) fn malformed(remote_addr: Option<SocketAddr>, reason: String) -> Self {
        Self::new(
            String::new(),
            String::new(),
            None,
            String::new(),
            Vec::new(),
            Bytes::new(),
            remote_addr,
        )
        .with_parse_error(reason)
    }

    pub(crate) fn with_parse_error(mut self, reason: String) -> Self {
        self.parse_error = Some(reason);
        self
    }

    pub(crate) fn with_sequence(mut self, sequence: usize) -> Self {
        self.sequence = sequence;
        self
    }

    /// Position of this request in the arrival order of the server that received it.
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    /// The request method as sent by the client, e.g. `GET`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The undecoded query string, if the request target had one.
    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// All decoded query parameters. Repeated parameters keep every value in arrival order.
    pub fn query(&self) -> &BTreeMap<String, Vec<String>> {
        &self.query
    }

    /// The first value of the query parameter `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// The path followed by `?` and the raw query string, if any.
    pub fn uri(&self) -> String {
        match &self.raw_query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// The protocol version, e.g. `HTTP/1.1`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// All headers with lowercased names. Headers are grouped by name in the order each name
    /// first appeared; the values of a repeated header keep their arrival order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The first value of the header `name`. Header names are compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of the header `name`, in arrival order.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// The de-framed request body (chunked encoding already removed).
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as text, replacing invalid UTF-8 sequences.
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Deserializes the body as JSON.
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// The address of the client that sent the request.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Why the request was considered malformed, if it was.
    pub fn parse_error(&self) -> Option<&str> {
        self.parse_error.as_deref()
    }

    pub fn is_malformed(&self) -> bool {
        self.parse_error.is_some()
    }
}

fn parse_query(query: &str) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

/// The response a rule answers with: status code, headers and body, plus an optional delay
/// before the response is written.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ResponseTemplate {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub delay: Option<Duration>,
}

impl ResponseTemplate {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
            delay: None,
        }
    }

    /// `200 OK` with an empty body.
    pub fn ok() -> Self {
        Self::new(200)
    }

    /// `404 Not Found` with an empty body. This is what the server answers when no rule matches
    /// and no other default response has been configured.
    pub fn not_found() -> Self {
        Self::new(404)
    }

    /// Appends a header. Headers are sent in the order they were added.
    pub fn header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a JSON body and adds `content-type: application/json` unless a content type was
    /// already set.
    pub fn json_body<V: Into<Value>>(mut self, value: V) -> Self {
        self.body = Bytes::from(value.into().to_string());
        if !self
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        {
            self.headers
                .push(("content-type".to_string(), "application/json".to_string()));
        }
        self
    }

    /// Serializes `body` as JSON. See [json_body](ResponseTemplate::json_body).
    pub fn json_body_obj<T: Serialize>(self, body: &T) -> Result<Self, serde_json::Error> {
        Ok(self.json_body(serde_json::to_value(body)?))
    }

    /// Holds the response back for `delay` before it is written.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Default for ResponseTemplate {
    fn default() -> Self {
        Self::ok()
    }
}

/// Either a fixed response or a function computing one from the request.
#[derive(Clone)]
pub enum Responder {
    Static(ResponseTemplate),
    Dynamic(Arc<ResponderFn>),
}

impl Responder {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&RequestRecord) -> Result<ResponseTemplate, BoxError> + Send + Sync + 'static,
    {
        Responder::Dynamic(Arc::new(f))
    }
}

impl From<ResponseTemplate> for Responder {
    fn from(template: ResponseTemplate) -> Self {
        Responder::Static(template)
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Responder::Static(template) => f.debug_tuple("Static").field(template).finish(),
            Responder::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// How the server arrived at the response it sent.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A rule matched and its responder produced the response.
    Matched { rule: RuleId },
    /// No rule matched; the default response was sent.
    Unmatched,
    /// The request could not be parsed or read completely.
    Malformed { reason: String },
    /// A rule matched but its responder failed or produced an invalid response.
    ResponderFailed { rule: RuleId, reason: String },
}

/// The response the server sent for a recorded request.
#[derive(Serialize, Debug, Clone)]
pub struct RecordedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub outcome: Outcome,
}

/// A recorded request together with the response that was sent for it. `response` is `None`
/// while the request is still being answered.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: Arc<RequestRecord>,
    pub response: Option<RecordedResponse>,
}
