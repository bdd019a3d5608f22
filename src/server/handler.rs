use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, request::Parts, HeaderName, HeaderValue, Request, Response, StatusCode};
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    common::{
        data::{Outcome, RecordedResponse, RequestRecord, Responder, ResponseTemplate},
        runtime,
        util::panic_message,
    },
    server::state::{ActiveRule, Resolution, StateManager},
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("responder failed: {0}")]
    Responder(String),
    #[error("rule could not be evaluated: {0}")]
    Matcher(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub(crate) trait Handler {
    /// Records a fully read request, resolves it against the rule table and produces the
    /// response to write.
    async fn handle(&self, req: Request<Bytes>, remote_addr: SocketAddr) -> Response<Bytes>;

    /// Records a request whose head was parsed but which could not be read completely, and
    /// produces the error response that closes the connection.
    fn reject(
        &self,
        parts: &Parts,
        remote_addr: SocketAddr,
        err: Error,
        status: StatusCode,
    ) -> Response<Bytes>;

    /// Records a request the connection could not parse at all. The HTTP layer has already
    /// answered it with `status`.
    fn record_malformed(&self, remote_addr: SocketAddr, err: Error, status: StatusCode);
}

pub(crate) struct StubHandler<S>
where
    S: StateManager + Send + Sync + 'static,
{
    state: Arc<S>,
    access_log: bool,
}

impl<S> StubHandler<S>
where
    S: StateManager + Send + Sync + 'static,
{
    pub fn new(state: Arc<S>, access_log: bool) -> Self {
        Self { state, access_log }
    }

    fn log_access(&self, req: &RequestRecord, status: u16, started: Instant) {
        if self.access_log {
            tracing::info!(
                method = req.method(),
                path = req.path(),
                status = status,
                duration_ms = started.elapsed().as_millis() as u64,
                "{} {} -> {}",
                req.method(),
                req.uri(),
                status
            );
        }
    }
}

#[async_trait]
impl<S> Handler for StubHandler<S>
where
    S: StateManager + Send + Sync + 'static,
{
    async fn handle(&self, req: Request<Bytes>, remote_addr: SocketAddr) -> Response<Bytes> {
        let started = Instant::now();

        let (parts, body) = req.into_parts();
        let record = self
            .state
            .record_request(to_record(&parts, body, remote_addr));

        tracing::trace!("Recorded request #{}: {} {}", record.sequence(), record.method(), record.uri());

        let (template, outcome) = match self.state.resolve(&record) {
            Resolution::Default(template) => (template, Outcome::Unmatched),
            Resolution::Failed { rule, reason } => {
                let err = Error::Matcher(reason);
                (
                    error_template(&err),
                    Outcome::ResponderFailed {
                        rule,
                        reason: err.to_string(),
                    },
                )
            }
            Resolution::Rule(rule) => match respond(&rule, &record).await {
                Ok(template) => (template, Outcome::Matched { rule: rule.id }),
                Err(err) => {
                    tracing::warn!("Rule {} failed to answer {} {}: {}", rule.id, record.method(), record.path(), err);
                    (
                        error_template(&err),
                        Outcome::ResponderFailed {
                            rule: rule.id,
                            reason: err.to_string(),
                        },
                    )
                }
            },
        };

        let (template, response, outcome) = match to_response(&template) {
            Ok(response) => (template, response, outcome),
            Err(err) => {
                tracing::warn!("Cannot send response for {} {}: {}", record.method(), record.path(), err);
                let outcome = match outcome {
                    Outcome::Matched { rule } => Outcome::ResponderFailed {
                        rule,
                        reason: err.to_string(),
                    },
                    other => other,
                };
                let template = error_template(&err);
                let response = fallback_response(&template);
                (template, response, outcome)
            }
        };

        if let Some(delay) = template.delay {
            runtime::sleep(delay).await;
        }

        self.state.record_response(
            record.sequence(),
            RecordedResponse {
                status: template.status,
                headers: template.headers,
                body: template.body,
                outcome,
            },
        );

        self.log_access(&record, response.status().as_u16(), started);

        response
    }

    fn reject(
        &self,
        parts: &Parts,
        remote_addr: SocketAddr,
        err: Error,
        status: StatusCode,
    ) -> Response<Bytes> {
        let reason = err.to_string();
        tracing::warn!("Rejecting request {} {} from {}: {}", parts.method, parts.uri, remote_addr, reason);

        let record = self.state.record_request(
            to_record(parts, Bytes::new(), remote_addr).with_parse_error(reason.clone()),
        );

        let body = Bytes::from(reason.clone());
        self.state.record_response(
            record.sequence(),
            RecordedResponse {
                status: status.as_u16(),
                headers: vec![(header::CONNECTION.as_str().to_string(), "close".to_string())],
                body: body.clone(),
                outcome: Outcome::Malformed { reason },
            },
        );

        let mut response = Response::new(body);
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        response
    }

    fn record_malformed(&self, remote_addr: SocketAddr, err: Error, status: StatusCode) {
        let reason = err.to_string();
        tracing::warn!("Malformed request from {}: {}", remote_addr, reason);

        let record = self
            .state
            .record_request(RequestRecord::malformed(Some(remote_addr), reason.clone()));

        self.state.record_response(
            record.sequence(),
            RecordedResponse {
                status: status.as_u16(),
                headers: Vec::new(),
                body: Bytes::new(),
                outcome: Outcome::Malformed { reason },
            },
        );
    }
}

fn to_record(parts: &Parts, body: Bytes, remote_addr: SocketAddr) -> RequestRecord {
    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    RequestRecord::new(
        parts.method.as_str().to_string(),
        parts.uri.path().to_string(),
        parts.uri.query().map(String::from),
        format!("{:?}", parts.version),
        headers,
        body,
        Some(remote_addr),
    )
}

async fn respond(rule: &ActiveRule, req: &Arc<RequestRecord>) -> Result<ResponseTemplate, Error> {
    match &rule.responder {
        Responder::Static(template) => Ok(template.clone()),
        Responder::Dynamic(f) => {
            let f = f.clone();
            let req = req.clone();

            // A responder may block; keep it off the thread that drives the connections.
            match tokio::task::spawn_blocking(move || f(&req)).await {
                Ok(Ok(template)) => Ok(template),
                Ok(Err(err)) => Err(Error::Responder(err.to_string())),
                Err(err) if err.is_panic() => Err(Error::Responder(format!(
                    "responder panicked: {}",
                    panic_message(err.into_panic())
                ))),
                Err(err) => Err(Error::Responder(err.to_string())),
            }
        }
    }
}

fn error_template(err: &Error) -> ResponseTemplate {
    ResponseTemplate::new(500)
        .header(header::CONTENT_TYPE.as_str(), "text/plain; charset=utf-8")
        .body(err.to_string())
}

fn to_response(template: &ResponseTemplate) -> Result<Response<Bytes>, Error> {
    let status = StatusCode::from_u16(template.status)
        .map_err(|_| Error::InvalidResponse(format!("invalid status code {}", template.status)))?;

    let mut builder = Response::builder().status(status);
    for (name, value) in &template.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::InvalidResponse(format!("invalid header name {:?}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::InvalidResponse(format!("invalid value for header {}", name)))?;
        builder = builder.header(name, value);
    }

    builder
        .body(template.body.clone())
        .map_err(|err| Error::InvalidResponse(err.to_string()))
}

fn fallback_response(template: &ResponseTemplate) -> Response<Bytes> {
    let mut response = Response::new(template.body.clone());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
