use std::{
    cell::Cell,
    io,
    net::{SocketAddr, TcpListener as StdTcpListener},
    rc::Rc,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use thiserror::Error;
use tokio::{net::TcpListener, sync::oneshot};

use crate::{
    api::{
        output::{body_preview, AssertionFailure},
        rule::{Then, When},
    },
    common::{
        data::{
            BoxError, Exchange, RequestRecord, Responder, ResponseTemplate, RuleId, ServerState,
        },
        runtime,
        util::{lock, Join},
    },
    server::{
        builder::{StubServerBuilder, StubServerConfig},
        handler::StubHandler,
        matchers::RequestMatcher,
        server::{HttpServer, ShutdownReport},
        state::{StateManager, StubStateManager},
    },
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot {operation} a server that is {state}")]
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },
    #[error("{force_closed} connection(s) did not finish within {timeout:?} and were closed")]
    ShutdownTimeout {
        timeout: Duration,
        force_closed: usize,
    },
    #[error("server thread error: {0}")]
    ServerThread(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

struct RunningServer {
    shutdown_sender: oneshot::Sender<Duration>,
    done_receiver: oneshot::Receiver<ShutdownReport>,
    thread: thread::JoinHandle<()>,
}

impl RunningServer {
    async fn shutdown(self, timeout: Duration) -> Result<ShutdownReport, Error> {
        // The accept loop treats a dropped sender as a shutdown request with the default
        // timeout, so a failed send needs no handling here.
        let _ = self.shutdown_sender.send(timeout);

        let report = self.done_receiver.await;

        // The server thread exits right after it sent its report.
        let joined = self.thread.join();

        match (report, joined) {
            (Ok(report), _) => Ok(report),
            (Err(_), Err(_)) => Err(Error::ServerThread("server thread panicked".to_string())),
            (Err(_), Ok(())) => Err(Error::ServerThread(
                "server thread exited without reporting".to_string(),
            )),
        }
    }
}

struct Lifecycle {
    state: ServerState,
    address: Option<SocketAddr>,
    running: Option<RunningServer>,
}

/// An HTTP stub server for tests.
///
/// The server runs on its own thread, answers requests according to the rules registered on
/// it and records every request it receives. Dropping the server stops it.
///
/// # Example
/// ```rust
/// use httpstub::prelude::*;
///
/// let server = StubServer::start_new().unwrap();
///
/// let rule = server.rule(|when, then| {
///     when.method(POST).path("/users");
///     then.status(201).json_body(serde_json::json!({ "id": 1 }));
/// });
///
/// let client = reqwest::blocking::Client::new();
/// let response = client.post(server.url("/users")).body("alice").send().unwrap();
///
/// assert_eq!(response.status(), 201);
/// server.assert_rule_hits(rule, 1).unwrap();
/// server.assert_last_request_body("alice").unwrap();
/// ```
pub struct StubServer {
    config: StubServerConfig,
    state: Arc<StubStateManager>,
    lifecycle: Mutex<Lifecycle>,
}

impl StubServer {
    /// Creates a stopped server with default settings.
    pub fn new() -> Self {
        StubServerBuilder::new().build()
    }

    /// Creates a builder to configure a server.
    pub fn builder() -> StubServerBuilder {
        StubServerBuilder::new()
    }

    /// Creates a server with default settings and starts it.
    pub fn start_new() -> Result<Self, Error> {
        StubServerBuilder::new().start()
    }

    pub(crate) fn with_config(config: StubServerConfig) -> Self {
        let state = Arc::new(StubStateManager::new(
            config.history_limit,
            config.default_response.clone(),
        ));

        Self {
            config,
            state,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                address: None,
                running: None,
            }),
        }
    }

    // ===========================================================================================
    // Lifecycle
    // ===========================================================================================

    /// Binds the configured address and starts serving. Returns the bound address, which
    /// carries the port the operating system chose if the configured port was `0`.
    ///
    /// # Errors
    /// - [Error::InvalidState] if the server is not stopped.
    /// - [Error::Bind] if the address is in use or invalid.
    pub fn start(&self) -> Result<SocketAddr, Error> {
        self.start_with(None)
    }

    /// Like [start](StubServer::start), but binds `address` (e.g. `127.0.0.1:8080`) instead
    /// of the configured address.
    pub fn start_on(&self, address: &str) -> Result<SocketAddr, Error> {
        self.start_with(Some(address))
    }

    /// Async variant of [start](StubServer::start). Binding never blocks for long, so this
    /// completes immediately.
    pub async fn start_async(&self) -> Result<SocketAddr, Error> {
        self.start()
    }

    fn start_with(&self, address: Option<&str>) -> Result<SocketAddr, Error> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state != ServerState::Stopped {
                return Err(Error::InvalidState {
                    operation: "start",
                    state: lifecycle.state,
                });
            }
            lifecycle.state = ServerState::Starting;
        }

        let spawned = self.spawn(address);

        let mut lifecycle = lock(&self.lifecycle);
        match spawned {
            Ok((address, running)) => {
                tracing::info!("Stub server listening on {}", address);
                lifecycle.state = ServerState::Running;
                lifecycle.address = Some(address);
                lifecycle.running = Some(running);
                Ok(address)
            }
            Err(err) => {
                lifecycle.state = ServerState::Stopped;
                Err(err)
            }
        }
    }

    fn spawn(&self, requested: Option<&str>) -> Result<(SocketAddr, RunningServer), Error> {
        let listener = match requested {
            Some(requested) => bind(requested)?,
            None => self.bind_configured()?,
        };

        let address = listener.local_addr().map_err(|source| Error::Bind {
            address: requested.unwrap_or(self.config.host.as_str()).to_string(),
            source,
        })?;

        listener
            .set_nonblocking(true)
            .map_err(|source| Error::Bind {
                address: address.to_string(),
                source,
            })?;

        let runtime = runtime::new_current_thread()
            .map_err(|err| Error::ServerThread(format!("cannot build runtime: {}", err)))?;

        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener).map_err(|source| Error::Bind {
                address: address.to_string(),
                source,
            })?
        };

        let server = HttpServer::new(
            StubHandler::new(self.state.clone(), self.config.access_log),
            self.config.read_timeout,
        );

        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<Duration>();
        let (done_sender, done_receiver) = oneshot::channel::<ShutdownReport>();
        let fallback_timeout = self.config.shutdown_timeout;

        let thread = thread::Builder::new()
            .name(format!("httpstub-{}", address.port()))
            .spawn(move || {
                let report = runtime.block_on(server.run_accept_loop(listener, async move {
                    shutdown_receiver.await.unwrap_or(fallback_timeout)
                }));

                let _ = done_sender.send(report);

                // Responders stuck on the blocking pool must not keep the thread alive.
                runtime.shutdown_background();
            })
            .map_err(|err| Error::ServerThread(format!("cannot spawn server thread: {}", err)))?;

        Ok((
            address,
            RunningServer {
                shutdown_sender,
                done_receiver,
                thread,
            },
        ))
    }

    fn bind_configured(&self) -> Result<StdTcpListener, Error> {
        let host = &self.config.host;

        let (start, attempts) = match self.config.port_search {
            Some(search) => search,
            None => return bind(&socket_address(host, self.config.port)),
        };

        let mut last_error = None;
        for port in (0..attempts).filter_map(|offset| start.checked_add(offset)) {
            match StdTcpListener::bind(socket_address(host, port)) {
                Ok(listener) => return Ok(listener),
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                    tracing::debug!("Port {} is in use, trying the next one", port);
                    last_error = Some(err);
                }
                Err(source) => {
                    return Err(Error::Bind {
                        address: socket_address(host, port),
                        source,
                    })
                }
            }
        }

        Err(Error::Bind {
            address: format!(
                "{} (ports {} to {})",
                host,
                start,
                start.saturating_add(attempts.saturating_sub(1))
            ),
            source: last_error.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "no port to try")
            }),
        })
    }

    /// Stops the server, giving open connections the configured shutdown timeout to finish.
    /// Stopping a stopped server does nothing.
    ///
    /// # Errors
    /// - [Error::ShutdownTimeout] if connections had to be closed forcibly. The server is
    ///   stopped nevertheless.
    /// - [Error::InvalidState] if the server is being started or stopped concurrently.
    pub fn stop(&self) -> Result<(), Error> {
        self.stop_with_timeout(self.config.shutdown_timeout)
    }

    /// Like [stop](StubServer::stop) with an explicit shutdown timeout.
    pub fn stop_with_timeout(&self, timeout: Duration) -> Result<(), Error> {
        self.stop_with_timeout_async(timeout).join()
    }

    pub async fn stop_async(&self) -> Result<(), Error> {
        self.stop_with_timeout_async(self.config.shutdown_timeout)
            .await
    }

    pub async fn stop_with_timeout_async(&self, timeout: Duration) -> Result<(), Error> {
        let running = {
            let mut lifecycle = lock(&self.lifecycle);
            match lifecycle.state {
                ServerState::Stopped => return Ok(()),
                ServerState::Running => {}
                state => {
                    return Err(Error::InvalidState {
                        operation: "stop",
                        state,
                    })
                }
            }
            lifecycle.state = ServerState::Stopping;
            lifecycle.running.take()
        };

        let report = match running {
            Some(running) => running.shutdown(timeout).await,
            None => Ok(ShutdownReport::default()),
        };

        let address = {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.state = ServerState::Stopped;
            lifecycle.address.take()
        };

        let report = report?;

        tracing::info!(
            "Stub server on {} stopped ({} open connection(s), {} closed forcibly)",
            address.map(|a| a.to_string()).unwrap_or_default(),
            report.open_connections,
            report.force_closed
        );

        if report.force_closed > 0 {
            return Err(Error::ShutdownTimeout {
                timeout,
                force_closed: report.force_closed,
            });
        }

        Ok(())
    }

    pub fn state(&self) -> ServerState {
        lock(&self.lifecycle).state
    }

    /// The bound address while the server is running.
    pub fn address(&self) -> Option<SocketAddr> {
        lock(&self.lifecycle).address
    }

    /// The bound port while the server is running.
    pub fn port(&self) -> Option<u16> {
        self.address().map(|address| address.port())
    }

    /// Builds the URL for `path` on this server, resolved against the root path. While the
    /// server is stopped the configured host and port are used.
    ///
    /// **Example**:
    /// ```
    /// let server = httpstub::StubServer::start_new().unwrap();
    ///
    /// let expected_url = format!("http://127.0.0.1:{}/hello", server.port().unwrap());
    /// assert_eq!(expected_url, server.url("/hello"));
    /// ```
    pub fn url<S: AsRef<str>>(&self, path: S) -> String {
        let authority = match self.address() {
            Some(address) => address.to_string(),
            None => socket_address(&self.config.host, self.config.port),
        };
        let path = path.as_ref();
        let separator = if path.starts_with('/') { "" } else { "/" };
        format!("http://{}{}{}", authority, separator, path)
    }

    /// The root URL of this server, ending in `/`.
    pub fn base_url(&self) -> String {
        self.url("/")
    }

    // ===========================================================================================
    // Rules
    // ===========================================================================================

    /// Registers a rule. Rules are evaluated in registration order and the first matching
    /// one answers the request.
    pub fn add_rule<R: Into<Responder>>(&self, matcher: RequestMatcher, responder: R) -> RuleId {
        self.state.add_rule(matcher, responder.into())
    }

    /// Registers a rule with a static response using the fluent [When]/[Then] API.
    ///
    /// **Example**:
    /// ```
    /// use httpstub::prelude::*;
    ///
    /// let server = StubServer::start_new().unwrap();
    ///
    /// server.rule(|when, then| {
    ///     when.path_pattern("/api/*");
    ///     then.status(503).header("retry-after", "1");
    /// });
    ///
    /// let response = reqwest::blocking::get(server.url("/api/users")).unwrap();
    /// assert_eq!(response.status(), 503);
    /// ```
    pub fn rule<F>(&self, config_fn: F) -> RuleId
    where
        F: FnOnce(When, Then),
    {
        let matcher = Rc::new(Cell::new(RequestMatcher::new()));
        let response = Rc::new(Cell::new(ResponseTemplate::default()));

        config_fn(
            When {
                matcher: matcher.clone(),
            },
            Then {
                response: response.clone(),
            },
        );

        self.add_rule(matcher.take(), response.take())
    }

    /// Registers a rule whose response is computed from the request. The responder runs on a
    /// blocking thread pool; if it fails or panics the client receives a `500`.
    pub fn rule_fn<C, F>(&self, config_fn: C, responder: F) -> RuleId
    where
        C: FnOnce(When),
        F: Fn(&RequestRecord) -> Result<ResponseTemplate, BoxError> + Send + Sync + 'static,
    {
        let matcher = Rc::new(Cell::new(RequestMatcher::new()));

        config_fn(When {
            matcher: matcher.clone(),
        });

        self.add_rule(matcher.take(), Responder::dynamic(responder))
    }

    /// Removes a rule. Returns `false` if it was already removed.
    pub fn remove_rule(&self, id: RuleId) -> bool {
        self.state.remove_rule(id)
    }

    /// How many requests the rule has answered, or `None` if it was removed.
    pub fn rule_hits(&self, id: RuleId) -> Option<usize> {
        self.state.rule_hits(id)
    }

    /// Replaces the response sent when no rule matches.
    pub fn set_default_response(&self, response: ResponseTemplate) {
        self.state.set_default_response(response)
    }

    /// Removes all rules, restores the configured default response and clears the request
    /// history.
    pub fn reset(&self) {
        self.state.reset()
    }

    // ===========================================================================================
    // History
    // ===========================================================================================

    /// All recorded requests in arrival order.
    pub fn requests(&self) -> Vec<Arc<RequestRecord>> {
        self.state.history()
    }

    pub fn last_request(&self) -> Option<Arc<RequestRecord>> {
        self.state.history().pop()
    }

    /// Clears the request history. Rules and the server state are not affected.
    pub fn clear_requests(&self) {
        self.state.delete_history()
    }

    /// All recorded requests paired with the response the server sent for them.
    pub fn exchanges(&self) -> Vec<Exchange> {
        self.state.exchanges()
    }

    // ===========================================================================================
    // Assertions
    // ===========================================================================================

    pub fn assert_request_count(&self, expected: usize) -> Result<(), AssertionFailure> {
        let requests = self.requests();
        if requests.len() == expected {
            return Ok(());
        }

        Err(AssertionFailure::new(
            "request count",
            expected.to_string(),
            requests.len().to_string(),
            &requests,
        ))
    }

    pub fn assert_last_request_path(&self, expected: &str) -> Result<(), AssertionFailure> {
        self.assert_last_request("last request path", expected, |req| req.path() == expected, |req| {
            req.path().to_string()
        })
    }

    /// Compares the method of the last request case-insensitively.
    pub fn assert_last_request_method<M: ToString>(
        &self,
        expected: M,
    ) -> Result<(), AssertionFailure> {
        let expected = expected.to_string();
        self.assert_last_request(
            "last request method",
            &expected,
            |req| req.method().eq_ignore_ascii_case(&expected),
            |req| req.method().to_string(),
        )
    }

    /// Compares the body of the last request byte for byte. For text bodies the failure
    /// contains a line diff.
    pub fn assert_last_request_body<B: AsRef<[u8]>>(
        &self,
        expected: B,
    ) -> Result<(), AssertionFailure> {
        let expected = expected.as_ref();
        let requests = self.requests();

        let last = match requests.last() {
            Some(last) => last,
            None => {
                return Err(AssertionFailure::new(
                    "last request body",
                    body_preview(expected),
                    "no request",
                    &requests,
                ))
            }
        };

        if &last.body()[..] == expected {
            return Ok(());
        }

        let failure = AssertionFailure::new(
            "last request body",
            body_preview(expected),
            body_preview(last.body()),
            &requests,
        );

        Err(
            match (std::str::from_utf8(expected), std::str::from_utf8(last.body())) {
                (Ok(expected), Ok(actual)) => failure.with_diff(expected, actual),
                _ => failure,
            },
        )
    }

    pub fn assert_rule_hits(&self, id: RuleId, expected: usize) -> Result<(), AssertionFailure> {
        let actual = match self.rule_hits(id) {
            Some(hits) if hits == expected => return Ok(()),
            Some(hits) => hits.to_string(),
            None => format!("rule {} was removed", id),
        };

        Err(AssertionFailure::new(
            format!("hits of rule {}", id),
            expected.to_string(),
            actual,
            &self.requests(),
        ))
    }

    fn assert_last_request<P, A>(
        &self,
        subject: &str,
        expected: &str,
        predicate: P,
        actual: A,
    ) -> Result<(), AssertionFailure>
    where
        P: FnOnce(&RequestRecord) -> bool,
        A: FnOnce(&RequestRecord) -> String,
    {
        let requests = self.requests();
        match requests.last() {
            Some(last) if predicate(last) => Ok(()),
            Some(last) => Err(AssertionFailure::new(subject, expected, actual(last), &requests)),
            None => Err(AssertionFailure::new(subject, expected, "no request", &requests)),
        }
    }
}

impl Default for StubServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!("Stub server did not stop cleanly: {}", err);
        }
    }
}

fn bind(address: &str) -> Result<StdTcpListener, Error> {
    StdTcpListener::bind(address).map_err(|source| Error::Bind {
        address: address.to_string(),
        source,
    })
}

fn socket_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
