use std::time::Duration;

use crate::{
    api::server::{Error, StubServer},
    common::{data::ResponseTemplate, util::parse_env, util::read_env},
};

pub(crate) const DEFAULT_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved settings of a [StubServer]. Fixed for the lifetime of the server; the default
/// response is only the initial value of the one the server uses.
#[derive(Debug, Clone)]
pub(crate) struct StubServerConfig {
    pub host: String,
    pub port: u16,
    pub port_search: Option<(u16, u16)>,
    pub default_response: ResponseTemplate,
    pub read_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub history_limit: usize,
    pub access_log: bool,
}

/// The `StubServerBuilder` is used to configure a [StubServer] before it is started.
/// Every option has a sensible default, so `StubServerBuilder::new().start()` is equivalent to
/// [StubServer::start_new](crate::StubServer::start_new).
#[derive(Debug, Default)]
pub struct StubServerBuilder {
    host: Option<String>,
    port: Option<u16>,
    port_search: Option<(u16, u16)>,
    default_response: Option<ResponseTemplate>,
    read_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    history_limit: Option<usize>,
    access_log: Option<bool>,
}

impl StubServerBuilder {
    /// Creates a new builder with default settings: `127.0.0.1`, an OS-assigned port, a `404`
    /// default response, no read timeout, a five second shutdown timeout and unbounded
    /// request history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder seeded from environment variables:
    ///
    /// - `HTTPSTUB_HOST`: the host to bind to
    /// - `HTTPSTUB_PORT`: the port to bind to (`0` lets the OS choose)
    /// - `HTTPSTUB_READ_TIMEOUT_MS`: the read timeout in milliseconds
    /// - `HTTPSTUB_SHUTDOWN_TIMEOUT_MS`: the shutdown timeout in milliseconds
    /// - `HTTPSTUB_HISTORY_LIMIT`: the maximum number of recorded requests
    /// - `HTTPSTUB_ACCESS_LOG`: `true` to log every answered request
    ///
    /// Unset variables keep their defaults. Options set on the returned builder override the
    /// environment.
    ///
    /// # Errors
    /// [Error::Config] if a variable is set to a value that cannot be parsed.
    pub fn from_env() -> Result<Self, Error> {
        let host = read_env("HTTPSTUB_HOST", "");
        let host = host.trim();

        Ok(Self {
            host: (!host.is_empty()).then(|| host.to_string()),
            port: parse_env::<u16>("HTTPSTUB_PORT").map_err(Error::Config)?,
            read_timeout: parse_env::<u64>("HTTPSTUB_READ_TIMEOUT_MS")
                .map_err(Error::Config)?
                .map(Duration::from_millis),
            shutdown_timeout: parse_env::<u64>("HTTPSTUB_SHUTDOWN_TIMEOUT_MS")
                .map_err(Error::Config)?
                .map(Duration::from_millis),
            history_limit: parse_env::<usize>("HTTPSTUB_HISTORY_LIMIT").map_err(Error::Config)?,
            access_log: parse_env::<bool>("HTTPSTUB_ACCESS_LOG").map_err(Error::Config)?,
            ..Self::default()
        })
    }

    /// Sets the host (IP address) the server binds to.
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets a fixed port. `0` lets the operating system pick a free port.
    ///
    /// # Parameters
    /// - `port`: The port number.
    ///
    /// # Returns
    /// A modified `StubServerBuilder` instance for method chaining.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Binds to the first free port in `start .. start + attempts` instead of a fixed one.
    /// Takes precedence over [port](StubServerBuilder::port).
    ///
    /// # Parameters
    /// - `start`: The first port to try.
    /// - `attempts`: How many consecutive ports to try.
    ///
    /// # Returns
    /// A modified `StubServerBuilder` instance for method chaining.
    pub fn port_search(mut self, start: u16, attempts: u16) -> Self {
        self.port_search = Some((start, attempts));
        self
    }

    /// Sets the response sent when no rule matches. Defaults to `404` with an empty body.
    pub fn default_response(mut self, response: ResponseTemplate) -> Self {
        self.default_response = Some(response);
        self
    }

    /// Bounds the time a client may take to send a request head and body. A client stalling
    /// in the body is answered with `408 Request Timeout`.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Sets how long [stop](crate::StubServer::stop) and dropping the server wait for open
    /// connections to finish before they are closed forcibly.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of requests kept in the history. The oldest requests are
    /// dropped first.
    ///
    /// # Parameters
    /// - `limit`: The maximum number of history entries to keep.
    ///
    /// # Returns
    /// A modified `StubServerBuilder` instance for method chaining.
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    /// Logs one line per answered request at `info` level.
    pub fn access_log(mut self, enabled: bool) -> Self {
        self.access_log = Some(enabled);
        self
    }

    /// Builds a stopped [StubServer] with the current settings.
    pub fn build(self) -> StubServer {
        StubServer::with_config(self.into_config())
    }

    /// Builds a [StubServer] and starts it.
    ///
    /// # Errors
    /// [Error::Bind] if the configured address cannot be bound.
    pub fn start(self) -> Result<StubServer, Error> {
        let server = self.build();
        server.start()?;
        Ok(server)
    }

    pub(crate) fn into_config(self) -> StubServerConfig {
        StubServerConfig {
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.unwrap_or(0),
            port_search: self.port_search,
            default_response: self
                .default_response
                .unwrap_or_else(ResponseTemplate::not_found),
            read_timeout: self.read_timeout,
            shutdown_timeout: self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
            history_limit: self.history_limit.unwrap_or(usize::MAX),
            access_log: self.access_log.unwrap_or(false),
        }
    }
}
