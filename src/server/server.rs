use std::{convert::Infallible, future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{request::Parts, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::{TokioIo, TokioTimer};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};

use crate::server::{
    handler::{Error::MalformedRequest, Handler},
    server::Error::{Body, Connection, Io, ReadTimeout},
};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(hyper::Error),
    #[error("cannot read request body: {0}")]
    Body(hyper::Error),
    #[error("request body not received within {0:?}")]
    ReadTimeout(Duration),
    #[error("socket error: {0}")]
    Io(io::Error),
}

/// What happened to the open connections when the accept loop shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ShutdownReport {
    pub open_connections: usize,
    pub force_closed: usize,
}

/// Serves HTTP/1.1 on accepted TCP connections and hands every request to a [Handler].
pub(crate) struct HttpServer<H>
where
    H: Handler + Send + Sync + 'static,
{
    handler: H,
    read_timeout: Option<Duration>,
}

impl<H> HttpServer<H>
where
    H: Handler + Send + Sync + 'static,
{
    pub fn new(handler: H, read_timeout: Option<Duration>) -> Self {
        HttpServer {
            handler,
            read_timeout,
        }
    }

    /// Accepts connections until `shutdown` resolves. The value it resolves to is the time the
    /// open connections get to finish their current exchange before they are closed forcibly.
    pub async fn run_accept_loop<F>(self, listener: TcpListener, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = Duration>,
    {
        let server = Arc::new(self);
        let (drain_sender, drain_receiver) = watch::channel(false);
        let mut connections = JoinSet::new();

        tokio::pin!(shutdown);

        let timeout = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp_stream, remote_address)) => {
                            let server = server.clone();
                            let drain = drain_receiver.clone();
                            connections.spawn(async move {
                                if let Err(err) = server.handle_tcp_stream(tcp_stream, remote_address, drain).await {
                                    tracing::debug!("Connection from {} ended with error: {}", remote_address, err);
                                }
                            });
                        },
                        Err(err) => {
                            tracing::error!("TCP error: {:?}", err);
                            // Errors such as EMFILE persist until a connection closes.
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        },
                    }
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = finished {
                        tracing::error!("Connection task failed: {}", err);
                    }
                }
                timeout = &mut shutdown => {
                    break timeout;
                }
            }
        };

        // Stop accepting before asking the open connections to wind down.
        drop(listener);

        let open_connections = connections.len();
        tracing::debug!("Draining {} open connection(s) within {:?}", open_connections, timeout);

        let _ = drain_sender.send(true);

        let drained = tokio::time::timeout(timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        let force_closed = match drained {
            Ok(()) => 0,
            Err(_) => {
                let remaining = connections.len();
                tracing::warn!("Forcibly closing {} connection(s) still open after {:?}", remaining, timeout);
                connections.shutdown().await;
                remaining
            }
        };

        ShutdownReport {
            open_connections,
            force_closed,
        }
    }

    async fn handle_tcp_stream(
        self: Arc<Self>,
        tcp_stream: TcpStream,
        remote_address: SocketAddr,
        mut drain: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        tracing::trace!("New TCP connection from {}", remote_address);

        tcp_stream.set_nodelay(true).map_err(Io)?;

        let mut builder = http1::Builder::new();
        // hyper bounds header reads by default once a timer is set; only the configured
        // read timeout may apply.
        builder
            .keep_alive(true)
            .timer(TokioTimer::new())
            .header_read_timeout(self.read_timeout);

        let server = self.clone();
        let connection = builder.serve_connection(
            TokioIo::new(tcp_stream),
            service_fn(move |req| server.clone().service(req, remote_address)),
        );
        tokio::pin!(connection);

        let draining = async move {
            let _ = drain.wait_for(|draining| *draining).await;
        };

        let result = tokio::select! {
            result = connection.as_mut() => result,
            _ = draining => {
                connection.as_mut().graceful_shutdown();
                connection.as_mut().await
            }
        };

        match result {
            Ok(()) => {
                tracing::trace!("TCP connection from {} closed", remote_address);
                Ok(())
            }
            Err(err) if err.is_parse_too_large() => {
                self.handler.record_malformed(
                    remote_address,
                    MalformedRequest(err.to_string()),
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                );
                Err(Connection(err))
            }
            Err(err) if err.is_parse() => {
                self.handler.record_malformed(
                    remote_address,
                    MalformedRequest(err.to_string()),
                    StatusCode::BAD_REQUEST,
                );
                Err(Connection(err))
            }
            Err(err) => Err(Connection(err)),
        }
    }

    async fn service(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote_address: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        tracing::trace!("New HTTP request received: {} {}", req.method(), req.uri());

        let response = match buffer_request(req, self.read_timeout).await {
            Ok(req) => self.handler.handle(req, remote_address).await,
            Err((parts, err)) => {
                let status = match err {
                    ReadTimeout(_) => StatusCode::REQUEST_TIMEOUT,
                    _ => StatusCode::BAD_REQUEST,
                };
                self.handler
                    .reject(&parts, remote_address, MalformedRequest(err.to_string()), status)
            }
        };

        Ok(response.map(Full::new))
    }
}

async fn buffer_request(
    req: Request<Incoming>,
    read_timeout: Option<Duration>,
) -> Result<Request<Bytes>, (Parts, Error)> {
    let (parts, body) = req.into_parts();

    let collected = match read_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, body.collect()).await {
            Ok(collected) => collected,
            Err(_) => return Err((parts, ReadTimeout(timeout))),
        },
        None => body.collect().await,
    };

    match collected {
        Ok(body) => Ok(Request::from_parts(parts, body.to_bytes())),
        Err(err) => Err((parts, Body(err))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::{
        handler::StubHandler,
        state::{StateManager, StubStateManager},
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        sync::oneshot,
    };

    async fn start(
        read_timeout: Option<Duration>,
    ) -> (
        SocketAddr,
        Arc<StubStateManager>,
        oneshot::Sender<Duration>,
        tokio::task::JoinHandle<ShutdownReport>,
    ) {
        let state = Arc::new(StubStateManager::default());
        let server = HttpServer::new(StubHandler::new(state.clone(), false), read_timeout);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<Duration>();

        let task = tokio::spawn(async move {
            server
                .run_accept_loop(listener, async move {
                    shutdown_receiver.await.unwrap_or(Duration::from_secs(1))
                })
                .await
        });

        (addr, state, shutdown_sender, task)
    }

    async fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn serves_and_drains() {
        let (addr, state, shutdown, task) = start(None).await;

        let response = exchange(addr, b"GET /x HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"));
        assert_eq!(state.history().len(), 1);

        shutdown.send(Duration::from_secs(1)).unwrap();
        let report = task.await.unwrap();
        assert_eq!(report.force_closed, 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_headers_are_not_cut_off_without_a_read_timeout() {
        let (addr, state, shutdown, task) = start(None).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /slow HTTP/1.1\r\nHost: a\r\n").await.unwrap();

        // Well past hyper's own header read default.
        tokio::time::sleep(Duration::from_secs(120)).await;

        stream.write_all(b"Connection: close\r\n\r\n").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 404"));
        assert_eq!(state.history()[0].path(), "/slow");

        shutdown.send(Duration::from_secs(1)).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_is_answered_with_400_and_recorded() {
        let (addr, state, shutdown, task) = start(None).await;

        let response = exchange(addr, b"this is not http\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400"));

        let history = state.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_malformed());

        shutdown.send(Duration::from_secs(1)).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stalled_body_is_answered_with_408() {
        let (addr, state, shutdown, task) = start(Some(Duration::from_millis(200))).await;

        let response = exchange(
            addr,
            b"POST /upload HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\nab",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 408"));

        let history = state.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].path(), "/upload");
        assert!(history[0].is_malformed());

        shutdown.send(Duration::from_secs(1)).unwrap();
        task.await.unwrap();
    }
}
