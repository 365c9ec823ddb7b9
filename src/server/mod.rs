//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and feeds HTTP/1.1 requests through a middleware
//! [`Pipeline`]. Connections are persistent (keep-alive) unless the client
//! asks otherwise. Every request is stamped with the peer address so the
//! request gate can identify the client.

use std::future::Future;
use std::net::SocketAddr;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::middleware::Pipeline;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The upguard HTTP front end.
///
/// # Examples
///
/// ```rust,no_run
/// use upguard::middleware::{LoggerMiddleware, Stack};
/// use upguard::server::Server;
/// use upguard::{Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = Stack::new()
///         .layer(LoggerMiddleware)
///         .endpoint(|_ctx| async { Response::new(StatusCode::Ok).body("Hello!") });
///     Server::bind("127.0.0.1:8080").await?.serve(pipeline).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `pipeline` until the process is terminated.
    pub async fn serve(self, pipeline: Pipeline) -> Result<(), ServerError> {
        self.serve_with_shutdown(pipeline, std::future::pending())
            .await
    }

    /// Serves `pipeline` until `shutdown` resolves. Connections already
    /// accepted keep running to completion on their own tasks.
    pub async fn serve_with_shutdown(
        self,
        pipeline: Pipeline,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "upguard listening");
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = &mut shutdown => {
                    info!(address = %self.local_addr, "upguard shutting down");
                    return Ok(());
                }
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let pipeline = pipeline.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, pipeline).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    pipeline: Pipeline,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // Several pipelined requests may be buffered at once.
        while let Some(total) = complete_request_len(&buf) {
            let request = match total {
                Ok(total) => {
                    let bytes = buf.split_to(total);
                    match Request::parse(&bytes) {
                        Ok((request, _)) => request.with_peer_addr(peer_addr),
                        Err(e) => return reject(&mut stream, peer_addr, &e).await,
                    }
                }
                Err(e) => return reject(&mut stream, peer_addr, &e).await,
            };

            let keep_alive = request.is_keep_alive();
            debug!(
                peer = %peer_addr,
                method = %request.method(),
                path = %request.path(),
                "dispatching request"
            );

            let response = pipeline.handle(request).await.keep_alive(keep_alive);
            stream.write_all(&response.into_bytes()).await?;
            stream.flush().await?;

            if !keep_alive {
                debug!(peer = %peer_addr, "Connection: close, shutting down");
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Length of the first complete request in `buf`, `None` while more bytes are
/// needed.
fn complete_request_len(buf: &[u8]) -> Option<Result<usize, RequestError>> {
    match Request::parse(buf) {
        Ok((request, body_offset)) => {
            let total = body_offset + request.content_length().unwrap_or(0);
            (buf.len() >= total).then_some(Ok(total))
        }
        Err(RequestError::Incomplete) => None,
        Err(e) => Some(Err(e)),
    }
}

async fn reject(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    err: &RequestError,
) -> Result<(), std::io::Error> {
    warn!(peer = %peer_addr, error = %err, "bad request, sending 400");
    let response = Response::new(StatusCode::BadRequest)
        .body(format!("Bad Request: {err}"))
        .keep_alive(false);
    stream.write_all(&response.into_bytes()).await
}
