//! The upload driver.
//!
//! One [`Driver::upload`] call is one HTTP/1.1 exchange on a fresh
//! connection: the request head announcing the exact body length, the
//! streamed body, a write-side shutdown, and the full response read to EOF.

use std::{io, net::SocketAddr, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{header, HeaderMap, Method, Request, StatusCode};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    body::{BodyError, BodyStream},
    boundary::Boundary,
    head::{self, ParseHeadersError, MAX_HEADERS},
};

/// Default limit for one whole exchange.
#[allow(clippy::duration_suboptimal_units)]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors emitted by [`Driver::upload`].
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The connection could not be established.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Target address.
        addr: SocketAddr,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// The request head could not be built.
    #[error("invalid request head: {0}")]
    Request(#[from] http::Error),

    /// Writing the request failed, e.g. the peer reset the connection.
    #[error("failed to write request: {0}")]
    Write(#[source] io::Error),

    /// Reading the response failed.
    #[error("failed to read response: {0}")]
    Read(#[source] io::Error),

    /// A fixture could not be read while streaming the body.
    #[error(transparent)]
    Body(#[from] BodyError),

    /// The response head could not be parsed.
    #[error("malformed response: {0}")]
    MalformedResponse(#[from] ParseHeadersError),

    /// The response carried an invalid status code.
    #[error("invalid response status")]
    InvalidStatus,

    /// The whole exchange took longer than the configured timeout.
    #[error("exchange timed out after {0:?}")]
    TimedOut(Duration),
}

/// A parsed HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Everything after the head.
    pub body: Bytes,
}

/// What happened on the wire during one upload.
#[derive(Debug)]
pub struct Exchange {
    /// Body bytes written to the socket, excluding the head.
    pub bytes_written: u64,
    /// Parts fully written.
    pub frames_completed: usize,
    /// The response, or `None` if the peer closed without sending one.
    pub response: Option<Response>,
}

/// Sends one multipart upload to a server.
#[derive(Debug, Clone)]
pub struct Driver {
    addr: SocketAddr,
    timeout: Duration,
}

impl Driver {
    /// A driver targeting `addr`.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Limit the whole exchange to `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upload `body`, declaring `content_length` bytes.
    ///
    /// Each body chunk is fully written before the next one is pulled from
    /// the stream.
    ///
    /// # Errors
    ///
    /// Any transport failure, fixture read failure, malformed response or
    /// timeout. Nothing is retried.
    pub async fn upload(
        &self,
        boundary: &Boundary,
        content_length: u64,
        body: BodyStream,
    ) -> Result<Exchange, DriverError> {
        tokio::time::timeout(self.timeout, self.exchange(boundary, content_length, body))
            .await
            .map_err(|_| DriverError::TimedOut(self.timeout))?
    }

    async fn exchange(
        &self,
        boundary: &Boundary,
        content_length: u64,
        mut body: BodyStream,
    ) -> Result<Exchange, DriverError> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(|source| DriverError::Connect {
                addr: self.addr,
                source,
            })?;

        let request = request_head(self.addr, boundary, content_length)?;
        stream
            .write_all(&encode_head(&request))
            .await
            .map_err(DriverError::Write)?;

        tracing::info!(addr = %self.addr, content_length, "streaming multipart body");

        let mut bytes_written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            stream.write_all(&chunk).await.map_err(DriverError::Write)?;
            bytes_written += chunk.len() as u64;
        }
        stream.shutdown().await.map_err(DriverError::Write)?;

        if body.is_truncated() {
            tracing::info!(
                bytes_written,
                content_length,
                frames = body.frames_completed(),
                "body truncated on purpose"
            );
        } else if bytes_written != content_length {
            tracing::warn!(
                bytes_written,
                content_length,
                "fixtures changed size while streaming"
            );
        }

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(DriverError::Read)?;

        let response = if raw.is_empty() {
            tracing::info!("peer closed without a response");
            None
        } else {
            Some(parse_response(&raw)?)
        };

        Ok(Exchange {
            bytes_written,
            frames_completed: body.frames_completed(),
            response,
        })
    }
}

fn request_head(
    addr: SocketAddr,
    boundary: &Boundary,
    content_length: u64,
) -> Result<Request<()>, http::Error> {
    Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(header::HOST, addr.to_string())
        .header(header::CONTENT_TYPE, boundary.content_type())
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::CONNECTION, "close")
        .body(())
}

fn encode_head(request: &Request<()>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method(), request.uri()).as_bytes());
    for (name, value) in request.headers() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");

    buf.freeze()
}

fn parse_response(raw: &[u8]) -> Result<Response, DriverError> {
    let mut hdrs = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut hdrs);

    let len = match res.parse(raw).map_err(ParseHeadersError::from)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(ParseHeadersError::Incomplete.into()),
    };

    let status = res
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(DriverError::InvalidStatus)?;
    let headers = head::header_map(res.headers)?;

    Ok(Response {
        status,
        headers,
        body: Bytes::copy_from_slice(&raw[len..]),
    })
}
