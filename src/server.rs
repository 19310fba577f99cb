//! The server half of the harness.
//!
//! Every accepted connection carries one request. Its head is read and
//! parsed here; the body is pumped from the socket into a bounded channel
//! that feeds an [`IncomingForm`]. The pump stops at the declared
//! `Content-Length` and keeps draining after the form lets go of the body,
//! so the form learns whether the transport delivered everything.

use std::{
    convert::Infallible,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::stream;
use http::{HeaderMap, StatusCode};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    boundary::Boundary,
    form::{BodyEnd, FormConfig, FormEvent, FormStatus, IncomingForm},
    head::{self, ParseHeadersError, MAX_HEADERS, MAX_HEADER_SECTION_SIZE},
    outcome::EventHarness,
};

/// Default time a request may go without delivering a byte.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Body chunks buffered between the socket and the parser.
const BODY_CHANNEL_CAPACITY: usize = 16;

const READ_CHUNK: usize = 64 << 10;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    form: FormConfig,
    idle_timeout: Duration,
}

impl ServerConfig {
    /// Parse requests with `form`.
    #[must_use]
    pub fn new(form: FormConfig) -> Self {
        Self {
            form,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Treat a request that stalls this long as closed.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Form settings used for every request.
    #[must_use]
    pub fn form(&self) -> &FormConfig {
        &self.form
    }

    /// Configured idle timeout.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

/// A running harness server.
#[derive(Debug)]
pub struct HarnessServer {
    local_addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl HarnessServer {
    /// Bind to `addr` and start accepting connections.
    ///
    /// Form events of every request are delivered to the returned
    /// [`EventHarness`].
    ///
    /// # Errors
    ///
    /// Binding the listener failed.
    pub async fn bind(addr: SocketAddr, config: ServerConfig) -> io::Result<(Self, EventHarness)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (events, rx) = mpsc::unbounded_channel();
        let requests = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(config),
            events,
            requests.clone(),
            shutdown.clone(),
        ));

        tracing::info!(%local_addr, "harness server listening");

        Ok((
            Self {
                local_addr,
                requests,
                shutdown,
                task,
            },
            EventHarness::new(rx),
        ))
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of requests whose head was received.
    #[must_use]
    pub fn requests_received(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Stop accepting connections. Requests in flight run to completion.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "accept loop ended abnormally");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    events: mpsc::UnboundedSender<FormEvent>,
    requests: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        tracing::debug!(%peer, "accepted connection");

        let config = config.clone();
        let events = events.clone();
        let requests = requests.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, &config, events, &requests).await {
                tracing::debug!(%peer, error = %err, "connection failed");
            }
        });
    }

    tracing::debug!("accept loop stopped");
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("bad request head: {0}")]
    Head(#[from] ParseHeadersError),
}

#[derive(Debug)]
struct RequestHead {
    method: String,
    path: String,
    headers: HeaderMap,
}

async fn handle_connection(
    stream: TcpStream,
    config: &ServerConfig,
    events: mpsc::UnboundedSender<FormEvent>,
    requests: &AtomicUsize,
) -> Result<(), ConnectionError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4096);

    let head_len = match read_head(&mut reader, &mut buf, config.idle_timeout).await {
        Ok(Some(len)) => len,
        Ok(None) => return Ok(()),
        Err(err) => {
            write_response(&mut writer, StatusCode::BAD_REQUEST).await?;
            return Err(err);
        }
    };

    let head = match parse_request_head(&buf[..head_len]) {
        Ok(head) => head,
        Err(err) => {
            write_response(&mut writer, StatusCode::BAD_REQUEST).await?;
            return Err(err.into());
        }
    };
    requests.fetch_add(1, Ordering::SeqCst);

    tracing::info!(method = %head.method, path = %head.path, "new request");

    let boundary = match Boundary::try_from(&head.headers) {
        Ok(boundary) => boundary,
        Err(err) => {
            tracing::warn!(error = %err, "rejecting request");
            write_response(&mut writer, StatusCode::BAD_REQUEST).await?;
            return Ok(());
        }
    };
    let Some(declared) = head::content_length(&head.headers) else {
        tracing::warn!("rejecting request without content-length");
        write_response(&mut writer, StatusCode::LENGTH_REQUIRED).await?;
        return Ok(());
    };

    let leftover = buf.split_off(head_len).freeze();
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let pump = tokio::spawn(pump_body(reader, leftover, declared, config.idle_timeout, tx));

    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<Bytes, Infallible>(chunk), rx))
    });
    let body_end = async move { pump.await.unwrap_or(BodyEnd::ClosedEarly) };

    let form = IncomingForm::new(config.form.clone(), events)
        .parse(body, &boundary, body_end)
        .await;

    match form.status {
        FormStatus::Ended => write_response(&mut writer, StatusCode::OK).await?,
        FormStatus::Failed => write_response(&mut writer, StatusCode::BAD_REQUEST).await?,
        FormStatus::Aborted => tracing::debug!("dropping aborted connection"),
    }

    Ok(())
}

/// Read until the end of the request head.
///
/// `Ok(None)` means the peer closed before sending anything.
async fn read_head(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    idle: Duration,
) -> Result<Option<usize>, ConnectionError> {
    loop {
        if let Some(len) = head::head_len(buf) {
            return Ok(Some(len));
        }
        if buf.len() > MAX_HEADER_SECTION_SIZE {
            return Err(ParseHeadersError::HeaderOverflow.into());
        }

        let n = tokio::time::timeout(idle, reader.read_buf(buf))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;

        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(ParseHeadersError::Incomplete.into())
            };
        }
    }
}

fn parse_request_head(raw: &[u8]) -> Result<RequestHead, ParseHeadersError> {
    let mut hdrs = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut hdrs);

    match req.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(ParseHeadersError::Incomplete),
        Err(httparse::Error::TooManyHeaders) => return Err(ParseHeadersError::HeaderOverflow),
        Err(e) => return Err(e.into()),
    }

    Ok(RequestHead {
        method: req.method.unwrap_or_default().to_owned(),
        path: req.path.unwrap_or_default().to_owned(),
        headers: head::header_map(req.headers)?,
    })
}

/// Move up to `declared` body bytes from the socket into `tx`.
///
/// Once the receiver is gone the remaining bytes are read and dropped, so the
/// result always reflects whether the whole body arrived.
async fn pump_body(
    mut reader: OwnedReadHalf,
    leftover: Bytes,
    declared: u64,
    idle: Duration,
    tx: mpsc::Sender<Bytes>,
) -> BodyEnd {
    let mut remaining = declared;
    let mut forward = true;

    if !leftover.is_empty() {
        let take = leftover.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        remaining -= take as u64;
        forward = tx.send(leftover.slice(..take)).await.is_ok();
    }

    let mut buf = vec![0u8; READ_CHUNK];
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = match tokio::time::timeout(idle, reader.read(&mut buf[..want])).await {
            Ok(Ok(0)) => {
                tracing::debug!(remaining, "peer closed mid-body");
                return BodyEnd::ClosedEarly;
            }
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                tracing::debug!(remaining, error = %err, "body read failed");
                return BodyEnd::ClosedEarly;
            }
            Err(_) => {
                tracing::debug!(remaining, ?idle, "body stalled");
                return BodyEnd::ClosedEarly;
            }
        };

        remaining -= n as u64;
        if forward {
            forward = tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_ok();
        }
    }

    BodyEnd::Complete
}

async fn write_response(writer: &mut OwnedWriteHalf, status: StatusCode) -> io::Result<()> {
    let body = status.canonical_reason().unwrap_or("");
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );

    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use http::header;

    use super::parse_request_head;
    use crate::head::ParseHeadersError;

    #[test]
    fn parses_upload_head() {
        let head = parse_request_head(
            b"POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=12\r\nContent-Length: 10\r\n\r\n",
        )
        .unwrap();

        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/");
        assert_eq!(head.headers.get(header::CONTENT_LENGTH).unwrap(), "10");
    }

    #[test]
    fn rejects_header_floods() {
        let mut raw = String::from("POST / HTTP/1.1\r\n");
        for i in 0..40 {
            raw.push_str(&format!("X-H{i}: v\r\n"));
        }
        raw.push_str("\r\n");

        assert!(matches!(
            parse_request_head(raw.as_bytes()),
            Err(ParseHeadersError::HeaderOverflow)
        ));
    }
}
