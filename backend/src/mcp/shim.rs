//! HTTP shim layer.
//!
//! axum hands handlers immutable requests and expects a finished `Response`
//! value back. The transport instead works push-style: it mutates headers,
//! writes chunks and signals the end of the response, and for the event
//! stream it keeps writing long after the handler has returned.
//!
//! [`ShimRequest`] and [`ResponseSink`] are the interface the transport
//! programs against. Two sinks bridge it to axum:
//!
//! - [`BufferedResponse`] collects the whole response and delivers it once,
//!   on `end()`, as a [`CapturedResponse`].
//! - [`PipeResponse`] forwards headers on flush and every write into a
//!   channel whose receiving end becomes the streamed response body.

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use serde_json::Value;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

/// Error type for sink operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShimError {
    #[error("response already ended")]
    Ended,

    #[error("client closed the stream")]
    Closed,

    #[error("stream buffer full")]
    Full,
}

// ============================================================================
// Request side
// ============================================================================

/// An inbound request as seen by the transport.
#[derive(Debug, Clone)]
pub struct ShimRequest {
    pub method: Method,
    pub headers: HeaderMap,
    /// Parsed JSON body (POST only).
    pub body: Option<Value>,
    abort: CancellationToken,
}

impl ShimRequest {
    pub fn new(
        method: Method,
        headers: HeaderMap,
        body: Option<Value>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            method,
            headers,
            body,
            abort,
        }
    }

    /// Header value as a string, if present and valid ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Resolves once the client has gone away.
    pub async fn on_abort(&self) {
        self.abort.cancelled().await
    }
}

// ============================================================================
// Response side
// ============================================================================

/// Push-style response the transport writes into.
pub trait ResponseSink: Send + 'static {
    /// Set the status code. Ignored once headers are sent.
    fn set_status(&mut self, status: StatusCode);

    /// Set (replace) a header. Ignored once headers are sent.
    fn set_header(&mut self, name: HeaderName, value: HeaderValue);

    fn headers_sent(&self) -> bool;

    /// Commit status and headers without writing body bytes.
    fn flush_headers(&mut self);

    /// Append a body chunk, committing headers first if needed.
    fn write(&mut self, chunk: Bytes) -> Result<(), ShimError>;

    /// Finish the response. Idempotent.
    fn end(&mut self);

    fn is_ended(&self) -> bool;

    /// Resolves once the reading side is gone.
    fn closed(&self) -> BoxFuture<'static, ()>;
}

/// Status line and headers of a response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }
}

/// A complete response captured by [`BufferedResponse`].
#[derive(Debug)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for CapturedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Sink that buffers the whole response and delivers it on `end()`.
pub struct BufferedResponse {
    head: ResponseHead,
    body: Vec<u8>,
    headers_sent: bool,
    finished: Option<oneshot::Sender<CapturedResponse>>,
}

impl BufferedResponse {
    /// Create a sink and the receiver that fires when it finishes.
    pub fn new() -> (Self, oneshot::Receiver<CapturedResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                head: ResponseHead::new(),
                body: Vec::new(),
                headers_sent: false,
                finished: Some(tx),
            },
            rx,
        )
    }
}

impl ResponseSink for BufferedResponse {
    fn set_status(&mut self, status: StatusCode) {
        if !self.headers_sent {
            self.head.status = status;
        }
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        if !self.headers_sent {
            self.head.headers.insert(name, value);
        }
    }

    fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    fn flush_headers(&mut self) {
        self.headers_sent = true;
    }

    fn write(&mut self, chunk: Bytes) -> Result<(), ShimError> {
        if self.is_ended() {
            return Err(ShimError::Ended);
        }
        self.headers_sent = true;
        self.body.extend_from_slice(&chunk);
        Ok(())
    }

    fn end(&mut self) {
        if let Some(tx) = self.finished.take() {
            let head = std::mem::replace(&mut self.head, ResponseHead::new());
            let captured = CapturedResponse {
                status: head.status,
                headers: head.headers,
                body: Bytes::from(std::mem::take(&mut self.body)),
            };
            if tx.send(captured).is_err() {
                debug!("Buffered response finished after its reader went away");
            }
        }
    }

    fn is_ended(&self) -> bool {
        self.finished.is_none()
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        futures::future::pending().boxed()
    }
}

impl Drop for BufferedResponse {
    fn drop(&mut self) {
        self.end();
    }
}

/// Sink whose writes are piped into a streamed response body.
pub struct PipeResponse {
    head: ResponseHead,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: Option<mpsc::Sender<Bytes>>,
    peer_gone: CancellationToken,
}

/// Readable end of a [`PipeResponse`].
pub struct PipeReader {
    head: oneshot::Receiver<ResponseHead>,
    body: mpsc::Receiver<Bytes>,
    guard: DropGuard,
}

impl PipeResponse {
    /// Create a pipe holding at most `capacity` unread chunks.
    pub fn new(capacity: usize) -> (Self, PipeReader) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(capacity.max(1));
        let peer_gone = CancellationToken::new();
        (
            Self {
                head: ResponseHead::new(),
                head_tx: Some(head_tx),
                body_tx: Some(body_tx),
                peer_gone: peer_gone.clone(),
            },
            PipeReader {
                head: head_rx,
                body: body_rx,
                guard: peer_gone.drop_guard(),
            },
        )
    }
}

impl ResponseSink for PipeResponse {
    fn set_status(&mut self, status: StatusCode) {
        if !self.headers_sent() {
            self.head.status = status;
        }
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        if !self.headers_sent() {
            self.head.headers.insert(name, value);
        }
    }

    fn headers_sent(&self) -> bool {
        self.head_tx.is_none()
    }

    fn flush_headers(&mut self) {
        if let Some(tx) = self.head_tx.take() {
            let head = std::mem::replace(&mut self.head, ResponseHead::new());
            if tx.send(head).is_err() {
                debug!("Pipe reader dropped before headers were flushed");
            }
        }
    }

    fn write(&mut self, chunk: Bytes) -> Result<(), ShimError> {
        if self.body_tx.is_none() {
            return Err(ShimError::Ended);
        }
        self.flush_headers();
        let Some(tx) = self.body_tx.as_ref() else {
            return Err(ShimError::Ended);
        };
        match tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ShimError::Full),
            Err(TrySendError::Closed(_)) => Err(ShimError::Closed),
        }
    }

    fn end(&mut self) {
        self.flush_headers();
        // Dropping the sender finishes the body stream.
        self.body_tx = None;
    }

    fn is_ended(&self) -> bool {
        self.body_tx.is_none()
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let token = self.peer_gone.clone();
        async move { token.cancelled().await }.boxed()
    }
}

impl Drop for PipeResponse {
    fn drop(&mut self) {
        self.end();
    }
}

impl PipeReader {
    /// Wait for the headers, then turn the pipe into a streamed response.
    ///
    /// Fails with [`ShimError::Closed`] if the writer went away without
    /// flushing headers.
    pub async fn into_response(self) -> Result<Response, ShimError> {
        let head = self.head.await.map_err(|_| ShimError::Closed)?;
        let body = PipeBody {
            inner: ReceiverStream::new(self.body),
            _guard: self.guard,
        };
        let mut response = Response::new(Body::from_stream(body));
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        Ok(response)
    }
}

/// Body stream that tells the writer when hyper stops polling it.
struct PipeBody {
    inner: ReceiverStream<Bytes>,
    _guard: DropGuard,
}

impl Stream for PipeBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|chunk| chunk.map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_buffered_response_delivers_on_end() {
        let (mut sink, rx) = BufferedResponse::new();
        sink.set_status(StatusCode::ACCEPTED);
        sink.set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        sink.write(Bytes::from_static(b"hello ")).unwrap();
        sink.write(Bytes::from_static(b"world")).unwrap();

        // Headers are committed by the first write
        sink.set_status(StatusCode::IM_A_TEAPOT);
        sink.end();

        let captured = rx.await.unwrap();
        assert_eq!(captured.status, StatusCode::ACCEPTED);
        assert_eq!(captured.headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(&captured.body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_buffered_response_rejects_write_after_end() {
        let (mut sink, _rx) = BufferedResponse::new();
        sink.end();
        assert!(sink.is_ended());
        assert_eq!(
            sink.write(Bytes::from_static(b"late")),
            Err(ShimError::Ended)
        );
    }

    #[tokio::test]
    async fn test_buffered_response_ends_on_drop() {
        let (sink, rx) = BufferedResponse::new();
        drop(sink);
        let captured = rx.await.unwrap();
        assert_eq!(captured.status, StatusCode::OK);
        assert!(captured.body.is_empty());
    }

    #[tokio::test]
    async fn test_pipe_streams_writes() {
        let (mut sink, reader) = PipeResponse::new(8);
        sink.set_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        sink.flush_headers();

        let response = reader.into_response().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

        sink.write(Bytes::from_static(b"data: one\n\n")).unwrap();
        sink.write(Bytes::from_static(b"data: two\n\n")).unwrap();
        sink.end();

        let chunks: Vec<Bytes> = response
            .into_body()
            .into_data_stream()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[1][..], b"data: two\n\n");
    }

    #[tokio::test]
    async fn test_pipe_detects_dropped_reader() {
        let (mut sink, reader) = PipeResponse::new(8);
        sink.flush_headers();
        let response = reader.into_response().await.unwrap();
        let closed = sink.closed();

        drop(response);

        closed.await;
        assert_eq!(
            sink.write(Bytes::from_static(b"data: x\n\n")),
            Err(ShimError::Closed)
        );
    }

    #[tokio::test]
    async fn test_pipe_reports_full_buffer() {
        let (mut sink, _reader) = PipeResponse::new(1);
        sink.write(Bytes::from_static(b"a")).unwrap();
        assert_eq!(sink.write(Bytes::from_static(b"b")), Err(ShimError::Full));
    }

    #[tokio::test]
    async fn test_pipe_writer_drop_finishes_response() {
        let (sink, reader) = PipeResponse::new(1);
        // Drop flushes headers, so the reader still gets an empty response
        drop(sink);
        let response = reader.into_response().await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty());
    }
}
