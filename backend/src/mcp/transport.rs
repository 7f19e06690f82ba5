//! Streamable HTTP transport for one MCP session.
//!
//! The transport consumes [`ShimRequest`]s and writes into [`ResponseSink`]s:
//!
//! - `POST` carries one JSON-RPC message or a batch. Requests are answered in
//!   the response body; notifications and client responses are accepted with
//!   `202`. POSTs on one session are processed one at a time.
//! - `GET` opens the server-to-client SSE stream (see [`Outbox`]).
//! - `DELETE` closes the transport.
//!
//! State machine: `Uninitialized -> Active -> Closed`. A closed transport
//! answers every request with 404.

use aido_types::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageResponse,
    JSONRPC_CONTENT_TYPE, LATEST_PROTOCOL_VERSION, MCP_LAST_EVENT_ID_HEADER, MCP_SESSION_ID_HEADER,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use axum::body::Bytes;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::ProtocolEngine;
use super::outbox::Outbox;
use super::shim::{ResponseSink, ShimRequest};
use crate::config::McpConfig;
use crate::error::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Active,
    Closed,
}

/// Transport settings shared by all sessions.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub keep_alive: Duration,
    pub server_name: String,
    pub server_version: String,
}

impl TransportOptions {
    pub fn from_config(config: &McpConfig) -> Self {
        Self {
            keep_alive: config.keep_alive(),
            server_name: config.server_name.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_config(&McpConfig::default())
    }
}

pub struct StreamableHttpTransport {
    session_id: String,
    options: TransportOptions,
    state: Mutex<TransportState>,
    engine: Arc<ProtocolEngine>,
    outbox: Arc<Outbox>,
    request_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(engine: Arc<ProtocolEngine>, options: TransportOptions) -> Self {
        Self {
            session_id: engine.session_id().to_string(),
            outbox: engine.outbox().clone(),
            options,
            state: Mutex::new(TransportState::Uninitialized),
            engine,
            request_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Handle one HTTP request, writing the full response into `res`.
    ///
    /// Errors are written to `res` as `{error}` bodies before being returned.
    pub async fn handle_request(
        &self,
        req: ShimRequest,
        mut res: Box<dyn ResponseSink>,
    ) -> Result<()> {
        let result = match req.method {
            Method::POST => self.handle_post(&req, res.as_mut()).await,
            Method::GET => match self.ensure_open() {
                Ok(()) => {
                    self.open_stream(&req, res);
                    return Ok(());
                }
                Err(e) => Err(e),
            },
            Method::DELETE => self.handle_delete(res.as_mut()),
            ref other => Err(TransportError::MethodNotAllowed(other.to_string())),
        };

        if let Err(e) = &result {
            match e {
                TransportError::Aborted => {
                    debug!("[{}] {} aborted by client", self.session_id, req.method)
                }
                other => warn!("[{}] {} failed: {}", self.session_id, req.method, other),
            }
            write_error(res.as_mut(), e);
        }
        res.end();
        result
    }

    /// Queue a server-to-client notification on the session stream.
    pub fn send_notification(&self, notification: &JsonRpcNotification) -> Result<u64> {
        self.ensure_open()?;
        self.outbox
            .send(notification)
            .map_err(|e| TransportError::Internal(e.into()))
    }

    /// Close the transport, ending its stream and background tasks.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == TransportState::Closed {
                return;
            }
            *state = TransportState::Closed;
        }
        self.shutdown.cancel();
        self.outbox.close();
        info!("[{}] MCP transport closed", self.session_id);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == TransportState::Closed {
            return Err(TransportError::SessionClosed(self.session_id.clone()));
        }
        Ok(())
    }

    async fn handle_post(&self, req: &ShimRequest, res: &mut dyn ResponseSink) -> Result<()> {
        let _guard = tokio::select! {
            guard = self.request_lock.lock() => guard,
            _ = req.on_abort() => return Err(TransportError::Aborted),
        };
        self.ensure_open()?;

        let (messages, is_batch) = match req.body.clone().unwrap_or(Value::Null) {
            Value::Array(items) => (items, true),
            other => (vec![other], false),
        };

        if is_batch && messages.is_empty() {
            let response = JsonRpcResponse::error(
                Value::Null,
                aido_types::JsonRpcError::invalid_request("Empty batch"),
            );
            return self.write_jsonrpc(res, StatusCode::BAD_REQUEST, &response);
        }

        let mut responses = Vec::new();
        let mut rejected = false;
        for raw in messages {
            match JsonRpcMessage::from_value(raw) {
                Ok(JsonRpcMessage::Request(request)) => {
                    let response = tokio::select! {
                        response = self.dispatch(request) => response,
                        _ = req.on_abort() => return Err(TransportError::Aborted),
                    };
                    responses.push(response);
                }
                Ok(JsonRpcMessage::Notification(notification)) => {
                    self.engine.handle_notification(&notification)
                }
                Ok(JsonRpcMessage::Response(response)) => {
                    debug!(
                        "[{}] Ignoring client response for id {}",
                        self.session_id, response.id
                    )
                }
                Err(invalid) => {
                    rejected = true;
                    responses.push(invalid);
                }
            }
        }

        if responses.is_empty() {
            res.set_status(StatusCode::ACCEPTED);
            self.set_session_header(res);
            res.flush_headers();
            return Ok(());
        }

        let status = if rejected && !is_batch {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::OK
        };

        if is_batch {
            self.write_jsonrpc(res, status, &responses)
        } else {
            match responses.pop() {
                Some(response) => self.write_jsonrpc(res, status, &response),
                None => Ok(()),
            }
        }
    }

    async fn dispatch(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        if request.method == "initialize" {
            return self.initialize(request);
        }
        self.engine.handle_request(request).await
    }

    fn initialize(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let requested = request
            .params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let protocol_version = match requested {
            Some(v) if SUPPORTED_PROTOCOL_VERSIONS.contains(&v) => v,
            _ => LATEST_PROTOCOL_VERSION,
        };

        {
            let mut state = self.state.lock();
            match *state {
                TransportState::Uninitialized => {
                    *state = TransportState::Active;
                    info!(
                        "[{}] MCP session initialized (protocol {})",
                        self.session_id, protocol_version
                    );
                }
                TransportState::Active => {
                    debug!("[{}] Re-initializing active session", self.session_id)
                }
                TransportState::Closed => {}
            }
        }

        JsonRpcResponse::success(
            request.id,
            json!({
                "protocolVersion": protocol_version,
                "capabilities": {
                    "tools": { "listChanged": false },
                    "logging": {}
                },
                "serverInfo": {
                    "name": self.options.server_name,
                    "version": self.options.server_version
                }
            }),
        )
    }

    fn open_stream(&self, req: &ShimRequest, mut res: Box<dyn ResponseSink>) {
        res.set_status(StatusCode::OK);
        res.set_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream; charset=utf-8"),
        );
        res.set_header(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-transform"),
        );
        res.set_header(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        res.set_header(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        );
        self.set_session_header(res.as_mut());
        res.flush_headers();

        let mut closed = res.closed();
        let generation = self
            .outbox
            .attach(res, req.header(MCP_LAST_EVENT_ID_HEADER));
        info!(
            "[{}] MCP event stream opened (generation {})",
            self.session_id, generation
        );

        let outbox = self.outbox.clone();
        let shutdown = self.shutdown.clone();
        let keep_alive = self.options.keep_alive;
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + keep_alive;
            let mut ticker = tokio::time::interval_at(start, keep_alive);
            loop {
                tokio::select! {
                    _ = &mut closed => {
                        debug!("[{}] Event stream client disconnected", session_id);
                        break;
                    }
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if outbox.keep_alive(generation).is_err() {
                            break;
                        }
                    }
                }
            }
            if outbox.detach(generation) {
                info!(
                    "[{}] MCP event stream closed (generation {})",
                    session_id, generation
                );
            }
        });
    }

    fn handle_delete(&self, res: &mut dyn ResponseSink) -> Result<()> {
        self.close();
        let body = MessageResponse::new(format!(
            "Session {} resources deleted.",
            self.session_id
        ));
        write_json(res, StatusCode::OK, header_value(JSON_CONTENT_TYPE), &body)
    }

    fn write_jsonrpc<T: Serialize + ?Sized>(
        &self,
        res: &mut dyn ResponseSink,
        status: StatusCode,
        payload: &T,
    ) -> Result<()> {
        self.set_session_header(res);
        write_json(res, status, header_value(JSONRPC_CONTENT_TYPE), payload)
    }

    fn set_session_header(&self, res: &mut dyn ResponseSink) {
        match HeaderValue::from_str(&self.session_id) {
            Ok(value) => res.set_header(HeaderName::from_static(MCP_SESSION_ID_HEADER), value),
            Err(_) => warn!(
                "Session id '{}' cannot be sent as a header",
                self.session_id
            ),
        }
    }
}

const JSON_CONTENT_TYPE: &str = "application/json";

fn header_value(value: &'static str) -> HeaderValue {
    HeaderValue::from_static(value)
}

fn write_json<T: Serialize + ?Sized>(
    res: &mut dyn ResponseSink,
    status: StatusCode,
    content_type: HeaderValue,
    payload: &T,
) -> Result<()> {
    let body = serde_json::to_vec(payload).map_err(|e| TransportError::Internal(e.into()))?;
    res.set_status(status);
    res.set_header(header::CONTENT_TYPE, content_type);
    res.write(Bytes::from(body))?;
    Ok(())
}

fn write_error(res: &mut dyn ResponseSink, error: &TransportError) {
    if res.headers_sent() || res.is_ended() {
        return;
    }
    if let Err(e) = write_json(res, error.status(), header_value(JSON_CONTENT_TYPE), &error.body()) {
        warn!("Failed to write error response: {}", e);
    }
}
