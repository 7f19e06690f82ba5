//! MCP Streamable HTTP endpoint handlers.
//!
//! These handlers resolve the session, translate the axum request into a
//! [`ShimRequest`] and hand it to the session's transport together with a
//! response sink. Transport-level failures that occur before a session can
//! be resolved are answered here as `{error}` bodies.
//!
//! ## Endpoints
//!
//! - `POST` - Send JSON-RPC requests
//! - `GET` - Open SSE stream for server-initiated messages
//! - `DELETE` - Terminate a session

use aido_types::{
    is_initialize_request, JsonRpcError, JsonRpcResponse, JSONRPC_CONTENT_TYPE,
    MCP_SESSION_ID_HEADER,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::mcp::shim::{BufferedResponse, CapturedResponse, PipeResponse, ShimRequest};
use crate::state::AppState;

/// Validate Origin header for DNS rebinding protection.
fn validate_origin(headers: &HeaderMap, allowed: &[String]) -> bool {
    // Requests without Origin come from non-browser clients
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let Ok(origin_str) = origin.to_str() else {
        warn!("Rejecting MCP request with unreadable origin");
        return false;
    };
    if origin_str.starts_with("http://localhost")
        || origin_str.starts_with("https://localhost")
        || origin_str.starts_with("http://127.0.0.1")
        || origin_str.starts_with("https://127.0.0.1")
        || origin_str.starts_with("http://[::1]")
        || allowed.iter().any(|a| a == origin_str)
    {
        return true;
    }
    warn!("Rejecting MCP request from origin: {}", origin_str);
    false
}

fn check_origin(state: &AppState, headers: &HeaderMap) -> Result<(), TransportError> {
    if state.mcp_config().validate_origin && !validate_origin(headers, state.allowed_origins()) {
        return Err(TransportError::InvalidOrigin);
    }
    Ok(())
}

/// Extract session ID from headers. An empty header counts as absent.
fn get_session_id(headers: &HeaderMap) -> Result<Option<String>, TransportError> {
    match headers.get(MCP_SESSION_ID_HEADER) {
        None => Ok(None),
        Some(value) => {
            let id = value
                .to_str()
                .map_err(|_| TransportError::InvalidSessionId)?
                .trim();
            Ok((!id.is_empty()).then(|| id.to_string()))
        }
    }
}

/// Remove one level of `{result: {result: ...}}` nesting from a JSON-RPC
/// response, or from each response of a batch.
pub fn unwrap_double_nested(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(unwrap_double_nested).collect()),
        Value::Object(mut object) => {
            let nested = object.contains_key("jsonrpc")
                && object.contains_key("id")
                && object
                    .get("result")
                    .and_then(Value::as_object)
                    .is_some_and(|r| r.contains_key("result"));
            if nested {
                if let Some(Value::Object(mut outer)) = object.remove("result") {
                    if let Some(inner) = outer.remove("result") {
                        warn!("Unwrapping double-nested JSON-RPC result");
                        object.insert("result".to_string(), inner);
                    }
                }
            }
            Value::Object(object)
        }
        other => other,
    }
}

fn internal_error_response(id: Value) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(JsonRpcResponse::error(
            id,
            JsonRpcError::internal_error("Internal server error"),
        )),
    )
        .into_response()
}

/// Turn a captured POST response into an axum response, repairing
/// double-nested results on the way.
fn finish_post(mut captured: CapturedResponse) -> Response {
    let is_jsonrpc = captured
        .headers
        .get(header::CONTENT_TYPE)
        .is_some_and(|v| v.as_bytes() == JSONRPC_CONTENT_TYPE.as_bytes());

    if is_jsonrpc && !captured.body.is_empty() {
        match serde_json::from_slice::<Value>(&captured.body) {
            Ok(value) => {
                let repaired = unwrap_double_nested(value.clone());
                if repaired != value {
                    match serde_json::to_vec(&repaired) {
                        Ok(bytes) => captured.body = Bytes::from(bytes),
                        Err(e) => error!("Failed to re-encode JSON-RPC response: {}", e),
                    }
                }
            }
            Err(e) => warn!("Transport produced a non-JSON response body: {}", e),
        }
    }

    captured.into_response()
}

/// POST - Handle JSON-RPC requests.
///
/// The `mcp-session-id` header is assigned on initialize and required for
/// every other request.
pub async fn mcp_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = check_origin(&state, &headers) {
        return e.into_response();
    }

    let body: Value = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            debug!("MCP POST: unparseable body: {}", e);
            return TransportError::InvalidJson(e).into_response();
        }
    };

    let header_id = match get_session_id(&headers) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let is_init = is_initialize_request(&body);

    let session_id = match (header_id, is_init) {
        (Some(id), _) => id,
        (None, true) => Uuid::new_v4().to_string(),
        (None, false) => return TransportError::MissingSessionId.into_response(),
    };

    let (session, created) = state.get_or_create_session(&session_id).await;
    if created && !is_init {
        warn!(
            "MCP: Unknown session {} on POST, created a fresh one",
            session_id
        );
    }
    session.touch();

    debug!("MCP POST: session={}, initialize={}", session_id, is_init);

    let request_id = body.get("id").cloned().unwrap_or(Value::Null);

    // Dropping this handler (client disconnect) cancels the transport work.
    let abort = CancellationToken::new();
    let _abort_guard = abort.clone().drop_guard();

    let req = ShimRequest::new(Method::POST, headers, Some(body), abort);
    let (sink, finished) = BufferedResponse::new();
    let transport = session.transport.clone();
    let task = tokio::spawn(async move { transport.handle_request(req, Box::new(sink)).await });

    match task.await {
        Ok(Ok(())) => {}
        // Already written to the response by the transport
        Ok(Err(e)) => debug!("MCP POST on {} ended with: {}", session_id, e),
        Err(e) => {
            error!("MCP POST on {} crashed: {}", session_id, e);
            return internal_error_response(request_id);
        }
    }

    let mut response = match finished.await {
        Ok(captured) => finish_post(captured),
        Err(_) => {
            error!("MCP POST on {} finished without a response", session_id);
            return internal_error_response(request_id);
        }
    };

    if is_init && !response.headers().contains_key(MCP_SESSION_ID_HEADER) {
        if let Ok(hv) = HeaderValue::from_str(&session_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(MCP_SESSION_ID_HEADER), hv);
        }
    }
    response
}

/// GET - Open SSE stream for server-initiated messages.
///
/// A request without `mcp-session-id` gets a freshly minted session.
pub async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = check_origin(&state, &headers) {
        return e.into_response();
    }

    let session_id = match get_session_id(&headers) {
        Ok(Some(id)) => id,
        Ok(None) => {
            let id = Uuid::new_v4().to_string();
            info!("MCP: GET without session id, minted {}", id);
            id
        }
        Err(e) => return e.into_response(),
    };

    let (session, created) = state.get_or_create_session(&session_id).await;
    if created {
        warn!(
            "MCP: Unknown session {} on GET, created a fresh one",
            session_id
        );
    }
    session.touch();

    let (sink, reader) = PipeResponse::new(state.mcp_config().stream_channel_capacity);
    let req = ShimRequest::new(Method::GET, headers, None, CancellationToken::new());
    let transport = session.transport.clone();
    tokio::spawn(async move {
        if let Err(e) = transport.handle_request(req, Box::new(sink)).await {
            debug!("MCP GET on {} ended with: {}", transport.session_id(), e);
        }
    });

    match reader.into_response().await {
        Ok(response) => response,
        Err(e) => TransportError::Shim(e).into_response(),
    }
}

/// DELETE - Terminate a session.
///
/// Terminates the session identified by the `mcp-session-id` header.
pub async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = check_origin(&state, &headers) {
        return e.into_response();
    }

    let session_id = match get_session_id(&headers) {
        Ok(Some(id)) => id,
        Ok(None) => return TransportError::MissingSessionId.into_response(),
        Err(e) => return e.into_response(),
    };

    let Some(session) = state.sessions().get(&session_id).await else {
        return TransportError::SessionNotFound(session_id).into_response();
    };

    let req = ShimRequest::new(Method::DELETE, headers, None, CancellationToken::new());
    let (sink, finished) = BufferedResponse::new();
    if let Err(e) = session.transport.handle_request(req, Box::new(sink)).await {
        warn!("MCP DELETE on {} failed: {}", session_id, e);
    }
    state.sessions().delete(&session_id).await;

    match finished.await {
        Ok(captured) => captured.into_response(),
        Err(_) => TransportError::Internal(anyhow::anyhow!("DELETE produced no response"))
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn origin(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_validate_origin() {
        assert!(validate_origin(&HeaderMap::new(), &[]));
        assert!(validate_origin(&origin("http://localhost:3000"), &[]));
        assert!(!validate_origin(&origin("https://evil.example"), &[]));
        assert!(validate_origin(
            &origin("https://aido.example"),
            &["https://aido.example".to_string()]
        ));
    }

    #[test]
    fn test_get_session_id() {
        let mut headers = HeaderMap::new();
        assert!(get_session_id(&headers).unwrap().is_none());

        headers.insert(MCP_SESSION_ID_HEADER, HeaderValue::from_static(""));
        assert!(get_session_id(&headers).unwrap().is_none());

        headers.insert(MCP_SESSION_ID_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(get_session_id(&headers).unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn test_unwrap_double_nested() {
        let nested = json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {"result": {"items": []}}
        });
        assert_eq!(
            unwrap_double_nested(nested),
            json!({"jsonrpc": "2.0", "id": 1, "result": {"items": []}})
        );
    }

    #[test]
    fn test_unwrap_leaves_normal_results() {
        let normal = json!({"jsonrpc": "2.0", "id": 1, "result": {"items": []}});
        assert_eq!(unwrap_double_nested(normal.clone()), normal);

        // Only one level is removed
        let triple = json!({
            "jsonrpc": "2.0", "id": 2,
            "result": {"result": {"result": 1}}
        });
        assert_eq!(unwrap_double_nested(triple)["result"], json!({"result": 1}));
    }

    #[test]
    fn test_unwrap_batch() {
        let batch = json!([
            {"jsonrpc": "2.0", "id": 1, "result": {"result": 5}},
            {"jsonrpc": "2.0", "id": 2, "error": {"code": -32601, "message": "x"}}
        ]);
        let repaired = unwrap_double_nested(batch);
        assert_eq!(repaired[0]["result"], 5);
        assert_eq!(repaired[1]["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_finish_post_repairs_body() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(JSONRPC_CONTENT_TYPE),
        );
        let captured = CapturedResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(r#"{"jsonrpc":"2.0","id":1,"result":{"result":{"ok":true}}}"#),
        };
        let response = finish_post(captured);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], JSONRPC_CONTENT_TYPE);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["result"], json!({"ok": true}));
    }
}
