//! Encrypted request gateway: `POST /api/invoke`.
//!
//! Per request:
//! 1. Identify the caller from `c-id` / `c-type` / `c-gid` / bearer headers
//! 2. Resolve its key (unknown caller → 401, body never decrypted)
//! 3. Decrypt the body; peer calls also pass freshness + signature checks
//! 4. Dispatch the operation envelope through the registry
//! 5. Stamp session activity and answer with an encrypted body

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::response::{IntoResponse, Response};

use crate::api::error::{encrypted_response, ApiError, DomainErrorBody};
use crate::api::types::{
    header_str, remote_ip, ApiContext, ResolvedCaller, CLIENT_TYPE_PEER, HEADER_CLIENT_ID,
    HEADER_CLIENT_TYPE, HEADER_GROUP_ID, MAX_BODY_BYTES,
};
use crate::cipher;
use crate::operations::{CallContext, CallerKind, OperationEnvelope};
use crate::peer_trust::KeyScope;
use crate::peer_verify;
use crate::rate_limit::now_ms;

/// Client id recorded for developer calls.
pub const DEVELOPER_CLIENT_ID: &str = "developer";

/// Work out who is calling and which key their traffic uses.
///
/// Never touches the body: an unknown caller is refused before any
/// decryption is attempted.
pub fn resolve_caller(
    ctx: &ApiContext,
    headers: &HeaderMap,
    observed_ip: &str,
) -> Result<ResolvedCaller, ApiError> {
    let client_id = header_str(headers, HEADER_CLIENT_ID);
    let is_peer = header_str(headers, HEADER_CLIENT_TYPE)
        .is_some_and(|t| t.eq_ignore_ascii_case(CLIENT_TYPE_PEER));

    if is_peer {
        let peer_id = client_id.unwrap_or_default().to_string();
        let trust = ctx.core.peer_trust();
        let (key, caller) = match header_str(headers, HEADER_GROUP_ID) {
            Some(group_id) => (
                trust.key_for(KeyScope::Group, group_id),
                CallerKind::Group(group_id.to_string()),
            ),
            None if !peer_id.is_empty() => (trust.key_for(KeyScope::Peer, &peer_id), CallerKind::Peer),
            None => (None, CallerKind::Peer),
        };
        let key = key.ok_or(ApiError::Unauthorized)?;
        return Ok(ResolvedCaller {
            key,
            context: CallContext {
                client_id: peer_id,
                client_ip: observed_ip.to_string(),
                caller,
            },
            signed: true,
        });
    }

    if let Some(client_id) = client_id {
        if let Some(key) = ctx.core.sessions.token_for(client_id) {
            let client_ip = ctx.core.sessions.resolve_client_ip(client_id, observed_ip);
            return Ok(ResolvedCaller {
                key,
                context: CallContext {
                    client_id: client_id.to_string(),
                    client_ip,
                    caller: CallerKind::Session,
                },
                signed: false,
            });
        }
    }

    let bearer = header_str(headers, axum::http::header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if let Some(token) = bearer {
        if ctx.core.dev_token_matches(token) {
            return Ok(ResolvedCaller {
                key: ctx.core.root_token(),
                context: CallContext {
                    client_id: DEVELOPER_CLIENT_ID.to_string(),
                    client_ip: observed_ip.to_string(),
                    caller: CallerKind::Developer,
                },
                signed: false,
            });
        }
    }

    Err(ApiError::Unauthorized)
}

/// Decrypt (and for peers, authenticate) the request body.
fn open_body(ctx: &ApiContext, caller: &ResolvedCaller, body: &[u8]) -> Result<Vec<u8>, ApiError> {
    let plaintext = cipher::open(&caller.key, body).map_err(|e| {
        tracing::debug!(client_id = %caller.context.client_id, error = %e, "Body rejected");
        ApiError::Unauthorized
    })?;
    if plaintext.is_empty() {
        return Err(ApiError::Unauthorized);
    }
    if !caller.signed {
        return Ok(plaintext);
    }

    let text = std::str::from_utf8(&plaintext).map_err(|_| ApiError::Unauthorized)?;
    let payload = peer_verify::verify(
        &caller.key,
        text,
        now_ms(),
        ctx.core.config.peer_freshness(),
    )
    .map_err(|e| {
        tracing::warn!(peer_id = %caller.context.client_id, error = %e, "Peer message rejected");
        ApiError::Unauthorized
    })?;
    Ok(payload.as_bytes().to_vec())
}

/// `POST /api/invoke`
pub async fn invoke(State(ctx): State<ApiContext>, req: Request<Body>) -> Response {
    match invoke_inner(ctx, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn invoke_inner(ctx: ApiContext, req: Request<Body>) -> Result<Response, ApiError> {
    let observed_ip = remote_ip(req.extensions())
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let caller = resolve_caller(&ctx, req.headers(), &observed_ip)?;

    let body = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("unreadable body: {e}")))?;
    let plaintext = open_body(&ctx, &caller, &body)?;

    // From here on the caller is authenticated; errors travel encrypted.
    let envelope = match OperationEnvelope::parse(&plaintext) {
        Ok(envelope) => envelope,
        Err(e) => return encrypted_response(&caller.key, &DomainErrorBody::from_error(&e, None)),
    };

    if caller.context.caller == CallerKind::Session {
        ctx.core.activity.record(&caller.context.client_id);
    }

    let operation = envelope.operation.clone();
    match ctx.operations.dispatch(envelope, caller.context.clone()).await {
        Ok(value) => encrypted_response(&caller.key, &value),
        Err(e) => encrypted_response(&caller.key, &DomainErrorBody::from_error(&e, Some(&operation))),
    }
}
