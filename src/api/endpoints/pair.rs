//! `POST /api/pair`: human-confirmed pairing handshake.
//!
//! The body is encrypted with the root token (no session key exists yet).
//! The handler parks until the device owner answers the prompt, then
//! answers with the freshly minted session token, also under the root key.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::{IntoResponse, Response};

use crate::api::error::{encrypted_response, ApiError};
use crate::api::types::{header_str, remote_ip, ApiContext, HEADER_CLIENT_ID, MAX_BODY_BYTES};
use crate::cipher;
use crate::pairing::{complete_pairing, PairRequest, PairResponse, PairingError, PairingEvent};

pub async fn pair(State(ctx): State<ApiContext>, req: Request<Body>) -> Response {
    match pair_inner(ctx, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn pair_inner(ctx: ApiContext, req: Request<Body>) -> Result<Response, ApiError> {
    if !ctx.core.credentials.has_password() {
        tracing::warn!("Pairing refused: no owner password configured");
        return Err(ApiError::Unauthorized);
    }

    let client_ip = remote_ip(req.extensions())
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    let header_client_id = header_str(req.headers(), HEADER_CLIENT_ID).map(str::to_string);

    let body = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("unreadable body: {e}")))?;

    let root = ctx.core.root_token();
    let plaintext = cipher::open(&root, &body)?;
    let mut request: PairRequest = serde_json::from_slice(&plaintext)
        .map_err(|e| ApiError::BadRequest(format!("malformed pairing request: {e}")))?;
    if request.client_id.trim().is_empty() {
        if let Some(id) = header_client_id {
            request.client_id = id;
        }
    }

    let (rx, approval) = {
        let mut pairing = ctx.core.lock_pairing()?;
        pairing.submit(&request, &client_ip).map_err(|e| match e {
            PairingError::AlreadyPending(id) => ApiError::PairingConflict(id),
            other => ApiError::BadRequest(other.to_string()),
        })?
    };
    let client_id = approval.client_id.clone();
    ctx.core.notify_pairing(PairingEvent::Requested(approval.clone()));

    let decision = tokio::time::timeout(ctx.core.config.pairing_timeout(), rx).await;
    ctx.core.lock_pairing()?.finish(&client_id);

    let outcome = match decision {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) | Ok(Err(_)) => Err(ApiError::PairingDenied),
        Err(_) => {
            tracing::info!(client_id = %client_id, "Pairing prompt expired");
            Err(ApiError::PairingTimeout)
        }
    };
    if let Err(err) = outcome {
        ctx.core.notify_pairing(PairingEvent::Resolved {
            client_id,
            approved: false,
        });
        return Err(err);
    }

    let (_, token) = complete_pairing(&ctx.core.sessions, &approval).map_err(|e| {
        ApiError::Internal(format!("pairing {client_id} could not be stored: {e}"))
    })?;
    ctx.core.notify_pairing(PairingEvent::Resolved {
        client_id: client_id.clone(),
        approved: true,
    });

    encrypted_response(
        &root,
        &PairResponse {
            client_id,
            token: token.to_base64(),
        },
    )
}
