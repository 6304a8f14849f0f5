// Copyright (C) 2025-2026 The readmark developers
//
// This file is part of readmark.
//
// readmark is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// readmark is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with readmark.  If not,
// see <http://www.gnu.org/licenses/>.

//! # counters
//!
//! The Counter Adjustment Endpoint: the receiving side of the propagation protocol.
//!
//! Peers POST signed deltas to `/internal/<resource>/<owner>/increment` with the shared-secret
//! `x-service-token` header and a body of the form
//!
//! ```json
//! { "field": "bookmarksCount", "by": 1, "idempotencyToken": "..." }
//! ```
//!
//! The apply is idempotent: the token goes into a dedup ledger in the same transaction as the
//! counter update, so redelivered deltas (and the at-least-once dispatcher *will* redeliver) are
//! no-ops. Either way the response carries the counter's current visible value, which is the raw
//! sum floored at zero; a decrement can drive the raw sum negative (deltas on different keys race,
//! and compensations can land before their originals), and preserving it un-clamped is what lets
//! a late-arriving increment reconcile the counter instead of inflating it.
//!
//! Counter names are validated against the owner type's allowed set; anything else is answered
//! with `400 {"message": "invalid_field"}`, which the sender treats as permanent. Note that error
//! bodies on this API are keyed `message` (that's the shape peers already parse), unlike the
//! public API's `error`.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    counter_add,
    entities::{CounterField, IdempotencyToken, OwnerKey, OwnerKind},
    http::{MessageResponseBody, Readmark, X_SERVICE_TOKEN},
    metrics::{self, Sort},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid_field"))]
    InvalidField { source: crate::entities::Error },
    #[snafu(display("invalid_token"))]
    InvalidToken { source: uuid::Error },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: crate::storage::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            ////////////////////////////////////////////////////////////////////////////////////////
            // Broken requests-- tell the caller how to fix it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::InvalidField { .. } => (StatusCode::BAD_REQUEST, "invalid_field".to_string()),
            Error::InvalidToken { .. } => (StatusCode::BAD_REQUEST, "invalid_token".to_string()),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Internal failure-- own up to it:
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Storage { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal server error applying the delta: {source}"),
            ),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        (code, Json(MessageResponseBody { message: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Authorization                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("counters.auth.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("counters.auth.failures", Sort::IntegralCounter) }

/// Authenticate a service-to-service request
///
/// No users here; the internal API trusts exactly one credential, the shared `x-service-token`
/// secret known to all peer services. Anything else is answered with a bare 401 (no body; don't
/// tell a potential attacker how they failed).
pub(crate) async fn authenticate(
    State(state): State<Arc<Readmark>>,
    headers: axum::http::HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let presented = headers
        .get(X_SERVICE_TOKEN)
        .and_then(|value| value.to_str().ok());
    if presented == Some(state.service_token.expose_secret()) {
        counter_add!(state.instruments, "counters.auth.successes", 1, &[]);
        next.run(request).await
    } else {
        warn!("rejected an internal request with a missing or bad service token");
        counter_add!(state.instruments, "counters.auth.failures", 1, &[]);
        StatusCode::UNAUTHORIZED.into_response()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                             `/internal/<resource>/{owner}/increment`                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("counters.deltas.applied", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize)]
struct IncrementReq {
    field: String,
    by: i64,
    #[serde(rename = "idempotencyToken")]
    idempotency_token: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IncrementRsp {
    #[serde(rename = "currentValue")]
    pub current_value: i64,
}

async fn apply(
    state: Arc<Readmark>,
    kind: OwnerKind,
    key: Uuid,
    req: IncrementReq,
) -> Result<IncrementRsp> {
    let field = CounterField::for_owner(kind, &req.field).context(InvalidFieldSnafu)?;
    let token =
        IdempotencyToken::from_raw_string(&req.idempotency_token).context(InvalidTokenSnafu)?;
    let owner = OwnerKey { kind, key };
    let current_value = state
        .storage
        .apply_delta(&owner, &field, req.by, &token)
        .await
        .context(StorageSnafu)?;
    debug!("applied {:+} to {} on {} => {}", req.by, field, owner, current_value);
    counter_add!(state.instruments, "counters.deltas.applied", 1, &[]);
    Ok(IncrementRsp { current_value })
}

async fn increment_content(
    State(state): State<Arc<Readmark>>,
    Path(id): Path<Uuid>,
    Json(req): Json<IncrementReq>,
) -> axum::response::Response {
    match apply(state, OwnerKind::Content, id, req).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn increment_profile(
    State(state): State<Arc<Readmark>>,
    Path(id): Path<Uuid>,
    Json(req): Json<IncrementReq>,
) -> axum::response::Response {
    match apply(state, OwnerKind::Profile, id, req).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                             `/internal/<resource>/{owner}/counters`                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn counters(
    state: Arc<Readmark>,
    kind: OwnerKind,
    key: Uuid,
) -> Result<std::collections::HashMap<String, i64>> {
    state
        .storage
        .counters_for(&OwnerKey { kind, key })
        .await
        .context(StorageSnafu)
}

async fn content_counters(
    State(state): State<Arc<Readmark>>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    match counters(state, OwnerKind::Content, id).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn profile_counters(
    State(state): State<Arc<Readmark>>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    match counters(state, OwnerKind::Profile, id).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the Counter Adjustment API
///
/// Mounted on the *internal* listener only; every route demands the service token.
pub fn make_router(state: Arc<Readmark>) -> Router<Arc<Readmark>> {
    Router::new()
        .route("/internal/contents/{id}/increment", post(increment_content))
        .route("/internal/profiles/{id}/increment", post(increment_profile))
        .route("/internal/contents/{id}/counters", get(content_counters))
        .route("/internal/profiles/{id}/counters", get(profile_counters))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            authenticate,
        ))
        // All responses are JSON; add the appropriate Content-Type header (but leave the existing
        // Content-Type header should a handler set it specially).
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
