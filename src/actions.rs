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

//! # actions
//!
//! The public Action API: the HTTP face of the [Recorder].
//!
//! [Recorder]: crate::recorder::Recorder
//!
//! Success here means the action record & its propagation intents are committed locally; whether
//! the remote aggregate counters have been adjusted yet is deliberately invisible. A caller who
//! bookmarks a lesson & immediately fetches the lesson's bookmark count from the content service
//! may briefly see the old value; that's the protocol working as intended, not a bug to paper
//! over.
//!
//! This module also carries the operator-facing listing of permanently failed intents, mounted on
//! the internal listener: those are the deltas the dispatcher has given up on, surfaced for manual
//! reconciliation rather than silently dropped.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use snafu::prelude::*;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::info;

use crate::{
    counter_add,
    entities::{ActionKind, ActionPayload, ActionRecord, ContentId, UserId},
    http::{ErrorResponseBody, Readmark},
    metrics::{self, Sort},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Record { source: crate::recorder::Error },
    #[snafu(display("No progress has been recorded for {actor} against {target}"))]
    NoProgress { actor: UserId, target: ContentId },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: crate::storage::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            ////////////////////////////////////////////////////////////////////////////////////////
            // Broken requests-- tell the caller how to fix it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Record {
                source: source @ crate::recorder::Error::Conflict { .. },
            } => (StatusCode::CONFLICT, format!("{source}")),
            Error::Record {
                source: source @ crate::recorder::Error::ProgressOutOfRange { .. },
            } => (StatusCode::BAD_REQUEST, format!("{source}")),
            Error::NoProgress { actor, target } => (
                StatusCode::NOT_FOUND,
                format!("No progress recorded for {} against {}", actor, target),
            ),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Internal failure-- own up to it:
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Record { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to record the action: {source}"),
            ),
            Error::Storage { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal server error: {source}"),
            ),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

inventory::submit! { metrics::Registration::new("actions.recorded", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("actions.removed", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("actions.conflicts", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                             bookmarks, downloads & read markers                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
struct BookmarkReq {
    note: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct DownloadReq {
    #[serde(rename = "file-path")]
    file_path: String,
}

#[derive(Clone, Debug, Deserialize)]
struct ProgressReq {
    words: u64,
    characters: u64,
}

async fn record(
    state: &Arc<Readmark>,
    actor: UserId,
    target: ContentId,
    payload: ActionPayload,
) -> axum::response::Response {
    match state
        .recorder
        .record(actor, target, payload)
        .await
        .context(RecordSnafu)
    {
        Ok(record) => {
            counter_add!(state.instruments, "actions.recorded", 1, &[]);
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn remove(
    state: &Arc<Readmark>,
    actor: UserId,
    target: ContentId,
    kind: ActionKind,
) -> axum::response::Response {
    match state
        .recorder
        .remove(actor, target, kind)
        .await
        .context(RecordSnafu)
    {
        Ok(record) => {
            info!("{} removed their {} of {}", actor, kind, target);
            counter_add!(state.instruments, "actions.removed", 1, &[]);
            Json(record).into_response()
        }
        Err(err) => {
            counter_add!(state.instruments, "actions.conflicts", 1, &[]);
            err.into_response()
        }
    }
}

async fn add_bookmark(
    State(state): State<Arc<Readmark>>,
    Path((actor, target)): Path<(UserId, ContentId)>,
    Json(req): Json<BookmarkReq>,
) -> axum::response::Response {
    record(&state, actor, target, ActionPayload::Bookmark { note: req.note }).await
}

async fn remove_bookmark(
    State(state): State<Arc<Readmark>>,
    Path((actor, target)): Path<(UserId, ContentId)>,
) -> axum::response::Response {
    remove(&state, actor, target, ActionKind::Bookmark).await
}

async fn list_bookmarks(
    State(state): State<Arc<Readmark>>,
    Path(actor): Path<UserId>,
) -> axum::response::Response {
    list(&state, actor, ActionKind::Bookmark).await
}

async fn add_download(
    State(state): State<Arc<Readmark>>,
    Path((actor, target)): Path<(UserId, ContentId)>,
    Json(req): Json<DownloadReq>,
) -> axum::response::Response {
    record(
        &state,
        actor,
        target,
        ActionPayload::Download {
            file_path: req.file_path,
        },
    )
    .await
}

async fn remove_download(
    State(state): State<Arc<Readmark>>,
    Path((actor, target)): Path<(UserId, ContentId)>,
) -> axum::response::Response {
    remove(&state, actor, target, ActionKind::Download).await
}

async fn list_downloads(
    State(state): State<Arc<Readmark>>,
    Path(actor): Path<UserId>,
) -> axum::response::Response {
    list(&state, actor, ActionKind::Download).await
}

async fn mark_read(
    State(state): State<Arc<Readmark>>,
    Path((actor, target)): Path<(UserId, ContentId)>,
) -> axum::response::Response {
    record(&state, actor, target, ActionPayload::MarkRead).await
}

async fn list(
    state: &Arc<Readmark>,
    actor: UserId,
    kind: ActionKind,
) -> axum::response::Response {
    match state
        .recorder
        .list(actor, kind)
        .await
        .context(RecordSnafu)
    {
        Ok(records) => Json(records).into_response(),
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            progress                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn upsert_progress(
    State(state): State<Arc<Readmark>>,
    Path((actor, target)): Path<(UserId, ContentId)>,
    Json(req): Json<ProgressReq>,
) -> axum::response::Response {
    match state
        .recorder
        .record_progress(actor, target, req.words, req.characters)
        .await
        .context(RecordSnafu)
    {
        Ok(record) => {
            counter_add!(state.instruments, "actions.recorded", 1, &[]);
            Json(record).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn get_progress(
    State(state): State<Arc<Readmark>>,
    Path((actor, target)): Path<(UserId, ContentId)>,
) -> axum::response::Response {
    async fn get_progress1(
        state: &Arc<Readmark>,
        actor: UserId,
        target: ContentId,
    ) -> Result<ActionRecord> {
        state
            .recorder
            .progress(actor, target)
            .await
            .context(RecordSnafu)?
            .context(NoProgressSnafu { actor, target })
    }

    match get_progress1(&state, actor, target).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    `/internal/intents/failed`                                  //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn failed_intents(State(state): State<Arc<Readmark>>) -> axum::response::Response {
    match state.storage.failed_intents().await.context(StorageSnafu) {
        Ok(intents) => Json(intents).into_response(),
        Err(err) => err.into_response(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the public Action API
///
/// The returned [Router] will presumably be merged with other routers.
pub fn make_router(state: Arc<Readmark>) -> Router<Arc<Readmark>> {
    Router::new()
        .route("/users/{actor}/bookmarks", get(list_bookmarks))
        .route("/users/{actor}/bookmarks/{target}", post(add_bookmark))
        .route("/users/{actor}/bookmarks/{target}", delete(remove_bookmark))
        .route("/users/{actor}/downloads", get(list_downloads))
        .route("/users/{actor}/downloads/{target}", post(add_download))
        .route("/users/{actor}/downloads/{target}", delete(remove_download))
        .route("/users/{actor}/read/{target}", post(mark_read))
        .route("/users/{actor}/progress/{target}", put(upsert_progress))
        .route("/users/{actor}/progress/{target}", get(get_progress))
        // All responses are JSON; add the appropriate Content-Type header (but leave the existing
        // Content-Type header should a handler set it specially).
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Return a router for the operator-facing pieces of the internal API
///
/// Merged with the Counter Adjustment router on the internal listener, behind the same
/// service-token middleware.
pub fn make_ops_router(state: Arc<Readmark>) -> Router<Arc<Readmark>> {
    Router::new()
        .route("/internal/intents/failed", get(failed_intents))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::counters::authenticate,
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("text/json; charset=utf-8"),
        ))
        .with_state(state)
}
