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

use std::sync::Arc;

use axum::Json;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::{metrics, recorder::Recorder, storage::Backend as StorageBackend};

/// Name of the shared-secret header authenticating service-to-service requests
pub const X_SERVICE_TOKEN: &str = "x-service-token";

/// A serializable struct for use in HTTP error responses
///
/// This is intended to be used in the [IntoResponse] implementations for whatever error type an
/// axum handler is using, so that every error leaves the building as `{"error": "..."}`.
///
/// [IntoResponse]: https://docs.rs/axum/latest/axum/response/trait.IntoResponse.html
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl axum::response::IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// Error body for the Counter Adjustment API
///
/// The service-to-service increment protocol predates this implementation & keys its error bodies
/// `message`, not `error` (e.g. `400 {"message": "invalid_field"}`); peers parse that shape, so
/// the counter endpoints answer with this rather than [ErrorResponseBody].
#[derive(Debug, Deserialize, Serialize)]
pub struct MessageResponseBody {
    pub message: String,
}

impl axum::response::IntoResponse for MessageResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// Application state available to all handlers
pub struct Readmark {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub recorder: Recorder,
    /// Shared secret presented by (and demanded of) peer services
    pub service_token: SecretString,
    pub instruments: Arc<metrics::Instruments>,
}
