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

//! # readmark client
//!
//! The addressing & credential layer, and the production [Deliver] implementation: intents name
//! their destination *logically* ("content-service"); this module resolves the name to a base URL
//! from configuration, attaches the shared-secret `x-service-token` header, and POSTs the delta to
//! the destination's Counter Adjustment Endpoint.
//!
//! Durable retry lives at the intent level in the [dispatcher]; this client makes exactly one
//! attempt per call and reports *why* it failed, since the permanent/transient distinction is the
//! dispatcher's retry decision.
//!
//! [Deliver]: crate::dispatcher::Deliver
//! [dispatcher]: crate::dispatcher

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use snafu::{prelude::*, Backtrace};
use tracing::debug;
use url::Url;

use crate::{
    define_metric,
    dispatcher::{Deliver, DeliveryError},
    entities::{CounterField, DestinationName, IdempotencyToken, PropagationIntent},
    http::X_SERVICE_TOKEN,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create an HTTP client: {source}"))]
    ReqwestClient {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

define_metric! { "client.requests", client_requests, Sort::IntegralCounter }
define_metric! { "client.errors", client_errors, Sort::IntegralCounter }

/// Wire format of the Counter Adjustment Endpoint request body
#[derive(Debug, Serialize)]
pub struct IncrementRequest<'a> {
    pub field: &'a CounterField,
    pub by: i64,
    #[serde(rename = "idempotencyToken")]
    pub idempotency_token: &'a IdempotencyToken,
}

/// [Deliver] implementation speaking the increment protocol over HTTP
pub struct HttpDeliver {
    client: reqwest::Client,
    destinations: HashMap<DestinationName, Url>,
    token: SecretString,
}

impl HttpDeliver {
    pub fn new(
        destinations: HashMap<DestinationName, Url>,
        token: SecretString,
        timeout: Duration,
    ) -> Result<HttpDeliver> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(ReqwestClientSnafu)?;
        Ok(HttpDeliver {
            client,
            destinations,
            token,
        })
    }
}

#[async_trait]
impl Deliver for HttpDeliver {
    async fn deliver(&self, intent: &PropagationIntent) -> std::result::Result<(), DeliveryError> {
        // An unknown destination can only come from a configuration that's lost an entry intents
        // were already written against; retrying won't fix that.
        let base = self.destinations.get(&intent.destination).ok_or_else(|| {
            DeliveryError::Permanent {
                reason: format!("no base URL configured for {}", intent.destination),
            }
        })?;
        let url = base
            .join(&format!(
                "internal/{}/{}/increment",
                intent.owner.kind.resource(),
                intent.owner.key.as_hyphenated()
            ))
            .map_err(|err| DeliveryError::Permanent {
                reason: format!("malformed destination URL: {err}"),
            })?;
        debug!("delivering {:+} to {}", intent.delta, url);
        client_requests.add(
            1,
            &[KeyValue::new("destination", intent.destination.to_string())],
        );
        let rsp = self
            .client
            .post(url)
            .header(X_SERVICE_TOKEN, self.token.expose_secret())
            .json(&IncrementRequest {
                field: &intent.field,
                by: intent.delta,
                idempotency_token: &intent.token,
            })
            .send()
            .await
            .map_err(|err| {
                client_errors.add(
                    1,
                    &[KeyValue::new("destination", intent.destination.to_string())],
                );
                // timeouts, refused connections, DNS... all worth another try
                DeliveryError::Transient {
                    reason: format!("{err}"),
                }
            })?;
        let status = rsp.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            // The destination understood us & said no: a bad credential or a disallowed field.
            // The same bytes will never succeed.
            Err(DeliveryError::Permanent {
                reason: format!("{} rejected the delta: {}", intent.destination, status),
            })
        } else {
            Err(DeliveryError::Transient {
                reason: format!("{} answered {}", intent.destination, status),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use wiremock::{
        matchers::{body_partial_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::entities::{ActionId, ContentId, OwnerKey, OwnerKind};

    fn intent_for(server_dest: &str) -> PropagationIntent {
        PropagationIntent::new(
            &ActionId::new(),
            DestinationName::new(server_dest),
            OwnerKey::content(&ContentId::new()),
            CounterField::for_owner(OwnerKind::Content, "bookmarksCount").unwrap(),
            1,
            0,
        )
    }

    async fn deliver_against(template: ResponseTemplate) -> std::result::Result<(), DeliveryError> {
        let server = MockServer::start().await;
        let intent = intent_for("content-service");
        Mock::given(method("POST"))
            .and(path(format!(
                "/internal/contents/{}/increment",
                intent.owner.key.as_hyphenated()
            )))
            .and(header(X_SERVICE_TOKEN, "sesame"))
            .and(body_partial_json(serde_json::json!({
                "field": "bookmarksCount",
                "by": 1
            })))
            .respond_with(template)
            .mount(&server)
            .await;
        let deliver = HttpDeliver::new(
            HashMap::from([(
                DestinationName::new("content-service"),
                Url::parse(&server.uri()).unwrap(),
            )]),
            SecretString::from("sesame"),
            Duration::from_secs(5),
        )
        .unwrap();
        deliver.deliver(&intent).await
    }

    #[tokio::test]
    async fn success_is_success() {
        deliver_against(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "currentValue": 1
        })))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        assert!(matches!(
            deliver_against(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error": "invalid_field"}))
            )
            .await,
            Err(DeliveryError::Permanent { .. })
        ));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        assert!(matches!(
            deliver_against(ResponseTemplate::new(503)).await,
            Err(DeliveryError::Transient { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_destinations_are_permanent() {
        let deliver = HttpDeliver::new(
            HashMap::new(),
            SecretString::from("sesame"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(
            deliver.deliver(&intent_for("no-such-service")).await,
            Err(DeliveryError::Permanent { .. })
        ));
    }
}
