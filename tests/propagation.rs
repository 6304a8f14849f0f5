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

//! # End-to-end propagation tests
//!
//! These exercise the full pipeline in one process: an action recorded against a "source" store
//! fans-out into propagation intents, the dispatcher leases & delivers them over real HTTP (via
//! [HttpDeliver]) to a Counter Adjustment router served on a loopback socket, and the deltas land
//! in the "destination" store's counters, idempotently.
//!
//! Both sides run on the in-memory backend; the ScyllaDB backend is exercised separately, against
//! a live cluster.
//!
//! [HttpDeliver]: readmark::client::HttpDeliver

use std::{collections::HashMap, future::IntoFuture, sync::Arc, time::Duration};

use secrecy::SecretString;
use tokio::net::TcpListener;
use url::Url;

use readmark::{
    client::HttpDeliver,
    counters::make_router as make_counter_router,
    dispatcher::{self, Processor},
    entities::{ActionKind, ActionPayload, ContentId, DestinationName, OwnerKey, UserId},
    http::Readmark,
    memory::InMemory,
    metrics::Instruments,
    recorder::{Recorder, CONTENT_SERVICE, USER_SERVICE},
    storage::Backend,
};

const SERVICE_TOKEN: &str = "integration-test-token";

struct Fixture {
    source: Arc<dyn Backend + Send + Sync>,
    destination: Arc<dyn Backend + Send + Sync>,
    recorder: Recorder,
    processor: Processor,
}

/// Stand-up a destination service on a loopback socket & a source recorder + dispatcher pointed
/// at it. Both logical destinations resolve to the same listener; routing is still exercised,
/// since each intent addresses its own resource & owner.
async fn fixture() -> Fixture {
    let destination: Arc<dyn Backend + Send + Sync> = Arc::new(InMemory::new());
    let instruments = Arc::new(Instruments::new("readmark-integration"));

    let dest_state = Arc::new(Readmark {
        storage: destination.clone(),
        recorder: Recorder::new(destination.clone()),
        service_token: SecretString::from(SERVICE_TOKEN),
        instruments: instruments.clone(),
    });
    let router = axum::Router::new()
        .merge(make_counter_router(dest_state.clone()))
        .with_state(dest_state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
    tokio::spawn(axum::serve(listener, router).into_future());

    let source: Arc<dyn Backend + Send + Sync> = Arc::new(InMemory::new());
    let deliver = Arc::new(
        HttpDeliver::new(
            HashMap::from([
                (DestinationName::new(CONTENT_SERVICE), base.clone()),
                (DestinationName::new(USER_SERVICE), base),
            ]),
            SecretString::from(SERVICE_TOKEN),
            Duration::from_secs(2),
        )
        .unwrap(),
    );
    let processor = dispatcher::new(
        source.clone(),
        deliver,
        Some(dispatcher::Config {
            sleep_duration: Duration::from_millis(25),
            pickup_timeout: Duration::from_millis(25),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(50),
            ..Default::default()
        }),
        instruments,
    );

    Fixture {
        recorder: Recorder::new(source.clone()),
        source,
        destination,
        processor,
    }
}

/// Poll `owner`'s counters on the destination until `field` reads `expected` (or five seconds
/// pass, in which case panic with the last observation).
async fn await_counter(
    destination: &Arc<dyn Backend + Send + Sync>,
    owner: &OwnerKey,
    field: &str,
    expected: i64,
) {
    let mut last = None;
    for _ in 0..200 {
        let counters = destination.counters_for(owner).await.unwrap();
        last = counters.get(field).cloned();
        if last == Some(expected) || (expected == 0 && last.is_none()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{} on {} never reached {} (last saw {:?})", field, owner, expected, last);
}

#[tokio::test]
async fn bookmarks_propagate_and_compensate() {
    let fx = fixture().await;
    let actor = UserId::new();
    let target = ContentId::new();

    fx.recorder
        .record(actor, target, ActionPayload::Bookmark { note: None })
        .await
        .unwrap();

    await_counter(&fx.destination, &OwnerKey::content(&target), "bookmarksCount", 1).await;
    await_counter(&fx.destination, &OwnerKey::profile(&actor), "bookmarkedCount", 1).await;

    // Undo it; the compensating decrements flow through the same pipeline & the visible values
    // return to zero.
    fx.recorder
        .remove(actor, target, ActionKind::Bookmark)
        .await
        .unwrap();

    await_counter(&fx.destination, &OwnerKey::content(&target), "bookmarksCount", 0).await;
    await_counter(&fx.destination, &OwnerKey::profile(&actor), "bookmarkedCount", 0).await;

    // Everything settled; nothing left leased or pending on the source.
    assert!(fx
        .source
        .lease_intents(16, chrono::Duration::seconds(30))
        .await
        .unwrap()
        .is_empty());

    fx.processor.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn progress_deltas_accumulate() {
    let fx = fixture().await;
    let actor = UserId::new();
    let target = ContentId::new();
    let profile = OwnerKey::profile(&actor);

    fx.recorder
        .record_progress(actor, target, 100, 500)
        .await
        .unwrap();
    await_counter(&fx.destination, &profile, "wordsLearned", 100).await;
    await_counter(&fx.destination, &profile, "charactersLearned", 500).await;

    // Totals advance; only the positive differences travel.
    fx.recorder
        .record_progress(actor, target, 150, 700)
        .await
        .unwrap();
    await_counter(&fx.destination, &profile, "wordsLearned", 150).await;
    await_counter(&fx.destination, &profile, "charactersLearned", 700).await;

    // A stale report (totals below the high-water mark) must change nothing.
    fx.recorder
        .record_progress(actor, target, 120, 600)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let counters = fx.destination.counters_for(&profile).await.unwrap();
    assert_eq!(counters.get("wordsLearned"), Some(&150));
    assert_eq!(counters.get("charactersLearned"), Some(&700));

    fx.processor.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn unauthenticated_deltas_are_rejected() {
    // A peer presenting the wrong token gets a bare 401 & no counter moves.
    let destination: Arc<dyn Backend + Send + Sync> = Arc::new(InMemory::new());
    let instruments = Arc::new(Instruments::new("readmark-integration-auth"));
    let dest_state = Arc::new(Readmark {
        storage: destination.clone(),
        recorder: Recorder::new(destination.clone()),
        service_token: SecretString::from(SERVICE_TOKEN),
        instruments,
    });
    let router = axum::Router::new()
        .merge(make_counter_router(dest_state.clone()))
        .with_state(dest_state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, router).into_future());

    let target = ContentId::new();
    let rsp = reqwest::Client::new()
        .post(format!(
            "http://{}/internal/contents/{}/increment",
            addr,
            target.as_uuid().as_hyphenated()
        ))
        .header("x-service-token", "not-the-token")
        .json(&serde_json::json!({
            "field": "bookmarksCount",
            "by": 1,
            "idempotencyToken": uuid::Uuid::new_v4().to_string()
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(rsp.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert!(destination
        .counters_for(&OwnerKey::content(&target))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn disallowed_fields_are_answered_with_invalid_field() {
    // The increment protocol's error bodies are keyed `message`, & a field outside the owner
    // type's allowed set is a 400 the sender will treat as permanent.
    let destination: Arc<dyn Backend + Send + Sync> = Arc::new(InMemory::new());
    let instruments = Arc::new(Instruments::new("readmark-integration-fields"));
    let dest_state = Arc::new(Readmark {
        storage: destination.clone(),
        recorder: Recorder::new(destination.clone()),
        service_token: SecretString::from(SERVICE_TOKEN),
        instruments,
    });
    let router = axum::Router::new()
        .merge(make_counter_router(dest_state.clone()))
        .with_state(dest_state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, router).into_future());

    let target = ContentId::new();
    let rsp = reqwest::Client::new()
        .post(format!(
            "http://{}/internal/contents/{}/increment",
            addr,
            target.as_uuid().as_hyphenated()
        ))
        .header("x-service-token", SERVICE_TOKEN)
        .json(&serde_json::json!({
            "field": "noSuchField",
            "by": 1,
            "idempotencyToken": uuid::Uuid::new_v4().to_string()
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(rsp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = rsp.json().await.unwrap();
    assert_eq!(body.get("message").and_then(|m| m.as_str()), Some("invalid_field"));
    assert!(destination
        .counters_for(&OwnerKey::content(&target))
        .await
        .unwrap()
        .is_empty());
}
