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

//! # Propagation Dispatch
//!
//! The background processor that drains the outbox: leases deliverable Propagation Intents from
//! storage, drives their delivery concurrently, and settles each outcome back into storage.
//!
//! One could of course just [tokio::spawn] a delivery from the request handler, but I'd rather not
//! accept the lack of durability entailed in that solution: if the process crashes after the
//! handler returns but before the delivery completes, the delta is lost & two services disagree
//! forever. Instead the intents live in the data store, written in the same transaction as the
//! action record, and this processor picks them up "nearline"; as soon as possible, with retries.
//! The lease mechanism pushes the synchronization down to the datastore, so multiple instances can
//! run this loop: should one pick up an intent & die before settling it, the lease expires &
//! another instance retries. Delivery is thus at-least-once; the destination's dedup ledger makes
//! the duplicates harmless.
//!
//! Concurrency is across ordering keys only: the lease query never hands out an intent whose
//! ordering-key predecessor is still undelivered, so deltas to any one (destination, owner,
//! counter) land in creation order no matter how wide the [JoinSet] runs.
//!
//! Retries back off exponentially with full jitter (the delay is drawn uniformly from zero up to
//! the capped exponential), which spreads a thundering herd of retries after a destination outage.
//! After `max_attempts` the intent is parked as permanently failed; never silently dropped. Parked
//! intents are logged at error level, counted, and queryable through the failed-intent listing.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use pin_project::pin_project;
use rand::Rng;
use serde::Deserialize;
use snafu::{prelude::*, Backtrace, IntoError};
use tokio::{
    sync::Notify,
    task::{Id, JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, error, warn};

use crate::{
    counter_add, gauge_setu,
    entities::PropagationIntent,
    metrics::{self, Instruments, Sort},
    storage::Backend as StorageBackend,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Delivery processing failed to run to completion: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timeout shutting-down the dispatcher: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to wait for in-flight deliveries: {source}"))]
    Timeout { source: tokio::time::error::Elapsed },
    #[snafu(display("A delivery completed for an intent we weren't tracking"))]
    UnknownIntent { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          delivery seam                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// How a delivery attempt failed
///
/// The distinction drives the retry decision: a transient failure (timeout, connection refused,
/// 5xx) will be retried with backoff; a permanent one (the destination rejected the request as
/// malformed or unauthorized) parks the intent immediately, since resending the same bytes can't
/// succeed.
#[derive(Debug, Snafu)]
pub enum DeliveryError {
    #[snafu(display("Permanent delivery failure: {reason}"))]
    Permanent { reason: String },
    #[snafu(display("Transient delivery failure: {reason}"))]
    Transient { reason: String },
}

/// The seam between the dispatcher & the wire
///
/// Object-safe so the processor can be driven against a mock in tests; the production
/// implementation is [HttpDeliver].
///
/// [HttpDeliver]: crate::client::HttpDeliver
#[async_trait]
pub trait Deliver {
    async fn deliver(&self, intent: &PropagationIntent) -> std::result::Result<(), DeliveryError>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Processor                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [Processor] is the type managing the ongoing dispatch of propagation intents. It has a single
/// method, `shutdown()`, which will consume the instance & resolve to the result of the dispatch
/// loop (`Result<()>`).
// `Processor` need not be cheaply clonable; will likely be held in one place & then dropped to
// signal that it should shut down.
#[pin_project]
pub struct Processor {
    // This               👇 must match the return type of `process()`
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Consume the instance & return the result of the dispatch loop
    ///
    /// This method will signal the loop to shut down, and wait for `timeout` for it to exit.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into its parts
    ///
    /// This is convenient when waiting on the processor along with other futures (in a
    /// `tokio::select!` invocation, e.g.)
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

/// Configuration parameters for the dispatch loop
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Maximum number of intents to lease in one storage round-trip
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
    /// The maximum number of deliveries to drive concurrently
    #[serde(rename = "max-concurrent-deliveries")]
    pub max_concurrent_deliveries: usize,
    /// How long a leased intent stays invisible to other instances
    #[serde(rename = "lease-duration")]
    pub lease_duration: Duration,
    /// Bound on any single delivery attempt
    #[serde(rename = "delivery-timeout")]
    pub delivery_timeout: Duration,
    /// Amount of time to sleep when there's nothing deliverable
    #[serde(rename = "sleep-duration")]
    pub sleep_duration: Duration,
    /// Amount of time to wait for in-flight deliveries on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
    /// Maximum amount of time to drive in-flight deliveries without attempting to lease new intents
    #[serde(rename = "pickup-timeout")]
    pub pickup_timeout: Duration,
    /// First retry delay (before jitter); doubles per attempt
    #[serde(rename = "backoff-base")]
    pub backoff_base: Duration,
    /// Ceiling on the (pre-jitter) retry delay
    #[serde(rename = "backoff-cap")]
    pub backoff_cap: Duration,
    /// Park an intent as permanently failed after this many attempts
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,
    /// How long the destination-side dedup ledger must be retained; must exceed the longest
    /// plausible redelivery tail (which `max_attempts` * `backoff_cap` bounds at ~10 minutes)
    #[serde(rename = "ledger-retention")]
    pub ledger_retention: Duration,
    /// How often to prune the dedup ledger
    #[serde(rename = "prune-interval")]
    pub prune_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_concurrent_deliveries: 16,
            lease_duration: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(5),
            sleep_duration: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(500),
            pickup_timeout: Duration::from_millis(1000),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            max_attempts: 10,
            ledger_retention: Duration::from_secs(7 * 24 * 3600),
            prune_interval: Duration::from_secs(3600),
        }
    }
}

inventory::submit! { metrics::Registration::new("dispatcher.intents.delivered", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("dispatcher.intents.retried", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("dispatcher.intents.failed", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("dispatcher.ledger.pruned", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("dispatcher.intents.inflight", Sort::IntegralGauge) }

/// Full-jitter exponential backoff: uniform over [0, min(cap, base * 2^(attempts-1))]
fn backoff_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;
    let exp_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempts.saturating_sub(1).min(32)))
        .min(cap_ms);
    Duration::from_millis(rand::rng().random_range(0..=exp_ms))
}

/// Settle one delivery outcome back into storage
///
/// `outcome` is the result of the timeout-wrapped delivery future: the outer `Err` is the timeout
/// elapsing, which we treat as just another transient failure.
async fn settle(
    storage: &Arc<dyn StorageBackend + Send + Sync>,
    intent: &PropagationIntent,
    outcome: std::result::Result<
        std::result::Result<(), DeliveryError>,
        tokio::time::error::Elapsed,
    >,
    config: &Config,
    instruments: &Arc<Instruments>,
) -> Result<()> {
    match outcome {
        Ok(Ok(())) => {
            storage
                .mark_delivered(&intent.id)
                .await
                .context(StorageSnafu)?;
            debug!(
                "delivered {:+} to {} on {} ({})",
                intent.delta, intent.field, intent.destination, intent.owner
            );
            counter_add!(instruments, "dispatcher.intents.delivered", 1, &[]);
            Ok(())
        }
        Ok(Err(DeliveryError::Permanent { reason })) => {
            error!(
                "intent {} ({:+} to {} on {} for {}) failed permanently after {} attempts: {}",
                intent.id,
                intent.delta,
                intent.field,
                intent.destination,
                intent.owner,
                intent.attempts + 1,
                reason
            );
            storage.mark_failed(&intent.id).await.context(StorageSnafu)?;
            counter_add!(instruments, "dispatcher.intents.failed", 1, &[]);
            Ok(())
        }
        Ok(Err(DeliveryError::Transient { reason })) => {
            retry_or_park(storage, intent, &reason, config, instruments).await
        }
        Err(_elapsed) => {
            retry_or_park(storage, intent, "delivery timed-out", config, instruments).await
        }
    }
}

async fn retry_or_park(
    storage: &Arc<dyn StorageBackend + Send + Sync>,
    intent: &PropagationIntent,
    reason: &str,
    config: &Config,
    instruments: &Arc<Instruments>,
) -> Result<()> {
    let attempts = intent.attempts + 1;
    if attempts >= config.max_attempts {
        error!(
            "intent {} ({:+} to {} on {} for {}) exhausted its {} attempts; parking it: {}",
            intent.id,
            intent.delta,
            intent.field,
            intent.destination,
            intent.owner,
            config.max_attempts,
            reason
        );
        storage.mark_failed(&intent.id).await.context(StorageSnafu)?;
        counter_add!(instruments, "dispatcher.intents.failed", 1, &[]);
    } else {
        let delay = backoff_delay(attempts, config.backoff_base, config.backoff_cap);
        warn!(
            "intent {} attempt {}/{} failed ({}); retrying in {:?}",
            intent.id, attempts, config.max_attempts, reason, delay
        );
        storage
            .record_attempt(
                &intent.id,
                attempts,
                Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64),
            )
            .await
            .context(StorageSnafu)?;
        counter_add!(instruments, "dispatcher.intents.retried", 1, &[]);
    }
    Ok(())
}

/// Drain the outbox. `storage` holds the intents, `deliver` is the seam to the wire, `config`
/// holds configuration parameters for the algorithm. `shutdown` is a [Notify] instance the caller
/// can use to signal this function to exit.
async fn process(
    storage: Arc<dyn StorageBackend + Send + Sync>,
    deliver: Arc<dyn Deliver + Send + Sync>,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    // The basic outline of this logic is to maintain a `JoinSet` of in-flight deliveries,
    let mut inflight: HashMap<Id, PropagationIntent> = HashMap::new();
    let mut futures = JoinSet::new();
    let mut last_prune = std::time::Instant::now();
    // The overall structure here is an infinite loop; so long as...
    let mut done = false;
    // `done` is not true, loop:
    while !done {
        // so long as we don't have too much on our plate, try 'n lease more intents:
        if futures.len() < config.max_concurrent_deliveries {
            let room = (config.max_concurrent_deliveries - futures.len()).min(config.batch_size);
            let lease = chrono::Duration::milliseconds(config.lease_duration.as_millis() as i64);
            for intent in storage
                .lease_intents(room, lease)
                .await
                .context(StorageSnafu)?
            {
                let deliver = deliver.clone();
                let task_intent = intent.clone();
                let id = futures
                    .spawn(tokio::time::timeout(config.delivery_timeout, async move {
                        deliver.deliver(&task_intent).await
                    }))
                    .id();
                inflight.insert(id, intent);
            }
        }

        gauge_setu!(
            instruments,
            "dispatcher.intents.inflight",
            futures.len() as u64,
            &[]
        );

        if !futures.is_empty() {
            // We've got at least one delivery; drive 'em all forward, while waiting on our
            // shutdown notification:
            tokio::select! {
                result = futures.join_next_with_id() => {
                    match result {
                        Some(Ok((id, outcome))) => {
                            let intent = inflight.remove(&id).context(UnknownIntentSnafu)?;
                            settle(&storage, &intent, outcome, &config, &instruments).await?;
                        },
                        Some(Err(err)) => {
                            return Err(JoinSnafu.into_error(err));
                        },
                        None => unimplemented!(), // Precluded by `.is_empty()`, above.
                    }
                },
                // If `futures` has a single delivery, and that delivery is long-running, we can
                // get "stuck" in this `select!`, driving it forward while deliverable intents
                // pile-up. By stopping periodically, we can lease new ones.
                _ = tokio::time::sleep(config.pickup_timeout) => (),
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        } else {
            // Nothing deliverable; hang out a bit before trying the lease again, while remaining
            // mindful of our shutdown notification:
            tokio::select! {
                _ = tokio::time::sleep(config.sleep_duration) => (), // Loop around & try again
                _ = shutdown.notified() => {
                    done = true;
                }
            }
        }

        if last_prune.elapsed() >= config.prune_interval {
            let cutoff = Utc::now()
                - chrono::Duration::milliseconds(config.ledger_retention.as_millis() as i64);
            let pruned = storage
                .prune_dedup_ledger(cutoff)
                .await
                .context(StorageSnafu)?;
            if pruned > 0 {
                debug!("pruned {} dedup ledger entries", pruned);
                counter_add!(instruments, "dispatcher.ledger.pruned", pruned as u64, &[]);
            }
            last_prune = std::time::Instant::now();
        }
    } // End dispatch loop.

    // Give any in-flight deliveries a chance to complete & be settled; anything still unsettled
    // when the timeout elapses will be re-leased (after lease expiry) by the next run.
    tokio::time::timeout(config.shutdown_timeout, async {
        while let Some(Ok((id, outcome))) = futures.join_next_with_id().await {
            if let Some(intent) = inflight.remove(&id) {
                settle(&storage, &intent, outcome, &config, &instruments).await?;
            }
        }
        Ok(())
    })
    .await
    .context(TimeoutSnafu)?
}

/// Create a new [Processor] given a storage backend & a [Deliver] implementation.
pub fn new(
    storage: Arc<dyn StorageBackend + Send + Sync>,
    deliver: Arc<dyn Deliver + Send + Sync>,
    config: Option<Config>,
    instruments: Arc<Instruments>,
) -> Processor {
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(
        storage,
        deliver,
        config.unwrap_or_default(),
        shutdown.clone(),
        instruments,
    ));
    Processor {
        processor,
        shutdown,
    }
}

// Pressure-test the loop against the in-memory backend & a scriptable Deliver implementation.
#[cfg(test)]
mod test {

    use std::sync::Mutex;

    use super::*;

    use crate::{
        entities::{
            ActionPayload, ActionRecord, ContentId, CounterField, DeliveryState, DestinationName,
            IntentId, OwnerKey, OwnerKind, UserId,
        },
        memory::InMemory,
        storage::Backend,
    };

    /// Fails the first `failures` attempts per intent with the scripted error, then succeeds
    struct Flaky {
        failures: usize,
        permanent: bool,
        attempts: Mutex<HashMap<IntentId, usize>>,
        delivered: Mutex<Vec<IntentId>>,
    }

    impl Flaky {
        fn new(failures: usize, permanent: bool) -> Flaky {
            Flaky {
                failures,
                permanent,
                attempts: Mutex::new(HashMap::new()),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Deliver for Flaky {
        async fn deliver(
            &self,
            intent: &PropagationIntent,
        ) -> std::result::Result<(), DeliveryError> {
            let mut attempts = self.attempts.lock().unwrap();
            let seen = attempts.entry(intent.id).or_insert(0);
            *seen += 1;
            if *seen <= self.failures {
                if self.permanent {
                    Err(DeliveryError::Permanent {
                        reason: "scripted".to_owned(),
                    })
                } else {
                    Err(DeliveryError::Transient {
                        reason: "scripted".to_owned(),
                    })
                }
            } else {
                self.delivered.lock().unwrap().push(intent.id);
                Ok(())
            }
        }
    }

    fn fast_config() -> Config {
        Config {
            sleep_duration: Duration::from_millis(10),
            pickup_timeout: Duration::from_millis(10),
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(10),
            shutdown_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    async fn seed_intent(backend: &InMemory) -> PropagationIntent {
        let record = ActionRecord::new(
            UserId::new(),
            ContentId::new(),
            ActionPayload::Bookmark { note: None },
        );
        let intent = PropagationIntent::new(
            &record.id,
            DestinationName::new("content-service"),
            OwnerKey::content(&record.target),
            CounterField::for_owner(OwnerKind::Content, "bookmarksCount").unwrap(),
            1,
            0,
        );
        backend.insert_action(&record, &[intent.clone()]).await.unwrap();
        intent
    }

    #[tokio::test]
    async fn happy_path_settles_as_delivered() {
        let backend = Arc::new(InMemory::new());
        let deliver = Arc::new(Flaky::new(0, false));
        let intent = seed_intent(&backend).await;

        let processor = new(
            backend.clone(),
            deliver.clone(),
            Some(fast_config()),
            Arc::new(Instruments::new("readmark-test")),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(*deliver.delivered.lock().unwrap(), vec![intent.id]);
        assert!(backend.failed_intents().await.unwrap().is_empty());
        // Delivered intents never come up for lease again.
        assert!(backend
            .lease_intents(16, chrono::Duration::seconds(30))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = Arc::new(InMemory::new());
        let deliver = Arc::new(Flaky::new(3, false));
        let intent = seed_intent(&backend).await;

        let processor = new(
            backend.clone(),
            deliver.clone(),
            Some(fast_config()),
            Arc::new(Instruments::new("readmark-test")),
        );
        // Three scripted failures at ≤10ms backoff; give it ample time to work through them.
        tokio::time::sleep(Duration::from_secs(1)).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(*deliver.delivered.lock().unwrap(), vec![intent.id]);
        assert_eq!(*deliver.attempts.lock().unwrap().get(&intent.id).unwrap(), 4);
    }

    #[tokio::test]
    async fn permanent_failures_are_parked_immediately() {
        let backend = Arc::new(InMemory::new());
        let deliver = Arc::new(Flaky::new(usize::MAX, true));
        let intent = seed_intent(&backend).await;

        let processor = new(
            backend.clone(),
            deliver.clone(),
            Some(fast_config()),
            Arc::new(Instruments::new("readmark-test")),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();

        let failed = backend.failed_intents().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, intent.id);
        assert_eq!(failed[0].state, DeliveryState::FailedPermanently);
        // one attempt; no retries against a permanent failure
        assert_eq!(*deliver.attempts.lock().unwrap().get(&intent.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn retries_exhaust_into_permanent_failure() {
        let backend = Arc::new(InMemory::new());
        let deliver = Arc::new(Flaky::new(usize::MAX, false));
        let intent = seed_intent(&backend).await;

        let processor = new(
            backend.clone(),
            deliver.clone(),
            Some(Config {
                max_attempts: 2,
                ..fast_config()
            }),
            Arc::new(Instruments::new("readmark-test")),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();

        let failed = backend.failed_intents().await.unwrap();
        assert_eq!(failed.iter().map(|i| i.id).collect::<Vec<_>>(), vec![intent.id]);
        assert_eq!(*deliver.attempts.lock().unwrap().get(&intent.id).unwrap(), 2);
    }

    #[test]
    fn backoff_is_capped_and_jittered() {
        for attempts in 1..=20 {
            let delay = backoff_delay(
                attempts,
                Duration::from_secs(1),
                Duration::from_secs(60),
            );
            assert!(delay <= Duration::from_secs(60));
        }
        // attempt 1 draws from [0, base]
        let delay = backoff_delay(1, Duration::from_secs(1), Duration::from_secs(60));
        assert!(delay <= Duration::from_secs(1));
    }
}
