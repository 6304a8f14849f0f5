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

//! # storage
//!
//! Abstractions for the readmark storage layer.
//!
//! The action record store and the propagation intent store are *one* transactional resource:
//! [Backend::insert_action] and [Backend::remove_action] commit the record and its intents
//! together, so a record can never exist without its obligations (nor obligations without their
//! record). The dedup ledger & counter set live behind [Backend::apply_delta] on the receiving
//! side; no cross-service transaction exists anywhere — consistency across services comes from
//! retry plus idempotency, nothing else.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::entities::{
    ActionKind, ActionRecord, ContentId, CounterField, IdempotencyToken, IntentId, OwnerKey,
    PropagationIntent, UserId,
};

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

/// Outcome of an attempted action insert
///
/// A second identical (actor, target, kind) insert is *not* an error: the caller gets the record
/// that already exists, and no new intents are created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    Created(ActionRecord),
    AlreadyExists(ActionRecord),
}

impl InsertOutcome {
    pub fn into_record(self) -> ActionRecord {
        match self {
            InsertOutcome::Created(record) => record,
            InsertOutcome::AlreadyExists(record) => record,
        }
    }
}

#[async_trait]
pub trait Backend {
    /// Insert an Action Record along with its Propagation Intents, atomically, under the
    /// (actor, target, kind) uniqueness invariant. If a record already exists, return it & write
    /// nothing.
    async fn insert_action(
        &self,
        record: &ActionRecord,
        intents: &[PropagationIntent],
    ) -> Result<InsertOutcome, Error>;
    /// Replace an existing Action Record's payload & enqueue further intents, atomically. Used by
    /// progress upserts, which accrue onto a single record rather than inserting new ones.
    async fn update_action(
        &self,
        record: &ActionRecord,
        intents: &[PropagationIntent],
    ) -> Result<(), Error>;
    /// Delete an Action Record & enqueue its compensating intents, atomically. Returns false if
    /// the record was gone by the time the delete ran (in which case no intents are written).
    async fn remove_action(
        &self,
        record: &ActionRecord,
        intents: &[PropagationIntent],
    ) -> Result<bool, Error>;
    /// Retrieve an Action Record by its uniqueness key. None means no such record.
    async fn get_action(
        &self,
        actor: &UserId,
        target: &ContentId,
        kind: ActionKind,
    ) -> Result<Option<ActionRecord>, Error>;
    /// Retrieve all of an actor's Action Records of the given kind (bookmark listings & the like)
    async fn actions_for_actor(
        &self,
        actor: &UserId,
        kind: ActionKind,
    ) -> Result<Vec<ActionRecord>, Error>;
    /// Lease up to `limit` deliverable intents: pending, due (`next_attempt` in the past), not
    /// currently leased, and at the head of their (destination, owner, counter) line — an intent
    /// with an older undelivered sibling on the same ordering key is held back so that deltas
    /// land in creation order. Leased intents won't be handed out again until `lease` elapses.
    async fn lease_intents(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<PropagationIntent>, Error>;
    /// The destination confirmed application; the obligation is discharged.
    async fn mark_delivered(&self, id: &IntentId) -> Result<(), Error>;
    /// A delivery attempt failed; bump the attempt count & schedule the retry.
    async fn record_attempt(
        &self,
        id: &IntentId,
        attempts: u32,
        next_attempt: DateTime<Utc>,
    ) -> Result<(), Error>;
    /// Retries exhausted; park the intent for operator attention.
    async fn mark_failed(&self, id: &IntentId) -> Result<(), Error>;
    /// All permanently failed intents, oldest first.
    async fn failed_intents(&self) -> Result<Vec<PropagationIntent>, Error>;
    /// Apply a delta to an aggregate counter, idempotently: if `token` is already in the dedup
    /// ledger this is a no-op. Either way, return the current *visible* value (the raw sum
    /// floored at zero).
    async fn apply_delta(
        &self,
        owner: &OwnerKey,
        field: &CounterField,
        delta: i64,
        token: &IdempotencyToken,
    ) -> Result<i64, Error>;
    /// Visible counter values for an owner; absent counters read as zero & are omitted.
    async fn counters_for(&self, owner: &OwnerKey) -> Result<HashMap<String, i64>, Error>;
    /// Drop dedup ledger entries recorded before `older_than`; returns the number pruned. The
    /// retention window bounds the ledger's size; it need only exceed the longest plausible
    /// redelivery tail.
    async fn prune_dedup_ledger(&self, older_than: DateTime<Utc>) -> Result<usize, Error>;
}
