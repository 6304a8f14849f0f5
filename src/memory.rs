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

//! # memory
//!
//! In-memory [storage] implementation, for tests & single-node development.
//!
//! [storage]: crate::storage
//!
//! All tables live behind a single [Mutex], which trivially gives us the "same transactional
//! resource" guarantee the storage contract demands: every trait method takes the lock once, does
//! all of its writes, and releases it. Never hold the guard across an await point (there are
//! none).

use std::{
    collections::HashMap,
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use uuid::Uuid;

use crate::{
    entities::{
        ActionKind, ActionRecord, ContentId, CounterField, DeliveryState, IdempotencyToken,
        IntentId, OwnerKey, PropagationIntent, UserId,
    },
    storage::{Backend, Error, InsertOutcome},
};

/// A stored intent, plus book-keeping that isn't part of the entity proper
#[derive(Clone, Debug)]
struct StoredIntent {
    intent: PropagationIntent,
    lease_expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Tables {
    /// (actor, target, kind) → record; the map key *is* the uniqueness invariant
    actions: HashMap<(Uuid, Uuid, ActionKind), ActionRecord>,
    intents: HashMap<IntentId, StoredIntent>,
    /// (owner, counter name) → raw sum (visible value is this, floored at zero)
    counters: HashMap<(OwnerKey, String), i64>,
    /// token → when it was applied
    ledger: HashMap<Uuid, DateTime<Utc>>,
}

/// In-memory storage backend
#[derive(Debug, Default)]
pub struct InMemory {
    tables: Mutex<Tables>,
}

impl InMemory {
    pub fn new() -> InMemory {
        InMemory::default()
    }
    fn key(actor: &UserId, target: &ContentId, kind: ActionKind) -> (Uuid, Uuid, ActionKind) {
        (*actor.as_uuid(), *target.as_uuid(), kind)
    }
}

#[async_trait]
impl Backend for InMemory {
    async fn insert_action(
        &self,
        record: &ActionRecord,
        intents: &[PropagationIntent],
    ) -> Result<InsertOutcome, Error> {
        let mut tables = self.tables.lock().unwrap();
        let key = Self::key(&record.actor, &record.target, record.kind());
        if let Some(existing) = tables.actions.get(&key) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        tables.actions.insert(key, record.clone());
        for intent in intents {
            tables.intents.insert(
                intent.id,
                StoredIntent {
                    intent: intent.clone(),
                    lease_expires: None,
                },
            );
        }
        Ok(InsertOutcome::Created(record.clone()))
    }

    async fn update_action(
        &self,
        record: &ActionRecord,
        intents: &[PropagationIntent],
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap();
        let key = Self::key(&record.actor, &record.target, record.kind());
        tables.actions.insert(key, record.clone());
        for intent in intents {
            tables.intents.insert(
                intent.id,
                StoredIntent {
                    intent: intent.clone(),
                    lease_expires: None,
                },
            );
        }
        Ok(())
    }

    async fn remove_action(
        &self,
        record: &ActionRecord,
        intents: &[PropagationIntent],
    ) -> Result<bool, Error> {
        let mut tables = self.tables.lock().unwrap();
        let key = Self::key(&record.actor, &record.target, record.kind());
        if tables.actions.remove(&key).is_none() {
            return Ok(false);
        }
        for intent in intents {
            tables.intents.insert(
                intent.id,
                StoredIntent {
                    intent: intent.clone(),
                    lease_expires: None,
                },
            );
        }
        Ok(true)
    }

    async fn get_action(
        &self,
        actor: &UserId,
        target: &ContentId,
        kind: ActionKind,
    ) -> Result<Option<ActionRecord>, Error> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.actions.get(&Self::key(actor, target, kind)).cloned())
    }

    async fn actions_for_actor(
        &self,
        actor: &UserId,
        kind: ActionKind,
    ) -> Result<Vec<ActionRecord>, Error> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .actions
            .values()
            .filter(|record| record.actor == *actor && record.kind() == kind)
            .cloned()
            .sorted_by_key(|record| (record.created, record.id))
            .collect())
    }

    async fn lease_intents(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<PropagationIntent>, Error> {
        let now = Utc::now();
        let mut tables = self.tables.lock().unwrap();
        // Head of each (destination, owner, counter) line, over *all* pending intents: a due
        // intent behind an undue or leased sibling must wait its turn.
        let heads: HashMap<_, IntentId> = tables
            .intents
            .values()
            .filter(|stored| stored.intent.state == DeliveryState::Pending)
            .sorted_by_key(|stored| (stored.intent.created, stored.intent.id))
            .map(|stored| (stored.intent.ordering_key(), stored.intent.id))
            // `unique_by` keeps the first (i.e. oldest) entry per key
            .unique_by(|(key, _)| key.clone())
            .collect();
        let chosen = tables
            .intents
            .values()
            .filter(|stored| {
                stored.intent.state == DeliveryState::Pending
                    && stored.intent.next_attempt <= now
                    && stored.lease_expires.map(|dt| dt <= now).unwrap_or(true)
                    && heads.get(&stored.intent.ordering_key()) == Some(&stored.intent.id)
            })
            .map(|stored| stored.intent.clone())
            .sorted_by_key(|intent| (intent.created, intent.id))
            .take(limit)
            .collect::<Vec<_>>();
        for intent in &chosen {
            if let Some(stored) = tables.intents.get_mut(&intent.id) {
                stored.lease_expires = Some(now + lease);
            }
        }
        Ok(chosen)
    }

    async fn mark_delivered(&self, id: &IntentId) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(stored) = tables.intents.get_mut(id) {
            stored.intent.state = DeliveryState::Delivered;
            stored.lease_expires = None;
        }
        Ok(())
    }

    async fn record_attempt(
        &self,
        id: &IntentId,
        attempts: u32,
        next_attempt: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(stored) = tables.intents.get_mut(id) {
            stored.intent.attempts = attempts;
            stored.intent.next_attempt = next_attempt;
            stored.lease_expires = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &IntentId) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(stored) = tables.intents.get_mut(id) {
            stored.intent.state = DeliveryState::FailedPermanently;
            stored.lease_expires = None;
        }
        Ok(())
    }

    async fn failed_intents(&self) -> Result<Vec<PropagationIntent>, Error> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .intents
            .values()
            .filter(|stored| stored.intent.state == DeliveryState::FailedPermanently)
            .map(|stored| stored.intent.clone())
            .sorted_by_key(|intent| (intent.created, intent.id))
            .collect())
    }

    async fn apply_delta(
        &self,
        owner: &OwnerKey,
        field: &CounterField,
        delta: i64,
        token: &IdempotencyToken,
    ) -> Result<i64, Error> {
        let mut tables = self.tables.lock().unwrap();
        let key = (*owner, field.as_str().to_owned());
        if tables.ledger.contains_key(token.as_uuid()) {
            let raw = tables.counters.get(&key).copied().unwrap_or(0);
            return Ok(raw.max(0));
        }
        let raw = tables.counters.entry(key).or_insert(0);
        *raw += delta;
        let visible = (*raw).max(0);
        tables.ledger.insert(*token.as_uuid(), Utc::now());
        Ok(visible)
    }

    async fn counters_for(&self, owner: &OwnerKey) -> Result<HashMap<String, i64>, Error> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .counters
            .iter()
            .filter(|((key, _), _)| key == owner)
            .map(|((_, field), raw)| (field.clone(), (*raw).max(0)))
            .collect())
    }

    async fn prune_dedup_ledger(&self, older_than: DateTime<Utc>) -> Result<usize, Error> {
        let mut tables = self.tables.lock().unwrap();
        let before = tables.ledger.len();
        tables.ledger.retain(|_, applied| *applied >= older_than);
        Ok(before - tables.ledger.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::entities::{ActionPayload, DestinationName, OwnerKind};

    fn bookmark_intents(record: &ActionRecord) -> Vec<PropagationIntent> {
        vec![
            PropagationIntent::new(
                &record.id,
                DestinationName::new("content-service"),
                OwnerKey::content(&record.target),
                CounterField::for_owner(OwnerKind::Content, "bookmarksCount").unwrap(),
                1,
                0,
            ),
            PropagationIntent::new(
                &record.id,
                DestinationName::new("user-service"),
                OwnerKey::profile(&record.actor),
                CounterField::for_owner(OwnerKind::Profile, "bookmarkedCount").unwrap(),
                1,
                0,
            ),
        ]
    }

    #[tokio::test]
    async fn duplicate_inserts_are_noops() {
        let backend = InMemory::new();
        let record = ActionRecord::new(
            UserId::new(),
            ContentId::new(),
            ActionPayload::Bookmark { note: None },
        );
        let intents = bookmark_intents(&record);
        assert_eq!(
            backend.insert_action(&record, &intents).await.unwrap(),
            InsertOutcome::Created(record.clone())
        );
        // A second, identical action: the existing record comes back & no new intents appear.
        let dup = ActionRecord::new(record.actor, record.target, record.payload.clone());
        let dup_intents = bookmark_intents(&dup);
        assert_eq!(
            backend.insert_action(&dup, &dup_intents).await.unwrap(),
            InsertOutcome::AlreadyExists(record.clone())
        );
        let leased = backend
            .lease_intents(16, Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(leased.len(), 2);
    }

    #[tokio::test]
    async fn leases_respect_ordering_keys() {
        let backend = InMemory::new();
        let actor = UserId::new();
        let target = ContentId::new();
        let record = ActionRecord::new(actor, target, ActionPayload::Bookmark { note: None });
        let dest = DestinationName::new("content-service");
        let field = CounterField::for_owner(OwnerKind::Content, "bookmarksCount").unwrap();
        // Two intents on the same ordering key; only the older may be leased.
        let first = PropagationIntent::new(&record.id, dest.clone(), OwnerKey::content(&target), field.clone(), 1, 0);
        let mut second =
            PropagationIntent::new(&record.id, dest, OwnerKey::content(&target), field, -1, 1);
        second.created = first.created + Duration::milliseconds(1);
        backend
            .insert_action(&record, &[first.clone(), second.clone()])
            .await
            .unwrap();

        let leased = backend
            .lease_intents(16, Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(leased.iter().map(|i| i.id).collect::<Vec<_>>(), vec![first.id]);
        // While the head is leased, nothing on that key is deliverable...
        assert!(backend
            .lease_intents(16, Duration::seconds(30))
            .await
            .unwrap()
            .is_empty());
        // ...and once it's delivered, the next in line comes up.
        backend.mark_delivered(&first.id).await.unwrap();
        let leased = backend
            .lease_intents(16, Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(leased.iter().map(|i| i.id).collect::<Vec<_>>(), vec![second.id]);
    }

    #[tokio::test]
    async fn deltas_are_idempotent_and_clamped() {
        let backend = InMemory::new();
        let owner = OwnerKey::content(&ContentId::new());
        let field = CounterField::for_owner(OwnerKind::Content, "downloadsCount").unwrap();
        let action = crate::entities::ActionId::new();
        let dest = DestinationName::new("content-service");
        let inc = IdempotencyToken::derive(&action, &dest, &field, 0);
        let dec = IdempotencyToken::derive(&action, &dest, &field, 1);

        assert_eq!(backend.apply_delta(&owner, &field, 1, &inc).await.unwrap(), 1);
        // replay: no change
        assert_eq!(backend.apply_delta(&owner, &field, 1, &inc).await.unwrap(), 1);
        // compensate under a distinct token: back to zero
        assert_eq!(backend.apply_delta(&owner, &field, -1, &dec).await.unwrap(), 0);

        // Out-of-order compensation drives the raw sum negative; the visible value clamps.
        let other = crate::entities::ActionId::new();
        let dec2 = IdempotencyToken::derive(&other, &dest, &field, 1);
        assert_eq!(backend.apply_delta(&owner, &field, -1, &dec2).await.unwrap(), 0);
        // ...but the raw sum is preserved: the late-arriving increment reconciles to zero, not one.
        let inc2 = IdempotencyToken::derive(&other, &dest, &field, 0);
        assert_eq!(backend.apply_delta(&owner, &field, 1, &inc2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ledger_pruning_is_bounded() {
        let backend = InMemory::new();
        let owner = OwnerKey::profile(&UserId::new());
        let field = CounterField::for_owner(OwnerKind::Profile, "wordsLearned").unwrap();
        let action = crate::entities::ActionId::new();
        let token =
            IdempotencyToken::derive(&action, &DestinationName::new("user-service"), &field, 42);
        backend.apply_delta(&owner, &field, 42, &token).await.unwrap();
        assert_eq!(
            backend
                .prune_dedup_ledger(Utc::now() - Duration::days(7))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            backend
                .prune_dedup_ledger(Utc::now() + Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
    }
}
