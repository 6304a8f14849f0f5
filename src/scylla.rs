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

//! # scylla
//!
//! [Storage] implementation for ScyllaDB.
//!
//! [Storage]: crate::storage
//!
//! Expected schema, in the `readmark` keyspace:
//!
//! ```cql
//! create table actions (
//!     actor uuid, target uuid, kind text,
//!     id uuid, payload text, created timestamp,
//!     primary key ((actor, target, kind)));
//! create index actions_by_id on actions (id);
//! create table intents (
//!     destination text, owner_kind text, owner uuid, field text,
//!     created timestamp, id uuid,
//!     action uuid, delta bigint, token uuid, state text,
//!     attempts int, next_attempt timestamp, lease_expires timestamp,
//!     primary key ((destination, owner_kind, owner, field), created, id));
//! create table intents_by_id (
//!     id uuid primary key,
//!     destination text, owner_kind text, owner uuid, field text, created timestamp);
//! create table counters (
//!     owner_kind text, owner uuid, field text, token uuid,
//!     value bigint, recorded timestamp,
//!     primary key ((owner_kind, owner, field), token));
//! ```
//!
//! The `intents` partition key *is* the ordering key, with `(created, id)` clustering, so a
//! partition reads back in creation order for free. `intents_by_id` is the reverse index the
//! settle path needs (it only has the [IntentId] in hand).
//!
//! The `counters` table holds, per (owner, field) partition, one "value row" (token = the nil
//! UUID) carrying the raw sum, plus one row per applied idempotency token; the token rows are the
//! dedup ledger, aged out by TTL rather than an explicit prune. Applying a delta is a conditional
//! batch over that single partition (token insert `IF NOT EXISTS` + a compare-and-swap on the
//! value row), which is what makes "dedup ledger & counter move together" hold here without
//! cross-table transactions.
//!
//! Actions & their intents live in different partitions, so the two can't commit in one LWT. The
//! write ordering is therefore intents first, action second: a crash in between can strand intent
//! rows, but never an action without the deltas it owes. Stranded increments are fenced at lease
//! time (the `actions_by_id` index answers "did the owning action ever commit?"; if it didn't,
//! the intent is parked rather than delivered), while compensating decrements need no fence-- the
//! action they follow was deleted on purpose.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use enum_map::{Enum, EnumMap};
use futures::stream;
use itertools::Itertools;
use scylla::{
    batch::Batch, frame::response::result::CqlValue, frame::response::result::Row,
    prepared_statement::PreparedStatement, QueryResult, SessionBuilder,
};
use secrecy::{ExposeSecret, SecretString};
use snafu::{Backtrace, ResultExt, Snafu};
use tap::Pipe;
use tracing::warn;
use uuid::Uuid;

use crate::{
    entities::{
        ActionId, ActionKind, ActionPayload, ActionRecord, ContentId, CounterField,
        DeliveryState, DestinationName, IdempotencyToken, IntentId, OwnerKey, OwnerKind,
        PropagationIntent, UserId,
    },
    storage,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "The number of prepared statements isn't consistent; this is a bug & should be reported!"
    ))]
    BadPreparedStatementCount { backtrace: Backtrace },
    #[snafu(display("{text} is not a recognized delivery state"))]
    BadState { text: String, backtrace: Backtrace },
    #[snafu(display("A conditional statement returned no [applied] column"))]
    NoAppliedColumn { backtrace: Backtrace },
    #[snafu(display(
        "Gave up applying a counter delta after {attempts} compare-and-swap rounds"
    ))]
    CounterContention { attempts: u32, backtrace: Backtrace },
    #[snafu(display("The intent {id} has no routing entry"))]
    NoRouting { id: IntentId, backtrace: Backtrace },
    #[snafu(display("An action vanished between a failed insert & the read-back"))]
    ActionVanished { backtrace: Backtrace },
    #[snafu(display("Failed to set keyspace: {source}"))]
    Keyspace {
        source: scylla::transport::errors::QueryError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create a ScyllaDB session: {source}"))]
    NewSession {
        source: scylla::transport::errors::NewSessionError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to prepare statement: {stmt}: {source}"))]
    Prepare {
        stmt: String,
        source: scylla::transport::errors::QueryError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                 readmark ScyllaDB session type                                 //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The set of prepared statements used by readmark
///
/// This enum is used as both a mnemonic tag identifying prepared statements and as the key type
/// in a mapping from said tags to the actual [PreparedStatement]s. The [Enum] interface is
/// defined in the [enum_map] crate; it will require us to provide a slice of [PreparedStatement]
/// of length exactly equal to the number of variants in this enumeration.
#[derive(Clone, Debug, Enum, Eq, PartialEq)]
enum PreparedStatements {
    InsertAction,
    UpsertAction,
    SelectAction,
    SelectActionsForActor,
    SelectActionById,
    DeleteAction,
    InsertIntent,
    InsertIntentById,
    SelectPendingIntents,
    SelectFailedIntents,
    SelectIntentRouting,
    LeaseIntent,
    DeleteIntent,
    DeleteIntentById,
    RecordAttempt,
    MarkFailed,
    SelectCounterCell,
    InsertTokenRow,
    InsertValueRow,
    CasUpdateValue,
    SelectCountersForOwner,
}

/// `readmark`-specific ScyllaDB Session type
///
/// Instantiate this via [Session::new] with connection info & credentials if need be; when
/// dropped the ScyllaDB session will be terminated.
pub struct Session {
    session: ::scylla::Session,
    /// An [EnumMap] is a map whose keys are enum values where all values are guaranteed to be
    /// represented. As a result, the index operator is guaranteed to succeed-- no need to unwrap
    /// [Option]s or [Result]s or some such.
    prepared_statements: EnumMap<PreparedStatements, PreparedStatement>,
    /// TTL applied to dedup ledger rows, in seconds
    ledger_ttl: i32,
}

/// Token identifying the value row within a counter partition
const VALUE_ROW: Uuid = Uuid::nil();

/// Rounds of compare-and-swap to attempt before conceding a counter partition to contention
const MAX_CAS_ROUNDS: u32 = 16;

impl Session {
    /// Prepare a statement
    async fn prepare(scylla: &::scylla::Session, stmt: &str) -> Result<PreparedStatement> {
        scylla.prepare(stmt).await.context(PrepareSnafu {
            stmt: stmt.to_owned(),
        })
    }

    /// [Session] constructor
    ///
    /// Construct with a collection of ScyllaDB hosts. The `Item`s are regrettably typed as
    /// `&str`, but they need to be parsable as `IpAddress`es. `credentials`, if non-None, should
    /// be a pair of strings consisting of the username & password. `ledger_ttl` is how long
    /// applied idempotency tokens are retained.
    pub async fn new(
        hosts: impl IntoIterator<Item = impl AsRef<str>>,
        credentials: &Option<(SecretString, SecretString)>,
        ledger_ttl: std::time::Duration,
    ) -> Result<Session> {
        let mut builder = SessionBuilder::new().known_nodes(hosts);
        if let Some((user, pass)) = credentials {
            builder = builder.user(user.expose_secret(), pass.expose_secret())
        }
        let scylla = builder.build().await.context(NewSessionSnafu)?;
        scylla
            .use_keyspace("readmark", false)
            .await
            .context(KeyspaceSnafu)?;

        use futures::stream::StreamExt;
        let prepared_statements = stream::iter(vec![
            // Ho-kay: here's the deal. We list here all the prepared statements we want to use, in
            // the same order as [PreparedStatements].
            "insert into actions (actor,target,kind,id,payload,created) values (?,?,?,?,?,?) if not exists",
            "insert into actions (actor,target,kind,id,payload,created) values (?,?,?,?,?,?)",
            "select id,payload,created from actions where actor=? and target=? and kind=?",
            "select target,id,payload,created from actions where actor=? and kind=? allow filtering",
            "select id from actions where id=?",
            "delete from actions where actor=? and target=? and kind=? if exists",
            "insert into intents (destination,owner_kind,owner,field,created,id,action,delta,token,state,attempts,next_attempt) values (?,?,?,?,?,?,?,?,?,?,?,?)",
            "insert into intents_by_id (id,destination,owner_kind,owner,field,created) values (?,?,?,?,?,?)",
            "select destination,owner_kind,owner,field,created,id,action,delta,token,state,attempts,next_attempt,lease_expires from intents where state='pending' allow filtering",
            "select destination,owner_kind,owner,field,created,id,action,delta,token,state,attempts,next_attempt,lease_expires from intents where state='failed' allow filtering",
            "select destination,owner_kind,owner,field,created from intents_by_id where id=?",
            "update intents set lease_expires=? where destination=? and owner_kind=? and owner=? and field=? and created=? and id=? if lease_expires=?",
            "delete from intents where destination=? and owner_kind=? and owner=? and field=? and created=? and id=?",
            "delete from intents_by_id where id=?",
            "update intents set attempts=?, next_attempt=?, lease_expires=null where destination=? and owner_kind=? and owner=? and field=? and created=? and id=?",
            "update intents set state='failed', lease_expires=null where destination=? and owner_kind=? and owner=? and field=? and created=? and id=?",
            "select token,value from counters where owner_kind=? and owner=? and field=? and token=?",
            "insert into counters (owner_kind,owner,field,token,recorded) values (?,?,?,?,?) if not exists using ttl ?",
            "insert into counters (owner_kind,owner,field,token,value) values (?,?,?,?,?) if not exists",
            "update counters set value=? where owner_kind=? and owner=? and field=? and token=? if value=?",
            "select field,value from counters where owner_kind=? and owner=? and token=? allow filtering",
        ])
            // Then (see what I did there?), we actually prepare them with the Scylla database to
            // get futures yielding `Result<PreparedStatement>`...
            .then(|s| async { Self::prepare(&scylla, s).await })
            // which we collect into a single `Future`...
            .collect::<Vec<_>>()
            // and then resolve to a `Vec<Result<PreparedStatement>>`...
            .await
            // and then move into an iterator...
            .into_iter()
            // and, finally, collect into a `Result<Vec<PreparedStatement>>:`
            .collect::<Result<Vec<PreparedStatement>>>()?;
        // Now: in order to create an `EnumMap`, we need a slice of `PreparedStatement` of
        // *precisely the right length*, and in the right order. We can't test for the latter, but
        // we can for the former.
        let prepared_statements: [PreparedStatement; 21] = prepared_statements
            .try_into()
            .map_err(|_| BadPreparedStatementCountSnafu.build())?;

        Ok(Session {
            session: scylla,
            prepared_statements: EnumMap::from_array(prepared_statements),
            ledger_ttl: ledger_ttl.as_secs().min(i32::MAX as u64) as i32,
        })
    }
}

use storage::Error as StorError;

// Use these if you don't want to add any context to a failed query.
impl std::convert::From<scylla::transport::errors::QueryError> for StorError {
    fn from(value: scylla::transport::errors::QueryError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::transport::query_result::IntoRowsResultError> for StorError {
    fn from(value: scylla::transport::query_result::IntoRowsResultError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::transport::query_result::RowsError> for StorError {
    fn from(value: scylla::transport::query_result::RowsError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::deserialize::DeserializationError> for StorError {
    fn from(value: scylla::deserialize::DeserializationError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::transport::query_result::FirstRowError> for StorError {
    fn from(value: scylla::transport::query_result::FirstRowError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::transport::query_result::MaybeFirstRowError> for StorError {
    fn from(value: scylla::transport::query_result::MaybeFirstRowError) -> Self {
        StorError::new(value)
    }
}

fn state_to_str(state: DeliveryState) -> &'static str {
    match state {
        DeliveryState::Pending => "pending",
        DeliveryState::Delivered => "delivered",
        DeliveryState::FailedPermanently => "failed",
    }
}

fn state_from_str(text: &str) -> Result<DeliveryState> {
    match text {
        "pending" => Ok(DeliveryState::Pending),
        "delivered" => Ok(DeliveryState::Delivered),
        "failed" => Ok(DeliveryState::FailedPermanently),
        text => BadStateSnafu { text }.fail(),
    }
}

/// Row shape shared by the pending & failed intent selects
type IntentRow = (
    String,                // destination
    String,                // owner_kind
    Uuid,                  // owner
    String,                // field
    DateTime<Utc>,         // created
    Uuid,                  // id
    Uuid,                  // action
    i64,                   // delta
    Uuid,                  // token
    String,                // state
    i32,                   // attempts
    DateTime<Utc>,         // next_attempt
    Option<DateTime<Utc>>, // lease_expires
);

fn intent_from_row(row: &IntentRow) -> StdResult<PropagationIntent, StorError> {
    let kind = row.1.parse::<OwnerKind>().map_err(StorError::new)?;
    Ok(PropagationIntent {
        id: row.5.into(),
        action: row.6.into(),
        destination: DestinationName::new(row.0.clone()),
        owner: OwnerKey { kind, key: row.2 },
        field: CounterField::for_owner(kind, &row.3).map_err(StorError::new)?,
        delta: row.7,
        token: IdempotencyToken::from(row.8),
        state: state_from_str(&row.9).map_err(StorError::new)?,
        attempts: row.10.max(0) as u32,
        next_attempt: row.11,
        created: row.4,
    })
}

/// Pull the `[applied]` column out of a conditional statement's (or batch's) result
///
/// Conditional results carry the prior values of the conditioned columns alongside the flag, so
/// the row can't be deserialized to a fixed tuple; go through the dynamic [Row] representation.
fn applied(result: QueryResult) -> StdResult<bool, StorError> {
    let rows = result.into_rows_result()?;
    let row = rows.first_row::<Row>()?;
    match row.columns.first() {
        Some(Some(CqlValue::Boolean(applied))) => Ok(*applied),
        _ => Err(StorError::new(NoAppliedColumnSnafu.build())),
    }
}

impl Session {
    /// Has the action owning an intent ever committed? Answered through the `actions_by_id` index
    async fn action_exists(&self, id: &ActionId) -> StdResult<bool, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectActionById],
                (id.as_uuid(),),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<(Uuid,)>()?
            .is_some()
            .pipe(Ok)
    }

    async fn write_intents(&self, intents: &[PropagationIntent]) -> StdResult<(), StorError> {
        for intent in intents {
            self.session
                .execute_unpaged(
                    &self.prepared_statements[PreparedStatements::InsertIntent],
                    (
                        intent.destination.as_str(),
                        intent.owner.kind.resource(),
                        intent.owner.key,
                        intent.field.as_str(),
                        intent.created,
                        intent.id.as_uuid(),
                        intent.action.as_uuid(),
                        intent.delta,
                        intent.token.as_uuid(),
                        state_to_str(intent.state),
                        intent.attempts as i32,
                        intent.next_attempt,
                    ),
                )
                .await?;
            self.session
                .execute_unpaged(
                    &self.prepared_statements[PreparedStatements::InsertIntentById],
                    (
                        intent.id.as_uuid(),
                        intent.destination.as_str(),
                        intent.owner.kind.resource(),
                        intent.owner.key,
                        intent.field.as_str(),
                        intent.created,
                    ),
                )
                .await?;
        }
        Ok(())
    }

    /// Unwind intents written ahead of an action write that didn't apply
    async fn delete_intents(&self, intents: &[PropagationIntent]) -> StdResult<(), StorError> {
        for intent in intents {
            self.session
                .execute_unpaged(
                    &self.prepared_statements[PreparedStatements::DeleteIntent],
                    (
                        intent.destination.as_str(),
                        intent.owner.kind.resource(),
                        intent.owner.key,
                        intent.field.as_str(),
                        intent.created,
                        intent.id.as_uuid(),
                    ),
                )
                .await?;
            self.session
                .execute_unpaged(
                    &self.prepared_statements[PreparedStatements::DeleteIntentById],
                    (intent.id.as_uuid(),),
                )
                .await?;
        }
        Ok(())
    }

    /// Recover an intent's partition & clustering key from its id
    async fn routing(
        &self,
        id: &IntentId,
    ) -> StdResult<(String, String, Uuid, String, DateTime<Utc>), StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectIntentRouting],
                (id.as_uuid(),),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<(String, String, Uuid, String, DateTime<Utc>)>()?
            .ok_or_else(|| StorError::new(NoRoutingSnafu { id: *id }.build()))
    }

    async fn select_intents(
        &self,
        stmt: PreparedStatements,
    ) -> StdResult<Vec<(PropagationIntent, Option<DateTime<Utc>>)>, StorError> {
        self.session
            .execute_unpaged(&self.prepared_statements[stmt], ())
            .await?
            .into_rows_result()?
            .rows::<IntentRow>()?
            .map(|row| {
                let row = row?;
                let lease = row.12;
                Ok((intent_from_row(&row)?, lease))
            })
            .collect::<StdResult<Vec<_>, StorError>>()
    }

    /// Current raw sum for a counter partition; None if the value row doesn't exist yet
    async fn counter_value(
        &self,
        owner: &OwnerKey,
        field: &CounterField,
    ) -> StdResult<Option<i64>, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectCounterCell],
                (owner.kind.resource(), owner.key, field.as_str(), VALUE_ROW),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<(Uuid, Option<i64>)>()?
            .and_then(|(_, value)| value)
            .pipe(Ok)
    }

    async fn token_seen(
        &self,
        owner: &OwnerKey,
        field: &CounterField,
        token: &IdempotencyToken,
    ) -> StdResult<bool, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectCounterCell],
                (
                    owner.kind.resource(),
                    owner.key,
                    field.as_str(),
                    token.as_uuid(),
                ),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<(Uuid, Option<i64>)>()?
            .is_some()
            .pipe(Ok)
    }
}

/// What to do with a due head intent, given whether its owning action row has committed
#[derive(Debug, Eq, PartialEq)]
enum HeadDisposition {
    Lease,
    /// Possibly racing the action write that enqueued it; look again next sweep
    Wait,
    /// The owning action never committed; the increment must never be delivered
    Park,
}

/// Fence increments whose owning action never committed
///
/// Intents are written ahead of their action row, so a crash in between (or an insert losing its
/// LWT race & crashing before the unwind) strands increments for an action that doesn't exist.
/// Compensating decrements are exempt-- the action they follow was deleted on purpose-- and young
/// orphans get `grace` to let an in-flight action write land before we give up on them.
fn head_disposition(
    intent: &PropagationIntent,
    action_committed: bool,
    now: DateTime<Utc>,
    grace: Duration,
) -> HeadDisposition {
    if intent.delta <= 0 || action_committed {
        HeadDisposition::Lease
    } else if now - intent.created <= grace {
        HeadDisposition::Wait
    } else {
        HeadDisposition::Park
    }
}

#[async_trait]
impl storage::Backend for Session {
    async fn insert_action(
        &self,
        record: &ActionRecord,
        intents: &[PropagationIntent],
    ) -> StdResult<storage::InsertOutcome, StorError> {
        let payload = serde_json::to_string(&record.payload).map_err(StorError::new)?;
        // Intents first: a crash after this point can strand intent rows (fenced at lease time),
        // but can never commit an action without the deltas it owes.
        self.write_intents(intents).await?;
        let result = self
            .session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::InsertAction],
                (
                    record.actor.as_uuid(),
                    record.target.as_uuid(),
                    record.kind().to_string(),
                    record.id.as_uuid(),
                    payload,
                    record.created,
                ),
            )
            .await?;
        if !applied(result)? {
            self.delete_intents(intents).await?;
            let existing = self
                .get_action(&record.actor, &record.target, record.kind())
                .await?
                // lost a race with a concurrent remove
                .ok_or_else(|| StorError::new(ActionVanishedSnafu.build()))?;
            return Ok(storage::InsertOutcome::AlreadyExists(existing));
        }
        Ok(storage::InsertOutcome::Created(record.clone()))
    }

    async fn update_action(
        &self,
        record: &ActionRecord,
        intents: &[PropagationIntent],
    ) -> StdResult<(), StorError> {
        let payload = serde_json::to_string(&record.payload).map_err(StorError::new)?;
        // Intents first, same as insert_action: losing an enqueued delta after the payload's
        // high-water mark has advanced would lose it for good, whereas the converse just means a
        // re-sent report re-enqueues the same delta under the same token & dedups downstream.
        self.write_intents(intents).await?;
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::UpsertAction],
                (
                    record.actor.as_uuid(),
                    record.target.as_uuid(),
                    record.kind().to_string(),
                    record.id.as_uuid(),
                    payload,
                    record.created,
                ),
            )
            .await?;
        Ok(())
    }

    async fn remove_action(
        &self,
        record: &ActionRecord,
        intents: &[PropagationIntent],
    ) -> StdResult<bool, StorError> {
        // Compensating decrements first; if the delete never runs, re-issuing the removal
        // re-enqueues them under the same tokens & they dedup downstream. The old order (delete,
        // then write) could lose the decrements outright, leaving the remote counters inflated
        // with nothing left to reconcile them.
        self.write_intents(intents).await?;
        let result = self
            .session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::DeleteAction],
                (
                    record.actor.as_uuid(),
                    record.target.as_uuid(),
                    record.kind().to_string(),
                ),
            )
            .await?;
        if !applied(result)? {
            self.delete_intents(intents).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn get_action(
        &self,
        actor: &UserId,
        target: &ContentId,
        kind: ActionKind,
    ) -> StdResult<Option<ActionRecord>, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectAction],
                (actor.as_uuid(), target.as_uuid(), kind.to_string()),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<(Uuid, String, DateTime<Utc>)>()?
            .map(|(id, payload, created)| {
                Ok(ActionRecord {
                    id: id.into(),
                    actor: *actor,
                    target: *target,
                    payload: serde_json::from_str::<ActionPayload>(&payload)
                        .map_err(StorError::new)?,
                    created,
                })
            })
            .transpose()
    }

    async fn actions_for_actor(
        &self,
        actor: &UserId,
        kind: ActionKind,
    ) -> StdResult<Vec<ActionRecord>, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectActionsForActor],
                (actor.as_uuid(), kind.to_string()),
            )
            .await?
            .into_rows_result()?
            .rows::<(Uuid, Uuid, String, DateTime<Utc>)>()?
            .map(|row| {
                let (target, id, payload, created) = row?;
                Ok(ActionRecord {
                    id: id.into(),
                    actor: *actor,
                    target: target.into(),
                    payload: serde_json::from_str::<ActionPayload>(&payload)
                        .map_err(StorError::new)?,
                    created,
                })
            })
            .collect::<StdResult<Vec<_>, StorError>>()?
            .into_iter()
            .sorted_by_key(|record| (record.created, record.id))
            .collect::<Vec<_>>()
            .pipe(Ok)
    }

    async fn lease_intents(
        &self,
        limit: usize,
        lease: Duration,
    ) -> StdResult<Vec<PropagationIntent>, StorError> {
        let now = Utc::now();
        let pending = self
            .select_intents(PreparedStatements::SelectPendingIntents)
            .await?;
        // Head of each (destination, owner, counter) line over *all* pending intents; a due
        // intent behind an undue or leased sibling must wait its turn.
        let heads: HashMap<_, IntentId> = pending
            .iter()
            .sorted_by_key(|(intent, _)| (intent.created, intent.id))
            .map(|(intent, _)| (intent.ordering_key(), intent.id))
            .unique_by(|(key, _)| key.clone())
            .collect();
        let mut leased = Vec::new();
        for (intent, lease_expires) in pending
            .into_iter()
            .filter(|(intent, lease_expires)| {
                intent.next_attempt <= now
                    && lease_expires.map(|dt| dt <= now).unwrap_or(true)
                    && heads.get(&intent.ordering_key()) == Some(&intent.id)
            })
            .sorted_by_key(|(intent, _)| (intent.created, intent.id))
            .take(limit)
        {
            let action_committed =
                intent.delta <= 0 || self.action_exists(&intent.action).await?;
            match head_disposition(&intent, action_committed, now, lease) {
                HeadDisposition::Wait => continue,
                HeadDisposition::Park => {
                    warn!(
                        "parking intent {}: its action {} never committed",
                        intent.id, intent.action
                    );
                    self.mark_failed(&intent.id).await?;
                    continue;
                }
                HeadDisposition::Lease => (),
            }
            // The conditional update arbitrates between instances racing for the same intent:
            // whoever swaps the lease first wins; everyone else moves on.
            let result = self
                .session
                .execute_unpaged(
                    &self.prepared_statements[PreparedStatements::LeaseIntent],
                    (
                        now + lease,
                        intent.destination.as_str(),
                        intent.owner.kind.resource(),
                        intent.owner.key,
                        intent.field.as_str(),
                        intent.created,
                        intent.id.as_uuid(),
                        lease_expires,
                    ),
                )
                .await?;
            if applied(result)? {
                leased.push(intent);
            }
        }
        Ok(leased)
    }

    async fn mark_delivered(&self, id: &IntentId) -> StdResult<(), StorError> {
        // Delivered intents are history; drop the row rather than letting the partition grow.
        let (destination, owner_kind, owner, field, created) = self.routing(id).await?;
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::DeleteIntent],
                (
                    destination,
                    owner_kind,
                    owner,
                    field,
                    created,
                    id.as_uuid(),
                ),
            )
            .await?;
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::DeleteIntentById],
                (id.as_uuid(),),
            )
            .await?;
        Ok(())
    }

    async fn record_attempt(
        &self,
        id: &IntentId,
        attempts: u32,
        next_attempt: DateTime<Utc>,
    ) -> StdResult<(), StorError> {
        let (destination, owner_kind, owner, field, created) = self.routing(id).await?;
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::RecordAttempt],
                (
                    attempts as i32,
                    next_attempt,
                    destination,
                    owner_kind,
                    owner,
                    field,
                    created,
                    id.as_uuid(),
                ),
            )
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: &IntentId) -> StdResult<(), StorError> {
        let (destination, owner_kind, owner, field, created) = self.routing(id).await?;
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::MarkFailed],
                (destination, owner_kind, owner, field, created, id.as_uuid()),
            )
            .await?;
        Ok(())
    }

    async fn failed_intents(&self) -> StdResult<Vec<PropagationIntent>, StorError> {
        self.select_intents(PreparedStatements::SelectFailedIntents)
            .await?
            .into_iter()
            .map(|(intent, _)| intent)
            .sorted_by_key(|intent| (intent.created, intent.id))
            .collect::<Vec<_>>()
            .pipe(Ok)
    }

    async fn apply_delta(
        &self,
        owner: &OwnerKey,
        field: &CounterField,
        delta: i64,
        token: &IdempotencyToken,
    ) -> StdResult<i64, StorError> {
        for _ in 0..MAX_CAS_ROUNDS {
            let current = self.counter_value(owner, field).await?;
            if self.token_seen(owner, field, token).await? {
                return Ok(current.unwrap_or(0).max(0));
            }
            // One conditional batch over the single counter partition: record the token & move
            // the value together, or not at all.
            let mut batch = Batch::default();
            batch.append_statement(
                self.prepared_statements[PreparedStatements::InsertTokenRow].clone(),
            );
            let result = match current {
                None => {
                    batch.append_statement(
                        self.prepared_statements[PreparedStatements::InsertValueRow].clone(),
                    );
                    self.session
                        .batch(
                            &batch,
                            (
                                (
                                    owner.kind.resource(),
                                    owner.key,
                                    field.as_str(),
                                    token.as_uuid(),
                                    Utc::now(),
                                    self.ledger_ttl,
                                ),
                                (
                                    owner.kind.resource(),
                                    owner.key,
                                    field.as_str(),
                                    VALUE_ROW,
                                    delta,
                                ),
                            ),
                        )
                        .await?
                }
                Some(old) => {
                    batch.append_statement(
                        self.prepared_statements[PreparedStatements::CasUpdateValue].clone(),
                    );
                    self.session
                        .batch(
                            &batch,
                            (
                                (
                                    owner.kind.resource(),
                                    owner.key,
                                    field.as_str(),
                                    token.as_uuid(),
                                    Utc::now(),
                                    self.ledger_ttl,
                                ),
                                (
                                    old + delta,
                                    owner.kind.resource(),
                                    owner.key,
                                    field.as_str(),
                                    VALUE_ROW,
                                    old,
                                ),
                            ),
                        )
                        .await?
                }
            };
            if applied(result)? {
                return Ok((current.unwrap_or(0) + delta).max(0));
            }
            // Either another instance moved the value, or this token just landed; loop & re-read.
        }
        Err(StorError::new(
            CounterContentionSnafu {
                attempts: MAX_CAS_ROUNDS,
            }
            .build(),
        ))
    }

    async fn counters_for(&self, owner: &OwnerKey) -> StdResult<HashMap<String, i64>, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectCountersForOwner],
                (owner.kind.resource(), owner.key, VALUE_ROW),
            )
            .await?
            .into_rows_result()?
            .rows::<(String, Option<i64>)>()?
            .map(|row| {
                let (field, value) = row?;
                Ok((field, value.unwrap_or(0).max(0)))
            })
            .collect::<StdResult<HashMap<_, _>, StorError>>()
    }

    async fn prune_dedup_ledger(
        &self,
        _older_than: DateTime<Utc>,
    ) -> StdResult<usize, StorError> {
        // Ledger rows carry a TTL; Scylla ages them out without our help.
        Ok(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::recorder::CONTENT_SERVICE;

    fn intent(delta: i64) -> PropagationIntent {
        PropagationIntent::new(
            &ActionId::new(),
            DestinationName::new(CONTENT_SERVICE),
            OwnerKey::content(&ContentId::new()),
            CounterField::for_owner(OwnerKind::Content, "bookmarksCount").unwrap(),
            delta,
            0,
        )
    }

    #[test]
    fn committed_increments_are_leased() {
        let intent = intent(1);
        assert_eq!(
            head_disposition(&intent, true, Utc::now(), Duration::seconds(30)),
            HeadDisposition::Lease
        );
    }

    #[test]
    fn young_orphaned_increments_wait_for_their_action() {
        // An intent written moments ago may just be racing the action write that enqueued it.
        let intent = intent(1);
        assert_eq!(
            head_disposition(&intent, false, Utc::now(), Duration::seconds(30)),
            HeadDisposition::Wait
        );
    }

    #[test]
    fn stale_orphaned_increments_are_parked() {
        let mut intent = intent(1);
        intent.created = Utc::now() - Duration::minutes(5);
        assert_eq!(
            head_disposition(&intent, false, Utc::now(), Duration::seconds(30)),
            HeadDisposition::Park
        );
    }

    #[test]
    fn compensating_decrements_need_no_action() {
        // The action a decrement follows was deleted on purpose; never fence it.
        let mut intent = intent(-1);
        intent.created = Utc::now() - Duration::minutes(5);
        assert_eq!(
            head_disposition(&intent, false, Utc::now(), Duration::seconds(30)),
            HeadDisposition::Lease
        );
    }
}
