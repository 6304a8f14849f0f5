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

//! # recorder
//!
//! The Action Recorder: the canonical write path for user actions.
//!
//! Each record or removal is one local transaction committing the action record *and* its
//! propagation intents together; the commit is the client-visible success point. Whether the
//! remote counters have caught up yet is invisible from here; the dispatcher owes them the
//! deltas & will keep trying until they're paid.
//!
//! The routing table lives in this module: each action kind maps to the aggregate counters it
//! moves, on which service. Removal enqueues the exact negation of what insertion enqueued,
//! under a distinct idempotency token.

use std::sync::Arc;

use snafu::{prelude::*, Backtrace};
use tracing::debug;

use crate::{
    define_metric,
    entities::{
        ActionKind, ActionPayload, ActionRecord, ContentId, CounterField, DestinationName,
        OwnerKey, PropagationIntent, UserId,
    },
    storage::{Backend, InsertOutcome},
};

/// Logical name of the service owning content aggregate counters
pub const CONTENT_SERVICE: &str = "content-service";
/// Logical name of the service owning profile aggregate counters
pub const USER_SERVICE: &str = "user-service";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "No removable {kind} action exists for actor {actor} against {target}"
    ))]
    Conflict {
        actor: UserId,
        target: ContentId,
        kind: ActionKind,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "Progress totals of {words} words / {characters} characters exceed what a counter can hold"
    ))]
    ProgressOutOfRange {
        words: u64,
        characters: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("Internal error in the routing table: {source}"))]
    Routing {
        source: crate::entities::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

define_metric! { "recorder.actions.recorded", actions_recorded, Sort::IntegralCounter }
define_metric! { "recorder.actions.duplicate", actions_duplicate, Sort::IntegralCounter }
define_metric! { "recorder.actions.removed", actions_removed, Sort::IntegralCounter }
define_metric! { "recorder.intents.enqueued", intents_enqueued, Sort::IntegralCounter }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        the routing table                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Sequence number for the original increment
const SEQ_RECORD: u64 = 0;
/// Sequence number for the compensating decrement
const SEQ_REMOVE: u64 = 1;

fn intent(
    record: &ActionRecord,
    destination: &str,
    owner: OwnerKey,
    field: &str,
    delta: i64,
    seq: u64,
) -> std::result::Result<PropagationIntent, crate::entities::Error> {
    Ok(PropagationIntent::new(
        &record.id,
        DestinationName::new(destination),
        owner,
        CounterField::for_owner(owner.kind, field)?,
        delta,
        seq,
    ))
}

/// The counters each action kind moves; `sign` is +1 on record, -1 on removal
///
/// Progress deltas don't route through here (their deltas depend on the prior payload; see
/// [Recorder::record_progress]).
fn routed_intents(record: &ActionRecord, sign: i64, seq: u64) -> Result<Vec<PropagationIntent>> {
    let content = OwnerKey::content(&record.target);
    let profile = OwnerKey::profile(&record.actor);
    match record.kind() {
        ActionKind::Bookmark => vec![
            intent(record, CONTENT_SERVICE, content, "bookmarksCount", sign, seq),
            intent(record, USER_SERVICE, profile, "bookmarkedCount", sign, seq),
        ],
        ActionKind::Download => vec![
            intent(record, CONTENT_SERVICE, content, "downloadsCount", sign, seq),
            intent(record, USER_SERVICE, profile, "downloadedCount", sign, seq),
        ],
        ActionKind::MarkRead => vec![
            intent(record, USER_SERVICE, profile, "markedReadCount", sign, seq),
            intent(record, USER_SERVICE, profile, "lessonsCompleted", sign, seq),
        ],
        // unreachable by construction; kept total so the match stays exhaustive
        ActionKind::ProgressDelta => vec![],
    }
    .into_iter()
    .collect::<std::result::Result<Vec<_>, _>>()
    .context(RoutingSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Recorder                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The Action Recorder; cheap to clone, shared across handlers
#[derive(Clone)]
pub struct Recorder {
    backend: Arc<dyn Backend + Send + Sync>,
}

impl Recorder {
    pub fn new(backend: Arc<dyn Backend + Send + Sync>) -> Recorder {
        Recorder { backend }
    }

    /// Record a bookmark, download or mark-read action
    ///
    /// Idempotent: if an action of this kind already exists for (actor, target), the existing
    /// record comes back unchanged & no new intents are enqueued. Progress payloads take the
    /// upsert path instead ([Recorder::record_progress]).
    pub async fn record(
        &self,
        actor: UserId,
        target: ContentId,
        payload: ActionPayload,
    ) -> Result<ActionRecord> {
        if let ActionPayload::Progress { words, characters } = payload {
            return self.record_progress(actor, target, words, characters).await;
        }
        let record = ActionRecord::new(actor, target, payload);
        let intents = routed_intents(&record, 1, SEQ_RECORD)?;
        let num_intents = intents.len();
        match self
            .backend
            .insert_action(&record, &intents)
            .await
            .context(StorageSnafu)?
        {
            InsertOutcome::Created(record) => {
                debug!(
                    "recorded {} by {} against {} ({} intents)",
                    record.kind(),
                    record.actor,
                    record.target,
                    num_intents
                );
                actions_recorded.add(1, &[]);
                intents_enqueued.add(num_intents as u64, &[]);
                Ok(record)
            }
            InsertOutcome::AlreadyExists(existing) => {
                debug!(
                    "{} by {} against {} already recorded as {}",
                    existing.kind(),
                    existing.actor,
                    existing.target,
                    existing.id
                );
                actions_duplicate.add(1, &[]);
                Ok(existing)
            }
        }
    }

    /// Record cumulative reading progress for (actor, target)
    ///
    /// Progress accrues onto a single record per pair rather than inserting new ones. `words` &
    /// `characters` are the client's cumulative totals; only the positive difference against what
    /// we've already recorded is propagated, and totals never move backwards, so a re-sent report
    /// never double-counts. The sequence number baked into each intent's idempotency token is the
    /// new cumulative total, which makes a re-enqueued identical delta collapse at the
    /// destination's dedup ledger too.
    pub async fn record_progress(
        &self,
        actor: UserId,
        target: ContentId,
        words: u64,
        characters: u64,
    ) -> Result<ActionRecord> {
        // Totals ride in counter deltas, which are i64 on the wire; anything bigger is garbage
        // from the client, not progress.
        ensure!(
            words <= i64::MAX as u64 && characters <= i64::MAX as u64,
            ProgressOutOfRangeSnafu { words, characters }
        );
        let profile = OwnerKey::profile(&actor);
        match self
            .backend
            .get_action(&actor, &target, ActionKind::ProgressDelta)
            .await
            .context(StorageSnafu)?
        {
            None => {
                let record = ActionRecord::new(
                    actor,
                    target,
                    ActionPayload::Progress { words, characters },
                );
                let mut intents = Vec::new();
                if words > 0 {
                    intents.push(
                        intent(&record, USER_SERVICE, profile, "wordsLearned", words as i64, words)
                            .context(RoutingSnafu)?,
                    );
                }
                if characters > 0 {
                    intents.push(
                        intent(
                            &record,
                            USER_SERVICE,
                            profile,
                            "charactersLearned",
                            characters as i64,
                            characters,
                        )
                        .context(RoutingSnafu)?,
                    );
                }
                let num_intents = intents.len();
                let record = self
                    .backend
                    .insert_action(&record, &intents)
                    .await
                    .context(StorageSnafu)?
                    .into_record();
                actions_recorded.add(1, &[]);
                intents_enqueued.add(num_intents as u64, &[]);
                Ok(record)
            }
            Some(mut record) => {
                let (old_words, old_characters) = match &record.payload {
                    ActionPayload::Progress { words, characters } => (*words, *characters),
                    // can't happen; the get was keyed by kind
                    _ => (0, 0),
                };
                let new_words = old_words.max(words);
                let new_characters = old_characters.max(characters);
                if new_words == old_words && new_characters == old_characters {
                    actions_duplicate.add(1, &[]);
                    return Ok(record);
                }
                record.payload = ActionPayload::Progress {
                    words: new_words,
                    characters: new_characters,
                };
                let mut intents = Vec::new();
                if new_words > old_words {
                    intents.push(
                        intent(
                            &record,
                            USER_SERVICE,
                            profile,
                            "wordsLearned",
                            (new_words - old_words) as i64,
                            new_words,
                        )
                        .context(RoutingSnafu)?,
                    );
                }
                if new_characters > old_characters {
                    intents.push(
                        intent(
                            &record,
                            USER_SERVICE,
                            profile,
                            "charactersLearned",
                            (new_characters - old_characters) as i64,
                            new_characters,
                        )
                        .context(RoutingSnafu)?,
                    );
                }
                let num_intents = intents.len();
                self.backend
                    .update_action(&record, &intents)
                    .await
                    .context(StorageSnafu)?;
                actions_recorded.add(1, &[]);
                intents_enqueued.add(num_intents as u64, &[]);
                Ok(record)
            }
        }
    }

    /// Undo a previously recorded action, enqueueing the compensating deltas
    ///
    /// Only bookmark & download actions can be removed; removal of a mark-read or progress
    /// record, or of a record that doesn't exist, is [Error::Conflict].
    pub async fn remove(
        &self,
        actor: UserId,
        target: ContentId,
        kind: ActionKind,
    ) -> Result<ActionRecord> {
        ensure!(kind.is_undoable(), ConflictSnafu { actor, target, kind });
        let record = self
            .backend
            .get_action(&actor, &target, kind)
            .await
            .context(StorageSnafu)?
            .context(ConflictSnafu { actor, target, kind })?;
        let intents = routed_intents(&record, -1, SEQ_REMOVE)?;
        let num_intents = intents.len();
        // false here means someone else removed it between the get & the delete
        ensure!(
            self.backend
                .remove_action(&record, &intents)
                .await
                .context(StorageSnafu)?,
            ConflictSnafu { actor, target, kind }
        );
        debug!(
            "removed {} by {} against {} ({} compensating intents)",
            kind, actor, target, num_intents
        );
        actions_removed.add(1, &[]);
        intents_enqueued.add(num_intents as u64, &[]);
        Ok(record)
    }

    /// All of an actor's actions of the given kind, oldest first
    pub async fn list(&self, actor: UserId, kind: ActionKind) -> Result<Vec<ActionRecord>> {
        self.backend
            .actions_for_actor(&actor, kind)
            .await
            .context(StorageSnafu)
    }

    /// The progress record for (actor, target), if any
    pub async fn progress(
        &self,
        actor: UserId,
        target: ContentId,
    ) -> Result<Option<ActionRecord>> {
        self.backend
            .get_action(&actor, &target, ActionKind::ProgressDelta)
            .await
            .context(StorageSnafu)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::memory::InMemory;

    fn recorder() -> Recorder {
        Recorder::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn bookmarks_are_recorded_once() {
        let recorder = recorder();
        let actor = UserId::new();
        let target = ContentId::new();
        let first = recorder
            .record(actor, target, ActionPayload::Bookmark { note: None })
            .await
            .unwrap();
        let second = recorder
            .record(
                actor,
                target,
                ActionPayload::Bookmark {
                    note: Some("second time around".to_owned()),
                },
            )
            .await
            .unwrap();
        // Idempotent: same record, original payload
        assert_eq!(first, second);
        assert_eq!(recorder.list(actor, ActionKind::Bookmark).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removal_of_missing_records_is_a_conflict() {
        let recorder = recorder();
        let actor = UserId::new();
        let target = ContentId::new();
        assert!(matches!(
            recorder.remove(actor, target, ActionKind::Bookmark).await,
            Err(Error::Conflict { .. })
        ));
        // mark-read has no undo, even when the record exists
        recorder
            .record(actor, target, ActionPayload::MarkRead)
            .await
            .unwrap();
        assert!(matches!(
            recorder.remove(actor, target, ActionKind::MarkRead).await,
            Err(Error::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn remove_then_list_is_empty() {
        let recorder = recorder();
        let actor = UserId::new();
        let target = ContentId::new();
        recorder
            .record(
                actor,
                target,
                ActionPayload::Download {
                    file_path: "/srv/content/42.epub".to_owned(),
                },
            )
            .await
            .unwrap();
        recorder.remove(actor, target, ActionKind::Download).await.unwrap();
        assert!(recorder.list(actor, ActionKind::Download).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_progress_totals_are_rejected() {
        let recorder = recorder();
        let actor = UserId::new();
        let target = ContentId::new();
        assert!(matches!(
            recorder.record_progress(actor, target, u64::MAX, 0).await,
            Err(Error::ProgressOutOfRange { .. })
        ));
        assert!(matches!(
            recorder
                .record(
                    actor,
                    target,
                    ActionPayload::Progress {
                        words: 0,
                        characters: 1 + i64::MAX as u64,
                    },
                )
                .await,
            Err(Error::ProgressOutOfRange { .. })
        ));
        // ...and nothing was recorded along the way.
        assert!(recorder.progress(actor, target).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_accrues_monotonically() {
        let recorder = recorder();
        let actor = UserId::new();
        let target = ContentId::new();
        let record = recorder.record_progress(actor, target, 100, 500).await.unwrap();
        assert_eq!(
            record.payload,
            ActionPayload::Progress {
                words: 100,
                characters: 500
            }
        );
        // A stale, smaller report never winds progress back...
        let record = recorder.record_progress(actor, target, 80, 400).await.unwrap();
        assert_eq!(
            record.payload,
            ActionPayload::Progress {
                words: 100,
                characters: 500
            }
        );
        // ...and a larger one moves it forward, on the same record.
        let updated = recorder.record_progress(actor, target, 150, 700).await.unwrap();
        assert_eq!(updated.id, record.id);
        assert_eq!(
            updated.payload,
            ActionPayload::Progress {
                words: 150,
                characters: 700
            }
        );
    }
}
