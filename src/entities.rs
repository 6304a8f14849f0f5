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

//! # readmark models
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are truly
//! foundational: identifiers, action records, counter fields & propagation intents, used by every
//! other module in the crate.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a recognized action kind"))]
    BadActionKind { text: String, backtrace: Backtrace },
    #[snafu(display("{field} is not an allowed counter for {owner}"))]
    BadCounterField {
        field: String,
        owner: OwnerKind,
        backtrace: Backtrace,
    },
    #[snafu(display("{text} is not a valid identifier: {source}"))]
    BadId {
        text: String,
        source: uuid::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{text} is not a recognized owner kind"))]
    BadOwnerKind { text: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// define_id!
///
/// Declare a newtype struct over [Uuid] intended to be used as an opaque identifier for some other
/// sort of entity. In a NoSQL world we can't count on an auto-increment column to hand us
/// identifiers, so we assign our own; UUIDs are the path of least resistance. I could have used
/// [Uuid] directly everywhere, but I just couldn't bring myself to use the same type to identify
/// users, content items, action records & propagation intents all at the same time.
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $type_name(Uuid);
        impl $type_name {
            pub fn new() -> $type_name {
                $type_name(Uuid::new_v4())
            }
            pub fn from_raw_string(s: &str) -> StdResult<$type_name, uuid::Error> {
                Ok($type_name(Uuid::parse_str(s)?))
            }
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                Self::new()
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }
        impl From<Uuid> for $type_name {
            fn from(value: Uuid) -> Self {
                $type_name(value)
            }
        }
    };
}

define_id!(UserId);
define_id!(ContentId);
define_id!(ActionId);
define_id!(IntentId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         action records                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The sorts of user action the recorder accepts
///
/// An action kind is "undoable" if removing it is a sensible client request (un-bookmarking,
/// clearing a download). Marking content read & accruing reading progress have no undo in the
/// product; attempting to remove them is a caller error.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Bookmark,
    Download,
    MarkRead,
    ProgressDelta,
}

impl ActionKind {
    pub fn is_undoable(&self) -> bool {
        matches!(self, ActionKind::Bookmark | ActionKind::Download)
    }
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Bookmark => write!(f, "bookmark"),
            ActionKind::Download => write!(f, "download"),
            ActionKind::MarkRead => write!(f, "mark-read"),
            ActionKind::ProgressDelta => write!(f, "progress-delta"),
        }
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<ActionKind> {
        match s {
            "bookmark" => Ok(ActionKind::Bookmark),
            "download" => Ok(ActionKind::Download),
            "mark-read" => Ok(ActionKind::MarkRead),
            "progress-delta" => Ok(ActionKind::ProgressDelta),
            text => BadActionKindSnafu { text }.fail(),
        }
    }
}

/// Kind-specific payload carried on an [ActionRecord]
///
/// For progress the payload holds the *cumulative* words & characters recorded so far for this
/// (actor, target) pair; deltas are computed against it on each upsert so that re-sent progress
/// reports never double-count.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionPayload {
    Bookmark { note: Option<String> },
    Download { file_path: String },
    MarkRead,
    Progress { words: u64, characters: u64 },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Bookmark { .. } => ActionKind::Bookmark,
            ActionPayload::Download { .. } => ActionKind::Download,
            ActionPayload::MarkRead => ActionKind::MarkRead,
            ActionPayload::Progress { .. } => ActionKind::ProgressDelta,
        }
    }
}

/// One user action against one target, uniquely keyed by (actor, target, kind)
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ActionRecord {
    pub id: ActionId,
    pub actor: UserId,
    pub target: ContentId,
    pub payload: ActionPayload,
    pub created: DateTime<Utc>,
}

impl ActionRecord {
    pub fn new(actor: UserId, target: ContentId, payload: ActionPayload) -> ActionRecord {
        ActionRecord {
            id: ActionId::new(),
            actor,
            target,
            payload,
            created: Utc::now(),
        }
    }
    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     aggregate counter sets                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The sort of entity owning an aggregate counter set
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnerKind {
    Content,
    Profile,
}

impl OwnerKind {
    /// The resource segment under which this owner's counters are addressed on the wire
    /// (`/internal/<resource>/<owner>/increment`)
    pub fn resource(&self) -> &'static str {
        match self {
            OwnerKind::Content => "contents",
            OwnerKind::Profile => "profiles",
        }
    }
    /// Counter names remote callers may adjust on this sort of owner
    pub fn allowed_fields(&self) -> &'static [&'static str] {
        match self {
            OwnerKind::Content => &[
                "bookmarksCount",
                "downloadsCount",
                "views",
                "completionsCount",
            ],
            OwnerKind::Profile => &[
                "bookmarkedCount",
                "downloadedCount",
                "markedReadCount",
                "lessonsCompleted",
                "wordsLearned",
                "charactersLearned",
            ],
        }
    }
}

impl Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.resource())
    }
}

impl FromStr for OwnerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<OwnerKind> {
        match s {
            "contents" => Ok(OwnerKind::Content),
            "profiles" => Ok(OwnerKind::Profile),
            text => BadOwnerKindSnafu { text }.fail(),
        }
    }
}

/// A counter name that has been checked against its owner's allowed set
///
/// Refinement type: possession of a [CounterField] is proof that the name was validated, so the
/// apply path doesn't need to re-check.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CounterField(String);

impl CounterField {
    pub fn for_owner(owner: OwnerKind, name: &str) -> Result<CounterField> {
        if owner.allowed_fields().contains(&name) {
            Ok(CounterField(name.to_owned()))
        } else {
            BadCounterFieldSnafu { field: name, owner }.fail()
        }
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CounterField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identifier of the entity whose counters are being adjusted
///
/// Either a [UserId] or a [ContentId], depending on the owner kind; the aggregate store doesn't
/// care which, so it's kept as a bare [Uuid] alongside its [OwnerKind].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct OwnerKey {
    pub kind: OwnerKind,
    pub key: Uuid,
}

impl OwnerKey {
    pub fn content(id: &ContentId) -> OwnerKey {
        OwnerKey {
            kind: OwnerKind::Content,
            key: *id.as_uuid(),
        }
    }
    pub fn profile(id: &UserId) -> OwnerKey {
        OwnerKey {
            kind: OwnerKind::Profile,
            key: *id.as_uuid(),
        }
    }
}

impl Display for OwnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.key.as_hyphenated())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      propagation intents                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Logical name of a remote service, resolved to a base URL by configuration
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct DestinationName(String);

impl DestinationName {
    pub fn new(name: impl Into<String>) -> DestinationName {
        DestinationName(name.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DestinationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// UUID namespace for idempotency tokens (readmark's own, generated once)
const TOKEN_NAMESPACE: Uuid = Uuid::from_fields(
    0x6f1c2b8e,
    0x4a17,
    0x4d02,
    &[0x9b, 0x5e, 0x21, 0xd4, 0x7c, 0x0a, 0xe3, 0x91],
);

/// A deterministic identifier making repeated delivery attempts safe
///
/// Derived (UUIDv5) from the originating action record, the destination, the counter name & a
/// sequence number. The sequence number distinguishes deltas that legitimately recur under the
/// same (action, destination, counter) triple: 0 for the original increment, 1 for the
/// compensating decrement, and the running cumulative total for successive progress deltas.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct IdempotencyToken(Uuid);

impl IdempotencyToken {
    pub fn derive(
        action: &ActionId,
        destination: &DestinationName,
        field: &CounterField,
        seq: u64,
    ) -> IdempotencyToken {
        let name = format!("{}:{}:{}:{}", action, destination, field, seq);
        IdempotencyToken(Uuid::new_v5(&TOKEN_NAMESPACE, name.as_bytes()))
    }
    pub fn from_raw_string(s: &str) -> StdResult<IdempotencyToken, uuid::Error> {
        Ok(IdempotencyToken(Uuid::parse_str(s)?))
    }
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for IdempotencyToken {
    fn from(value: Uuid) -> Self {
        IdempotencyToken(value)
    }
}

impl Display for IdempotencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

/// Delivery state of a [PropagationIntent]
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    FailedPermanently,
}

/// One outstanding obligation to apply a delta at a remote service
///
/// Created in the same local transaction as its action record; owned exclusively by the
/// originating service until delivered.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PropagationIntent {
    pub id: IntentId,
    pub action: ActionId,
    pub destination: DestinationName,
    pub owner: OwnerKey,
    pub field: CounterField,
    pub delta: i64,
    pub token: IdempotencyToken,
    pub state: DeliveryState,
    pub attempts: u32,
    pub next_attempt: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

impl PropagationIntent {
    pub fn new(
        action: &ActionId,
        destination: DestinationName,
        owner: OwnerKey,
        field: CounterField,
        delta: i64,
        seq: u64,
    ) -> PropagationIntent {
        let token = IdempotencyToken::derive(action, &destination, &field, seq);
        let now = Utc::now();
        PropagationIntent {
            id: IntentId::new(),
            action: *action,
            destination,
            owner,
            field,
            delta,
            token,
            state: DeliveryState::Pending,
            attempts: 0,
            next_attempt: now,
            created: now,
        }
    }
    /// Intents sharing an ordering key must be delivered in creation order
    pub fn ordering_key(&self) -> (DestinationName, OwnerKey, CounterField) {
        (
            self.destination.clone(),
            self.owner,
            self.field.clone(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tokens_are_deterministic() {
        let action = ActionId::new();
        let dest = DestinationName::new("content-service");
        let field = CounterField::for_owner(OwnerKind::Content, "bookmarksCount").unwrap();
        let a = IdempotencyToken::derive(&action, &dest, &field, 0);
        let b = IdempotencyToken::derive(&action, &dest, &field, 0);
        assert_eq!(a, b);
        // ...and distinct across sequence numbers (increment vs. compensating decrement)
        let c = IdempotencyToken::derive(&action, &dest, &field, 1);
        assert_ne!(a, c);
    }

    #[test]
    fn counter_fields_are_validated() {
        assert!(CounterField::for_owner(OwnerKind::Content, "bookmarksCount").is_ok());
        assert!(CounterField::for_owner(OwnerKind::Profile, "bookmarksCount").is_err());
        assert!(CounterField::for_owner(OwnerKind::Profile, "wordsLearned").is_ok());
        assert!(CounterField::for_owner(OwnerKind::Content, "dropTables").is_err());
    }

    #[test]
    fn action_kinds_round_trip() {
        for kind in [
            ActionKind::Bookmark,
            ActionKind::Download,
            ActionKind::MarkRead,
            ActionKind::ProgressDelta,
        ] {
            assert_eq!(kind, format!("{}", kind).parse().unwrap());
        }
        assert!("bookmarks".parse::<ActionKind>().is_err());
    }
}
