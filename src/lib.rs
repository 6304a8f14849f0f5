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

//! # readmark
//!
//! Per-user reading actions (bookmarks, downloads, read markers, reading progress) together with
//! the machinery for propagating the corresponding aggregate-counter adjustments to peer services:
//! a durable outbox of propagation intents, an at-least-once dispatcher with per-counter ordering,
//! and the receiving-side counter adjustment endpoint with its idempotency ledger.
//!
//! Right now, the library crate has the same name as the binary, meaning that `rustdoc` will
//! ignore the binary crate.
pub mod actions;
pub mod client;
pub mod counters;
pub mod dispatcher;
pub mod entities;
pub mod http;
pub mod memory;
pub mod metrics;
pub mod recorder;
pub mod scylla;
pub mod storage;
