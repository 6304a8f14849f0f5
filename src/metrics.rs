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

//! # readmark metrics
//!
//! readmark uses [OpenTelemetry] to collect & export metrics. The actual counters & gauges are
//! called "instruments" in OTel, and we are advised to re-use them rather than creating new ones
//! repeatedly. Fine, but where to keep them? I'd prefer not to litter the application state type
//! with dozens of fields of type `Counter<u64>` and so forth.
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! This module uses David Tolnay's [inventory] crate to avoid a centralized list of metric names.
//! Modules register their metrics at the collection site:
//!
//! ```ignore
//! define_metric! { "recorder.actions.recorded", recorder_actions_recorded, Sort::IntegralCounter }
//! // ...
//! recorder_actions_recorded.add(1, &[]);
//! ```
//!
//! which both submits a [Registration] (so [check_metric_registrations] can detect name clashes at
//! startup) and lazily builds the instrument itself. Handler modules that already carry the
//! application state around instead go through the [Instruments] map built from the registrations
//! with the [counter_add] convenience macro.
//!
//! A bad metric name, or calling `counter_add!` against a name that was registered as a gauge, is
//! a logic error & will panic; these would be compile-time errors with a richer type system.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// The type of thing being inventoried
///
/// Register a metric by name & type using
///
/// ```ignore
/// inventory::submit!{metrics::Registration::new("recorder.conflicts", Sort::IntegralCounter)}
/// ```
///
/// or, more conveniently, [define_metric].
///
/// [define_metric]: crate::define_metric
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> String {
        self.name.to_string()
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic at startup if two call sites registered the same metric name
pub fn check_metric_registrations() {
    let mut names: HashSet<String> = HashSet::new();
    IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
        if names.contains(&reg.name()) {
            panic!("The metric name {} was used twice", reg.name());
        }
        names.insert(reg.name());
    });
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    map: HashMap<String, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let mut m: HashMap<String, Instrument> = HashMap::new();
        let meter = global::meter(prefix);
        // "Pre-creating" all the registered instruments risks building things that may never be
        // used, but means `add` doesn't require `&mut self`, so an instance can live in an Arc.
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            let name = reg.name();
            match m.entry(reg.name()) {
                Entry::Occupied(_occupied_entry) => {
                    panic!("The metric name {} was used twice", name)
                }
                Entry::Vacant(vacant_entry) => {
                    vacant_entry.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(name).build())
                        }
                        Sort::IntegralGauge => Instrument::GaugeU64(meter.u64_gauge(name).build()),
                    });
                }
            }
        });

        Instruments { map: m }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(c)) = self.map.get(name) {
            c.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    // panics if `name` doesn't name a gauge
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeU64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}

/// Register a metric & bind a lazily-built instrument to `$ident` in one shot
///
/// For modules that don't carry the application state around; handler code should prefer
/// [Instruments] + [counter_add].
///
/// [counter_add]: crate::counter_add
#[macro_export]
macro_rules! define_metric {
    ($name:literal, $ident:ident, Sort::IntegralCounter) => {
        inventory::submit! {
            $crate::metrics::Registration::new($name, $crate::metrics::Sort::IntegralCounter)
        }
        lazy_static::lazy_static! {
            #[allow(non_upper_case_globals)]
            static ref $ident: opentelemetry::metrics::Counter<u64> =
                opentelemetry::global::meter(env!("CARGO_PKG_NAME")).u64_counter($name).build();
        }
    };
    ($name:literal, $ident:ident, Sort::IntegralGauge) => {
        inventory::submit! {
            $crate::metrics::Registration::new($name, $crate::metrics::Sort::IntegralGauge)
        }
        lazy_static::lazy_static! {
            #[allow(non_upper_case_globals)]
            static ref $ident: opentelemetry::metrics::Gauge<u64> =
                opentelemetry::global::meter(env!("CARGO_PKG_NAME")).u64_gauge($name).build();
        }
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registrations_are_distinct() {
        check_metric_registrations();
    }

    #[test]
    fn instruments_build() {
        let instruments = Instruments::new("readmark-test");
        // Every registered counter is usable through the map.
        IntoIterator::into_iter(inventory::iter::<Registration>)
            .filter(|reg| reg.sort() == Sort::IntegralCounter)
            .for_each(|reg| instruments.add(&reg.name(), 0, &[]));
    }
}
