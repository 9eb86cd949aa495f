// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of knowfeed.
//
// knowfeed is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// knowfeed is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with knowfeed.  If not,
// see <http://www.gnu.org/licenses/>.

//! # knowfeed metrics
//!
//! knowfeed uses [OpenTelemetry] to collect & export metrics. OTel wants instruments created once
//! & reused, but I'd rather not litter the state types with dozens of `Counter<u64>` fields, so
//! each collection site "registers" its metric by name with David Tolnay's [inventory] crate:
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("counter.toggles", Sort::IntegralCounter) }
//! // ...
//! counter_add!(instruments, "counter.toggles", 1, &[]);
//! ```
//!
//! [Instruments::new] pre-builds every registered instrument & panics on a name collision--
//! those are logic errors, caught the first time the process starts.

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

/// The thing being inventoried: a metric name & its instrument type
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

pub fn check_metric_registrations() {
    let mut names: HashSet<String> = HashSet::new();
    IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
        if !names.insert(reg.name()) {
            panic!("The metric name {} was used twice", reg.name());
        }
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
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            let name = reg.name();
            match m.entry(reg.name()) {
                Entry::Occupied(_) => panic!("The metric name {} was used twice", name),
                Entry::Vacant(vacant) => {
                    vacant.insert(match reg.sort() {
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

#[cfg(test)]
mod test {
    use super::*;

    inventory::submit! { Registration::new("test.metrics.smoke", Sort::IntegralCounter) }

    #[test]
    fn registrations_build() {
        check_metric_registrations();
        let instruments = Instruments::new("knowfeed");
        counter_add!(instruments, "test.metrics.smoke", 1, &[]);
    }
}
