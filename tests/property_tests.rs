//! Property tests for unit conversion, unification and histogram merging
//!
//! Uses proptest to check algebraic laws that the aggregation pipeline
//! relies on: conversions inside a domain are invertible, unification is
//! idempotent, and histogram merges do not depend on grouping or order.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use tsd_aggregator::model::{AggregatedData, Fqdsn, Period, Quantity, Unit, UnitDomain};
use tsd_aggregator::statistics::{Histogram, HistogramSupportingData, Statistic};
use tsd_aggregator::unifier;

// =============================================================================
// Test Data Strategies
// =============================================================================

/// Finite values in a range where unit scaling stays well inside f64
fn finite_f64() -> impl Strategy<Value = f64> {
    prop_oneof![
        (-1e6..1e6f64),
        (-1.0..1.0f64),
        Just(0.0),
        (-1000i32..1000).prop_map(|i| i as f64),
    ]
}

fn scaled_domain() -> impl Strategy<Value = UnitDomain> {
    prop_oneof![Just(UnitDomain::Time), Just(UnitDomain::DataSize)]
}

/// Two units of the same scaled domain
fn unit_pair() -> impl Strategy<Value = (Unit, Unit)> {
    scaled_domain().prop_flat_map(|domain| {
        let units = domain.units();
        (
            prop::sample::select(units.to_vec()),
            prop::sample::select(units.to_vec()),
        )
    })
}

fn time_quantity() -> impl Strategy<Value = Quantity> {
    (
        finite_f64(),
        prop::sample::select(UnitDomain::Time.units().to_vec()),
    )
        .prop_map(|(v, u)| Quantity::with_unit(v, u))
}

fn histogram(bits: u8) -> impl Strategy<Value = Histogram> {
    prop::collection::vec((0i32..5000).prop_map(|i| i as f64 / 8.0), 0..64).prop_map(
        move |values| {
            let mut h = Histogram::new(bits).unwrap();
            for v in values {
                h.record(v);
            }
            h
        },
    )
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

// =============================================================================
// Unit conversion
// =============================================================================

proptest! {
    #[test]
    fn conversion_round_trips((from, to) in unit_pair(), value in finite_f64()) {
        let there = Quantity::with_unit(value, from).convert_to(to).unwrap();
        let back = there.convert_to(from).unwrap();
        prop_assert_eq!(back.unit(), Some(from));
        prop_assert!(approx_eq(back.value(), value), "{} != {}", back.value(), value);
    }

    #[test]
    fn temperature_round_trips(value in -200.0..1000.0f64) {
        for from in UnitDomain::Temperature.units() {
            for to in UnitDomain::Temperature.units() {
                let back = Quantity::with_unit(value, *from)
                    .convert_to(*to)
                    .and_then(|q| q.convert_to(*from))
                    .unwrap();
                prop_assert!((back.value() - value).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn unify_uses_one_unit(samples in prop::collection::vec(time_quantity(), 1..20)) {
        let unified = Quantity::unify(&samples).unwrap();
        let unit = unified[0].unit();
        prop_assert!(unified.iter().all(|q| q.unit() == unit));
        for (original, converted) in samples.iter().zip(&unified) {
            prop_assert_eq!(original.compare(converted).unwrap(), std::cmp::Ordering::Equal);
        }
    }

    #[test]
    fn unifier_is_idempotent(
        value in time_quantity(),
        samples in prop::collection::vec(time_quantity(), 0..20),
    ) {
        let data = AggregatedData::new(
            Fqdsn::new("c", "s", "m", Statistic::Max),
            "h",
            Period::from_secs(60).unwrap(),
            Utc.timestamp_opt(0, 0).unwrap(),
            value,
        )
        .with_samples(samples);
        let once = unifier::unify_one(data).unwrap();
        let twice = unifier::unify_one(once.clone()).unwrap();
        prop_assert_eq!(once, twice);
    }
}

// =============================================================================
// Histogram merging
// =============================================================================

proptest! {
    #[test]
    fn histogram_merge_is_commutative(a in histogram(7), b in histogram(7)) {
        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        prop_assert_eq!(&ab, &ba);
        prop_assert_eq!(ab.entries(), a.entries() + b.entries());
    }

    #[test]
    fn histogram_merge_is_associative(
        a in histogram(7),
        b in histogram(7),
        c in histogram(7),
    ) {
        let mut left = a.clone();
        left.merge(&b).unwrap();
        left.merge(&c).unwrap();

        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut right = a.clone();
        right.merge(&bc).unwrap();

        prop_assert_eq!(left, right);
    }

    #[test]
    fn supporting_data_merge_survives_codec(a in histogram(5), b in histogram(5)) {
        let a = HistogramSupportingData::new(a, Some(Unit::Millisecond));
        let b = HistogramSupportingData::new(b, Some(Unit::Millisecond));

        let mut direct = a.clone();
        direct.merge(&b).unwrap();

        let mut decoded = HistogramSupportingData::decode(&a.encode().unwrap()).unwrap();
        decoded.merge(&HistogramSupportingData::decode(&b.encode().unwrap()).unwrap()).unwrap();

        prop_assert_eq!(direct, decoded);
    }

    #[test]
    fn percentile_is_within_recorded_range(h in histogram(7), p in 0.0..=100.0f64) {
        if let Some(value) = h.value_at_percentile(p) {
            let min = h.iter().next().map(|(k, _)| k).unwrap();
            let max = h.iter().last().map(|(k, _)| k).unwrap();
            prop_assert!(value >= min && value <= max);
        } else {
            prop_assert!(h.is_empty());
        }
    }
}
