//! Value/sample unit unification
//!
//! After computation an aggregate's value and its retained samples may be
//! expressed in different units of the same domain (a mean in milliseconds
//! over samples recorded in seconds). Unification keeps the value's unit and
//! converts the samples to it. Mixing unit'd and unit-less quantities is an
//! error rather than a guess.

use std::sync::Arc;

use tracing::error;

use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{AggregatedData, PeriodicData, Quantity};
use crate::sink::Sink;

/// Make the samples of one aggregate share the value's unit
///
/// An aggregate without samples, or whose value and samples are all
/// unit-less, is returned unchanged. So is a count-valued aggregate
/// (`count`, `histogram`): its value carries no unit by construction.
///
/// # Errors
///
/// `IncompatibleUnit` when exactly one of value and a sample has a unit, or
/// when their units belong to different domains.
pub fn unify_one(data: AggregatedData) -> Result<AggregatedData> {
    if data.fqdsn().statistic.is_dimensionless() && data.value().unit().is_none() {
        return Ok(data);
    }
    let value_unit = data.value().unit();
    if data.samples().iter().all(|s| s.unit() == value_unit) {
        return Ok(data);
    }

    let samples = match value_unit {
        Some(unit) => data
            .samples()
            .iter()
            .map(|s| match s.unit() {
                Some(_) => s.convert_to(unit),
                None => Err(Error::incompatible(Some(unit), None::<String>)),
            })
            .collect::<Result<Vec<Quantity>>>()?,
        None => {
            let offending = data.samples().iter().find_map(|s| s.unit());
            return Err(Error::incompatible(None::<String>, offending));
        },
    };
    Ok(data.with_samples(samples))
}

/// Unify every aggregate in `data`
///
/// Fails on the first aggregate that cannot be unified. Applying it twice
/// yields the same result as applying it once.
pub fn unify(data: Vec<AggregatedData>) -> Result<Vec<AggregatedData>> {
    data.into_iter().map(unify_one).collect()
}

/// Sink wrapper that unifies each batch before forwarding it
///
/// Aggregates that fail unification are logged and dropped; the rest of the
/// batch is forwarded.
pub struct UnifyingSink {
    inner: Arc<dyn Sink>,
}

impl UnifyingSink {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn Sink>) -> Self {
        Self { inner }
    }
}

impl Sink for UnifyingSink {
    fn record_aggregate_data(&self, mut batch: PeriodicData) {
        let data = std::mem::take(&mut batch.data);
        batch.data = data
            .into_iter()
            .filter_map(|d| {
                let fqdsn = d.fqdsn().clone();
                match unify_one(d) {
                    Ok(unified) => Some(unified),
                    Err(e) => {
                        error!(fqdsn = %fqdsn, error = %e, "Dropping aggregate that failed unification");
                        let statistic = fqdsn.statistic.name();
                        metrics::UNIFICATION_FAILURES
                            .with_label_values(&[statistic.as_ref()])
                            .inc();
                        None
                    },
                }
            })
            .collect();
        self.inner.record_aggregate_data(batch);
    }

    fn close(&self) {
        self.inner.close();
    }
}
