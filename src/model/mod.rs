//! Value types shared by the aggregation and cluster tiers

mod aggregated;
mod fqdsn;
mod period;
mod quantity;
mod record;
mod statistic_set;
mod unit;

pub use aggregated::{
    dimensions_for, AggregatedData, PeriodicData, CLUSTER_DIMENSION, HOST_DIMENSION,
    SERVICE_DIMENSION, UNKNOWN_POPULATION,
};
pub use fqdsn::Fqdsn;
pub use period::Period;
pub use quantity::Quantity;
pub use record::{Identity, Metric, MetricKind, Record};
pub use statistic_set::{StatisticRecord, StatisticSetRecord};
pub use unit::{Unit, UnitDomain};
