//! Name → statistic registry with case-insensitive aliases

use std::collections::HashMap;

use lazy_static::lazy_static;

use super::Statistic;
use crate::error::{Error, Result};

lazy_static! {
    static ref REGISTRY: HashMap<&'static str, Statistic> = {
        let mut table = HashMap::new();
        let entries: [(&[&'static str], Statistic); 12] = [
            (&["count", "n"], Statistic::Count),
            (&["sum"], Statistic::Sum),
            (&["mean"], Statistic::Mean),
            (&["min", "tp0", "p0"], Statistic::Min),
            (&["max", "tp100", "p100"], Statistic::Max),
            (&["median", "tp50", "p50"], Statistic::MEDIAN),
            (&["tp75", "p75"], Statistic::Percentile(750)),
            (&["tp90", "p90"], Statistic::Percentile(900)),
            (&["tp95", "p95"], Statistic::Percentile(950)),
            (&["tp99", "p99"], Statistic::Percentile(990)),
            (&["tp99.9", "p99.9", "p999"], Statistic::Percentile(999)),
            (&["histogram"], Statistic::Histogram),
        ];
        for (names, statistic) in entries {
            for name in names {
                table.insert(*name, statistic);
            }
        }
        table
    };
}

/// Lookup of statistics by name
///
/// Names are matched case-insensitively against the registered aliases.
/// Any other `tp<N>` / `p<N>` name is parsed as a percentile with at most one
/// decimal digit (`tp97.5`, `p975`).
pub struct StatisticFactory;

impl StatisticFactory {
    /// Resolve `name` to a statistic
    ///
    /// # Errors
    ///
    /// `UnknownStatistic` if no alias matches and the name is not a
    /// percentile.
    pub fn get_statistic(name: &str) -> Result<Statistic> {
        Self::try_get_statistic(name).ok_or_else(|| Error::UnknownStatistic(name.to_string()))
    }

    /// Resolve `name`, returning `None` for unknown names
    pub fn try_get_statistic(name: &str) -> Option<Statistic> {
        let lower = name.trim().to_ascii_lowercase();
        if let Some(statistic) = REGISTRY.get(lower.as_str()) {
            return Some(*statistic);
        }
        parse_percentile(&lower)
    }

    /// Every registered alias, sorted
    pub fn registered_names() -> Vec<&'static str> {
        let mut names: Vec<_> = REGISTRY.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn parse_percentile(lower: &str) -> Option<Statistic> {
    let digits = lower
        .strip_prefix("tp")
        .or_else(|| lower.strip_prefix('p'))?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let percentile: f64 = if digits.contains('.') {
        digits.parse().ok()?
    } else if digits.len() == 3 && digits != "100" {
        // p999 style: implied decimal before the last digit
        digits.parse::<f64>().ok()? / 10.0
    } else {
        digits.parse().ok()?
    };
    Statistic::percentile(percentile).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_case_insensitive() {
        for name in ["p99", "P99", "Tp99", "TP99", "tp99"] {
            assert_eq!(
                StatisticFactory::get_statistic(name).unwrap(),
                Statistic::Percentile(990),
                "{}",
                name
            );
        }
        assert_eq!(StatisticFactory::get_statistic("N").unwrap(), Statistic::Count);
        assert_eq!(StatisticFactory::get_statistic("tp0").unwrap(), Statistic::Min);
        assert_eq!(StatisticFactory::get_statistic("p100").unwrap(), Statistic::Max);
        assert_eq!(StatisticFactory::get_statistic("P50").unwrap(), Statistic::MEDIAN);
    }

    #[test]
    fn test_parsed_percentiles() {
        assert_eq!(
            StatisticFactory::get_statistic("p999").unwrap(),
            Statistic::Percentile(999)
        );
        assert_eq!(
            StatisticFactory::get_statistic("tp97.5").unwrap(),
            Statistic::Percentile(975)
        );
        assert_eq!(
            StatisticFactory::get_statistic("p975").unwrap(),
            Statistic::Percentile(975)
        );
        assert_eq!(StatisticFactory::get_statistic("tp12").unwrap(), Statistic::Percentile(120));
    }

    #[test]
    fn test_unknown() {
        assert!(matches!(
            StatisticFactory::get_statistic("stddev"),
            Err(Error::UnknownStatistic(_))
        ));
        assert!(StatisticFactory::try_get_statistic("p").is_none());
        assert!(StatisticFactory::try_get_statistic("tp101").is_none());
        assert!(StatisticFactory::try_get_statistic("p1.2.3").is_none());
    }

    #[test]
    fn test_canonical_names_resolve() {
        for stat in [
            Statistic::Count,
            Statistic::Sum,
            Statistic::Mean,
            Statistic::Min,
            Statistic::Max,
            Statistic::Histogram,
            Statistic::MEDIAN,
            Statistic::Percentile(10),
            Statistic::Percentile(999),
        ] {
            assert_eq!(StatisticFactory::get_statistic(&stat.name()).unwrap(), stat);
        }
        assert!(StatisticFactory::registered_names().contains(&"p999"));
    }
}
