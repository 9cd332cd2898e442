use std::collections::BTreeMap;

use crate::quality::SourceDivergence;
use crate::{Record, UtcDateTime};

/// Compares reference prices against other sources' stored records at the
/// same timestamps. Relative difference is measured against the other value.
pub fn reconcile(records: &[Record], others: &[Record], tolerance: f64) -> Vec<SourceDivergence> {
    let mut by_ts: BTreeMap<UtcDateTime, Vec<&Record>> = BTreeMap::new();
    for other in others {
        by_ts.entry(other.ts).or_default().push(other);
    }

    let mut divergences = Vec::new();
    for record in records {
        let Some(candidates) = by_ts.get(&record.ts) else {
            continue;
        };
        for other in candidates {
            if other.source == record.source {
                continue;
            }
            let value = record.reference_price();
            let other_value = other.reference_price();
            let denominator = other_value.abs().max(f64::EPSILON);
            let relative_diff = (value - other_value).abs() / denominator;
            if relative_diff > tolerance {
                divergences.push(SourceDivergence {
                    ts: record.ts,
                    other_source: other.source.clone(),
                    value,
                    other_value,
                    relative_diff,
                });
            }
        }
    }
    divergences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AssetClass, Granularity, InstrumentId, SourceId};

    fn bar(source: &str, close: f64) -> Record {
        Record::bar(
            InstrumentId::new("BTC-USD", AssetClass::Crypto, "COINBASE").expect("id"),
            Granularity::OneDay,
            UtcDateTime::parse("2024-01-02T00:00:00Z").expect("ts"),
            close,
            close,
            close,
            close,
            1.0,
            SourceId::parse(source).expect("source"),
        )
    }

    #[test]
    fn five_cent_difference_on_101_exceeds_one_basis_point() {
        let divergences = reconcile(&[bar("b", 101.05)], &[bar("a", 101.00)], 0.0001);
        assert_eq!(divergences.len(), 1);
        assert!(divergences[0].relative_diff > 0.0004);
    }

    #[test]
    fn agreement_within_tolerance_is_silent() {
        assert!(reconcile(&[bar("b", 101.00)], &[bar("a", 101.00)], 0.0001).is_empty());
    }
}
