use std::collections::BTreeMap;

use crate::core::error::ConvertError;
use crate::core::models::{MetricValue, RawResultSet};

/// Dimension name for bucket totals of queries without a group-by.
pub const TOTAL_DIMENSION: &str = "total";

/// measure -> dimension group -> amount
pub type SeriesMap = BTreeMap<String, BTreeMap<String, f64>>;

pub fn series_count(series: &SeriesMap) -> usize {
    series.values().map(BTreeMap::len).sum()
}

fn parse_amount(measure: &str, dimension: &str, value: &MetricValue) -> Result<f64, ConvertError> {
    value
        .amount
        .trim()
        .parse::<f64>()
        .map_err(|source| ConvertError::AmountParse {
            measure: measure.to_string(),
            dimension: dimension.to_string(),
            amount: value.amount.clone(),
            source,
        })
}

/// Merges every page of every set into one series map.
///
/// Values for the same measure and dimension are not summed: the last one
/// visited replaces earlier ones. Sets are visited in the order given, pages
/// and buckets in the order the API returned them.
pub fn flatten<'a, I>(sets: I) -> Result<SeriesMap, ConvertError>
where
    I: IntoIterator<Item = &'a RawResultSet>,
{
    let mut series = SeriesMap::new();
    let mut insert = |measure: &str,
                      dimension: &str,
                      value: &MetricValue|
     -> Result<(), ConvertError> {
        let amount = parse_amount(measure, dimension, value)?;
        series
            .entry(measure.to_string())
            .or_default()
            .insert(dimension.to_string(), amount);
        Ok(())
    };

    for set in sets {
        for page in &set.pages {
            for bucket in &page.results_by_time {
                if bucket.groups.is_empty() {
                    for (measure, value) in &bucket.total {
                        insert(measure, TOTAL_DIMENSION, value)?;
                    }
                    continue;
                }

                for group in &bucket.groups {
                    let dimension = group.name();
                    for (measure, value) in &group.metrics {
                        insert(measure, &dimension, value)?;
                    }
                }
            }
        }
    }

    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{CostAndUsageResponse, Group, ResultByTime};
    use crate::core::query::SlotId;
    use crate::sources::testing::{group, page};
    use chrono::Utc;

    fn set(index: usize, pages: Vec<CostAndUsageResponse>) -> RawResultSet {
        RawResultSet {
            slot: SlotId::new("aws", index),
            pages,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_last_value_wins() {
        let first = set(0, vec![page(vec![group("Amazon S3", &[("NetUnblendedCost", "5")])], None)]);
        let second = set(1, vec![page(vec![group("Amazon S3", &[("NetUnblendedCost", "7")])], None)]);

        let series = flatten([&first, &second]).unwrap();
        assert_eq!(series["NetUnblendedCost"]["Amazon S3"], 7.0);
        assert_eq!(series_count(&series), 1);
    }

    #[test]
    fn test_later_pages_win_within_a_set() {
        let raw = set(
            0,
            vec![
                page(vec![group("Amazon S3", &[("NetUnblendedCost", "5")])], Some("next")),
                page(vec![group("Amazon S3", &[("NetUnblendedCost", "7")])], None),
            ],
        );

        let series = flatten([&raw]).unwrap();
        assert_eq!(series["NetUnblendedCost"]["Amazon S3"], 7.0);
    }

    #[test]
    fn test_totals_without_groups() {
        let mut response = page(vec![], None);
        response.results_by_time[0].total.insert(
            "UnblendedCost".to_string(),
            MetricValue {
                amount: "12.5".to_string(),
                unit: Some("USD".to_string()),
            },
        );

        let series = flatten([&set(0, vec![response])]).unwrap();
        assert_eq!(series["UnblendedCost"][TOTAL_DIMENSION], 12.5);
    }

    #[test]
    fn test_multi_key_groups() {
        let response = CostAndUsageResponse {
            results_by_time: vec![ResultByTime {
                time_period: None,
                total: Default::default(),
                groups: vec![Group {
                    keys: vec!["Amazon EC2".to_string(), "eu-west-1".to_string()],
                    ..group("", &[("UsageQuantity", "3")])
                }],
                estimated: false,
            }],
            ..Default::default()
        };

        let series = flatten([&set(0, vec![response])]).unwrap();
        assert_eq!(series["UsageQuantity"]["Amazon EC2/eu-west-1"], 3.0);
    }

    #[test]
    fn test_bad_amount_fails_the_pass() {
        let raw = set(
            0,
            vec![page(
                vec![
                    group("ok", &[("NetUnblendedCost", "1")]),
                    group("broken", &[("NetUnblendedCost", "1,5")]),
                ],
                None,
            )],
        );

        let err = flatten([&raw]).unwrap_err();
        assert!(err.to_string().contains("\"1,5\""));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_empty_pages_are_skipped() {
        let raw = set(0, vec![CostAndUsageResponse::default()]);
        assert!(flatten([&raw]).unwrap().is_empty());
    }
}
