use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::query::SlotId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DateInterval {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDefinition {
    #[serde(rename = "Type", alias = "type")]
    pub group_type: String,
    #[serde(rename = "Key", alias = "key")]
    pub key: String,
}

#[cfg(test)]
impl GroupDefinition {
    pub fn dimension(key: impl Into<String>) -> Self {
        Self {
            group_type: "DIMENSION".to_string(),
            key: key.into(),
        }
    }
}

/// Key/value matcher shared by the dimension, tag and cost category filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ValueMatcher {
    #[serde(default, alias = "key", skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, alias = "values", skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, alias = "match_options", skip_serializing_if = "Vec::is_empty")]
    pub match_options: Vec<String>,
}

impl ValueMatcher {
    fn is_empty(&self) -> bool {
        self.key.is_none() && self.values.is_empty() && self.match_options.is_empty()
    }
}

/// Filter expression sent with a billing query.
///
/// The upstream API rejects an expression with no operand set, so callers keep
/// it behind an `Option` and use [`Expression::is_empty`] to normalize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Expression {
    #[serde(default, alias = "or", skip_serializing_if = "Vec::is_empty")]
    pub or: Vec<Expression>,
    #[serde(default, alias = "and", skip_serializing_if = "Vec::is_empty")]
    pub and: Vec<Expression>,
    #[serde(default, alias = "not", skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<Expression>>,
    #[serde(default, alias = "dimensions", skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<ValueMatcher>,
    #[serde(default, alias = "tags", skip_serializing_if = "Option::is_none")]
    pub tags: Option<ValueMatcher>,
    #[serde(
        default,
        alias = "cost_categories",
        skip_serializing_if = "Option::is_none"
    )]
    pub cost_categories: Option<ValueMatcher>,
}

impl Expression {
    pub fn is_empty(&self) -> bool {
        let matcher_empty = |m: &Option<ValueMatcher>| m.as_ref().map_or(true, ValueMatcher::is_empty);

        self.or.is_empty()
            && self.and.is_empty()
            && self.not.is_none()
            && matcher_empty(&self.dimensions)
            && matcher_empty(&self.tags)
            && matcher_empty(&self.cost_categories)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CostAndUsageRequest {
    pub time_period: DateInterval,
    pub granularity: String,
    pub metrics: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<GroupDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Expression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricValue {
    pub amount: String,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Group {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricValue>,
}

impl Group {
    /// Dimension group name used as the `dimension` label.
    pub fn name(&self) -> String {
        self.keys.join("/")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultByTime {
    #[serde(default)]
    pub time_period: Option<DateInterval>,
    #[serde(default)]
    pub total: BTreeMap<String, MetricValue>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub estimated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CostAndUsageResponse {
    #[serde(default)]
    pub results_by_time: Vec<ResultByTime>,
    #[serde(default)]
    pub group_definitions: Vec<GroupDefinition>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl CostAndUsageResponse {
    pub fn continuation(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Every page returned for one completed poll cycle of one slot.
#[derive(Debug, Clone)]
pub struct RawResultSet {
    pub slot: SlotId,
    pub pages: Vec<CostAndUsageResponse>,
    pub fetched_at: DateTime<Utc>,
}

impl fmt::Display for GroupDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_type, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let json = r#"{
            "GroupDefinitions": [{"Type": "DIMENSION", "Key": "SERVICE"}],
            "ResultsByTime": [{
                "TimePeriod": {"Start": "2024-10-01", "End": "2024-10-02"},
                "Total": {},
                "Groups": [{
                    "Keys": ["Amazon DynamoDB"],
                    "Metrics": {"NetUnblendedCost": {"Amount": "0.0000012", "Unit": "USD"}}
                }],
                "Estimated": true
            }],
            "NextPageToken": "abc"
        }"#;

        let response: CostAndUsageResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.continuation(), Some("abc"));
        assert_eq!(response.group_definitions[0], GroupDefinition::dimension("SERVICE"));

        let bucket = &response.results_by_time[0];
        assert!(bucket.estimated);
        assert_eq!(bucket.groups[0].name(), "Amazon DynamoDB");
        assert_eq!(bucket.groups[0].metrics["NetUnblendedCost"].amount, "0.0000012");
    }

    #[test]
    fn test_empty_continuation_token_is_ignored() {
        let response = CostAndUsageResponse {
            next_page_token: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(response.continuation(), None);
    }

    #[test]
    fn test_request_omits_unset_fields() {
        let request = CostAndUsageRequest {
            time_period: DateInterval {
                start: "2024-10-01".to_string(),
                end: "2024-10-02".to_string(),
            },
            granularity: "DAILY".to_string(),
            metrics: vec!["UnblendedCost".to_string()],
            group_by: vec![GroupDefinition::dimension("SERVICE")],
            filter: None,
            next_page_token: None,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "TimePeriod": {"Start": "2024-10-01", "End": "2024-10-02"},
                "Granularity": "DAILY",
                "Metrics": ["UnblendedCost"],
                "GroupBy": [{"Type": "DIMENSION", "Key": "SERVICE"}]
            })
        );
    }

    #[test]
    fn test_expression_from_config_keys() {
        let toml = r#"
            [dimensions]
            key = "SERVICE"
            values = ["AWS Cost Explorer"]
        "#;

        let expr: Expression = toml::from_str(toml).unwrap();
        assert!(!expr.is_empty());

        let value = serde_json::to_value(&expr).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"Dimensions": {"Key": "SERVICE", "Values": ["AWS Cost Explorer"]}})
        );
    }

    #[test]
    fn test_default_expression_is_empty() {
        assert!(Expression::default().is_empty());

        let expr = Expression {
            tags: Some(ValueMatcher::default()),
            ..Default::default()
        };
        assert!(expr.is_empty());
    }
}
