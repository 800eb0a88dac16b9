use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::QueryError;
use crate::core::models::{CostAndUsageRequest, DateInterval, Expression, GroupDefinition};

pub const SUPPORTED_MEASURES: &[&str] = &[
    "AmortizedCost",
    "BlendedCost",
    "NetAmortizedCost",
    "NetUnblendedCost",
    "NormalizedUsageAmount",
    "UnblendedCost",
    "UsageQuantity",
];

const HOUR: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Monthly,
    Daily,
    Hourly,
}

impl Granularity {
    pub fn api_name(&self) -> &'static str {
        match self {
            Granularity::Monthly => "MONTHLY",
            Granularity::Daily => "DAILY",
            Granularity::Hourly => "HOURLY",
        }
    }

    /// How far back from `now` a request window starts.
    pub fn lookback(&self) -> chrono::Duration {
        match self {
            Granularity::Monthly => chrono::Duration::hours(730),
            Granularity::Daily => chrono::Duration::hours(24),
            Granularity::Hourly => chrono::Duration::hours(1),
        }
    }

    /// Delay between two successful polls of the same query.
    pub fn refresh_interval(&self) -> Duration {
        match self {
            Granularity::Hourly => HOUR,
            Granularity::Daily | Granularity::Monthly => 24 * HOUR,
        }
    }

    fn format_bound(&self, instant: DateTime<Utc>) -> String {
        match self {
            Granularity::Monthly | Granularity::Daily => instant.format("%Y-%m-%d").to_string(),
            Granularity::Hourly => instant.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

impl FromStr for Granularity {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "monthly" => Ok(Granularity::Monthly),
            "daily" => Ok(Granularity::Daily),
            "hourly" => Ok(Granularity::Hourly),
            _ => Err(QueryError::UnsupportedGranularity(s.to_string())),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Granularity::Monthly => "monthly",
            Granularity::Daily => "daily",
            Granularity::Hourly => "hourly",
        })
    }
}

/// Stable identifier of one configured query, displayed as
/// `<source>_<index>`. Orders by source, then by position in the config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    source: String,
    index: usize,
}

impl SlotId {
    pub fn new(source: &str, index: usize) -> Self {
        Self {
            source: source.to_string(),
            index,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.source, self.index)
    }
}

impl Serialize for SlotId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One fixed billing query shape. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryDescriptor {
    granularity: Granularity,
    measures: Vec<String>,
    group_by: Vec<GroupDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Expression>,
}

impl QueryDescriptor {
    pub fn new(
        granularity: &str,
        measures: Vec<String>,
        group_by: Vec<GroupDefinition>,
        filter: Option<Expression>,
    ) -> Result<Self, QueryError> {
        let granularity: Granularity = granularity.parse()?;

        if measures.is_empty() {
            return Err(QueryError::NoMeasures);
        }
        if let Some(bad) = measures
            .iter()
            .find(|m| !SUPPORTED_MEASURES.contains(&m.as_str()))
        {
            return Err(QueryError::UnsupportedMeasure(bad.clone()));
        }
        if group_by.iter().any(|g| g.key.trim().is_empty()) {
            return Err(QueryError::EmptyGroupKey);
        }

        let group_by = group_by
            .into_iter()
            .map(|g| GroupDefinition {
                group_type: g.group_type.to_ascii_uppercase(),
                key: g.key,
            })
            .collect();

        Ok(Self {
            granularity,
            measures,
            group_by,
            filter: filter.filter(|f| !f.is_empty()),
        })
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn measures(&self) -> &[String] {
        &self.measures
    }

    pub fn group_by(&self) -> &[GroupDefinition] {
        &self.group_by
    }

    pub fn filter(&self) -> Option<&Expression> {
        self.filter.as_ref()
    }

    pub fn build_request(&self, now: DateTime<Utc>) -> CostAndUsageRequest {
        let start = now - self.granularity.lookback();

        CostAndUsageRequest {
            time_period: DateInterval {
                start: self.granularity.format_bound(start),
                end: self.granularity.format_bound(now),
            },
            granularity: self.granularity.api_name().to_string(),
            metrics: self.measures.clone(),
            group_by: self.group_by.clone(),
            filter: self.filter.clone(),
            next_page_token: None,
        }
    }
}
