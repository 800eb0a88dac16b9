use std::num::ParseFloatError;
use thiserror::Error;

use crate::core::query::SlotId;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unsupported granularity: {0}. Supported: monthly, daily, hourly")]
    UnsupportedGranularity(String),

    #[error("unsupported metric type: {0}. Supported: {supported}", supported = crate::core::query::SUPPORTED_MEASURES.join(", "))]
    UnsupportedMeasure(String),

    #[error("at least one metric is required")]
    NoMeasures,

    #[error("group_by entries need a non-empty key")]
    EmptyGroupKey,

    #[error("billing query failed: {0}")]
    Transient(#[from] ClientError),

    #[error("billing query returned an empty response")]
    EmptyResponse,

    #[error("poll task did not complete: {0}")]
    Aborted(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("API error ({code}): {message}")]
    Api { code: String, message: String },

    #[error("request failed: {0}")]
    Sdk(String),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("slot {slot} exceeded its retry budget after {failures} consecutive failures")]
    RetryBudgetExceeded { slot: SlotId, failures: u32 },
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("cannot parse amount {amount:?} of {measure} for {dimension}: {source}")]
    AmountParse {
        measure: String,
        dimension: String,
        amount: String,
        #[source]
        source: ParseFloatError,
    },

    #[error("cannot encode metrics: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("exposition is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("no cache entry for {0}")]
    Missing(String),

    #[error("cache entry {key} holds {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}
