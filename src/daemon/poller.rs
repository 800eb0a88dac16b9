use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

use crate::core::cache::{keys, CacheValue, MetricsCache};
use crate::core::error::QueryError;
use crate::core::models::RawResultSet;
use crate::core::query::{QueryDescriptor, SlotId};
use crate::daemon::self_metrics::SelfMetrics;
use crate::sources::BillingClient;

/// Runs one query against a billing client and stores the result.
#[derive(Clone)]
pub struct Poller {
    client: Arc<dyn BillingClient>,
    cache: MetricsCache,
    metrics: SelfMetrics,
    max_pages: Option<u32>,
}

impl Poller {
    pub fn new(
        client: Arc<dyn BillingClient>,
        cache: MetricsCache,
        metrics: SelfMetrics,
        max_pages: Option<u32>,
    ) -> Self {
        Self {
            client,
            cache,
            metrics,
            max_pages,
        }
    }

    /// Fetches every page of the query. Nothing is written anywhere.
    pub async fn fetch(
        &self,
        slot: &SlotId,
        descriptor: &QueryDescriptor,
        now: DateTime<Utc>,
    ) -> Result<RawResultSet, QueryError> {
        let mut request = descriptor.build_request(now);
        let mut pages = Vec::new();

        loop {
            let page = self.client.get_cost_and_usage(&request).await?;
            let next = page.continuation().map(str::to_string);
            pages.push(page);

            let Some(token) = next else {
                break;
            };
            if self
                .max_pages
                .is_some_and(|max| pages.len() >= max as usize)
            {
                tracing::warn!(
                    slot = %slot,
                    pages = pages.len(),
                    "Page limit reached, dropping remaining results"
                );
                break;
            }
            request.next_page_token = Some(token);
        }

        if pages.iter().all(|page| page.results_by_time.is_empty()) {
            return Err(QueryError::EmptyResponse);
        }

        Ok(RawResultSet {
            slot: slot.clone(),
            pages,
            fetched_at: now,
        })
    }

    /// Polls once. On success the slot's raw entry is replaced, on failure
    /// the cache is left alone so readers keep the last good data.
    pub async fn poll(&self, slot: &SlotId, descriptor: &QueryDescriptor) -> Result<(), QueryError> {
        let started = Instant::now();
        let result = self.fetch(slot, descriptor, Utc::now()).await;
        self.metrics.record_call(result.is_ok(), started.elapsed());

        let set = result?;
        tracing::info!(
            slot = %slot,
            client = self.client.name(),
            pages = set.pages.len(),
            fetched_at = %set.fetched_at,
            "Fetched billing data"
        );
        self.cache.put(keys::raw(slot), CacheValue::Raw(Arc::new(set)));
        Ok(())
    }

    pub async fn reload_client(&self) {
        self.client.reload().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{Expression, ValueMatcher};
    use crate::sources::testing::{api_error, group, ok_page, page, ScriptedClient};

    fn descriptor(filter: Option<Expression>) -> QueryDescriptor {
        QueryDescriptor::new("daily", vec!["NetUnblendedCost".to_string()], vec![], filter).unwrap()
    }

    fn poller(client: Arc<ScriptedClient>, max_pages: Option<u32>) -> (Poller, MetricsCache, SelfMetrics) {
        let cache = MetricsCache::new();
        let metrics = SelfMetrics::new().unwrap();
        (
            Poller::new(client, cache.clone(), metrics.clone(), max_pages),
            cache,
            metrics,
        )
    }

    #[tokio::test]
    async fn test_follows_continuation_tokens() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(page(vec![group("a", &[("NetUnblendedCost", "1")])], Some("p2"))),
            Ok(page(vec![group("b", &[("NetUnblendedCost", "2")])], Some("p3"))),
            Ok(page(vec![group("c", &[("NetUnblendedCost", "3")])], None)),
        ]));
        let (poller, _, _) = poller(client.clone(), None);

        let slot = SlotId::new("aws", 0);
        let set = poller.fetch(&slot, &descriptor(None), Utc::now()).await.unwrap();

        assert_eq!(set.pages.len(), 3);
        let tokens: Vec<Option<String>> = client
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.next_page_token.clone())
            .collect();
        assert_eq!(tokens, vec![None, Some("p2".to_string()), Some("p3".to_string())]);
    }

    #[tokio::test]
    async fn test_page_cap() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(page(vec![group("a", &[])], Some("p2"))),
            Ok(page(vec![group("b", &[])], Some("p3"))),
        ]));
        let (poller, _, _) = poller(client.clone(), Some(2));

        let set = poller
            .fetch(&SlotId::new("aws", 0), &descriptor(None), Utc::now())
            .await
            .unwrap();

        assert_eq!(set.pages.len(), 2);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_token_ends_pagination() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(page(vec![group("a", &[])], Some("")))]));
        let (poller, _, _) = poller(client.clone(), None);

        poller
            .fetch(&SlotId::new("aws", 0), &descriptor(None), Utc::now())
            .await
            .unwrap();
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_success_writes_raw_entry() {
        let client = Arc::new(ScriptedClient::new(vec![ok_page()]));
        let (poller, cache, metrics) = poller(client, None);
        let slot = SlotId::new("aws", 3);

        poller.poll(&slot, &descriptor(None)).await.unwrap();

        let entry = cache.get("raw:aws_3").unwrap();
        let set = entry.as_raw("raw:aws_3").unwrap();
        assert_eq!(set.slot, slot);
        assert_eq!(set.pages.len(), 1);
        assert_eq!(metrics.calls("success"), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_data() {
        let client = Arc::new(ScriptedClient::new(vec![ok_page(), Err(api_error())]));
        let (poller, cache, metrics) = poller(client, None);
        let slot = SlotId::new("aws", 0);

        poller.poll(&slot, &descriptor(None)).await.unwrap();
        let first = Arc::clone(cache.get("raw:aws_0").unwrap().as_raw("raw:aws_0").unwrap());

        let err = poller.poll(&slot, &descriptor(None)).await.unwrap_err();
        assert!(matches!(err, QueryError::Transient(_)));
        let kept = cache.get("raw:aws_0").unwrap();
        assert!(Arc::ptr_eq(kept.as_raw("raw:aws_0").unwrap(), &first));
        assert_eq!(metrics.calls("success"), 1);
        assert_eq!(metrics.calls("failure"), 1);
    }

    #[tokio::test]
    async fn test_empty_response_is_a_failure() {
        let mut empty = page(vec![], None);
        empty.results_by_time.clear();
        let client = Arc::new(ScriptedClient::new(vec![Ok(empty)]));
        let (poller, cache, _) = poller(client, None);

        let err = poller
            .poll(&SlotId::new("aws", 0), &descriptor(None))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::EmptyResponse));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_filter_is_sent() {
        let filter = Expression {
            dimensions: Some(ValueMatcher {
                key: Some("SERVICE".to_string()),
                values: vec!["Amazon DynamoDB".to_string()],
                match_options: vec![],
            }),
            ..Default::default()
        };
        let client = Arc::new(ScriptedClient::new(vec![ok_page()]));
        let (poller, _, _) = poller(client.clone(), None);

        poller
            .poll(&SlotId::new("aws", 0), &descriptor(Some(filter.clone())))
            .await
            .unwrap();

        assert_eq!(client.requests.lock().unwrap()[0].filter, Some(filter));
    }
}
