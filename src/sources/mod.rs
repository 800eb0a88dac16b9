mod aws;

use crate::core::error::ClientError;
use crate::core::models::{CostAndUsageRequest, CostAndUsageResponse};
use crate::core::query::{QueryDescriptor, SlotId};
use crate::core::settings::{ClientSettings, Settings};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub use aws::CostExplorerClient;

#[async_trait]
pub trait BillingClient: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get_cost_and_usage(
        &self,
        request: &CostAndUsageRequest,
    ) -> Result<CostAndUsageResponse, ClientError>;
    /// Files whose changes should reset the retry state of this client's
    /// slots.
    fn credential_files(&self) -> Vec<PathBuf>;
    /// Drops any cached credentials so the next call resolves them again.
    async fn reload(&self) {}
}

pub type SourceFactory = fn(&ClientSettings) -> Result<Arc<dyn BillingClient>>;

/// A configured billing client together with the queries it runs.
pub struct Source {
    pub name: String,
    pub client: Arc<dyn BillingClient>,
    pub max_pages: Option<u32>,
    pub queries: Vec<(SlotId, Arc<QueryDescriptor>)>,
}

/// Name to factory map, built explicitly at the composition root.
pub struct SourceRegistry {
    factories: BTreeMap<&'static str, SourceFactory>,
}

impl SourceRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("aws", CostExplorerClient::from_settings);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: SourceFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn build(&self, name: &str, settings: &ClientSettings) -> Result<Arc<dyn BillingClient>> {
        let factory = self.factories.get(name).with_context(|| {
            format!(
                "Unsupported client: {name}. Supported: {}",
                self.names().join(", ")
            )
        })?;
        factory(settings).with_context(|| format!("Failed to create {name} client"))
    }

    pub fn resolve(&self, settings: &Settings) -> Result<Vec<Source>> {
        let mut sources = Vec::new();

        for (name, client_settings) in &settings.clients {
            let client = self.build(name, client_settings)?;
            let queries = client_settings
                .descriptors()
                .with_context(|| format!("Cannot build queries for client {name}"))?
                .into_iter()
                .enumerate()
                .map(|(index, descriptor)| (SlotId::new(name, index), Arc::new(descriptor)))
                .collect();

            tracing::info!(client = %name, "Initialized billing client");
            sources.push(Source {
                name: name.clone(),
                client,
                max_pages: client_settings.max_pages,
                queries,
            });
        }

        Ok(sources)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [[clients.aws.metrics]]
        granularity = "daily"
        metrics = ["UnblendedCost"]

        [[clients.aws.metrics]]
        granularity = "hourly"
        metrics = ["UsageQuantity"]

        [[clients.aws.metrics]]
        granularity = "monthly"
        metrics = ["NetAmortizedCost"]
    "#;

    fn scripted(_: &ClientSettings) -> Result<Arc<dyn BillingClient>> {
        Ok(Arc::new(testing::ScriptedClient::default()))
    }

    #[test]
    fn test_builtin_names() {
        assert_eq!(SourceRegistry::builtin().names(), vec!["aws"]);
    }

    #[test]
    fn test_resolve_creates_one_query_per_metric() {
        let mut registry = SourceRegistry::empty();
        registry.register("aws", scripted);

        let settings = Settings::from_toml(CONFIG).unwrap();
        let sources = registry.resolve(&settings).unwrap();

        assert_eq!(sources.len(), 1);
        let ids: Vec<String> = sources[0].queries.iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec!["aws_0", "aws_1", "aws_2"]);
    }

    #[test]
    fn test_unknown_client() {
        let settings = Settings::from_toml(
            r#"
            [[clients.gcp.metrics]]
            granularity = "daily"
            metrics = ["UnblendedCost"]
            "#,
        )
        .unwrap();

        let err = SourceRegistry::builtin().resolve(&settings).err().unwrap();
        assert_eq!(err.to_string(), "Unsupported client: gcp. Supported: aws");
    }
}
