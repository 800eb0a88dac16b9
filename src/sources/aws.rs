use anyhow::Result;
use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_costexplorer::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_costexplorer::operation::get_cost_and_usage::{
    GetCostAndUsageError, GetCostAndUsageOutput,
};
use aws_sdk_costexplorer::types as ce;
use aws_sdk_costexplorer::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::error::ClientError;
use crate::core::models::{
    CostAndUsageRequest, CostAndUsageResponse, DateInterval, Expression, Group, GroupDefinition,
    MetricValue, ResultByTime, ValueMatcher,
};
use crate::core::settings::ClientSettings;
use crate::sources::BillingClient;

const SESSION_NAME: &str = "cost-meter";

/// Cost Explorer `GetCostAndUsage` through the AWS SDK.
///
/// Credentials come from the SDK's default chain: environment, shared
/// config and credentials files (profiles, SSO), web identity, ECS and
/// IMDS. With `assume_role` set, the resolved identity assumes that role
/// through STS. The SDK client is built on first use and rebuilt after
/// [`BillingClient::reload`].
pub struct CostExplorerClient {
    settings: ClientSettings,
    sdk: Mutex<Option<Client>>,
}

impl CostExplorerClient {
    pub fn new(settings: &ClientSettings) -> Self {
        Self {
            settings: settings.clone(),
            sdk: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Arc<dyn BillingClient>> {
        Ok(Arc::new(Self::new(settings)))
    }

    async fn sdk(&self) -> Client {
        let mut sdk = self.sdk.lock().await;
        if let Some(client) = sdk.as_ref() {
            return client.clone();
        }

        let client = build_sdk_client(&self.settings).await;
        tracing::debug!(
            region = %self.settings.region,
            assume_role = ?self.settings.assume_role,
            "Built Cost Explorer client"
        );
        *sdk = Some(client.clone());
        client
    }
}

async fn load_sdk_config(settings: &ClientSettings) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(settings.region.clone()))
        .timeout_config(
            TimeoutConfig::builder()
                .operation_timeout(settings.request_timeout())
                .build(),
        );
    if let Some(profile) = &settings.profile {
        loader = loader.profile_name(profile);
    }
    loader.load().await
}

async fn build_sdk_client(settings: &ClientSettings) -> Client {
    let config = load_sdk_config(settings).await;
    let mut builder = aws_sdk_costexplorer::config::Builder::from(&config);

    if let Some(role) = &settings.assume_role {
        let provider = AssumeRoleProvider::builder(role)
            .session_name(SESSION_NAME)
            .configure(&config)
            .build()
            .await;
        builder = builder.credentials_provider(provider);
    }
    if let Some(endpoint) = &settings.endpoint {
        builder = builder.endpoint_url(endpoint);
    }

    Client::from_conf(builder.build())
}

/// Shared credentials and config files, honoring the SDK's env overrides.
fn shared_files() -> Vec<PathBuf> {
    let home_file = |name: &str| {
        dirs::home_dir()
            .map(|home| home.join(".aws").join(name))
            .unwrap_or_else(|| PathBuf::from(".aws").join(name))
    };

    vec![
        std::env::var_os("AWS_SHARED_CREDENTIALS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_file("credentials")),
        std::env::var_os("AWS_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_file("config")),
    ]
}

fn matcher_values(matcher: &ValueMatcher) -> (Option<Vec<String>>, Option<Vec<ce::MatchOption>>) {
    let values = (!matcher.values.is_empty()).then(|| matcher.values.clone());
    let options = (!matcher.match_options.is_empty()).then(|| {
        matcher
            .match_options
            .iter()
            .map(|option| ce::MatchOption::from(option.as_str()))
            .collect()
    });
    (values, options)
}

fn sdk_expression(expr: &Expression) -> ce::Expression {
    let mut builder = ce::Expression::builder();

    for operand in &expr.or {
        builder = builder.or(sdk_expression(operand));
    }
    for operand in &expr.and {
        builder = builder.and(sdk_expression(operand));
    }
    if let Some(not) = &expr.not {
        builder = builder.not(sdk_expression(not));
    }

    if let Some(matcher) = &expr.dimensions {
        let (values, options) = matcher_values(matcher);
        builder = builder.dimensions(
            ce::DimensionValues::builder()
                .set_key(matcher.key.as_deref().map(ce::Dimension::from))
                .set_values(values)
                .set_match_options(options)
                .build(),
        );
    }
    if let Some(matcher) = &expr.tags {
        let (values, options) = matcher_values(matcher);
        builder = builder.tags(
            ce::TagValues::builder()
                .set_key(matcher.key.clone())
                .set_values(values)
                .set_match_options(options)
                .build(),
        );
    }
    if let Some(matcher) = &expr.cost_categories {
        let (values, options) = matcher_values(matcher);
        builder = builder.cost_categories(
            ce::CostCategoryValues::builder()
                .set_key(matcher.key.clone())
                .set_values(values)
                .set_match_options(options)
                .build(),
        );
    }

    builder.build()
}

fn sdk_group_definition(group: &GroupDefinition) -> ce::GroupDefinition {
    ce::GroupDefinition::builder()
        .r#type(ce::GroupDefinitionType::from(group.group_type.as_str()))
        .key(group.key.clone())
        .build()
}

fn metric_values(
    metrics: Option<&std::collections::HashMap<String, ce::MetricValue>>,
) -> std::collections::BTreeMap<String, MetricValue> {
    metrics
        .into_iter()
        .flatten()
        .map(|(name, value)| {
            (
                name.clone(),
                MetricValue {
                    amount: value.amount().unwrap_or_default().to_string(),
                    unit: value.unit().map(str::to_string),
                },
            )
        })
        .collect()
}

fn from_sdk_output(output: &GetCostAndUsageOutput) -> CostAndUsageResponse {
    let results_by_time = output
        .results_by_time()
        .iter()
        .map(|bucket| ResultByTime {
            time_period: bucket.time_period().map(|period| DateInterval {
                start: period.start().to_string(),
                end: period.end().to_string(),
            }),
            total: metric_values(bucket.total()),
            groups: bucket
                .groups()
                .iter()
                .map(|group| Group {
                    keys: group.keys().to_vec(),
                    metrics: metric_values(group.metrics()),
                })
                .collect(),
            estimated: bucket.estimated(),
        })
        .collect();

    let group_definitions = output
        .group_definitions()
        .iter()
        .map(|definition| GroupDefinition {
            group_type: definition
                .r#type()
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            key: definition.key().unwrap_or_default().to_string(),
        })
        .collect();

    CostAndUsageResponse {
        results_by_time,
        group_definitions,
        next_page_token: output.next_page_token().map(str::to_string),
    }
}

fn sdk_error<R: std::fmt::Debug + 'static>(err: SdkError<GetCostAndUsageError, R>) -> ClientError {
    match err.as_service_error() {
        Some(service) => ClientError::Api {
            code: service.code().unwrap_or("Unknown").to_string(),
            message: service.message().unwrap_or_default().to_string(),
        },
        None => ClientError::Sdk(DisplayErrorContext(&err).to_string()),
    }
}

#[async_trait]
impl BillingClient for CostExplorerClient {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn get_cost_and_usage(
        &self,
        request: &CostAndUsageRequest,
    ) -> Result<CostAndUsageResponse, ClientError> {
        let time_period = ce::DateInterval::builder()
            .start(&request.time_period.start)
            .end(&request.time_period.end)
            .build()
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

        let output = self
            .sdk()
            .await
            .get_cost_and_usage()
            .time_period(time_period)
            .granularity(ce::Granularity::from(request.granularity.as_str()))
            .set_metrics(Some(request.metrics.clone()))
            .set_group_by(
                (!request.group_by.is_empty())
                    .then(|| request.group_by.iter().map(sdk_group_definition).collect()),
            )
            .set_filter(request.filter.as_ref().map(sdk_expression))
            .set_next_page_token(request.next_page_token.clone())
            .send()
            .await
            .map_err(sdk_error)?;

        Ok(from_sdk_output(&output))
    }

    fn credential_files(&self) -> Vec<PathBuf> {
        shared_files()
    }

    async fn reload(&self) {
        if self.sdk.lock().await.take().is_some() {
            tracing::debug!("Dropped cached Cost Explorer client");
        }
    }
}
