pub mod aws;
pub mod azure;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod latest;
pub mod rackspace;
pub mod runner;

use cloudmon_common::{Provider, ResourceMetricsRecord, StageErrors};
use config::CloudConfig;
use credentials::CredentialCatalog;
use error::{CloudError, Result};
use http::RetryingHttpClient;
use std::sync::Arc;

/// Everything one provider run produced, ready to be committed.
#[derive(Debug, Clone)]
pub struct CollectionReport {
    pub provider: Provider,
    pub records: Vec<ResourceMetricsRecord>,
    pub resources_discovered: usize,
    pub resources_processed: usize,
    pub errors: StageErrors,
    pub truncated: bool,
}

impl CollectionReport {
    pub fn empty(provider: Provider) -> Self {
        Self {
            provider,
            records: Vec::new(),
            resources_discovered: 0,
            resources_processed: 0,
            errors: StageErrors::default(),
            truncated: false,
        }
    }
}

/// Two-phase collector implemented once per provider.
///
/// `discover` enumerates resources (and whatever provider-specific plan the
/// second phase needs); `collect_metrics` fetches the latest samples for
/// them. Unit- and resource-level failures are folded into the report;
/// only provider-wide failures return `Err`.
#[async_trait::async_trait]
pub trait Collector: Send + Sync {
    type Discovery: Send;

    fn provider(&self) -> Provider;

    /// Whether usable credentials exist for this provider.
    fn is_configured(&self) -> bool;

    async fn discover(&self) -> Result<Self::Discovery>;

    async fn collect_metrics(&self, discovery: Self::Discovery) -> Result<CollectionReport>;
}

/// Object-safe view of a [`Collector`], used by the orchestrator.
#[async_trait::async_trait]
pub trait ProviderCollector: Send + Sync {
    fn provider(&self) -> Provider;

    fn is_configured(&self) -> bool;

    /// Discover and collect in one go.
    async fn collect(&self) -> Result<CollectionReport>;
}

#[async_trait::async_trait]
impl<C: Collector> ProviderCollector for C {
    fn provider(&self) -> Provider {
        Collector::provider(self)
    }

    fn is_configured(&self) -> bool {
        Collector::is_configured(self)
    }

    async fn collect(&self) -> Result<CollectionReport> {
        if !Collector::is_configured(self) {
            return Err(CloudError::NotConfigured(Collector::provider(self)));
        }
        let discovery = self.discover().await?;
        self.collect_metrics(discovery).await
    }
}

/// Build one collector per provider from configuration.
///
/// Providers without usable credentials still get a collector; it reports
/// itself as not configured.
pub fn build_collectors(
    config: &CloudConfig,
    http: RetryingHttpClient,
) -> Vec<Arc<dyn ProviderCollector>> {
    let catalog = CredentialCatalog::from_config(config);

    Provider::ALL
        .iter()
        .map(|provider| -> Arc<dyn ProviderCollector> {
            match provider {
                Provider::Azure => Arc::new(azure::AzureCollector::new(
                    config.azure.clone(),
                    catalog.accounts(Provider::Azure).into_iter().next(),
                    http.clone(),
                )),
                Provider::Aws => Arc::new(aws::AwsCollector::new(
                    config.aws.clone().unwrap_or_default(),
                    catalog.accounts(Provider::Aws),
                    http.clone(),
                )),
                Provider::Rackspace => Arc::new(rackspace::RackspaceCollector::new(
                    config.rackspace.clone().unwrap_or_default(),
                    catalog.accounts(Provider::Rackspace),
                    http.clone(),
                )),
            }
        })
        .collect()
}
