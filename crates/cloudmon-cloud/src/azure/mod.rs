//! Azure collector.
//!
//! Discovery lists the tenant's enabled subscriptions and runs one Resource
//! Graph query across them, falling back to plain ARM listing per
//! subscription when the graph is unavailable. Collection looks up metric
//! definitions once per resource type per run, reads metric values in
//! namespace-scoped batches and tops up VMs with their provisioned memory.

pub mod auth;
mod cache;
pub mod discovery;
pub mod metrics;
pub mod vm_sizes;

pub use cache::OnceCache;
pub use discovery::{AzureResource, Subscription};

use crate::config::AzureConfig;
use crate::credentials::{CloudAccount, Credentials};
use crate::error::{CloudError, Result};
use crate::http::RetryingHttpClient;
use crate::runner::map_with_concurrency;
use crate::{CollectionReport, Collector};
use auth::TokenCache;
use chrono::{DateTime, Utc};
use cloudmon_common::{MetricSample, Provider, ResourceDescriptor, ResourceMetricsRecord, StageErrors};
use metrics::DefinitionCache;
use std::time::Duration;
use vm_sizes::SizeCatalog;

pub struct AzureCollector {
    config: Option<AzureConfig>,
    account: Option<CloudAccount>,
    http: RetryingHttpClient,
    tokens: TokenCache,
}

/// Lookups shared by the resources of one collection run. Dropped with the
/// run so definition or size changes are picked up on the next one.
#[derive(Default)]
struct RunCaches {
    definitions: DefinitionCache,
    vm_sizes: OnceCache<(String, String), SizeCatalog>,
}

#[derive(Debug)]
pub struct AzureDiscovery {
    pub subscriptions: Vec<Subscription>,
    pub resources: Vec<AzureResource>,
    /// Summary records for subscriptions whose fallback listing failed.
    pub failures: Vec<ResourceMetricsRecord>,
    pub fetched_at: DateTime<Utc>,
    pub truncated: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct ResourceOutcome {
    definitions_failed: bool,
    metrics_failed: bool,
}

struct Settings<'a> {
    config: &'a AzureConfig,
    account: &'a CloudAccount,
    tenant_id: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
}

impl AzureCollector {
    pub fn new(
        config: Option<AzureConfig>,
        account: Option<CloudAccount>,
        http: RetryingHttpClient,
    ) -> Self {
        let buffer = config
            .as_ref()
            .map(|c| c.token_refresh_buffer_secs)
            .unwrap_or(120);
        Self {
            config,
            account,
            http,
            tokens: TokenCache::new(buffer),
        }
    }

    fn settings(&self) -> Result<Settings<'_>> {
        let (Some(config), Some(account)) = (&self.config, &self.account) else {
            return Err(CloudError::NotConfigured(Provider::Azure));
        };
        let Credentials::AzureClientSecret {
            tenant_id,
            client_id,
            client_secret,
        } = &account.credentials
        else {
            return Err(CloudError::Config(
                "Azure account does not carry a client secret".to_string(),
            ));
        };
        Ok(Settings {
            config,
            account,
            tenant_id,
            client_id,
            client_secret,
        })
    }

    fn arm_url(config: &AzureConfig) -> &str {
        config.resource_manager_url.trim_end_matches('/')
    }

    async fn token(&self) -> Result<String> {
        let settings = self.settings()?;
        let scope = format!("{}/.default", Self::arm_url(settings.config));
        self.tokens
            .get_or_refresh(|| {
                auth::request_token(
                    &self.http,
                    &settings.config.authority_host,
                    settings.tenant_id,
                    settings.client_id,
                    settings.client_secret,
                    &scope,
                )
            })
            .await
    }

    /// Fallback discovery, one ARM listing per subscription.
    async fn list_per_subscription(
        &self,
        config: &AzureConfig,
        token: &str,
        subscriptions: &[Subscription],
        fetched_at: DateTime<Utc>,
    ) -> Result<(Vec<AzureResource>, Vec<ResourceMetricsRecord>)> {
        let arm_url = Self::arm_url(config);
        let listings = map_with_concurrency(
            subscriptions.to_vec(),
            config.concurrency,
            |subscription| async move {
                let listing = discovery::list_subscription_resources(
                    &self.http,
                    arm_url,
                    token,
                    &subscription,
                    config.page_size,
                )
                .await;
                (subscription, listing)
            },
        )
        .await;

        let mut resources = Vec::new();
        let mut failures = Vec::new();
        let mut last_error = String::new();
        for (subscription, listing) in listings {
            match listing {
                Ok(found) => resources.extend(found),
                Err(e) => {
                    tracing::warn!(
                        "Failed to list resources in subscription {}: {}",
                        subscription.id,
                        e
                    );
                    last_error = format!("resource listing failed: {e}");
                    failures.push(ResourceMetricsRecord::unit_failure(
                        self.subscription_descriptor(&subscription),
                        fetched_at,
                        last_error.clone(),
                    ));
                }
            }
        }

        if failures.len() == subscriptions.len() {
            return Err(CloudError::Discovery {
                provider: Provider::Azure,
                message: format!(
                    "all {} subscriptions failed; last error: {last_error}",
                    subscriptions.len()
                ),
            });
        }
        Ok((resources, failures))
    }

    fn account_id(&self) -> String {
        self.account
            .as_ref()
            .map(|a| a.account_id.clone())
            .unwrap_or_default()
    }

    fn subscription_descriptor(&self, subscription: &Subscription) -> ResourceDescriptor {
        let mut descriptor = ResourceDescriptor::new(
            Provider::Azure,
            format!("/subscriptions/{}", subscription.id),
            subscription.display_name.clone(),
            "microsoft.resources/subscriptions",
            self.account_id(),
        );
        descriptor.subscription_id = Some(subscription.id.clone());
        descriptor.metadata.insert("synthetic".into(), true.into());
        descriptor
    }

    fn resource_descriptor(&self, resource: &AzureResource) -> ResourceDescriptor {
        let mut descriptor = ResourceDescriptor::new(
            Provider::Azure,
            resource.id.clone(),
            resource.name.clone(),
            resource.resource_type.clone(),
            self.account_id(),
        );
        descriptor.subscription_id = resource.subscription_id.clone();
        descriptor.resource_group = resource.resource_group.clone();
        descriptor.location = resource.location.clone();
        for (key, value) in [
            ("kind", &resource.kind),
            ("sku", &resource.sku),
            ("vm_size", &resource.vm_size),
        ] {
            if let Some(value) = value {
                descriptor.metadata.insert(key.into(), value.clone().into());
            }
        }
        descriptor
    }

    /// Read one chunk. A namespace-scoped read rejected as a client error is
    /// retried once without the namespace. The token is looked up per chunk
    /// so a long run refreshes it before expiry.
    async fn read_chunk(
        &self,
        config: &AzureConfig,
        resource: &AzureResource,
        namespace: Option<&str>,
        names: &[String],
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<Vec<MetricSample>> {
        let token = self.token().await?;
        let token = token.as_str();
        let arm_url = Self::arm_url(config);
        let (start, end) = window;
        let scoped = metrics::read_metrics(
            &self.http, arm_url, token, &resource.id, namespace, names, start, end,
        )
        .await;

        match scoped {
            Err(e) if namespace.is_some() && e.is_client_error() => {
                tracing::debug!(
                    "Metrics read for {} rejected with namespace {:?}, retrying unscoped: {}",
                    resource.id,
                    namespace,
                    e
                );
                let mut samples = metrics::read_metrics(
                    &self.http, arm_url, token, &resource.id, None, names, start, end,
                )
                .await?;
                for sample in &mut samples {
                    sample.namespace = namespace.map(str::to_string);
                }
                Ok(samples)
            }
            other => other,
        }
    }

    async fn collect_resource(
        &self,
        config: &AzureConfig,
        caches: &RunCaches,
        resource: &AzureResource,
        window: (DateTime<Utc>, DateTime<Utc>),
        fetched_at: DateTime<Utc>,
    ) -> (ResourceMetricsRecord, ResourceOutcome) {
        let mut record = ResourceMetricsRecord::new(self.resource_descriptor(resource), fetched_at);
        let mut outcome = ResourceOutcome::default();
        let arm_url = Self::arm_url(config);

        let definitions = match caches
            .definitions
            .get_or_fetch(resource.resource_type.clone(), || async {
                let token = self.token().await?;
                metrics::fetch_definitions(&self.http, arm_url, &token, &resource.id).await
            })
            .await
        {
            Ok(definitions) => definitions,
            Err(e) => {
                outcome.definitions_failed = true;
                record.metadata.error = Some(format!("metric definitions unavailable: {e}"));
                return (record, outcome);
            }
        };

        let mut first_failure: Option<String> = None;
        let chunks = metrics::plan_chunks(&definitions, config.metric_batch_size);
        for (i, (namespace, names)) in chunks.iter().enumerate() {
            if i > 0 && config.chunk_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(config.chunk_delay_ms)).await;
            }
            match self
                .read_chunk(config, resource, namespace.as_deref(), names, window)
                .await
            {
                Ok(samples) => record.metrics.extend(samples),
                Err(e) => {
                    let message = format!("metrics [{}]: {e}", names.join(","));
                    record.metadata.push_warning(message.clone());
                    first_failure.get_or_insert(message);
                }
            }
        }

        if let Some(failure) = first_failure {
            outcome.metrics_failed = true;
            if record.metrics.is_empty() {
                record.metadata.error = Some(failure);
            }
        }

        if resource.is_virtual_machine() && !vm_sizes::has_native_memory_metric(&record.metrics) {
            self.add_provisioned_memory(config, caches, resource, &mut record)
                .await;
        }

        (record, outcome)
    }

    async fn add_provisioned_memory(
        &self,
        config: &AzureConfig,
        caches: &RunCaches,
        resource: &AzureResource,
        record: &mut ResourceMetricsRecord,
    ) {
        let (Some(size), Some(subscription), Some(location)) = (
            resource.vm_size.as_deref(),
            resource.subscription_id.as_deref(),
            resource.location.as_deref(),
        ) else {
            return;
        };
        let arm_url = Self::arm_url(config);
        let location = location.to_lowercase();
        let key = (subscription.to_lowercase(), location.clone());

        let catalog = caches
            .vm_sizes
            .get_or_fetch(key, || async {
                let token = self.token().await?;
                vm_sizes::fetch_size_catalog(&self.http, arm_url, &token, subscription, &location)
                    .await
            })
            .await;

        match catalog {
            Ok(catalog) => match catalog.get(&size.to_lowercase()).and_then(|memory_mb| {
                vm_sizes::provisioned_memory_sample(*memory_mb, record.fetched_at)
            }) {
                Some(sample) => record.metrics.push(sample),
                None => record
                    .metadata
                    .push_warning(format!("vm size {size} not found in {location} size catalog")),
            },
            Err(e) => record
                .metadata
                .push_warning(format!("vm size catalog unavailable: {e}")),
        }
    }
}

#[async_trait::async_trait]
impl Collector for AzureCollector {
    type Discovery = AzureDiscovery;

    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn is_configured(&self) -> bool {
        self.config.is_some() && self.account.is_some()
    }

    async fn discover(&self) -> Result<AzureDiscovery> {
        let settings = self.settings()?;
        let config = settings.config;
        let arm_url = Self::arm_url(config);
        let fetched_at = Utc::now();
        let token = self.token().await?;

        let subscriptions =
            discovery::list_subscriptions(&self.http, arm_url, &token, &config.subscription_ids)
                .await
                .map_err(|e| CloudError::Discovery {
                    provider: Provider::Azure,
                    message: format!("listing subscriptions failed: {e}"),
                })?;
        tracing::info!(
            "Found {} enabled Azure subscriptions for tenant {}",
            subscriptions.len(),
            settings.account.account_id
        );

        if subscriptions.is_empty() {
            return Ok(AzureDiscovery {
                subscriptions,
                resources: Vec::new(),
                failures: Vec::new(),
                fetched_at,
                truncated: false,
            });
        }

        let (raw, failures) = match discovery::query_resource_graph(
            &self.http,
            arm_url,
            &token,
            &subscriptions,
            config.page_size,
        )
        .await
        {
            Ok(resources) => (resources, Vec::new()),
            Err(e) => {
                tracing::warn!(
                    "Resource graph query failed, falling back to per-subscription listing: {}",
                    e
                );
                self.list_per_subscription(config, &token, &subscriptions, fetched_at)
                    .await?
            }
        };

        let (resources, truncated) = discovery::prepare_resources(raw, config.max_resources);
        if truncated {
            tracing::warn!(
                "Azure discovery capped at {} resources",
                config.max_resources
            );
        }

        Ok(AzureDiscovery {
            subscriptions,
            resources,
            failures,
            fetched_at,
            truncated,
        })
    }

    async fn collect_metrics(&self, discovery: AzureDiscovery) -> Result<CollectionReport> {
        let settings = self.settings()?;
        let config = settings.config;
        let caches = RunCaches::default();
        let end = Utc::now();
        let window = (end - chrono::Duration::minutes(config.lookback_minutes.max(1)), end);
        let fetched_at = discovery.fetched_at;

        let results = map_with_concurrency(
            discovery.resources.iter().collect(),
            config.concurrency,
            |resource| {
                let caches = &caches;
                async move {
                    self.collect_resource(config, caches, resource, window, fetched_at)
                        .await
                }
            },
        )
        .await;

        let mut errors = StageErrors {
            discovery: discovery.failures.len() as u32,
            ..Default::default()
        };
        let resources_discovered = results.len();
        let mut resources_processed = 0;
        let mut records = Vec::with_capacity(results.len() + discovery.failures.len());

        for (record, outcome) in results {
            if outcome.definitions_failed {
                errors.metric_definitions += 1;
            }
            if outcome.metrics_failed {
                errors.metrics += 1;
            }
            if !record.metadata.has_error() {
                resources_processed += 1;
            }
            records.push(record);
        }
        records.extend(discovery.failures);

        tracing::info!(
            "Collected Azure metrics for {}/{} resources ({} definition types cached)",
            resources_processed,
            resources_discovered,
            caches.definitions.len()
        );

        Ok(CollectionReport {
            provider: Provider::Azure,
            records,
            resources_discovered,
            resources_processed,
            errors,
            truncated: discovery.truncated,
        })
    }
}
