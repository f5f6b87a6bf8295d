//! Rackspace Cloud Monitoring collector.
//!
//! Each account authenticates against its identity endpoint, then walks
//! entities, their checks, and each check's metrics, plotting a short
//! window to find the latest point. A 403 or 404 below the entity list
//! means "nothing to report" rather than a failure.

pub mod api;

use crate::config::RackspaceConfig;
use crate::credentials::CloudAccount;
use crate::error::{CloudError, Result};
use crate::http::RetryingHttpClient;
use crate::latest;
use crate::runner::map_with_concurrency;
use crate::{CollectionReport, Collector};
use api::{Entity, Session};
use chrono::{DateTime, Utc};
use cloudmon_common::{Provider, ResourceDescriptor, ResourceMetricsRecord, StageErrors};

const ENTITY_RESOURCE_TYPE: &str = "rackspace/monitoring/entity";

pub struct RackspaceCollector {
    config: RackspaceConfig,
    accounts: Vec<CloudAccount>,
    http: RetryingHttpClient,
}

/// An authenticated account and the entities found under it.
#[derive(Debug)]
pub struct AccountEntities {
    pub account: CloudAccount,
    pub session: Session,
    pub entities: Vec<Entity>,
}

#[derive(Debug)]
pub struct RackspaceDiscovery {
    pub accounts: Vec<AccountEntities>,
    /// Summary records for accounts that failed to authenticate or list.
    pub failures: Vec<ResourceMetricsRecord>,
    pub fetched_at: DateTime<Utc>,
    pub truncated: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct EntityOutcome {
    listing_failed: bool,
    plot_failures: u32,
}

impl RackspaceCollector {
    pub fn new(
        config: RackspaceConfig,
        accounts: Vec<CloudAccount>,
        http: RetryingHttpClient,
    ) -> Self {
        Self {
            config,
            accounts,
            http,
        }
    }

    async fn discover_account(&self, account: &CloudAccount) -> Result<(Session, Vec<Entity>, bool)> {
        let session =
            api::authenticate(&self.http, account, &self.config.default_monitoring_url).await?;
        let (entities, truncated) =
            api::list_entities(&self.http, &session, self.config.max_entities).await?;
        Ok((session, entities, truncated))
    }

    fn summary_descriptor(account: &CloudAccount) -> ResourceDescriptor {
        let mut descriptor = ResourceDescriptor::new(
            Provider::Rackspace,
            format!("rackspace://{}/summary", account.account_id),
            account.display_name.clone(),
            "rackspace/account-summary",
            account.account_id.clone(),
        );
        descriptor.location = account.regions.first().cloned();
        descriptor.metadata.insert("synthetic".into(), true.into());
        descriptor
    }

    fn entity_descriptor(account: &CloudAccount, entity: &Entity) -> ResourceDescriptor {
        let mut descriptor = ResourceDescriptor::new(
            Provider::Rackspace,
            format!("rackspace://{}/entities/{}", account.account_id, entity.id),
            entity.label.clone().unwrap_or_else(|| entity.id.clone()),
            ENTITY_RESOURCE_TYPE,
            account.account_id.clone(),
        );
        descriptor.location = account.regions.first().cloned();
        descriptor
            .metadata
            .insert("account_name".into(), account.display_name.clone().into());
        if let Some(ips) = &entity.ip_addresses {
            descriptor.metadata.insert("ip_addresses".into(), ips.clone());
        }
        if let Some(agent_id) = &entity.agent_id {
            descriptor
                .metadata
                .insert("agent_id".into(), agent_id.clone().into());
        }
        if let Some(managed) = entity.managed {
            descriptor.metadata.insert("managed".into(), managed.into());
        }
        if let Some(uri) = &entity.uri {
            descriptor.metadata.insert("uri".into(), uri.clone().into());
        }
        descriptor
    }

    async fn collect_entity(
        &self,
        account: &CloudAccount,
        session: &Session,
        entity: &Entity,
        window: (DateTime<Utc>, DateTime<Utc>),
        fetched_at: DateTime<Utc>,
    ) -> (ResourceMetricsRecord, EntityOutcome) {
        let mut record =
            ResourceMetricsRecord::new(Self::entity_descriptor(account, entity), fetched_at);
        let mut outcome = EntityOutcome::default();
        let (from, to) = window;

        let checks = match api::list_checks(&self.http, session, &entity.id).await {
            Ok(checks) => checks,
            Err(e) if e.is_forbidden_or_not_found() => Vec::new(),
            Err(e) => {
                outcome.listing_failed = true;
                record.metadata.error = Some(format!("listing checks failed: {e}"));
                return (record, outcome);
            }
        };

        for check in &checks {
            let check_label = check.label.clone().unwrap_or_else(|| check.id.clone());
            let metrics =
                match api::list_check_metrics(&self.http, session, &entity.id, &check.id).await {
                    Ok(metrics) => metrics,
                    Err(e) if e.is_forbidden_or_not_found() => continue,
                    Err(e) => {
                        outcome.listing_failed = true;
                        record
                            .metadata
                            .push_warning(format!("check {check_label}: listing metrics failed: {e}"));
                        continue;
                    }
                };

            if metrics.len() > self.config.max_metrics_per_check {
                tracing::debug!(
                    "Check {} on entity {} has {} metrics, keeping {}",
                    check.id,
                    entity.id,
                    metrics.len(),
                    self.config.max_metrics_per_check
                );
            }

            for metric in metrics.iter().take(self.config.max_metrics_per_check) {
                let points = match api::plot_metric(
                    &self.http,
                    session,
                    &entity.id,
                    &check.id,
                    &metric.name,
                    from,
                    to,
                )
                .await
                {
                    Ok(points) => points,
                    Err(e) if e.is_forbidden_or_not_found() => continue,
                    Err(e) => {
                        outcome.plot_failures += 1;
                        record.metadata.push_warning(format!(
                            "check {check_label}: metric {}: {e}",
                            metric.name
                        ));
                        continue;
                    }
                };

                if let Some(sample) = latest::latest_sample(
                    &metric.name,
                    Some(&check_label),
                    metric.unit.as_deref(),
                    points,
                ) {
                    record.metrics.push(sample);
                }
            }
        }

        (record, outcome)
    }
}

#[async_trait::async_trait]
impl Collector for RackspaceCollector {
    type Discovery = RackspaceDiscovery;

    fn provider(&self) -> Provider {
        Provider::Rackspace
    }

    fn is_configured(&self) -> bool {
        !self.accounts.is_empty()
    }

    async fn discover(&self) -> Result<RackspaceDiscovery> {
        let fetched_at = Utc::now();
        let mut discovery = RackspaceDiscovery {
            accounts: Vec::new(),
            failures: Vec::new(),
            fetched_at,
            truncated: false,
        };
        let mut last_error = String::new();

        for account in &self.accounts {
            match self.discover_account(account).await {
                Ok((session, entities, truncated)) => {
                    tracing::info!(
                        "Discovered {} Rackspace entities for account {}",
                        entities.len(),
                        account.account_id
                    );
                    discovery.truncated |= truncated;
                    discovery.accounts.push(AccountEntities {
                        account: account.clone(),
                        session,
                        entities,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Rackspace account {} discovery failed: {}",
                        account.account_id,
                        e
                    );
                    last_error = e.to_string();
                    discovery.failures.push(ResourceMetricsRecord::unit_failure(
                        Self::summary_descriptor(account),
                        fetched_at,
                        format!("account discovery failed: {e}"),
                    ));
                }
            }
        }

        if !self.accounts.is_empty() && discovery.failures.len() == self.accounts.len() {
            return Err(CloudError::Discovery {
                provider: Provider::Rackspace,
                message: format!(
                    "all {} accounts failed; last error: {last_error}",
                    self.accounts.len()
                ),
            });
        }

        Ok(discovery)
    }

    async fn collect_metrics(&self, discovery: RackspaceDiscovery) -> Result<CollectionReport> {
        let end = Utc::now();
        let window = (
            end - chrono::Duration::minutes(self.config.lookback_minutes.max(1)),
            end,
        );
        let fetched_at = discovery.fetched_at;

        let jobs: Vec<(&CloudAccount, &Session, &Entity)> = discovery
            .accounts
            .iter()
            .flat_map(|a| a.entities.iter().map(move |e| (&a.account, &a.session, e)))
            .collect();

        let results = map_with_concurrency(jobs, self.config.concurrency, |(account, session, entity)| async move {
            self.collect_entity(account, session, entity, window, fetched_at)
                .await
        })
        .await;

        let mut errors = StageErrors {
            discovery: discovery.failures.len() as u32,
            ..Default::default()
        };
        let resources_discovered = results.len();
        let mut resources_processed = 0;
        let mut records = Vec::with_capacity(results.len() + discovery.failures.len());

        for (record, outcome) in results {
            if outcome.listing_failed {
                errors.metric_definitions += 1;
            }
            errors.metrics += outcome.plot_failures;
            if !record.metadata.has_error() {
                resources_processed += 1;
            }
            records.push(record);
        }
        records.extend(discovery.failures);

        Ok(CollectionReport {
            provider: Provider::Rackspace,
            records,
            resources_discovered,
            resources_processed,
            errors,
            truncated: discovery.truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::credentials::Credentials;
    use crate::http::RetryPolicy;
    use crate::ProviderCollector;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http() -> RetryingHttpClient {
        RetryingHttpClient::new(&HttpConfig::default())
            .unwrap()
            .with_policy(RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                max_jitter: Duration::ZERO,
                max_retry_after: Duration::from_millis(1),
            })
    }

    fn account(server: &MockServer, id: &str) -> CloudAccount {
        CloudAccount {
            provider: Provider::Rackspace,
            account_id: id.into(),
            display_name: format!("acct-{id}"),
            credentials: Credentials::RackspaceApiKey {
                username: "ops".into(),
                api_key: "key".into(),
            },
            regions: vec!["DFW".into()],
            identity_url: Some(format!("{}/v2.0", server.uri())),
        }
    }

    fn collector(server: &MockServer, accounts: Vec<CloudAccount>) -> RackspaceCollector {
        let config = RackspaceConfig {
            default_monitoring_url: format!("{}/fallback/{{tenant_id}}", server.uri()),
            ..Default::default()
        };
        RackspaceCollector::new(config, accounts, http())
    }

    async fn mount_identity(server: &MockServer, with_catalog: bool) {
        let catalog = if with_catalog {
            json!([{"type": "rax:monitor", "name": "cloudMonitoring", "endpoints": [
                {"region": "DFW", "publicURL": format!("{}/v1.0/123456", server.uri())}
            ]}])
        } else {
            json!([])
        };
        Mock::given(method("POST"))
            .and(path("/v2.0/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access": {
                    "token": {"id": "rax-token", "tenant": {"id": "123456"}},
                    "serviceCatalog": catalog
                }
            })))
            .mount(server)
            .await;
    }

    async fn mount_monitoring(server: &MockServer, base: &str) {
        Mock::given(method("GET"))
            .and(path(format!("{base}/entities")))
            .and(query_param("limit", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [
                    {"id": "en1", "label": "web1", "agent_id": "agent-1",
                     "ip_addresses": {"public0_v4": "203.0.113.10"}},
                    {"id": "en2", "label": "db1"}
                ],
                "metadata": {"count": 2, "limit": 100, "marker": null, "next_marker": null}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{base}/entities/en1/checks")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [{"id": "ch1", "label": "ping", "type": "remote.ping"}]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{base}/entities/en2/checks")))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{base}/entities/en1/checks/ch1/metrics")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [{"name": "mzdfw.available"}, {"name": "mzdfw.average"}]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"/entities/en1/checks/ch1/metrics/[^/]+/plot$"))
            .and(query_param("resolution", "FULL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [
                    {"timestamp": 1_700_000_000_000i64, "average": 99.0, "numPoints": 1},
                    {"timestamp": 1_700_000_060_000i64, "average": 100.0, "max": 100.0, "numPoints": 1}
                ]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn should_walk_entities_checks_and_metrics() {
        let server = MockServer::start().await;
        mount_identity(&server, true).await;
        mount_monitoring(&server, "/v1.0/123456").await;

        let report = collector(&server, vec![account(&server, "acct1")])
            .collect()
            .await
            .unwrap();

        assert_eq!(report.resources_discovered, 2);
        assert_eq!(report.resources_processed, 2);
        assert_eq!(report.errors.total(), 0);

        let web = &report.records[0];
        assert_eq!(web.resource.resource_id, "rackspace://acct1/entities/en1");
        assert_eq!(web.resource.resource_name, "web1");
        assert_eq!(web.resource.metadata_str("agent_id"), Some("agent-1"));
        assert_eq!(web.metrics.len(), 2);
        assert_eq!(web.metrics[0].value, 100.0);
        assert_eq!(web.metrics[0].namespace.as_deref(), Some("ping"));

        // 404 on checks is "no data", not an error
        let db = &report.records[1];
        assert!(db.metrics.is_empty());
        assert!(!db.metadata.has_error());
        assert!(db.metadata.warnings.is_empty());
    }

    #[tokio::test]
    async fn should_fall_back_to_default_monitoring_url() {
        let server = MockServer::start().await;
        mount_identity(&server, false).await;
        mount_monitoring(&server, "/fallback/123456").await;

        let collector = collector(&server, vec![account(&server, "acct1")]);
        let discovery = collector.discover().await.unwrap();

        assert_eq!(
            discovery.accounts[0].session.endpoint,
            format!("{}/fallback/123456", server.uri())
        );
        assert_eq!(discovery.accounts[0].entities.len(), 2);
    }

    #[tokio::test]
    async fn should_keep_other_accounts_when_one_fails_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bad/tokens"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        mount_identity(&server, true).await;
        mount_monitoring(&server, "/v1.0/123456").await;

        let mut bad = account(&server, "bad");
        bad.identity_url = Some(format!("{}/bad", server.uri()));
        let report = collector(&server, vec![bad, account(&server, "good")])
            .collect()
            .await
            .unwrap();

        assert_eq!(report.errors.discovery, 1);
        let summary = report
            .records
            .iter()
            .find(|r| r.resource.resource_id == "rackspace://bad/summary")
            .unwrap();
        assert!(summary.metadata.has_error());
        assert!(report
            .records
            .iter()
            .any(|r| r.resource.resource_id == "rackspace://good/entities/en1"));
    }

    #[tokio::test]
    async fn should_fail_provider_when_every_account_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = collector(&server, vec![account(&server, "a"), account(&server, "b")])
            .collect()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CloudError::Discovery {
                provider: Provider::Rackspace,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn should_stop_listing_at_entity_cap() {
        let server = MockServer::start().await;
        mount_identity(&server, true).await;
        mount_monitoring(&server, "/v1.0/123456").await;

        let mut collector = collector(&server, vec![account(&server, "acct1")]);
        collector.config.max_entities = 1;
        let discovery = collector.discover().await.unwrap();

        assert!(discovery.truncated);
        assert_eq!(discovery.accounts[0].entities.len(), 1);
    }
}
