use serde::{Deserialize, Deserializer, Serialize};

/// Provider sections of the server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub azure: Option<AzureConfig>,
    #[serde(default)]
    pub aws: Option<AwsConfig>,
    #[serde(default)]
    pub rackspace: Option<RackspaceConfig>,
}

/// Timeout and retry tunables shared by every outbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    #[serde(default = "default_max_retry_after_secs")]
    pub max_retry_after_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            max_retry_after_secs: default_max_retry_after_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_jitter_ms() -> u64 {
    250
}

fn default_max_retry_after_secs() -> u64 {
    120
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Restrict discovery to these subscriptions. Empty means every enabled one.
    #[serde(default)]
    pub subscription_ids: Vec<String>,
    #[serde(default = "default_azure_authority_host")]
    pub authority_host: String,
    #[serde(default = "default_azure_resource_manager_url")]
    pub resource_manager_url: String,
    #[serde(default = "default_azure_max_resources")]
    pub max_resources: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: i64,
    #[serde(default = "default_azure_metric_batch_size")]
    pub metric_batch_size: usize,
    #[serde(default)]
    pub chunk_delay_ms: u64,
    #[serde(default = "default_azure_token_refresh_buffer_secs")]
    pub token_refresh_buffer_secs: i64,
    #[serde(default = "default_azure_page_size")]
    pub page_size: usize,
}

impl std::fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("subscription_ids", &self.subscription_ids)
            .field("resource_manager_url", &self.resource_manager_url)
            .field("max_resources", &self.max_resources)
            .finish_non_exhaustive()
    }
}

fn default_azure_authority_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_azure_resource_manager_url() -> String {
    "https://management.azure.com".to_string()
}

fn default_azure_max_resources() -> usize {
    500
}

fn default_azure_metric_batch_size() -> usize {
    20
}

fn default_azure_token_refresh_buffer_secs() -> i64 {
    120
}

fn default_azure_page_size() -> usize {
    1000
}

fn default_concurrency() -> usize {
    8
}

fn default_lookback_minutes() -> i64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    /// Global region override; when non-empty it replaces every account's list.
    #[serde(default, deserialize_with = "deserialize_regions")]
    pub regions: Vec<String>,
    /// Only enumerate these namespaces. Empty means all.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default = "default_aws_max_metrics_per_region")]
    pub max_metrics_per_region: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: i64,
    /// CloudWatch endpoint template, `{region}` is substituted.
    #[serde(default = "default_aws_endpoint_url")]
    pub endpoint_url: String,
    #[serde(default)]
    pub accounts: Vec<AwsAccountConfig>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            namespaces: Vec::new(),
            max_metrics_per_region: default_aws_max_metrics_per_region(),
            concurrency: default_concurrency(),
            lookback_minutes: default_lookback_minutes(),
            endpoint_url: default_aws_endpoint_url(),
            accounts: Vec::new(),
        }
    }
}

fn default_aws_max_metrics_per_region() -> usize {
    500
}

fn default_aws_endpoint_url() -> String {
    "https://monitoring.{region}.amazonaws.com".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AwsAccountConfig {
    pub account_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(
        default,
        alias = "region",
        deserialize_with = "deserialize_regions"
    )]
    pub regions: Vec<String>,
}

impl std::fmt::Debug for AwsAccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsAccountConfig")
            .field("account_id", &self.account_id)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RackspaceConfig {
    #[serde(default = "default_rackspace_max_entities")]
    pub max_entities: usize,
    #[serde(default = "default_rackspace_max_metrics_per_check")]
    pub max_metrics_per_check: usize,
    #[serde(default = "default_rackspace_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_rackspace_lookback_minutes")]
    pub lookback_minutes: i64,
    /// Used when the service catalog carries no monitoring endpoint;
    /// `{tenant_id}` is substituted.
    #[serde(default = "default_rackspace_monitoring_url")]
    pub default_monitoring_url: String,
    #[serde(default)]
    pub accounts: Vec<RackspaceAccountConfig>,
}

impl Default for RackspaceConfig {
    fn default() -> Self {
        Self {
            max_entities: default_rackspace_max_entities(),
            max_metrics_per_check: default_rackspace_max_metrics_per_check(),
            concurrency: default_rackspace_concurrency(),
            lookback_minutes: default_rackspace_lookback_minutes(),
            default_monitoring_url: default_rackspace_monitoring_url(),
            accounts: Vec::new(),
        }
    }
}

fn default_rackspace_max_entities() -> usize {
    200
}

fn default_rackspace_max_metrics_per_check() -> usize {
    25
}

fn default_rackspace_concurrency() -> usize {
    4
}

fn default_rackspace_lookback_minutes() -> i64 {
    30
}

fn default_rackspace_monitoring_url() -> String {
    "https://monitoring.api.rackspacecloud.com/v1.0/{tenant_id}".to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RackspaceAccountConfig {
    pub account_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub username: String,
    pub api_key: String,
    #[serde(default = "default_rackspace_identity_url")]
    pub identity_url: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl std::fmt::Debug for RackspaceAccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RackspaceAccountConfig")
            .field("account_id", &self.account_id)
            .field("username", &self.username)
            .field("api_key", &"<redacted>")
            .field("identity_url", &self.identity_url)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

fn default_rackspace_identity_url() -> String {
    "https://identity.api.rackspacecloud.com/v2.0".to_string()
}

fn deserialize_regions<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RegionsInput {
        One(String),
        Many(Vec<String>),
    }

    match RegionsInput::deserialize(deserializer)? {
        RegionsInput::One(region) => Ok(vec![region]),
        RegionsInput::Many(regions) => Ok(regions),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_deserialize_aws_account_region_from_single_string_alias() {
        let cfg: AwsAccountConfig = serde_json::from_value(serde_json::json!({
            "account_id": "123456789012",
            "access_key_id": "AKIDEXAMPLE",
            "secret_access_key": "secret",
            "region": "eu-west-1"
        }))
        .expect("config should parse");

        assert_eq!(cfg.regions, vec!["eu-west-1"]);
        assert!(cfg.session_token.is_none());
    }

    #[test]
    fn should_fill_azure_tunables_with_defaults() {
        let cfg: AzureConfig = serde_json::from_value(serde_json::json!({
            "tenant_id": "t",
            "client_id": "c",
            "client_secret": "s"
        }))
        .expect("config should parse");

        assert_eq!(cfg.metric_batch_size, 20);
        assert_eq!(cfg.max_resources, 500);
        assert_eq!(cfg.resource_manager_url, "https://management.azure.com");
    }

    #[test]
    fn should_not_leak_secrets_through_debug() {
        let cfg = RackspaceAccountConfig {
            account_id: "acct".into(),
            display_name: None,
            username: "ops".into(),
            api_key: "super-secret-key".into(),
            identity_url: default_rackspace_identity_url(),
            region: Some("DFW".into()),
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("super-secret-key"));
        assert!(rendered.contains("<redacted>"));
    }
}
