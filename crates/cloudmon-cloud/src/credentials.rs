//! Enumeration of configured accounts per provider. Reads configuration
//! only; never touches the network.

use crate::config::CloudConfig;
use cloudmon_common::Provider;
use std::collections::HashSet;

/// Opaque credential material for one account.
#[derive(Clone)]
pub enum Credentials {
    AzureClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    AwsAccessKey {
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    },
    RackspaceApiKey {
        username: String,
        api_key: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::AzureClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("AzureClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            Credentials::AwsAccessKey { access_key_id, .. } => f
                .debug_struct("AwsAccessKey")
                .field("access_key_id", access_key_id)
                .finish_non_exhaustive(),
            Credentials::RackspaceApiKey { username, .. } => f
                .debug_struct("RackspaceApiKey")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

impl Credentials {
    fn is_usable(&self) -> bool {
        match self {
            Credentials::AzureClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => !tenant_id.is_empty() && !client_id.is_empty() && !client_secret.is_empty(),
            Credentials::AwsAccessKey {
                access_key_id,
                secret_access_key,
                ..
            } => !access_key_id.is_empty() && !secret_access_key.is_empty(),
            Credentials::RackspaceApiKey { username, api_key } => {
                !username.is_empty() && !api_key.is_empty()
            }
        }
    }
}

/// One configured account, immutable for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct CloudAccount {
    pub provider: Provider,
    pub account_id: String,
    pub display_name: String,
    pub credentials: Credentials,
    /// AWS: the account's own region list. Rackspace: the preferred
    /// catalog region. Empty for Azure.
    pub regions: Vec<String>,
    /// Rackspace identity endpoint.
    pub identity_url: Option<String>,
}

/// Accounts with usable credentials, grouped by provider.
#[derive(Debug, Clone, Default)]
pub struct CredentialCatalog {
    accounts: Vec<CloudAccount>,
}

impl CredentialCatalog {
    pub fn from_config(config: &CloudConfig) -> Self {
        let mut accounts = Vec::new();

        if let Some(azure) = &config.azure {
            accounts.push(CloudAccount {
                provider: Provider::Azure,
                account_id: azure.tenant_id.trim().to_string(),
                display_name: azure
                    .display_name
                    .clone()
                    .unwrap_or_else(|| azure.tenant_id.clone()),
                credentials: Credentials::AzureClientSecret {
                    tenant_id: azure.tenant_id.trim().to_string(),
                    client_id: azure.client_id.trim().to_string(),
                    client_secret: azure.client_secret.trim().to_string(),
                },
                regions: Vec::new(),
                identity_url: None,
            });
        }

        if let Some(aws) = &config.aws {
            for acct in &aws.accounts {
                accounts.push(CloudAccount {
                    provider: Provider::Aws,
                    account_id: acct.account_id.trim().to_string(),
                    display_name: acct
                        .display_name
                        .clone()
                        .unwrap_or_else(|| acct.account_id.trim().to_string()),
                    credentials: Credentials::AwsAccessKey {
                        access_key_id: acct.access_key_id.trim().to_string(),
                        secret_access_key: acct.secret_access_key.trim().to_string(),
                        session_token: acct
                            .session_token
                            .as_ref()
                            .map(|t| t.trim().to_string())
                            .filter(|t| !t.is_empty()),
                    },
                    regions: acct.regions.clone(),
                    identity_url: None,
                });
            }
        }

        if let Some(rackspace) = &config.rackspace {
            for acct in &rackspace.accounts {
                accounts.push(CloudAccount {
                    provider: Provider::Rackspace,
                    account_id: acct.account_id.trim().to_string(),
                    display_name: acct
                        .display_name
                        .clone()
                        .unwrap_or_else(|| acct.account_id.trim().to_string()),
                    credentials: Credentials::RackspaceApiKey {
                        username: acct.username.trim().to_string(),
                        api_key: acct.api_key.trim().to_string(),
                    },
                    regions: acct.region.iter().cloned().collect(),
                    identity_url: Some(acct.identity_url.trim_end_matches('/').to_string()),
                });
            }
        }

        let mut seen = HashSet::new();
        let accounts = accounts
            .into_iter()
            .filter(|acct| {
                let usable = acct.credentials.is_usable();
                if !usable {
                    tracing::warn!(
                        provider = %acct.provider,
                        account = %acct.account_id,
                        "Skipping account with incomplete credentials"
                    );
                }
                usable
            })
            .filter(|acct| {
                let first = seen.insert((acct.provider, acct.account_id.clone()));
                if !first {
                    tracing::warn!(
                        provider = %acct.provider,
                        account = %acct.account_id,
                        "Skipping duplicate account id, first entry wins"
                    );
                }
                first
            })
            .collect();

        Self { accounts }
    }

    /// Usable accounts for `provider`, in configuration order.
    pub fn accounts(&self, provider: Provider) -> Vec<CloudAccount> {
        self.accounts
            .iter()
            .filter(|a| a.provider == provider)
            .cloned()
            .collect()
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        self.accounts.iter().any(|a| a.provider == provider)
    }
}
