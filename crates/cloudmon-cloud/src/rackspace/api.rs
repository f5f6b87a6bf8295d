//! Identity and Cloud Monitoring calls.

use crate::credentials::{CloudAccount, Credentials};
use crate::error::{CloudError, Result};
use crate::http::{HttpRequest, RetryingHttpClient};
use crate::latest::RawPoint;
use chrono::{DateTime, TimeZone, Utc};
use cloudmon_common::Provider;
use serde_json::{json, Value};
use std::collections::HashSet;

const MONITORING_SERVICE_TYPE: &str = "rax:monitor";
const ENTITY_PAGE_LIMIT: usize = 100;
/// Guard against a marker that never ends.
const MAX_ENTITY_PAGES: usize = 200;

/// Scoped token plus the monitoring endpoint it is valid for.
#[derive(Clone)]
pub struct Session {
    pub token: String,
    pub tenant_id: String,
    pub endpoint: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tenant_id", &self.tenant_id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn get(&self, path: &str) -> HttpRequest {
        HttpRequest::get(format!("{}/{}", self.endpoint, path)).header("X-Auth-Token", &self.token)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub label: Option<String>,
    pub ip_addresses: Option<Value>,
    pub agent_id: Option<String>,
    pub managed: Option<bool>,
    pub uri: Option<String>,
}

impl Entity {
    fn from_json(value: &Value) -> Option<Self> {
        Some(Self {
            id: str_field(value, "id")?,
            label: str_field(value, "label"),
            ip_addresses: value
                .get("ip_addresses")
                .filter(|v| !v.is_null())
                .cloned(),
            agent_id: str_field(value, "agent_id"),
            managed: value.get("managed").and_then(|v| v.as_bool()),
            uri: str_field(value, "uri"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub id: String,
    pub label: Option<String>,
    pub check_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricName {
    pub name: String,
    pub unit: Option<String>,
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn values(body: &Value) -> &[Value] {
    body.get("values")
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Exchange username and API key for a token and the monitoring endpoint.
pub async fn authenticate(
    http: &RetryingHttpClient,
    account: &CloudAccount,
    default_monitoring_url: &str,
) -> Result<Session> {
    let Credentials::RackspaceApiKey { username, api_key } = &account.credentials else {
        return Err(CloudError::Config(format!(
            "account {} does not carry a Rackspace API key",
            account.account_id
        )));
    };
    let identity_url = account.identity_url.as_deref().ok_or_else(|| {
        CloudError::Config(format!("account {} has no identity URL", account.account_id))
    })?;

    let request = HttpRequest::post(format!("{identity_url}/tokens")).json(json!({
        "auth": {
            "RAX-KSKEY:apiKeyCredentials": {
                "username": username,
                "apiKey": api_key,
            }
        }
    }));
    let body = http.request(&request).await.map_err(|e| CloudError::Auth {
        provider: Provider::Rackspace,
        message: e.to_string(),
    })?;

    let token = body
        .pointer("/access/token/id")
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CloudError::Auth {
            provider: Provider::Rackspace,
            message: "identity response carries no token".to_string(),
        })?
        .to_string();
    let tenant_id = body
        .pointer("/access/token/tenant/id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| account.account_id.clone());

    let preferred_region = account.regions.first().map(String::as_str);
    let endpoint = catalog_endpoint(&body, preferred_region)
        .unwrap_or_else(|| default_monitoring_url.replace("{tenant_id}", &tenant_id));

    Ok(Session {
        token,
        tenant_id,
        endpoint: endpoint.trim_end_matches('/').to_string(),
    })
}

/// Monitoring `publicURL` from the service catalog, preferring the given
/// region and falling back to the first endpoint listed.
fn catalog_endpoint(body: &Value, region: Option<&str>) -> Option<String> {
    let services = body.pointer("/access/serviceCatalog")?.as_array()?;
    let endpoints = services
        .iter()
        .find(|s| s.get("type").and_then(|t| t.as_str()) == Some(MONITORING_SERVICE_TYPE))?
        .get("endpoints")?
        .as_array()?;

    let preferred = region.and_then(|region| {
        endpoints.iter().find(|e| {
            e.get("region")
                .and_then(|r| r.as_str())
                .is_some_and(|r| r.eq_ignore_ascii_case(region))
        })
    });
    preferred
        .or_else(|| endpoints.first())
        .and_then(|e| str_field(e, "publicURL"))
}

/// Page through entities by marker until exhausted or `cap` is reached.
/// A repeated marker or running out of pages also stops paging and counts
/// as truncated.
pub async fn list_entities(
    http: &RetryingHttpClient,
    session: &Session,
    cap: usize,
) -> Result<(Vec<Entity>, bool)> {
    let mut entities = Vec::new();
    let mut marker: Option<String> = None;
    let mut seen_markers = HashSet::new();

    for _ in 0..MAX_ENTITY_PAGES {
        let mut request = session
            .get("entities")
            .query("limit", ENTITY_PAGE_LIMIT.to_string());
        if let Some(marker) = &marker {
            request = request.query("marker", marker);
        }
        let body = http.request(&request).await?;

        for value in values(&body) {
            let Some(entity) = Entity::from_json(value) else {
                continue;
            };
            if entities.len() >= cap {
                return Ok((entities, true));
            }
            entities.push(entity);
        }

        marker = body
            .pointer("/metadata/next_marker")
            .and_then(|v| v.as_str())
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        let Some(next) = &marker else {
            return Ok((entities, false));
        };
        if !seen_markers.insert(next.clone()) {
            tracing::warn!(
                tenant = %session.tenant_id,
                marker = %next,
                "Entity listing returned a repeated marker, stopping"
            );
            return Ok((entities, true));
        }
    }

    tracing::warn!(
        tenant = %session.tenant_id,
        pages = MAX_ENTITY_PAGES,
        "Entity listing hit the page limit, stopping"
    );
    Ok((entities, true))
}

pub async fn list_checks(
    http: &RetryingHttpClient,
    session: &Session,
    entity_id: &str,
) -> Result<Vec<Check>> {
    let request = session.get(&format!("entities/{}/checks", encode_segment(entity_id)));
    let body = http.request(&request).await?;
    Ok(values(&body)
        .iter()
        .filter_map(|c| {
            Some(Check {
                id: str_field(c, "id")?,
                label: str_field(c, "label"),
                check_type: str_field(c, "type"),
            })
        })
        .collect())
}

pub async fn list_check_metrics(
    http: &RetryingHttpClient,
    session: &Session,
    entity_id: &str,
    check_id: &str,
) -> Result<Vec<MetricName>> {
    let request = session.get(&format!(
        "entities/{}/checks/{}/metrics",
        encode_segment(entity_id),
        encode_segment(check_id)
    ));
    let body = http.request(&request).await?;
    Ok(values(&body)
        .iter()
        .filter_map(|m| {
            Some(MetricName {
                name: str_field(m, "name")?,
                unit: str_field(m, "unit"),
            })
        })
        .collect())
}

/// Plotted points for one metric over `[from, to]`, at full resolution.
pub async fn plot_metric(
    http: &RetryingHttpClient,
    session: &Session,
    entity_id: &str,
    check_id: &str,
    metric: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<RawPoint>> {
    let request = session
        .get(&format!(
            "entities/{}/checks/{}/metrics/{}/plot",
            encode_segment(entity_id),
            encode_segment(check_id),
            encode_segment(metric)
        ))
        .query("from", from.timestamp_millis().to_string())
        .query("to", to.timestamp_millis().to_string())
        .query("resolution", "FULL")
        .query("select", "average")
        .query("select", "max")
        .query("select", "min");
    let body = http.request(&request).await?;

    Ok(values(&body)
        .iter()
        .map(|p| RawPoint {
            timestamp: p
                .get("timestamp")
                .and_then(|t| t.as_i64())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            average: p.get("average").and_then(|v| v.as_f64()),
            minimum: p.get("min").and_then(|v| v.as_f64()),
            maximum: p.get("max").and_then(|v| v.as_f64()),
            total: None,
            count: p.get("numPoints").and_then(|v| v.as_f64()),
        })
        .collect())
}

/// Percent-encode the characters that would break a path segment.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => out.push(c),
            _ => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    out
}
