//! CloudWatch over the AWS JSON 1.0 protocol, signed with SigV4.

use super::resources::MetricDefinition;
use super::sigv4::{self, SignableRequest, SigningCredentials};
use crate::credentials::{CloudAccount, Credentials};
use crate::error::{CloudError, Result};
use crate::http::{HttpRequest, RetryingHttpClient};
use crate::latest::{self, RawPoint};
use chrono::{DateTime, TimeZone, Utc};
use cloudmon_common::{MetricSample, Provider, ResourceDescriptor};
use serde_json::{json, Value};
use std::collections::HashSet;

const TARGET_PREFIX: &str = "GraniteServiceVersion20100801";
const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const SERVICE: &str = "monitoring";
const STATISTICS: [&str; 5] = ["Average", "Minimum", "Maximum", "Sum", "SampleCount"];
/// Guard against a `NextToken` that never ends, per namespace.
const MAX_LIST_PAGES: usize = 200;

/// One account in one region: the unit of discovery and of failure.
#[derive(Debug, Clone)]
pub struct RegionScope {
    pub account: CloudAccount,
    pub region: String,
    pub endpoint: String,
}

impl RegionScope {
    /// Descriptor for the synthetic record that stands in for a failed unit.
    pub fn summary_descriptor(&self) -> ResourceDescriptor {
        let mut descriptor = ResourceDescriptor::new(
            Provider::Aws,
            format!("aws://{}/{}/summary", self.account.account_id, self.region),
            format!("{} ({})", self.account.display_name, self.region),
            "aws/account/region-summary",
            self.account.account_id.clone(),
        );
        descriptor.location = Some(self.region.clone());
        descriptor.metadata.insert("synthetic".into(), true.into());
        descriptor
    }
}

/// Definitions found in one region, in `ListMetrics` order.
#[derive(Debug, Default)]
pub struct MetricListing {
    pub definitions: Vec<MetricDefinition>,
    pub truncated: bool,
}

/// Issue a signed CloudWatch action against the scope's endpoint.
pub async fn call(
    http: &RetryingHttpClient,
    scope: &RegionScope,
    action: &str,
    payload: &Value,
) -> Result<Value> {
    let Credentials::AwsAccessKey {
        access_key_id,
        secret_access_key,
        session_token,
    } = &scope.account.credentials
    else {
        return Err(CloudError::Config(format!(
            "account {} does not carry AWS access keys",
            scope.account.account_id
        )));
    };

    let url = reqwest::Url::parse(&scope.endpoint).map_err(|e| {
        CloudError::Config(format!("invalid CloudWatch endpoint {}: {e}", scope.endpoint))
    })?;
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => {
            return Err(CloudError::Config(format!(
                "CloudWatch endpoint {} has no host",
                scope.endpoint
            )))
        }
    };

    let body = payload.to_string();
    let target = format!("{TARGET_PREFIX}.{action}");
    let signed = sigv4::sign(
        &SigningCredentials {
            access_key_id,
            secret_access_key,
            session_token: session_token.as_deref(),
        },
        &scope.region,
        SERVICE,
        &SignableRequest {
            method: "POST",
            host: &host,
            path: url.path(),
            headers: &[("Content-Type", CONTENT_TYPE), ("X-Amz-Target", target.as_str())],
            payload: &body,
        },
        Utc::now(),
    )?;

    let mut request = HttpRequest::post(scope.endpoint.clone())
        .header("Content-Type", CONTENT_TYPE)
        .header("X-Amz-Target", target)
        .header("X-Amz-Date", signed.amz_date)
        .header("Authorization", signed.authorization)
        .text(body);
    if let Some(token) = signed.security_token {
        request = request.header("X-Amz-Security-Token", token);
    }

    http.request(&request).await
}

/// Page through `ListMetrics` for each namespace (or all namespaces when
/// the list is empty), stopping once `cap` definitions are held. A repeated
/// `NextToken` or running out of pages ends that namespace and marks the
/// listing truncated.
pub async fn list_metrics(
    http: &RetryingHttpClient,
    scope: &RegionScope,
    namespaces: &[String],
    cap: usize,
) -> Result<MetricListing> {
    let filters: Vec<Option<&str>> = if namespaces.is_empty() {
        vec![None]
    } else {
        namespaces.iter().map(|n| Some(n.as_str())).collect()
    };

    let mut listing = MetricListing::default();

    'namespaces: for namespace in filters {
        let mut next_token: Option<String> = None;
        let mut seen_tokens = HashSet::new();
        let mut exhausted = false;

        for _ in 0..MAX_LIST_PAGES {
            let mut payload = json!({});
            if let Some(ns) = namespace {
                payload["Namespace"] = json!(ns);
            }
            if let Some(token) = &next_token {
                payload["NextToken"] = json!(token);
            }

            let response = call(http, scope, "ListMetrics", &payload).await?;
            let metrics = response
                .get("Metrics")
                .and_then(|m| m.as_array())
                .cloned()
                .unwrap_or_default();

            for metric in &metrics {
                let Some(definition) = MetricDefinition::from_json(metric) else {
                    continue;
                };
                if listing.definitions.len() >= cap {
                    listing.truncated = true;
                    break 'namespaces;
                }
                listing.definitions.push(definition);
            }

            next_token = response
                .get("NextToken")
                .and_then(|t| t.as_str())
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            let Some(token) = &next_token else {
                exhausted = true;
                break;
            };
            if !seen_tokens.insert(token.clone()) {
                tracing::warn!(
                    account = %scope.account.account_id,
                    region = %scope.region,
                    namespace = namespace.unwrap_or("*"),
                    "ListMetrics returned a repeated NextToken, stopping"
                );
                break;
            }
        }

        if !exhausted {
            listing.truncated = true;
        }
    }

    Ok(listing)
}

/// Latest statistics for one definition over `[start, end)`. `Ok(None)`
/// when CloudWatch returns no datapoints.
pub async fn get_statistics(
    http: &RetryingHttpClient,
    scope: &RegionScope,
    definition: &MetricDefinition,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    period_secs: i64,
) -> Result<Option<MetricSample>> {
    let dimensions: Vec<Value> = definition
        .dimensions
        .iter()
        .map(|d| json!({"Name": d.name, "Value": d.value}))
        .collect();
    let payload = json!({
        "Namespace": definition.namespace,
        "MetricName": definition.metric_name,
        "Dimensions": dimensions,
        "StartTime": start.timestamp(),
        "EndTime": end.timestamp(),
        "Period": period_secs,
        "Statistics": STATISTICS,
    });

    let response = call(http, scope, "GetMetricStatistics", &payload).await?;
    let datapoints = response
        .get("Datapoints")
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_default();

    let unit = datapoints
        .iter()
        .find_map(|p| p.get("Unit").and_then(|u| u.as_str()))
        .map(str::to_string);
    let points = datapoints.iter().map(|p| RawPoint {
        timestamp: p.get("Timestamp").and_then(parse_timestamp),
        average: p.get("Average").and_then(|v| v.as_f64()),
        minimum: p.get("Minimum").and_then(|v| v.as_f64()),
        maximum: p.get("Maximum").and_then(|v| v.as_f64()),
        total: p.get("Sum").and_then(|v| v.as_f64()),
        count: p.get("SampleCount").and_then(|v| v.as_f64()),
    });

    Ok(latest::latest_sample(
        &definition.sample_name(),
        Some(&definition.namespace),
        unit.as_deref(),
        points,
    ))
}

/// Statistics period for a lookback window: a third of the window in whole
/// minutes, never below one minute.
pub fn statistics_period(lookback_minutes: i64) -> i64 {
    let window_secs = lookback_minutes.max(1) * 60;
    ((window_secs / 3) / 60 * 60).max(60)
}

/// JSON-protocol timestamps are epoch seconds; accept RFC 3339 too.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(secs) = value.as_f64() {
        let millis = (secs * 1000.0).round() as i64;
        return Utc.timestamp_millis_opt(millis).single();
    }
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
