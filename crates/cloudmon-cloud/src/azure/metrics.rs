//! Metric definitions and metric values from Azure Monitor.

use super::cache::OnceCache;
use crate::error::Result;
use crate::http::{HttpRequest, RetryingHttpClient};
use crate::latest::{self, RawPoint};
use chrono::{DateTime, SecondsFormat, Utc};
use cloudmon_common::MetricSample;
use serde_json::Value;
use std::collections::BTreeMap;

const METRICS_API_VERSION: &str = "2018-01-01";
const AGGREGATIONS: &str = "Average,Minimum,Maximum,Total,Count";

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    pub name: String,
    pub namespace: Option<String>,
    pub unit: Option<String>,
}

/// Metric definitions keyed by lowercase resource type. Resources of one
/// type share a catalog, so only the first resource of each type pays for
/// the lookup.
pub type DefinitionCache = OnceCache<String, Vec<MetricDefinition>>;

pub async fn fetch_definitions(
    http: &RetryingHttpClient,
    arm_url: &str,
    token: &str,
    resource_id: &str,
) -> Result<Vec<MetricDefinition>> {
    let request = HttpRequest::get(format!(
        "{arm_url}{resource_id}/providers/Microsoft.Insights/metricDefinitions"
    ))
    .query("api-version", METRICS_API_VERSION)
    .bearer(token);

    let body = http.request(&request).await?;
    let definitions: Vec<MetricDefinition> = body
        .get("value")
        .and_then(|v| v.as_array())
        .map(|values| {
            values
                .iter()
                .filter_map(|d| {
                    let name = localizable_value(d.get("name"))?;
                    Some(MetricDefinition {
                        name,
                        namespace: d
                            .get("namespace")
                            .and_then(|n| n.as_str())
                            .filter(|n| !n.is_empty())
                            .map(str::to_string),
                        unit: d.get("unit").and_then(|u| u.as_str()).map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(definitions)
}

/// Group definition names by namespace and split each group into chunks of
/// at most `batch_size`. Namespaces come out in sorted order.
pub fn plan_chunks(
    definitions: &[MetricDefinition],
    batch_size: usize,
) -> Vec<(Option<String>, Vec<String>)> {
    let mut by_namespace: BTreeMap<Option<String>, Vec<String>> = BTreeMap::new();
    for definition in definitions {
        let names = by_namespace.entry(definition.namespace.clone()).or_default();
        if !names.contains(&definition.name) {
            names.push(definition.name.clone());
        }
    }

    by_namespace
        .into_iter()
        .flat_map(|(namespace, names)| {
            names
                .chunks(batch_size.max(1))
                .map(|chunk| (namespace.clone(), chunk.to_vec()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// One metrics read for a chunk of names over `[start, end]` at one-minute
/// grain. `namespace` narrows the query when given.
#[allow(clippy::too_many_arguments)]
pub async fn read_metrics(
    http: &RetryingHttpClient,
    arm_url: &str,
    token: &str,
    resource_id: &str,
    namespace: Option<&str>,
    names: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<MetricSample>> {
    let timespan = format!(
        "{}/{}",
        start.to_rfc3339_opts(SecondsFormat::Secs, true),
        end.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    let mut request = HttpRequest::get(format!(
        "{arm_url}{resource_id}/providers/Microsoft.Insights/metrics"
    ))
    .query("api-version", METRICS_API_VERSION)
    .query("metricnames", names.join(","))
    .query("timespan", timespan)
    .query("interval", "PT1M")
    .query("aggregation", AGGREGATIONS)
    .bearer(token);
    if let Some(ns) = namespace {
        request = request.query("metricnamespace", ns);
    }

    let body = http.request(&request).await?;
    Ok(parse_metrics_response(&body, namespace))
}

/// Reduce every metric in a response to its latest sample. Metrics with
/// no data in the window are left out.
pub fn parse_metrics_response(body: &Value, namespace: Option<&str>) -> Vec<MetricSample> {
    let Some(metrics) = body.get("value").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    metrics
        .iter()
        .filter_map(|metric| {
            let name = localizable_value(metric.get("name"))?;
            let unit = metric.get("unit").and_then(|u| u.as_str());
            let points = metric
                .get("timeseries")
                .and_then(|t| t.as_array())
                .into_iter()
                .flatten()
                .filter_map(|series| series.get("data").and_then(|d| d.as_array()))
                .flatten()
                .map(|point| RawPoint {
                    timestamp: point
                        .get("timeStamp")
                        .and_then(|t| t.as_str())
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                        .map(|t| t.with_timezone(&Utc)),
                    average: point.get("average").and_then(|v| v.as_f64()),
                    minimum: point.get("minimum").and_then(|v| v.as_f64()),
                    maximum: point.get("maximum").and_then(|v| v.as_f64()),
                    total: point.get("total").and_then(|v| v.as_f64()),
                    count: point.get("count").and_then(|v| v.as_f64()),
                });
            latest::latest_sample(&name, namespace, unit, points)
        })
        .collect()
}

/// `{"value": "...", "localizedValue": "..."}`, or a bare string.
fn localizable_value(value: Option<&Value>) -> Option<String> {
    let value = value?;
    value
        .get("value")
        .and_then(|v| v.as_str())
        .or_else(|| value.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(name: &str, namespace: Option<&str>) -> MetricDefinition {
        MetricDefinition {
            name: name.into(),
            namespace: namespace.map(str::to_string),
            unit: None,
        }
    }

    #[test]
    fn should_group_by_namespace_and_chunk() {
        let definitions = vec![
            definition("a", Some("ns1")),
            definition("b", Some("ns1")),
            definition("c", Some("ns1")),
            definition("d", Some("ns2")),
            definition("a", Some("ns1")),
        ];

        let chunks = plan_chunks(&definitions, 2);
        assert_eq!(
            chunks,
            vec![
                (Some("ns1".to_string()), vec!["a".to_string(), "b".to_string()]),
                (Some("ns1".to_string()), vec!["c".to_string()]),
                (Some("ns2".to_string()), vec!["d".to_string()]),
            ]
        );
    }

    #[test]
    fn should_take_latest_point_across_timeseries() {
        let body = json!({
            "value": [{
                "name": {"value": "Percentage CPU", "localizedValue": "Percentage CPU"},
                "unit": "Percent",
                "timeseries": [{
                    "data": [
                        {"timeStamp": "2024-05-01T12:00:00Z", "average": 10.0},
                        {"timeStamp": "2024-05-01T12:01:00Z", "average": 30.0, "maximum": 55.0},
                        {"timeStamp": "2024-05-01T12:02:00Z"}
                    ]
                }]
            }, {
                "name": {"value": "Disk Read Bytes"},
                "unit": "Bytes",
                "timeseries": []
            }]
        });

        let samples = parse_metrics_response(&body, Some("Microsoft.Compute/virtualMachines"));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "Percentage CPU");
        assert_eq!(samples[0].value, 30.0);
        assert_eq!(samples[0].maximum, Some(55.0));
        assert_eq!(samples[0].unit.as_deref(), Some("Percent"));
    }
}
