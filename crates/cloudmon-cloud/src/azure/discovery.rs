//! Subscription and resource enumeration.

use crate::error::{CloudError, Result};
use crate::http::{HttpRequest, RetryingHttpClient};
use serde_json::{json, Value};
use std::collections::HashSet;

const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";
const RESOURCE_GRAPH_API_VERSION: &str = "2021-03-01";
const RESOURCES_API_VERSION: &str = "2021-04-01";

/// Guard against a continuation token that never ends.
const MAX_PAGES: usize = 200;

/// Types that never expose platform metrics.
const NON_METRIC_TYPES: [&str; 14] = [
    "microsoft.resources/deployments",
    "microsoft.resources/tags",
    "microsoft.insights/diagnosticsettings",
    "microsoft.insights/actiongroups",
    "microsoft.insights/metricalerts",
    "microsoft.insights/activitylogalerts",
    "microsoft.insights/scheduledqueryrules",
    "microsoft.alertsmanagement/smartdetectoralertrules",
    "microsoft.compute/sshpublickeys",
    "microsoft.compute/restorepointcollections",
    "microsoft.network/networkwatchers",
    "microsoft.operationsmanagement/solutions",
    "microsoft.portal/dashboards",
    "microsoft.managedidentity/userassignedidentities",
];

const GRAPH_QUERY: &str = "Resources \
| project id, name, type, location, resourceGroup, subscriptionId, kind, \
sku = tostring(sku.name), vmSize = tostring(properties.hardwareProfile.vmSize)";

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub display_name: String,
}

/// One ARM resource as returned by discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct AzureResource {
    pub id: String,
    pub name: String,
    /// Lowercase.
    pub resource_type: String,
    pub location: Option<String>,
    pub resource_group: Option<String>,
    pub subscription_id: Option<String>,
    pub kind: Option<String>,
    pub sku: Option<String>,
    pub vm_size: Option<String>,
}

impl AzureResource {
    pub fn from_json(value: &Value) -> Option<Self> {
        let id = non_empty(value.get("id"))?;
        let resource_type = non_empty(value.get("type"))?.to_lowercase();
        let name = non_empty(value.get("name"))
            .unwrap_or_else(|| id.rsplit('/').next().unwrap_or_default().to_string());
        // The listing API returns sku as an object, the graph projection as a string.
        let sku = match value.get("sku") {
            Some(Value::Object(obj)) => non_empty(obj.get("name")),
            other => non_empty(other),
        };
        let vm_size = non_empty(value.get("vmSize")).or_else(|| {
            non_empty(
                value
                    .get("properties")
                    .and_then(|p| p.get("hardwareProfile"))
                    .and_then(|h| h.get("vmSize")),
            )
        });

        Some(Self {
            resource_group: non_empty(value.get("resourceGroup"))
                .or_else(|| id_segment(&id, "resourcegroups")),
            subscription_id: non_empty(value.get("subscriptionId"))
                .or_else(|| id_segment(&id, "subscriptions")),
            location: non_empty(value.get("location")),
            kind: non_empty(value.get("kind")),
            id,
            name,
            resource_type,
            sku,
            vm_size,
        })
    }

    pub fn is_virtual_machine(&self) -> bool {
        self.resource_type == "microsoft.compute/virtualmachines"
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Value following `key` in an ARM id, matched case-insensitively.
fn id_segment(id: &str, key: &str) -> Option<String> {
    let mut parts = id.split('/');
    while let Some(part) = parts.next() {
        if part.eq_ignore_ascii_case(key) {
            return parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        }
    }
    None
}

pub fn is_metric_bearing(resource_type: &str) -> bool {
    let resource_type = resource_type.to_lowercase();
    !NON_METRIC_TYPES.contains(&resource_type.as_str()) && !resource_type.ends_with("/extensions")
}

/// Drop non-metric types, dedupe by id, sort by type then name, and cap.
/// Returns the kept resources and whether the cap cut anything off.
pub fn prepare_resources(resources: Vec<AzureResource>, max: usize) -> (Vec<AzureResource>, bool) {
    let mut seen = HashSet::new();
    let mut kept: Vec<AzureResource> = resources
        .into_iter()
        .filter(|r| is_metric_bearing(&r.resource_type))
        .filter(|r| seen.insert(r.id.to_lowercase()))
        .collect();

    kept.sort_by(|a, b| {
        a.resource_type
            .cmp(&b.resource_type)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.id.cmp(&b.id))
    });

    let truncated = kept.len() > max;
    kept.truncate(max);
    (kept, truncated)
}

/// Enabled subscriptions visible to the service principal, narrowed to
/// `allow_list` when it is non-empty.
pub async fn list_subscriptions(
    http: &RetryingHttpClient,
    arm_url: &str,
    token: &str,
    allow_list: &[String],
) -> Result<Vec<Subscription>> {
    let first = HttpRequest::get(format!("{arm_url}/subscriptions"))
        .query("api-version", SUBSCRIPTIONS_API_VERSION)
        .bearer(token);
    let pages = follow_next_links(http, first, token).await?;

    let subscriptions = pages
        .iter()
        .filter(|s| {
            s.get("state")
                .and_then(|v| v.as_str())
                .map_or(true, |state| state.eq_ignore_ascii_case("enabled"))
        })
        .filter_map(|s| {
            let id = non_empty(s.get("subscriptionId"))?;
            Some(Subscription {
                display_name: non_empty(s.get("displayName")).unwrap_or_else(|| id.clone()),
                id,
            })
        })
        .filter(|s| allow_list.is_empty() || allow_list.iter().any(|a| a.eq_ignore_ascii_case(&s.id)))
        .collect();

    Ok(subscriptions)
}

/// One Resource Graph query across every subscription, paged by
/// `$skipToken`.
pub async fn query_resource_graph(
    http: &RetryingHttpClient,
    arm_url: &str,
    token: &str,
    subscriptions: &[Subscription],
    page_size: usize,
) -> Result<Vec<AzureResource>> {
    let url = format!("{arm_url}/providers/Microsoft.ResourceGraph/resources");
    let ids: Vec<&str> = subscriptions.iter().map(|s| s.id.as_str()).collect();
    let mut resources = Vec::new();
    let mut skip_token: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let mut options = json!({
            "$top": page_size.clamp(1, 1000),
            "resultFormat": "objectArray",
        });
        if let Some(skip) = &skip_token {
            options["$skipToken"] = json!(skip);
        }
        let request = HttpRequest::post(url.clone())
            .query("api-version", RESOURCE_GRAPH_API_VERSION)
            .bearer(token)
            .json(json!({
                "subscriptions": ids,
                "query": GRAPH_QUERY,
                "options": options,
            }));

        let body = http.request(&request).await?;
        let rows = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| CloudError::Protocol {
                url: url.clone(),
                message: "resource graph response has no data array".to_string(),
            })?;
        resources.extend(rows.iter().filter_map(AzureResource::from_json));

        skip_token = non_empty(body.get("$skipToken"));
        if skip_token.is_none() {
            return Ok(resources);
        }
    }

    tracing::warn!("Resource graph paging stopped after {} pages", MAX_PAGES);
    Ok(resources)
}

/// Plain ARM listing of one subscription, used when the graph query fails.
pub async fn list_subscription_resources(
    http: &RetryingHttpClient,
    arm_url: &str,
    token: &str,
    subscription: &Subscription,
    page_size: usize,
) -> Result<Vec<AzureResource>> {
    let first = HttpRequest::get(format!("{arm_url}/subscriptions/{}/resources", subscription.id))
        .query("api-version", RESOURCES_API_VERSION)
        .query("$top", page_size.clamp(1, 1000).to_string())
        .bearer(token);
    let rows = follow_next_links(http, first, token).await?;
    Ok(rows.iter().filter_map(AzureResource::from_json).collect())
}

/// Collect `value[]` across pages linked by `nextLink`. The link already
/// carries every query parameter.
async fn follow_next_links(
    http: &RetryingHttpClient,
    first: HttpRequest,
    token: &str,
) -> Result<Vec<Value>> {
    let mut rows = Vec::new();
    let mut request = first;

    for _ in 0..MAX_PAGES {
        let body = http.request(&request).await?;
        if let Some(values) = body.get("value").and_then(|v| v.as_array()) {
            rows.extend(values.iter().cloned());
        }
        match non_empty(body.get("nextLink")) {
            Some(next) => request = HttpRequest::get(next).bearer(token),
            None => return Ok(rows),
        }
    }

    tracing::warn!("ARM paging stopped after {} pages", MAX_PAGES);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(id: &str, name: &str, resource_type: &str) -> AzureResource {
        AzureResource::from_json(&json!({"id": id, "name": name, "type": resource_type})).unwrap()
    }

    #[test]
    fn should_parse_graph_row_and_listing_row_alike() {
        let graph = AzureResource::from_json(&json!({
            "id": "/subscriptions/s1/resourceGroups/rg1/providers/Microsoft.Compute/virtualMachines/vm1",
            "name": "vm1",
            "type": "Microsoft.Compute/virtualMachines",
            "location": "westeurope",
            "resourceGroup": "rg1",
            "subscriptionId": "s1",
            "sku": "",
            "vmSize": "Standard_D2s_v3"
        }))
        .unwrap();
        assert_eq!(graph.resource_type, "microsoft.compute/virtualmachines");
        assert_eq!(graph.vm_size.as_deref(), Some("Standard_D2s_v3"));
        assert!(graph.sku.is_none());
        assert!(graph.is_virtual_machine());

        let listed = AzureResource::from_json(&json!({
            "id": "/subscriptions/s2/resourceGroups/RG2/providers/Microsoft.Storage/storageAccounts/st1",
            "name": "st1",
            "type": "Microsoft.Storage/storageAccounts",
            "sku": {"name": "Standard_LRS"}
        }))
        .unwrap();
        assert_eq!(listed.subscription_id.as_deref(), Some("s2"));
        assert_eq!(listed.resource_group.as_deref(), Some("RG2"));
        assert_eq!(listed.sku.as_deref(), Some("Standard_LRS"));
    }

    #[test]
    fn should_filter_dedupe_sort_and_cap() {
        let input = vec![
            resource("/s/1/vm-b", "vm-b", "Microsoft.Compute/virtualMachines"),
            resource("/s/1/dep", "dep", "Microsoft.Resources/deployments"),
            resource("/s/1/ext", "ext", "Microsoft.Compute/virtualMachines/extensions"),
            resource("/s/1/VM-B", "vm-b", "Microsoft.Compute/virtualMachines"),
            resource("/s/1/db", "db", "Microsoft.Sql/servers/databases"),
            resource("/s/1/vm-a", "vm-a", "Microsoft.Compute/virtualMachines"),
        ];

        let (kept, truncated) = prepare_resources(input.clone(), 10);
        let names: Vec<&str> = kept.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["vm-a", "vm-b", "db"]);
        assert!(!truncated);

        let (kept, truncated) = prepare_resources(input, 2);
        assert_eq!(kept.len(), 2);
        assert!(truncated);
    }

    #[test]
    fn should_not_flag_truncation_at_exact_cap() {
        let input = vec![
            resource("/a", "a", "Microsoft.Web/sites"),
            resource("/b", "b", "Microsoft.Web/sites"),
        ];
        let (kept, truncated) = prepare_resources(input, 2);
        assert_eq!(kept.len(), 2);
        assert!(!truncated);
    }
}
