use crate::error::Result;
use crate::http::{HttpRequest, RetryingHttpClient};
use chrono::{DateTime, Utc};
use cloudmon_common::MetricSample;
use std::collections::HashMap;

const COMPUTE_API_VERSION: &str = "2023-03-01";

pub const PROVISIONED_MEMORY_METRIC: &str = "Provisioned VM Memory";

/// VM size name (lowercase) to provisioned memory in MB.
pub type SizeCatalog = HashMap<String, u64>;

pub async fn fetch_size_catalog(
    http: &RetryingHttpClient,
    arm_url: &str,
    token: &str,
    subscription_id: &str,
    location: &str,
) -> Result<SizeCatalog> {
    let request = HttpRequest::get(format!(
        "{arm_url}/subscriptions/{subscription_id}/providers/Microsoft.Compute/locations/{location}/vmSizes"
    ))
    .query("api-version", COMPUTE_API_VERSION)
    .bearer(token);

    let body = http.request(&request).await?;
    let catalog = body
        .get("value")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|size| {
            let name = size.get("name")?.as_str()?.to_lowercase();
            let memory_mb = size.get("memoryInMB")?.as_u64().filter(|mb| *mb > 0)?;
            Some((name, memory_mb))
        })
        .collect();
    Ok(catalog)
}

/// Whether the VM already reports memory on its own (guest agent or
/// platform metric).
pub fn has_native_memory_metric(samples: &[MetricSample]) -> bool {
    samples
        .iter()
        .any(|s| s.name.to_lowercase().contains("memory"))
}

/// Constant sample carrying the size's provisioned memory, in bytes.
/// `None` for a size that reports no memory.
pub fn provisioned_memory_sample(memory_mb: u64, at: DateTime<Utc>) -> Option<MetricSample> {
    if memory_mb == 0 {
        return None;
    }
    let bytes = memory_mb.saturating_mul(1024 * 1024) as f64;
    Some(MetricSample {
        name: PROVISIONED_MEMORY_METRIC.to_string(),
        namespace: Some("Microsoft.Compute/virtualMachines".to_string()),
        unit: Some("Bytes".to_string()),
        value: bytes,
        average: Some(bytes),
        minimum: Some(bytes),
        maximum: Some(bytes),
        total: None,
        count: None,
        timestamp: Some(at),
    })
}
