//! Synthesizing resources out of CloudWatch metric dimensions.

use crate::credentials::CloudAccount;
use cloudmon_common::{Provider, ResourceDescriptor};
use serde_json::Value;
use std::collections::BTreeMap;

/// Dimension names that identify a resource, most specific first.
pub const PRIMARY_DIMENSIONS: [&str; 20] = [
    "InstanceId",
    "DBInstanceIdentifier",
    "DBClusterIdentifier",
    "LoadBalancer",
    "LoadBalancerName",
    "TargetGroup",
    "BucketName",
    "FunctionName",
    "TableName",
    "QueueName",
    "TopicName",
    "CacheClusterId",
    "ClusterName",
    "ServiceName",
    "AutoScalingGroupName",
    "VolumeId",
    "NatGatewayId",
    "ApiName",
    "DomainName",
    "StreamName",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

/// One `ListMetrics` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Vec<Dimension>,
}

impl MetricDefinition {
    pub fn from_json(value: &Value) -> Option<Self> {
        let namespace = value.get("Namespace")?.as_str()?.to_string();
        let metric_name = value.get("MetricName")?.as_str()?.to_string();
        let dimensions = value
            .get("Dimensions")
            .and_then(|d| d.as_array())
            .map(|dims| {
                dims.iter()
                    .filter_map(|d| {
                        Some(Dimension {
                            name: d.get("Name")?.as_str()?.to_string(),
                            value: d.get("Value")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            namespace,
            metric_name,
            dimensions,
        })
    }

    pub fn primary_dimension(&self) -> Option<&Dimension> {
        primary_dimension(&self.dimensions)
    }

    /// Sample name within the owning resource. Dimensions other than the
    /// primary one are appended so that, for example, per-AZ load balancer
    /// series stay distinguishable.
    pub fn sample_name(&self) -> String {
        let primary = self.primary_dimension();
        let extra: Vec<String> = self
            .dimensions
            .iter()
            .filter(|d| Some(*d) != primary)
            .map(|d| format!("{}={}", d.name, d.value))
            .collect();
        if extra.is_empty() {
            self.metric_name.clone()
        } else {
            format!("{}[{}]", self.metric_name, extra.join(","))
        }
    }
}

/// The dimension that names the owning resource: the first match in
/// [`PRIMARY_DIMENSIONS`], else the first dimension present.
pub fn primary_dimension(dimensions: &[Dimension]) -> Option<&Dimension> {
    PRIMARY_DIMENSIONS
        .iter()
        .find_map(|name| dimensions.iter().find(|d| d.name == *name))
        .or_else(|| dimensions.first())
}

/// `AWS/EC2` + `InstanceId` becomes `aws/ec2/instanceid`. Custom
/// namespaces land under `aws/custom/`.
pub fn resource_type(namespace: &str, dimension_name: Option<&str>) -> String {
    let lowered = namespace.to_lowercase();
    let service = match lowered.strip_prefix("aws/") {
        Some(rest) => rest.to_string(),
        None => format!("custom/{}", lowered.replace(' ', "-")),
    };
    let dimension = dimension_name
        .map(str::to_lowercase)
        .unwrap_or_else(|| "namespace".to_string());
    format!("aws/{service}/{dimension}")
}

pub fn resource_id(
    account_id: &str,
    region: &str,
    namespace: &str,
    dimension: Option<&Dimension>,
) -> String {
    match dimension {
        Some(d) => format!(
            "aws://{account_id}/{region}/{namespace}/{}/{}",
            d.name, d.value
        ),
        None => format!("aws://{account_id}/{region}/{namespace}"),
    }
}

/// A synthesized resource and the metric definitions it owns.
#[derive(Debug, Clone)]
pub struct AwsResource {
    pub descriptor: ResourceDescriptor,
    pub metrics: Vec<MetricDefinition>,
}

/// Group definitions by primary dimension identity, ordered by resource id.
pub fn group_into_resources(
    account: &CloudAccount,
    region: &str,
    definitions: Vec<MetricDefinition>,
) -> Vec<AwsResource> {
    let mut grouped: BTreeMap<String, AwsResource> = BTreeMap::new();

    for definition in definitions {
        let primary = definition.primary_dimension().cloned();
        let id = resource_id(
            &account.account_id,
            region,
            &definition.namespace,
            primary.as_ref(),
        );

        let entry = grouped.entry(id.clone()).or_insert_with(|| {
            let (name, dimension_name) = match &primary {
                Some(d) => (d.value.clone(), Some(d.name.as_str())),
                None => (definition.namespace.clone(), None),
            };
            let mut descriptor = ResourceDescriptor::new(
                Provider::Aws,
                id,
                name,
                resource_type(&definition.namespace, dimension_name),
                account.account_id.clone(),
            );
            descriptor.location = Some(region.to_string());
            descriptor
                .metadata
                .insert("namespace".into(), definition.namespace.clone().into());
            descriptor
                .metadata
                .insert("account_name".into(), account.display_name.clone().into());
            if let Some(d) = &primary {
                descriptor
                    .metadata
                    .insert("dimension_name".into(), d.name.clone().into());
                descriptor
                    .metadata
                    .insert("dimension_value".into(), d.value.clone().into());
            }
            AwsResource {
                descriptor,
                metrics: Vec::new(),
            }
        });
        entry.metrics.push(definition);
    }

    grouped.into_values().collect()
}
