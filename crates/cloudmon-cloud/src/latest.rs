//! Latest-sample selection shared by every collector.
//!
//! Providers return either a time series (Azure `timeseries[].data[]`,
//! Rackspace plot `values[]`) or a flat list (CloudWatch `Datapoints`). Both
//! are reduced to one [`RawPoint`] with the greatest timestamp, and a single
//! representative value is read from that point alone.

use chrono::{DateTime, Utc};
use cloudmon_common::MetricSample;

/// One observation in provider-neutral form. Fields missing from the
/// provider payload stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPoint {
    pub timestamp: Option<DateTime<Utc>>,
    pub average: Option<f64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    /// Total or sum.
    pub total: Option<f64>,
    /// Count or sample count.
    pub count: Option<f64>,
}

impl RawPoint {
    fn has_value(&self) -> bool {
        representative_value(self).is_some()
    }
}

/// Pick the newest point that carries at least one value.
///
/// Ties, and candidates where either timestamp is missing, go to the
/// candidate examined last.
pub fn select_latest<I>(points: I) -> Option<RawPoint>
where
    I: IntoIterator<Item = RawPoint>,
{
    let mut best: Option<RawPoint> = None;
    for candidate in points.into_iter().filter(RawPoint::has_value) {
        let replace = match &best {
            None => true,
            Some(current) => match (current.timestamp, candidate.timestamp) {
                (Some(cur), Some(cand)) => cand >= cur,
                _ => true,
            },
        };
        if replace {
            best = Some(candidate);
        }
    }
    best
}

/// Representative value by fixed precedence: average, total, maximum,
/// minimum, count.
///
/// ```
/// use cloudmon_cloud::latest::{representative_value, RawPoint};
///
/// let point = RawPoint { average: None, total: Some(50.0), maximum: Some(40.0), ..Default::default() };
/// assert_eq!(representative_value(&point), Some(50.0));
/// ```
pub fn representative_value(point: &RawPoint) -> Option<f64> {
    point
        .average
        .or(point.total)
        .or(point.maximum)
        .or(point.minimum)
        .or(point.count)
        .filter(|v| v.is_finite())
}

/// Reduce `points` to a [`MetricSample`], or `None` when no point has data.
pub fn latest_sample<I>(
    name: &str,
    namespace: Option<&str>,
    unit: Option<&str>,
    points: I,
) -> Option<MetricSample>
where
    I: IntoIterator<Item = RawPoint>,
{
    let point = select_latest(points)?;
    let value = representative_value(&point)?;
    Some(MetricSample {
        name: name.to_string(),
        namespace: namespace.map(str::to_string),
        unit: unit.map(str::to_string),
        value,
        average: point.average,
        minimum: point.minimum,
        maximum: point.maximum,
        total: point.total,
        count: point.count,
        timestamp: point.timestamp,
    })
}
