//! # Telemetry Topics
//!
//! Parsing for the hierarchical telemetry topic and the topic filters used
//! in device provisioning and subscriptions.
//!
//! ## Topic Layout
//! ```text
//! iot / telemetry / {tenantId} / {farmId} / {barnId} / {deviceId} / {metric}
//!  0        1           2            3          4           5           6
//! ```
//!
//! Filters use the same seven positions. `+` matches exactly one segment,
//! `#` is only accepted in the metric position and matches any metric.

use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::validation::validate_segment;
use crate::{TOPIC_KIND, TOPIC_ROOT, TOPIC_SEGMENTS};

/// Field names for the five variable positions, used in error messages.
const SEGMENT_FIELDS: [&str; 5] = ["tenant_id", "farm_id", "barn_id", "device_id", "metric"];

// =============================================================================
// Telemetry Topic
// =============================================================================

/// A concrete (wildcard-free) telemetry topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TelemetryTopic {
    pub tenant_id: String,
    pub farm_id: String,
    pub barn_id: String,
    pub device_id: String,
    pub metric: String,
}

impl TelemetryTopic {
    /// Parses `iot/telemetry/{tenant}/{farm}/{barn}/{device}/{metric}`.
    ///
    /// ## Example
    /// ```rust
    /// use agrilink_core::topic::TelemetryTopic;
    ///
    /// let topic = TelemetryTopic::parse("iot/telemetry/t1/f1/b1/dev-7/temperature").unwrap();
    /// assert_eq!(topic.device_id, "dev-7");
    /// assert!(TelemetryTopic::parse("iot/telemetry/t1/f1/b1/dev-7").is_err());
    /// ```
    pub fn parse(topic: &str) -> CoreResult<Self> {
        let segments = split_prefixed(topic)?;

        for (field, value) in SEGMENT_FIELDS.iter().zip(segments.iter()) {
            validate_segment(field, value)
                .map_err(|e| CoreError::malformed(topic, e.to_string()))?;
        }

        Ok(TelemetryTopic {
            tenant_id: segments[0].to_string(),
            farm_id: segments[1].to_string(),
            barn_id: segments[2].to_string(),
            device_id: segments[3].to_string(),
            metric: segments[4].to_string(),
        })
    }

    /// Builds a topic from already-validated parts.
    pub fn new(
        tenant_id: impl Into<String>,
        farm_id: impl Into<String>,
        barn_id: impl Into<String>,
        device_id: impl Into<String>,
        metric: impl Into<String>,
    ) -> CoreResult<Self> {
        let topic = TelemetryTopic {
            tenant_id: tenant_id.into(),
            farm_id: farm_id.into(),
            barn_id: barn_id.into(),
            device_id: device_id.into(),
            metric: metric.into(),
        };
        // Round-trip through the parser so both constructors share one rule set.
        TelemetryTopic::parse(&topic.to_string())
    }
}

impl fmt::Display for TelemetryTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}/{}",
            TOPIC_ROOT,
            TOPIC_KIND,
            self.tenant_id,
            self.farm_id,
            self.barn_id,
            self.device_id,
            self.metric
        )
    }
}

// =============================================================================
// Topic Filter
// =============================================================================

/// One position of a topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSegment {
    /// Must equal this value.
    Literal(String),
    /// `+`: any single segment.
    AnyOne,
    /// `#`: any metric (only valid in the metric position).
    AnyRest,
}

impl FilterSegment {
    /// Returns the literal value, if this segment is not a wildcard.
    pub fn literal(&self) -> Option<&str> {
        match self {
            FilterSegment::Literal(value) => Some(value),
            _ => None,
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            FilterSegment::Literal(expected) => expected == value,
            FilterSegment::AnyOne | FilterSegment::AnyRest => true,
        }
    }

    /// Returns true if every segment matched by `other` is also matched by `self`.
    ///
    /// `#` can only sit in the last position, so there it spans the same
    /// values as `+`.
    fn covers(&self, other: &FilterSegment) -> bool {
        match (self, other) {
            (FilterSegment::AnyOne | FilterSegment::AnyRest, _) => true,
            (FilterSegment::Literal(a), FilterSegment::Literal(b)) => a == b,
            (FilterSegment::Literal(_), _) => false,
        }
    }
}

impl fmt::Display for FilterSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterSegment::Literal(value) => f.write_str(value),
            FilterSegment::AnyOne => f.write_str("+"),
            FilterSegment::AnyRest => f.write_str("#"),
        }
    }
}

/// A telemetry topic filter (`iot/telemetry/t1/+/+/dev-7/#`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    /// The five variable positions: tenant, farm, barn, device, metric.
    segments: [FilterSegment; 5],
}

impl TopicFilter {
    /// Parses a filter. `#` is only accepted in the metric position.
    pub fn parse(filter: &str) -> CoreResult<Self> {
        let raw = split_prefixed(filter)?;
        let mut segments: Vec<FilterSegment> = Vec::with_capacity(5);

        for (index, (field, value)) in SEGMENT_FIELDS.iter().zip(raw.iter()).enumerate() {
            let segment = match *value {
                "+" => FilterSegment::AnyOne,
                "#" if index == 4 => FilterSegment::AnyRest,
                "#" => {
                    return Err(CoreError::malformed(
                        filter,
                        "'#' is only allowed in the metric position",
                    ))
                }
                literal => {
                    validate_segment(field, literal)
                        .map_err(|e| CoreError::malformed(filter, e.to_string()))?;
                    FilterSegment::Literal(literal.to_string())
                }
            };
            segments.push(segment);
        }

        let segments: [FilterSegment; 5] = segments
            .try_into()
            .map_err(|_| CoreError::malformed(filter, "expected five variable segments"))?;

        Ok(TopicFilter { segments })
    }

    /// Tenant position.
    pub fn tenant(&self) -> &FilterSegment {
        &self.segments[0]
    }

    /// Device position.
    pub fn device(&self) -> &FilterSegment {
        &self.segments[3]
    }

    /// Returns true if the concrete topic matches this filter.
    pub fn matches(&self, topic: &TelemetryTopic) -> bool {
        let values = [
            topic.tenant_id.as_str(),
            topic.farm_id.as_str(),
            topic.barn_id.as_str(),
            topic.device_id.as_str(),
            topic.metric.as_str(),
        ];
        self.segments
            .iter()
            .zip(values.iter())
            .all(|(segment, value)| segment.matches(value))
    }

    /// Returns true if every topic matched by `other` is matched by `self`.
    pub fn covers(&self, other: &TopicFilter) -> bool {
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(mine, theirs)| mine.covers(theirs))
    }
}

impl From<&TelemetryTopic> for TopicFilter {
    fn from(topic: &TelemetryTopic) -> Self {
        TopicFilter {
            segments: [
                FilterSegment::Literal(topic.tenant_id.clone()),
                FilterSegment::Literal(topic.farm_id.clone()),
                FilterSegment::Literal(topic.barn_id.clone()),
                FilterSegment::Literal(topic.device_id.clone()),
                FilterSegment::Literal(topic.metric.clone()),
            ],
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", TOPIC_ROOT, TOPIC_KIND)?;
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Splits a topic, checks the fixed `iot/telemetry` prefix and returns the
/// five variable segments.
fn split_prefixed(topic: &str) -> CoreResult<Vec<&str>> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() != TOPIC_SEGMENTS {
        return Err(CoreError::malformed(
            topic,
            format!("expected {} segments, got {}", TOPIC_SEGMENTS, parts.len()),
        ));
    }

    if parts[0] != TOPIC_ROOT || parts[1] != TOPIC_KIND {
        return Err(CoreError::malformed(
            topic,
            format!("topic must start with '{}/{}'", TOPIC_ROOT, TOPIC_KIND),
        ));
    }

    Ok(parts[2..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_topic() {
        let topic = TelemetryTopic::parse("iot/telemetry/t1/f1/b1/dev-7/temperature").unwrap();
        assert_eq!(topic.tenant_id, "t1");
        assert_eq!(topic.farm_id, "f1");
        assert_eq!(topic.barn_id, "b1");
        assert_eq!(topic.device_id, "dev-7");
        assert_eq!(topic.metric, "temperature");
        assert_eq!(topic.to_string(), "iot/telemetry/t1/f1/b1/dev-7/temperature");
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        for bad in [
            "",
            "iot/telemetry/t1/f1/b1/dev-7",
            "iot/telemetry/t1/f1/b1/dev-7/temp/extra",
            "iot/telemetry/t1//b1/dev-7/temp",
            "iot/telemetry/t1/f1/b1/dev-7/",
            "mqtt/telemetry/t1/f1/b1/dev-7/temp",
            "iot/events/t1/f1/b1/dev-7/temp",
            "iot/telemetry/t1/+/b1/dev-7/temp",
            "iot/telemetry/t1/f1/b1/dev-7/#",
            "iot/telemetry/t 1/f1/b1/dev-7/temp",
        ] {
            assert!(
                matches!(TelemetryTopic::parse(bad), Err(CoreError::MalformedTopic { .. })),
                "expected MalformedTopic for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_new_validates() {
        assert!(TelemetryTopic::new("t1", "f1", "b1", "dev-7", "humidity").is_ok());
        assert!(TelemetryTopic::new("t1", "f1", "b/1", "dev-7", "humidity").is_err());
    }

    #[test]
    fn test_filter_matching() {
        let filter = TopicFilter::parse("iot/telemetry/t1/+/+/dev-7/#").unwrap();
        let topic = TelemetryTopic::parse("iot/telemetry/t1/f9/b3/dev-7/co2").unwrap();
        assert!(filter.matches(&topic));

        let other = TelemetryTopic::parse("iot/telemetry/t1/f9/b3/dev-8/co2").unwrap();
        assert!(!filter.matches(&other));

        assert_eq!(filter.to_string(), "iot/telemetry/t1/+/+/dev-7/#");
    }

    #[test]
    fn test_hash_only_in_metric_position() {
        assert!(TopicFilter::parse("iot/telemetry/t1/#/b1/dev-7/temp").is_err());
        assert!(TopicFilter::parse("iot/telemetry/t1/f1/b1/dev-7/#").is_ok());
    }

    #[test]
    fn test_filter_covers() {
        let allowed = TopicFilter::parse("iot/telemetry/t1/f1/+/dev-7/+").unwrap();
        let narrow = TopicFilter::parse("iot/telemetry/t1/f1/b2/dev-7/+").unwrap();
        let wider = TopicFilter::parse("iot/telemetry/t1/+/b2/dev-7/+").unwrap();
        let all_metrics = TopicFilter::parse("iot/telemetry/t1/f1/b2/dev-7/#").unwrap();

        assert!(allowed.covers(&narrow));
        assert!(!allowed.covers(&wider));
        // '+' in the metric position already spans every metric
        assert!(allowed.covers(&all_metrics));
        assert!(!narrow.covers(&allowed));
    }
}
