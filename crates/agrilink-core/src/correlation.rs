//! # Correlation Propagation
//!
//! Carries request, trace and tenant identifiers across the device → edge →
//! cloud hop. Header names are matched case-insensitively; empty values are
//! treated as absent.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const TENANT_ID_HEADER: &str = "x-tenant-id";

/// Identifiers propagated alongside a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationContext {
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl CorrelationContext {
    /// Builds a context from `(name, value)` header pairs.
    ///
    /// ## Example
    /// ```rust
    /// use agrilink_core::CorrelationContext;
    ///
    /// let ctx = CorrelationContext::from_headers([("X-Request-Id", "abc"), ("x-trace-id", "")]);
    /// assert_eq!(ctx.request_id.as_deref(), Some("abc"));
    /// assert_eq!(ctx.trace_id, None);
    /// ```
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut ctx = CorrelationContext::default();

        for (name, value) in headers {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let slot = if name.eq_ignore_ascii_case(REQUEST_ID_HEADER) {
                &mut ctx.request_id
            } else if name.eq_ignore_ascii_case(TRACE_ID_HEADER) {
                &mut ctx.trace_id
            } else if name.eq_ignore_ascii_case(TENANT_ID_HEADER) {
                &mut ctx.tenant_id
            } else {
                continue;
            };
            slot.get_or_insert_with(|| value.to_string());
        }

        ctx
    }

    /// The propagated request id, or a fresh UUID v4.
    pub fn correlation_id(&self) -> String {
        self.request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Header pairs for the values that are present.
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        [
            (REQUEST_ID_HEADER, &self.request_id),
            (TRACE_ID_HEADER, &self.trace_id),
            (TENANT_ID_HEADER, &self.tenant_id),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.clone().map(|v| (name, v)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_is_propagated() {
        let ctx = CorrelationContext::from_headers([
            ("x-request-id", "req-1"),
            ("x-tenant-id", "t1"),
            ("content-type", "application/json"),
        ]);
        assert_eq!(ctx.correlation_id(), "req-1");
        assert_eq!(ctx.tenant_id.as_deref(), Some("t1"));
        assert_eq!(ctx.trace_id, None);
    }

    #[test]
    fn test_missing_request_id_generates_uuid() {
        let ctx = CorrelationContext::from_headers([("x-request-id", "   ")]);
        let id = ctx.correlation_id();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_ne!(id, ctx.correlation_id());
    }

    #[test]
    fn test_first_value_wins() {
        let ctx = CorrelationContext::from_headers([("X-Trace-Id", "a"), ("x-trace-id", "b")]);
        assert_eq!(ctx.trace_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_to_headers() {
        let ctx = CorrelationContext {
            request_id: Some("r".into()),
            trace_id: None,
            tenant_id: Some("t".into()),
        };
        assert_eq!(
            ctx.to_headers(),
            vec![(REQUEST_ID_HEADER, "r".to_string()), (TENANT_ID_HEADER, "t".to_string())]
        );
    }
}
