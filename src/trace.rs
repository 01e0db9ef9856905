//! Trace context propagation
//!
//! Carries trace/span identifiers in event headers so that a workflow can
//! be followed across publishers, retries and the Kafka bridge. Export is
//! through an injected `SpanExporter`; no vendor protocol is assumed.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const SPAN_ID_HEADER: &str = "x-span-id";
pub const PARENT_SPAN_ID_HEADER: &str = "x-parent-span-id";
pub const SAMPLED_HEADER: &str = "x-sampled";

/// Identifiers linking spans across a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// 32 lowercase hex chars
    pub trace_id: String,
    /// 16 lowercase hex chars
    pub span_id: String,
    /// 16 hex chars, or empty for a root span
    pub parent_span_id: String,
    pub sampled: bool,
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

impl TraceContext {
    /// Start a new root trace
    pub fn new_root() -> Self {
        Self {
            trace_id: random_hex(16),
            span_id: random_hex(8),
            parent_span_id: String::new(),
            sampled: true,
        }
    }

    /// Derive a child context within the same trace
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex(8),
            parent_span_id: self.span_id.clone(),
            sampled: self.sampled,
        }
    }

    /// Parse a context from event headers
    ///
    /// Returns None when the headers are absent or malformed.
    pub fn from_headers(headers: &HashMap<String, String>) -> Option<Self> {
        let trace_id = headers.get(TRACE_ID_HEADER)?;
        let span_id = headers.get(SPAN_ID_HEADER)?;
        if trace_id.len() != 32 || !is_hex(trace_id) {
            return None;
        }
        if span_id.len() != 16 || !is_hex(span_id) {
            return None;
        }

        let parent_span_id = headers
            .get(PARENT_SPAN_ID_HEADER)
            .cloned()
            .unwrap_or_default();
        if !parent_span_id.is_empty() && (parent_span_id.len() != 16 || !is_hex(&parent_span_id)) {
            return None;
        }

        Some(Self {
            trace_id: trace_id.clone(),
            span_id: span_id.clone(),
            parent_span_id,
            sampled: headers
                .get(SAMPLED_HEADER)
                .map(|v| v == "true")
                .unwrap_or(true),
        })
    }

    /// Write the context into event headers
    pub fn inject(&self, headers: &mut HashMap<String, String>) {
        headers.insert(TRACE_ID_HEADER.to_string(), self.trace_id.clone());
        headers.insert(SPAN_ID_HEADER.to_string(), self.span_id.clone());
        headers.insert(
            PARENT_SPAN_ID_HEADER.to_string(),
            self.parent_span_id.clone(),
        );
        headers.insert(SAMPLED_HEADER.to_string(), self.sampled.to_string());
    }
}

fn is_hex(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_hexdigit())
}

/// A finished unit of work reported to the exporter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub context: TraceContext,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub ok: bool,
    pub attributes: HashMap<String, String>,
}

/// Receives finished spans; implementations ship them wherever they like
pub trait SpanExporter: Send + Sync {
    fn export(&self, span: SpanRecord);
}

/// Exporter that drops every span
#[derive(Debug, Clone, Default)]
pub struct NoopExporter;

impl SpanExporter for NoopExporter {
    fn export(&self, _span: SpanRecord) {}
}

/// Exporter that forwards spans to the `tracing` subscriber
#[derive(Debug, Clone, Default)]
pub struct TracingExporter;

impl SpanExporter for TracingExporter {
    fn export(&self, span: SpanRecord) {
        tracing::debug!(
            trace_id = span.context.trace_id.as_str(),
            span_id = span.context.span_id.as_str(),
            parent_span_id = span.context.parent_span_id.as_str(),
            name = span.name.as_str(),
            duration_ms = span.duration.as_millis() as u64,
            ok = span.ok,
            "span finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_context_shape() {
        let ctx = TraceContext::new_root();
        assert_eq!(ctx.trace_id.len(), 32);
        assert_eq!(ctx.span_id.len(), 16);
        assert!(ctx.parent_span_id.is_empty());
        assert!(ctx.sampled);
    }

    #[test]
    fn child_keeps_trace_and_links_parent() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id, root.span_id);
        assert_ne!(child.span_id, root.span_id);
    }

    #[test]
    fn header_round_trip() {
        let ctx = TraceContext::new_root();
        let mut headers = HashMap::new();
        ctx.inject(&mut headers);

        let parsed = TraceContext::from_headers(&headers).unwrap();
        assert_eq!(parsed, ctx);
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let mut headers = HashMap::new();
        headers.insert(TRACE_ID_HEADER.to_string(), "not-hex".to_string());
        headers.insert(SPAN_ID_HEADER.to_string(), "0011223344556677".to_string());
        assert!(TraceContext::from_headers(&headers).is_none());
    }
}
