//! Bounded in-process store of request traces with filtered search.
//! Traces are written out-of-band; a failed write never fails a request.

use conduit_core::{OperationType, RequestTrace, TraceStatus};
use parking_lot::RwLock;
use std::collections::VecDeque;

const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub operation: Option<OperationType>,
    pub provider: Option<String>,
    pub virtual_key: Option<String>,
    pub status: Option<TraceStatus>,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub limit: Option<usize>,
}

pub struct TraceStore {
    capacity: usize,
    traces: RwLock<VecDeque<RequestTrace>>,
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl TraceStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            traces: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn record(&self, trace: RequestTrace) {
        let mut traces = self.traces.write();
        if traces.len() == self.capacity {
            traces.pop_front();
        }
        traces.push_back(trace);
    }

    pub fn len(&self) -> usize {
        self.traces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.read().is_empty()
    }

    pub fn get(&self, trace_id: &str) -> Option<RequestTrace> {
        self.traces
            .read()
            .iter()
            .find(|t| t.trace_id == trace_id)
            .cloned()
    }

    /// Newest-first search over the retained window.
    pub fn search(&self, query: &TraceQuery) -> Vec<RequestTrace> {
        let traces = self.traces.read();
        let limit = query.limit.unwrap_or(100);
        traces
            .iter()
            .rev()
            .filter(|t| query.operation.is_none_or(|op| t.operation == op))
            .filter(|t| {
                query
                    .provider
                    .as_deref()
                    .is_none_or(|p| t.provider.as_deref() == Some(p))
            })
            .filter(|t| {
                query
                    .virtual_key
                    .as_deref()
                    .is_none_or(|k| t.virtual_key.as_deref() == Some(k))
            })
            .filter(|t| query.status.is_none_or(|s| t.status == s))
            .filter(|t| query.min_duration_ms.is_none_or(|min| t.duration_ms >= min))
            .filter(|t| query.max_duration_ms.is_none_or(|max| t.duration_ms <= max))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn trace(id: &str, provider: &str, status: TraceStatus, duration_ms: u64) -> RequestTrace {
        RequestTrace {
            trace_id: id.to_string(),
            started_at: chrono::Utc::now(),
            duration_ms,
            operation: OperationType::Chat,
            provider: Some(provider.to_string()),
            virtual_key: Some("vk1".to_string()),
            status,
            error_kind: None,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn search_filters_compose() {
        let store = TraceStore::default();
        store.record(trace("t1", "openai", TraceStatus::Ok, 120));
        store.record(trace("t2", "groq", TraceStatus::Error, 80));
        store.record(trace("t3", "groq", TraceStatus::Ok, 2400));

        let results = store.search(&TraceQuery {
            provider: Some("groq".to_string()),
            status: Some(TraceStatus::Ok),
            min_duration_ms: Some(1000),
            ..Default::default()
        });
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].trace_id, "t3");
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = TraceStore::with_capacity(2);
        store.record(trace("t1", "a", TraceStatus::Ok, 1));
        store.record(trace("t2", "a", TraceStatus::Ok, 1));
        store.record(trace("t3", "a", TraceStatus::Ok, 1));
        assert_eq!(store.len(), 2);
        assert!(store.get("t1").is_none());
        assert!(store.get("t3").is_some());
    }
}
