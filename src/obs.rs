use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::model::Metadata;
use crate::store::Store;

pub const EVENT_TYPE_SPAN: &str = "span";
pub const EVENT_TYPE_METRIC: &str = "metric";

thread_local! {
    static RUN_CONTEXT: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// The run id bound to the current thread, if any.
pub fn current_run_id() -> Option<String> {
    RUN_CONTEXT.with(|stack| stack.borrow().last().cloned())
}

/// Bind a run id for the duration of `f`. Nesting overrides; leaving
/// restores the previous binding, unwinding included.
pub fn with_run_context<T>(run_id: &str, f: impl FnOnce() -> T) -> T {
    struct ContextGuard;
    impl Drop for ContextGuard {
        fn drop(&mut self) {
            RUN_CONTEXT.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }

    RUN_CONTEXT.with(|stack| stack.borrow_mut().push(run_id.to_string()));
    let _guard = ContextGuard;
    f()
}

#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub name: String,
    pub duration_ms: f64,
    pub status: &'static str,
    pub attributes: Metadata,
    pub error: Option<String>,
    pub run_id: Option<String>,
}

/// Where spans and metrics go. The live sink writes `events` rows; the noop
/// sink exists for benchmark and test builds.
pub trait TelemetrySink: Send + Sync {
    fn record_span(&self, record: SpanRecord);
    fn record_metric(&self, name: &str, value: f64, attributes: Metadata, run_id: Option<String>);
}

pub struct StoreSink {
    store: Arc<Store>,
}

impl StoreSink {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl TelemetrySink for StoreSink {
    fn record_span(&self, record: SpanRecord) {
        let mut metadata = Metadata::new();
        metadata.insert("status".into(), record.status.into());
        if !record.attributes.is_empty() {
            metadata.insert(
                "attributes".into(),
                serde_json::Value::Object(record.attributes),
            );
        }
        if let Some(error) = record.error {
            metadata.insert("error".into(), error.into());
        }
        if let Err(err) = self.store.append_event(
            EVENT_TYPE_SPAN,
            &record.name,
            Some(record.duration_ms),
            record.run_id.as_deref(),
            metadata,
        ) {
            tracing::warn!(error = %err, "failed to record span");
        }
    }

    fn record_metric(&self, name: &str, value: f64, attributes: Metadata, run_id: Option<String>) {
        if let Err(err) =
            self.store
                .append_event(EVENT_TYPE_METRIC, name, Some(value), run_id.as_deref(), attributes)
        {
            tracing::warn!(error = %err, "failed to record metric");
        }
    }
}

/// Sink with zero side effects.
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record_span(&self, _record: SpanRecord) {}
    fn record_metric(&self, _name: &str, _value: f64, _attributes: Metadata, _run_id: Option<String>) {
    }
}

/// Span/metric recording over a pluggable sink.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    pub fn store_backed(store: Arc<Store>) -> Self {
        Self::new(Arc::new(StoreSink::new(store)))
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    /// Time `f` and record one span row on completion, success or error.
    /// The current run context is attached automatically.
    pub fn with_span<T>(
        &self,
        name: &str,
        attributes: Metadata,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let started = Instant::now();
        let result = f();
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (status, error) = match &result {
            Ok(_) => ("ok", None),
            Err(err) => ("error", Some(err.to_string())),
        };
        self.sink.record_span(SpanRecord {
            name: name.to_string(),
            duration_ms,
            status,
            attributes,
            error,
            run_id: current_run_id(),
        });
        result
    }

    pub fn record_metric(&self, name: &str, value: f64, attributes: Metadata) {
        self.sink
            .record_metric(name, value, attributes, current_run_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TxError;

    fn store_telemetry() -> (Arc<Store>, Telemetry) {
        let store = Arc::new(Store::open_memory().unwrap());
        let telemetry = Telemetry::store_backed(Arc::clone(&store));
        (store, telemetry)
    }

    #[test]
    fn span_records_duration_and_status() {
        let (store, telemetry) = store_telemetry();

        let out = telemetry
            .with_span("sync.export", Metadata::new(), || Ok(21 * 2))
            .unwrap();
        assert_eq!(out, 42);

        let events = store.list_events(None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "span");
        assert_eq!(events[0].content, "sync.export");
        assert!(events[0].duration_ms.is_some());
        assert_eq!(events[0].metadata["status"], "ok");
    }

    #[test]
    fn failed_span_keeps_error_and_propagates() {
        let (store, telemetry) = store_telemetry();

        let result: Result<()> =
            telemetry.with_span("doomed", Metadata::new(), || Err(TxError::EmptyTitle));
        assert!(result.is_err());

        let events = store.list_events(None).unwrap();
        assert_eq!(events[0].metadata["status"], "error");
        assert!(
            events[0].metadata["error"]
                .as_str()
                .unwrap()
                .contains("title")
        );
    }

    #[test]
    fn metric_rows_carry_value_in_duration_column() {
        let (store, telemetry) = store_telemetry();
        telemetry.record_metric("search.candidates", 17.0, Metadata::new());

        let events = store.list_events(None).unwrap();
        assert_eq!(events[0].event_type, "metric");
        assert_eq!(events[0].duration_ms, Some(17.0));
    }

    #[test]
    fn run_context_nests_and_restores() {
        assert_eq!(current_run_id(), None);
        with_run_context("run-aaaaaaaaaaaa", || {
            assert_eq!(current_run_id().as_deref(), Some("run-aaaaaaaaaaaa"));
            with_run_context("run-bbbbbbbbbbbb", || {
                assert_eq!(current_run_id().as_deref(), Some("run-bbbbbbbbbbbb"));
            });
            assert_eq!(current_run_id().as_deref(), Some("run-aaaaaaaaaaaa"));
        });
        assert_eq!(current_run_id(), None);
    }

    #[test]
    fn spans_inside_run_context_are_attributed() {
        let (store, telemetry) = store_telemetry();
        with_run_context("run-cccccccccccc", || {
            telemetry
                .with_span("inside", Metadata::new(), || Ok(()))
                .unwrap();
        });

        let events = store.list_events(None).unwrap();
        assert_eq!(events[0].run_id.as_deref(), Some("run-cccccccccccc"));
    }

    #[test]
    fn noop_sink_writes_nothing() {
        let store = Arc::new(Store::open_memory().unwrap());
        let telemetry = Telemetry::noop();
        telemetry
            .with_span("silent", Metadata::new(), || Ok(()))
            .unwrap();
        telemetry.record_metric("silent.metric", 1.0, Metadata::new());
        assert!(store.list_events(None).unwrap().is_empty());
    }
}
