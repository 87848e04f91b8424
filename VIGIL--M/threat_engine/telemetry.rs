use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};

/// Builder for engine telemetry sinks.
pub struct EngineTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    log_sinks: Vec<Arc<dyn LogSink>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl EngineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            log_sinks: Vec::new(),
            event_publisher: None,
        }
    }

    /// Sets the JSON log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Adds an extra sink (in-memory capture, custom forwarders).
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sinks.push(sink);
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<EngineTelemetry> {
        let mut sinks = self.log_sinks;
        if let Some(path) = self.log_path {
            sinks.push(Arc::new(JsonLogger::new(path)?));
        }
        Ok(EngineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                sinks,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared by the orchestrator and its components.
#[derive(Clone)]
pub struct EngineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for EngineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTelemetry")
            .field("module", &self.inner.module)
            .field("sinks", &self.inner.sinks.len())
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

impl Default for EngineTelemetry {
    fn default() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: "threat_engine".into(),
                sinks: Vec::new(),
                publisher: None,
            }),
        }
    }
}

struct TelemetryInner {
    module: String,
    sinks: Vec<Arc<dyn LogSink>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl EngineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> EngineTelemetryBuilder {
        EngineTelemetryBuilder::new(module)
    }

    /// Module name stamped on records.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Writes a structured record to every sink; stops at the first sink error.
    pub fn log(
        &self,
        level: LogLevel,
        message: &str,
        analysis_id: Option<&str>,
        metadata: Value,
    ) -> Result<()> {
        if self.inner.sinks.is_empty() {
            return Ok(());
        }
        let mut record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
        if let Some(id) = analysis_id {
            record = record.with_analysis(id);
        }
        for sink in &self.inner.sinks {
            sink.write(&record)?;
        }
        Ok(())
    }

    /// Publishes an event when a publisher is configured.
    pub async fn event(
        &self,
        event_type: &str,
        analysis_id: Option<&str>,
        payload: Value,
    ) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            let mut record = EventRecord::new(&self.inner.module, event_type, payload);
            if let Some(id) = analysis_id {
                record = record.with_analysis(id);
            }
            publisher.publish(record).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use shared_logging::MemoryLogSink;
    use tempfile::tempdir;

    #[tokio::test]
    async fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("engine.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let memory = Arc::new(MemoryLogSink::new());
        let telemetry = EngineTelemetry::builder("orchestrator")
            .log_path(&path)
            .log_sink(memory.clone())
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "analysis.started", Some("a-1"), json!({ "kind": "url" }))
            .unwrap();
        telemetry
            .event("analysis.completed", Some("a-1"), json!({ "risk_level": "LOW" }))
            .await
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("analysis.started"));
        assert_eq!(memory.find("analysis.started")[0].analysis_id.as_deref(), Some("a-1"));
        assert_eq!(bus.of_type("analysis.completed").len(), 1);
    }

    #[tokio::test]
    async fn default_handle_is_silent() {
        let telemetry = EngineTelemetry::default();
        telemetry
            .log(LogLevel::Error, "ignored", None, Value::Null)
            .unwrap();
        telemetry.event("ignored", None, Value::Null).await.unwrap();
        assert_eq!(telemetry.module(), "threat_engine");
    }
}
