//! Metrics reporting over the mesh.
//!
//! Apps emit measurement reports as JSON messages of a reserved type; a
//! collector elsewhere in the mesh routes on that type. Reports are
//! fire-and-forget with a small retry bound of their own, lower than the
//! default send bound, since a lost report is cheaper than a stalled app.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::debug;

use crate::app::MessageApp;
use crate::transport::TransportError;

/// Reserved message type for metrics reports.
pub const METRICS_MSG_TYPE: i32 = 120;
/// Default attempt bound for report sends.
pub const DEFAULT_METRIC_RETRIES: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("a metrics report must carry at least one data point")]
    EmptyReport,

    #[error("failed to serialize metrics report")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One measurement inside a report.
#[derive(Clone, Debug, Serialize)]
pub struct MetricData {
    /// Measurement identifier, as registered with the collector.
    pub id: String,
    /// Optional measurement type tag.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub value: f64,
}

impl MetricData {
    pub fn new(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: None,
            value,
        }
    }

    pub fn with_kind(id: impl Into<String>, kind: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: Some(kind.into()),
            value,
        }
    }
}

#[derive(Serialize)]
struct MetricsReport<'a> {
    reporter: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    generator: Option<&'a str>,
    timestamp: u128,
    data: &'a [MetricData],
}

/// Emits measurement reports on behalf of one reporting entity.
pub struct MetricsReporter {
    app: Arc<MessageApp>,
    reporter: String,
    generator: Option<String>,
}

impl MetricsReporter {
    pub fn new(app: Arc<MessageApp>, reporter: impl Into<String>) -> Self {
        Self {
            app,
            reporter: reporter.into(),
            generator: None,
        }
    }

    /// Attribute reports to a generator distinct from the reporting app.
    pub fn with_generator(mut self, generator: impl Into<String>) -> Self {
        self.generator = Some(generator.into());
        self
    }

    /// Send one report carrying `data`, timestamped now.
    ///
    /// Returns whether the mesh accepted the report within
    /// [`DEFAULT_METRIC_RETRIES`] attempts.
    pub async fn send(&self, data: &[MetricData]) -> Result<bool, MetricsError> {
        if data.is_empty() {
            return Err(MetricsError::EmptyReport);
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let report = MetricsReport {
            reporter: &self.reporter,
            generator: self.generator.as_deref(),
            timestamp,
            data,
        };
        let payload = serde_json::to_vec(&report)?;

        let sent = self
            .app
            .send_with_retries(&payload, METRICS_MSG_TYPE, DEFAULT_METRIC_RETRIES)
            .await?;
        if !sent {
            debug!(reporter = %self.reporter, points = data.len(), "metrics report not delivered");
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameConfig;
    use crate::storage::MemoryStorage;
    use crate::transport::{MockTransport, Transport, TransportStatus};

    async fn mock_app(mock: &Arc<MockTransport>) -> Arc<MessageApp> {
        let cfg = FrameConfig {
            wait_for_ready: false,
            ..FrameConfig::default()
        };
        MessageApp::start(
            cfg,
            mock.clone() as Arc<dyn Transport>,
            Arc::new(MemoryStorage::new()),
        )
        .await
    }

    #[test]
    fn report_serializes_with_renamed_kind() {
        let data = vec![
            MetricData::new("requests", 42.0),
            MetricData::with_kind("latency", "gauge", 3.5),
        ];
        let report = MetricsReport {
            reporter: "app-1",
            generator: None,
            timestamp: 1000,
            data: &data,
        };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["reporter"], "app-1");
        assert!(value.get("generator").is_none());
        assert_eq!(value["data"][0]["id"], "requests");
        assert!(value["data"][0].get("type").is_none());
        assert_eq!(value["data"][1]["type"], "gauge");
        assert_eq!(value["data"][1]["value"], 3.5);
    }

    #[tokio::test]
    async fn empty_report_is_rejected_without_a_send() {
        let mock = Arc::new(MockTransport::new());
        let app = mock_app(&mock).await;
        let reporter = MetricsReporter::new(Arc::clone(&app), "app-1");

        let err = reporter.send(&[]).await.unwrap_err();
        assert!(matches!(err, MetricsError::EmptyReport));
        assert_eq!(mock.send_attempts(), 0);

        app.stop().await;
    }

    #[tokio::test]
    async fn report_uses_the_metric_retry_bound() {
        let mock = Arc::new(MockTransport::new());
        mock.script_send(vec![TransportStatus::Retry; 16]);
        let app = mock_app(&mock).await;
        let reporter = MetricsReporter::new(Arc::clone(&app), "app-1").with_generator("probe-7");

        let sent = reporter.send(&[MetricData::new("m", 1.0)]).await.unwrap();
        assert!(!sent);
        assert_eq!(mock.send_attempts(), DEFAULT_METRIC_RETRIES as usize);

        app.stop().await;
    }
}
