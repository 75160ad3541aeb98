use matsearch_core::{Error, ExperimentRecord, Result, TelemetrySink};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Posts experiment rounds to a Google Apps Script web app.
///
/// The body is JSON sent as `text/plain;charset=UTF-8`, the same shape the browser
/// client posts to that endpoint.
#[derive(Debug, Clone)]
pub struct AppsScriptSink {
    client: reqwest::Client,
    url: String,
    timeout_ms: u64,
}

impl AppsScriptSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Bounds each write so a hung endpoint cannot accumulate background tasks.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms.max(1);
        self
    }
}

#[async_trait::async_trait]
impl TelemetrySink for AppsScriptSink {
    async fn record(&self, rec: &ExperimentRecord) -> Result<()> {
        let body = serde_json::to_string(rec).map_err(|e| Error::Telemetry(e.to_string()))?;
        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(body)
            .timeout(Duration::from_millis(self.timeout_ms))
            .send()
            .await
            .map_err(|e| Error::Telemetry(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Telemetry(format!("HTTP {status}: {text}")));
        }
        Ok(())
    }
}

/// Fire-and-forget: spawns the write and returns immediately. Failures are logged only.
pub fn dispatch(sink: Arc<dyn TelemetrySink>, rec: ExperimentRecord) {
    tokio::spawn(async move {
        match sink.record(&rec).await {
            Ok(()) => tracing::debug!(user_id = %rec.user_id, "experiment round recorded"),
            Err(e) => tracing::warn!(user_id = %rec.user_id, error = %e, "experiment log failed"),
        }
    });
}
