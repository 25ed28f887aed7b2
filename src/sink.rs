//! Destinations for terminal task results.
//!
//! Sinks run after a task finishes. Their failures are logged and never
//! change the task's outcome.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::SinkConfig;
use crate::events::{Event, EventBus};
use crate::pipeline::TaskResult;

#[async_trait]
pub trait ResultSink: Send + Sync {
    fn name(&self) -> &str;

    /// Stores one result together with the task's buffered events.
    async fn write(&self, result: &TaskResult, events: &[Event]) -> Result<()>;
}

/// Writes `<task_id>.json` and `<task_id>.events.jsonl` into a directory.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn result_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(task_id)))
    }

    pub fn events_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.events.jsonl", file_stem(task_id)))
    }
}

/// Task ids become file names; path separators are replaced.
fn file_stem(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| if matches!(c, '/' | '\\') || c.is_control() { '_' } else { c })
        .collect()
}

#[async_trait]
impl ResultSink for JsonFileSink {
    fn name(&self) -> &str {
        "json"
    }

    async fn write(&self, result: &TaskResult, events: &[Event]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create results directory {}", self.dir.display()))?;

        let path = self.result_path(&result.task_id);
        let body = serde_json::to_string_pretty(result).context("Failed to serialize result")?;
        fs::write(&path, body).with_context(|| format!("Failed to write {}", path.display()))?;

        let events_path = self.events_path(&result.task_id);
        let mut file = fs::File::create(&events_path)
            .with_context(|| format!("Failed to create {}", events_path.display()))?;
        for event in events {
            let line = serde_json::to_string(event).context("Failed to serialize event")?;
            writeln!(file, "{line}")
                .with_context(|| format!("Failed to write {}", events_path.display()))?;
        }

        debug!(task_id = %result.task_id, path = %path.display(), events = events.len(), "Wrote result");
        Ok(())
    }
}

/// POSTs each result as JSON, retrying transient failures.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
    max_attempts: u32,
    base_delay: Duration,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }

    /// Base of the exponential delay between attempts.
    #[cfg(test)]
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }
}

#[async_trait]
impl ResultSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    #[allow(tail_expr_drop_order)]
    async fn write(&self, result: &TaskResult, _events: &[Event]) -> Result<()> {
        let payload = json!({
            "event": "task.result",
            "result": result,
        });
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = self.base_delay * (1u32 << attempt);
                debug!(
                    "Webhook retry attempt {} after {}ms delay",
                    attempt + 1,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            match self.client.post(&self.url).json(&payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(task_id = %result.task_id, "Webhook delivered");
                        return Ok(());
                    }
                    let body = response.text().await.unwrap_or_default();

                    // 5xx and 429 are worth another attempt
                    if status.is_server_error() || status.as_u16() == 429 {
                        last_error = Some(format!("Webhook returned {status}: {body}"));
                        continue;
                    }
                    bail!("Webhook returned error status {status}: {body}");
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        bail!(
            "Webhook failed after {} attempts: {}",
            self.max_attempts,
            last_error.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}

/// Every configured sink.
#[derive(Default)]
pub struct Sinks {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl Sinks {
    pub fn from_config(config: &SinkConfig) -> Self {
        let mut sinks: Vec<Box<dyn ResultSink>> = vec![Box::new(JsonFileSink::new(&config.results_dir))];
        if let Some(url) = config.webhook.as_deref().filter(|u| !u.is_empty()) {
            sinks.push(Box::new(WebhookSink::new(url)));
        }
        Self { sinks }
    }

    pub fn push(&mut self, sink: Box<dyn ResultSink>) {
        self.sinks.push(sink);
    }

    pub fn names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Hands `result` and its events to every sink. Failures are logged.
    pub async fn deliver(&self, result: &TaskResult, bus: &EventBus) {
        let events = bus.events_for(&result.task_id);
        for sink in &self.sinks {
            match sink.write(result, &events).await {
                Ok(()) => info!(task_id = %result.task_id, sink = sink.name(), "Result delivered"),
                Err(e) => warn!(task_id = %result.task_id, sink = sink.name(), "Failed to deliver result: {:#}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{TaskState, Totals};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn result(id: &str) -> TaskResult {
        TaskResult {
            task_id: id.to_string(),
            status: TaskState::Completed,
            classification: None,
            reason: None,
            partial: false,
            risk_labels: Vec::new(),
            phases: BTreeMap::new(),
            totals: Totals::default(),
            retry_count: 0,
            history: Vec::new(),
            verdict: None,
            artifacts: vec!["src/lib.rs".to_string()],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    /// Answers each connection with the next status code.
    async fn serve(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            for status in statuses {
                let (mut socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                read_request(&mut socket).await;
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        (url, hits)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_json_sink_writes_result_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path().join("results"));
        let events = vec![
            Event::new("pipeline.state", json!({ "to": "PLANNING" })).with_task("t1"),
            Event::new("pipeline.result", json!({ "status": "COMPLETED" })).with_task("t1"),
        ];

        sink.write(&result("t1"), &events).await.unwrap();

        let stored: TaskResult =
            serde_json::from_str(&fs::read_to_string(sink.result_path("t1")).unwrap()).unwrap();
        assert_eq!(stored.task_id, "t1");
        assert_eq!(stored.artifacts, vec!["src/lib.rs".to_string()]);
        let lines = fs::read_to_string(sink.events_path("t1")).unwrap();
        assert_eq!(lines.lines().count(), 2);
        assert!(lines.lines().last().unwrap().contains("pipeline.result"));
    }

    #[test]
    fn test_task_ids_cannot_escape_results_dir() {
        let sink = JsonFileSink::new("/tmp/results");
        assert_eq!(
            sink.result_path("../etc/passwd"),
            PathBuf::from("/tmp/results/.._etc_passwd.json")
        );
    }

    #[tokio::test]
    async fn test_webhook_retries_server_errors() {
        let (url, hits) = serve(vec![503, 429, 200]).await;
        let sink = WebhookSink::new(url).with_base_delay(Duration::from_millis(10));
        sink.write(&result("t1"), &[]).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_webhook_does_not_retry_client_errors() {
        let (url, hits) = serve(vec![400, 200]).await;
        let sink = WebhookSink::new(url).with_base_delay(Duration::from_millis(10));
        let err = sink.write(&result("t1"), &[]).await.unwrap_err();
        assert!(err.to_string().contains("400"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_webhook_gives_up_after_three_attempts() {
        let (url, hits) = serve(vec![500, 500, 500]).await;
        let sink = WebhookSink::new(url).with_base_delay(Duration::from_millis(10));
        let err = sink.write(&result("t1"), &[]).await.unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deliver_survives_failing_sink() {
        let dir = tempfile::tempdir().unwrap();
        let mut sinks = Sinks::from_config(&SinkConfig {
            results_dir: dir.path().display().to_string(),
            webhook: None,
        });
        sinks.push(Box::new(
            WebhookSink::new("http://127.0.0.1:1/hook").with_base_delay(Duration::from_millis(1)),
        ));
        assert_eq!(sinks.names(), vec!["json", "webhook"]);

        let bus = EventBus::new(10);
        bus.publish(Event::new("pipeline.result", json!({})).with_task("t1"));
        sinks.deliver(&result("t1"), &bus).await;

        assert!(dir.path().join("t1.json").exists());
        let events = fs::read_to_string(dir.path().join("t1.events.jsonl")).unwrap();
        assert_eq!(events.lines().count(), 1);
    }
}
