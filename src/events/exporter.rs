//! Event exporters registered as catch-all subscribers at platform init.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use super::bus::SubscriptionId;
use super::{Event, EventBus};
use crate::config::{ExporterConfig, ExporterKind};

/// Subscriptions and background writers started by [`install_exporters`].
///
/// Closing (or dropping) unsubscribes, then flushes and joins every writer.
pub struct Exporters {
    bus: Arc<EventBus>,
    subscriptions: Vec<SubscriptionId>,
    writers: Vec<JsonlWriter>,
}

impl Exporters {
    /// Stops accepting events and waits until everything queued is on disk.
    pub fn close(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
        for writer in &mut self.writers {
            writer.close();
        }
    }
}

impl Drop for Exporters {
    fn drop(&mut self) {
        self.close();
    }
}

/// Subscribes every configured exporter to `bus`.
pub fn install_exporters(bus: &Arc<EventBus>, exporters: &[ExporterConfig]) -> Result<Exporters> {
    let mut installed = Exporters {
        bus: Arc::clone(bus),
        subscriptions: Vec::new(),
        writers: Vec::new(),
    };
    for exporter in exporters {
        match exporter.kind {
            ExporterKind::Log => {
                let id = bus.subscribe("*", |event| {
                    log_event(event);
                    Ok(())
                });
                installed.subscriptions.push(id);
                debug!("Installed log event exporter");
            }
            ExporterKind::Jsonl => {
                let path = exporter
                    .path
                    .as_deref()
                    .context("jsonl exporter requires a path")?;
                let writer = JsonlWriter::spawn(Path::new(path))?;
                let sender = writer.sender();
                let id = bus.subscribe("*", move |event| {
                    let sender = sender
                        .lock()
                        .map_err(|_| anyhow!("event log sender poisoned"))?;
                    // None once the exporters are closed at shutdown.
                    if let Some(sender) = sender.as_ref() {
                        sender
                            .send(event.clone())
                            .map_err(|_| anyhow!("event log writer stopped"))?;
                    }
                    Ok(())
                });
                installed.subscriptions.push(id);
                installed.writers.push(writer);
                info!("Exporting events to {}", path);
            }
        }
    }
    Ok(installed)
}

fn log_event(event: &Event) {
    info!(
        target: "phaserun::events",
        seq = event.seq,
        event_type = %event.event_type,
        task_id = event.task_id.as_deref().unwrap_or("-"),
        component = event.component.as_deref().unwrap_or("-"),
        payload = %event.payload,
    );
}

type SharedSender = Arc<Mutex<Option<Sender<Event>>>>;

/// Appends events to a JSON-lines file from a dedicated thread.
struct JsonlWriter {
    sender: SharedSender,
    worker: Option<JoinHandle<()>>,
}

impl JsonlWriter {
    fn spawn(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open event log: {}", path.display()))?;

        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("phaserun-events".to_string())
            .spawn(move || write_events(&rx, BufWriter::new(file)))
            .context("Failed to start event log writer")?;
        Ok(Self {
            sender: Arc::new(Mutex::new(Some(tx))),
            worker: Some(worker),
        })
    }

    fn sender(&self) -> SharedSender {
        Arc::clone(&self.sender)
    }

    fn close(&mut self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Event log writer panicked");
            }
        }
    }
}

/// Writes until every sender is gone, flushing whenever the queue runs dry.
fn write_events(rx: &Receiver<Event>, mut out: BufWriter<File>) {
    while let Ok(first) = rx.recv() {
        let mut next = Some(first);
        while let Some(event) = next {
            if let Err(e) = write_line(&mut out, &event) {
                warn!(seq = event.seq, "Failed to write event log line: {}", e);
            }
            next = rx.try_recv().ok();
        }
        if let Err(e) = out.flush() {
            warn!("Failed to flush event log: {}", e);
        }
    }
}

fn write_line(out: &mut impl Write, event: &Event) -> Result<()> {
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_jsonl_exporter_writes_one_line_per_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/events.jsonl");
        let bus = Arc::new(EventBus::new(8));
        let mut exporters = install_exporters(
            &bus,
            &[ExporterConfig {
                kind: ExporterKind::Jsonl,
                path: Some(path.to_string_lossy().to_string()),
            }],
        )
        .unwrap();

        bus.publish(Event::new("a", json!({ "n": 1 })));
        bus.publish(Event::new("b", json!({ "n": 2 })).with_task("t"));
        exporters.close();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<Event> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].event_type, "b");
        assert_eq!(lines[1].task_id.as_deref(), Some("t"));
    }

    #[test]
    fn test_jsonl_exporter_ignores_events_after_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let bus = Arc::new(EventBus::new(64));
        let errors = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&errors);
        bus.subscribe(crate::events::bus::BUS_HANDLER_ERROR, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        let mut exporters = install_exporters(
            &bus,
            &[ExporterConfig {
                kind: ExporterKind::Jsonl,
                path: Some(path.to_string_lossy().to_string()),
            }],
        )
        .unwrap();

        for i in 0..20 {
            bus.publish(Event::new("tick", json!({ "i": i })));
        }
        exporters.close();
        exporters.close();
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(Event::new("late", json!({})));

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 20);
        assert!(!content.contains("late"));
        assert_eq!(*errors.lock().unwrap(), 0);
    }

    #[test]
    fn test_jsonl_exporter_requires_path() {
        let bus = Arc::new(EventBus::new(8));
        let result = install_exporters(
            &bus,
            &[ExporterConfig {
                kind: ExporterKind::Jsonl,
                path: None,
            }],
        );
        assert!(result.is_err());
    }
}
