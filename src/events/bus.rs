use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::json;
use tracing::{error, warn};

use super::types::{Event, EventPayload};

/// Meta-event published when the buffer evicts its oldest event.
pub const BUS_OVERFLOW: &str = "bus.overflow";

/// Meta-event published when a subscriber handler fails.
pub const BUS_HANDLER_ERROR: &str = "bus.handler_error";

type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    All,
    Prefix(String),
    Exact(String),
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Self::All
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            Self::Prefix(format!("{prefix}."))
        } else {
            Self::Exact(pattern.to_string())
        }
    }

    fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::All => true,
            Self::Prefix(prefix) => event_type.starts_with(prefix.as_str()),
            Self::Exact(exact) => exact == event_type,
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    pattern: Pattern,
    raw_pattern: String,
    handler: Handler,
}

#[derive(Default)]
struct Buffer {
    events: VecDeque<Event>,
    /// Recorded but not yet handed to subscribers.
    pending: VecDeque<Event>,
    next_seq: u64,
    dropped_total: u64,
}

impl Buffer {
    /// Returns the new event's sequence number and any evicted event.
    fn append(&mut self, mut event: Event, capacity: usize) -> (u64, Option<Event>) {
        self.next_seq += 1;
        event.seq = self.next_seq;
        let evicted = if self.events.len() >= capacity {
            self.dropped_total += 1;
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event.clone());
        self.pending.push_back(event);
        (self.next_seq, evicted)
    }
}

thread_local! {
    /// Buses this thread is currently delivering for.
    static DELIVERING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct DeliveryMark(usize);

impl DeliveryMark {
    fn enter(key: usize) -> Self {
        DELIVERING.with(|d| d.borrow_mut().push(key));
        Self(key)
    }
}

impl Drop for DeliveryMark {
    fn drop(&mut self) {
        DELIVERING.with(|d| {
            let mut d = d.borrow_mut();
            if let Some(pos) = d.iter().rposition(|k| *k == self.0) {
                d.remove(pos);
            }
        });
    }
}

/// Synchronous publish/subscribe bus with a bounded replay buffer.
///
/// Delivery is at-most-once: the buffer evicts its oldest entry when full.
/// Subscribers see events in sequence order, across all publishers.
pub struct EventBus {
    capacity: usize,
    buffer: Mutex<Buffer>,
    delivery: Mutex<()>,
    subscribers: RwLock<Vec<Arc<Subscription>>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Creates a bus retaining at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: Mutex::new(Buffer::default()),
            delivery: Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Registers `handler` for every event whose type matches `pattern`.
    ///
    /// `*` matches all events, `prefix.*` matches a dotted prefix and any
    /// other pattern is an exact type match.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            id,
            pattern: Pattern::parse(pattern),
            raw_pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription);
        id
    }

    /// Removes a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Number of registered subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Publishes a typed payload, optionally correlated with a task.
    pub fn emit<P: EventPayload>(&self, payload: &P, task_id: Option<&str>) -> u64 {
        self.publish(Event::from_payload(payload).with_task_opt(task_id))
    }

    /// Publishes an event and returns its sequence number.
    ///
    /// Everything queued is delivered in sequence order before this returns.
    /// Publishes made by a handler while this thread is delivering are
    /// queued and delivered by the enclosing call.
    pub fn publish(&self, event: Event) -> u64 {
        let seq = self.record(event, false);
        let key = self.key();
        if DELIVERING.with(|d| d.borrow().contains(&key)) {
            return seq;
        }

        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let _mark = DeliveryMark::enter(key);
        loop {
            let next = self
                .buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending
                .pop_front();
            match next {
                Some(event) => self.deliver(&event),
                None => break,
            }
        }
        seq
    }

    /// Assigns a sequence number and queues the event for delivery.
    fn record(&self, event: Event, meta: bool) -> u64 {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let (seq, evicted) = buffer.append(event, self.capacity);

        // Evictions caused by meta-events stay silent so overflow cannot cascade.
        if let Some(dropped) = evicted.filter(|_| !meta) {
            let overflow = Event::new(
                BUS_OVERFLOW,
                json!({
                    "evicted_seq": dropped.seq,
                    "evicted_type": dropped.event_type,
                    "dropped_total": buffer.dropped_total,
                    "capacity": self.capacity,
                }),
            )
            .with_component("event_bus");
            buffer.append(overflow, self.capacity);
        }
        seq
    }

    fn deliver(&self, event: &Event) {
        for (subscription, message) in self.dispatch(event) {
            if event.event_type == BUS_HANDLER_ERROR {
                error!(
                    pattern = %subscription,
                    error = %message,
                    "Handler failed while handling a handler error; dropping"
                );
                continue;
            }
            warn!(
                pattern = %subscription,
                event_type = %event.event_type,
                error = %message,
                "Event handler failed"
            );
            let report = Event::new(
                BUS_HANDLER_ERROR,
                json!({
                    "pattern": subscription,
                    "failed_event_type": event.event_type,
                    "failed_event_seq": event.seq,
                    "error": message,
                }),
            )
            .with_component("event_bus")
            .with_task_opt(event.task_id.as_deref());
            self.record(report, true);
        }
    }

    fn key(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    fn dispatch(&self, event: &Event) -> Vec<(String, String)> {
        // Snapshot so handlers may subscribe or publish without deadlocking.
        let subscribers: Vec<Arc<Subscription>> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.pattern.matches(&event.event_type))
            .cloned()
            .collect();

        let mut failures = Vec::new();
        for subscription in subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscription.handler)(event)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };
            failures.push((subscription.raw_pattern.clone(), message));
        }
        failures
    }

    /// Returns up to `limit` of the newest buffered events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = buffer.events.len().saturating_sub(limit);
        buffer.events.iter().skip(skip).cloned().collect()
    }

    /// Returns the buffered events correlated with `task_id`.
    pub fn events_for(&self, task_id: &str) -> Vec<Event> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer
            .events
            .iter()
            .filter(|e| e.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect()
    }

    /// Total events published since creation.
    pub fn published_total(&self) -> u64 {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_seq
    }

    /// Total events evicted from the buffer.
    pub fn dropped_total(&self) -> u64 {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dropped_total
    }

    /// Configured buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collector(bus: &EventBus, pattern: &str) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(pattern, move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        seen
    }

    fn types(events: &Arc<Mutex<Vec<Event>>>) -> Vec<String> {
        events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    #[test]
    fn test_pattern_matching() {
        assert!(Pattern::parse("*").matches("anything.at.all"));
        assert!(Pattern::parse("sandbox.*").matches("sandbox.exec"));
        assert!(!Pattern::parse("sandbox.*").matches("sandboxes.exec"));
        assert!(Pattern::parse("sandbox.exec").matches("sandbox.exec"));
        assert!(!Pattern::parse("sandbox.exec").matches("sandbox.violation"));
    }

    #[test]
    fn test_delivers_in_publish_order_to_matching_subscribers() {
        let bus = EventBus::new(16);
        let all = collector(&bus, "*");
        let sandbox = collector(&bus, "sandbox.*");
        let exact = collector(&bus, "pipeline.state");

        bus.publish(Event::new("sandbox.exec", json!({})));
        bus.publish(Event::new("pipeline.state", json!({})));
        bus.publish(Event::new("sandbox.violation", json!({})));

        assert_eq!(
            types(&all),
            vec!["sandbox.exec", "pipeline.state", "sandbox.violation"]
        );
        assert_eq!(types(&sandbox), vec!["sandbox.exec", "sandbox.violation"]);
        assert_eq!(types(&exact), vec!["pipeline.state"]);

        let seqs: Vec<u64> = all.lock().unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_publishers_deliver_in_seq_order() {
        let bus = Arc::new(EventBus::new(4096));
        let all = collector(&bus, "*");

        std::thread::scope(|scope| {
            for t in 0..4 {
                let bus = Arc::clone(&bus);
                scope.spawn(move || {
                    for i in 0..250 {
                        bus.publish(Event::new("tick", json!({ "thread": t, "i": i })));
                    }
                });
            }
        });

        let seqs: Vec<u64> = all.lock().unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=1000).collect::<Vec<u64>>());
    }

    #[test]
    fn test_reentrant_publish_is_delivered_after_current_event() {
        let bus = Arc::new(EventBus::new(10));
        let inner = Arc::clone(&bus);
        bus.subscribe("outer", move |_| {
            inner.publish(Event::new("inner", json!({})));
            Ok(())
        });
        let all = collector(&bus, "*");

        bus.publish(Event::new("outer", json!({})));

        assert_eq!(types(&all), vec!["outer", "inner"]);
        let seqs: Vec<u64> = all.lock().unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let bus = EventBus::new(16);
        bus.subscribe("task.*", |_| anyhow::bail!("boom"));
        bus.subscribe("task.*", |_| panic!("kaboom"));
        let survivors = collector(&bus, "task.*");
        let errors = collector(&bus, BUS_HANDLER_ERROR);

        bus.publish(Event::new("task.started", json!({})).with_task("t1"));

        assert_eq!(types(&survivors), vec!["task.started"]);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].payload["error"], "boom");
        assert!(errors[1].payload["error"]
            .as_str()
            .unwrap()
            .contains("kaboom"));
        assert_eq!(errors[0].task_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_handler_error_handler_failure_does_not_recurse() {
        let bus = EventBus::new(64);
        bus.subscribe("*", |_| anyhow::bail!("always fails"));

        bus.publish(Event::new("x", json!({})));

        // The original event plus exactly one handler error report.
        assert_eq!(bus.published_total(), 2);
    }

    #[test]
    fn test_overflow_evicts_oldest_and_publishes_meta_event() {
        let bus = EventBus::new(3);
        let overflow = collector(&bus, BUS_OVERFLOW);

        for i in 0..3 {
            bus.publish(Event::new("tick", json!({ "i": i })));
        }
        assert!(overflow.lock().unwrap().is_empty());

        bus.publish(Event::new("tick", json!({ "i": 3 })));

        let overflow = overflow.lock().unwrap();
        assert_eq!(overflow.len(), 1);
        assert_eq!(overflow[0].payload["evicted_seq"], 1);

        let recent = bus.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.last().unwrap().event_type, BUS_OVERFLOW);
        assert!(bus.dropped_total() >= 1);
    }

    #[test]
    fn test_recent_and_events_for() {
        let bus = EventBus::new(10);
        bus.publish(Event::new("a", json!({})).with_task("t1"));
        bus.publish(Event::new("b", json!({})).with_task("t2"));
        bus.publish(Event::new("c", json!({})).with_task("t1"));

        let recent: Vec<String> = bus.recent(2).into_iter().map(|e| e.event_type).collect();
        assert_eq!(recent, vec!["b", "c"]);

        let t1: Vec<String> = bus
            .events_for("t1")
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(t1, vec!["a", "c"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new(10);
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        let id = bus.subscribe("*", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        bus.publish(Event::new("a", json!({})));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(Event::new("b", json!({})));

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_handler_may_publish_reentrantly() {
        let bus = Arc::new(EventBus::new(10));
        let inner = Arc::clone(&bus);
        bus.subscribe("outer", move |_| {
            inner.publish(Event::new("inner", json!({})));
            Ok(())
        });
        let inner_seen = collector(&bus, "inner");

        bus.publish(Event::new("outer", json!({})));

        assert_eq!(types(&inner_seen), vec!["inner"]);
    }
}
