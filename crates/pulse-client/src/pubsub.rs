//! Topic registrations and inbound publication fan-out.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// Callback invoked with each record published on a subscribed topic.
pub type PushHandler = Arc<dyn Fn(Value) + Send + Sync>;

struct TopicRegistration {
    topic: String,
    handler: PushHandler,
}

/// Which local handlers want which topics.
///
/// The registry is purely local bookkeeping; the caller is responsible
/// for telling the server about topics the registry reports as newly
/// wanted or no longer wanted.
#[derive(Default)]
pub struct PushRegistry {
    entries: Mutex<Vec<TopicRegistration>>,
}

impl PushRegistry {
    /// Register `handler` for each topic. Returns the topics that had no
    /// registration before this call and therefore need a server-side
    /// subscription. A (topic, handler) pair that is already registered
    /// is skipped rather than doubled up.
    pub fn register(&self, topics: &[String], handler: &PushHandler) -> Vec<String> {
        let mut entries = self.entries.lock();
        let mut fresh = Vec::new();
        for topic in topics {
            let duplicate = entries
                .iter()
                .any(|e| e.topic == *topic && Arc::ptr_eq(&e.handler, handler));
            if duplicate {
                debug!(topic = %topic, "handler already registered for topic");
                continue;
            }
            if !entries.iter().any(|e| e.topic == *topic) {
                fresh.push(topic.clone());
            }
            entries.push(TopicRegistration {
                topic: topic.clone(),
                handler: Arc::clone(handler),
            });
        }
        fresh
    }

    /// Remove `handler`'s registration for each topic. Returns the
    /// topics left with no registrations at all, which the caller should
    /// unsubscribe server-side.
    pub fn unregister(&self, topics: &[String], handler: &PushHandler) -> Vec<String> {
        let mut entries = self.entries.lock();
        let mut released = Vec::new();
        for topic in topics {
            let before = entries.len();
            entries.retain(|e| !(e.topic == *topic && Arc::ptr_eq(&e.handler, handler)));
            let removed = before != entries.len();
            if removed && !entries.iter().any(|e| e.topic == *topic) {
                released.push(topic.clone());
            }
        }
        released
    }

    /// Hand `data` to every handler registered for `topic`. Returns how
    /// many handlers ran.
    pub fn dispatch(&self, topic: &str, data: &Value) -> usize {
        let handlers: Vec<PushHandler> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.topic == topic)
            .map(|e| Arc::clone(&e.handler))
            .collect();
        for handler in &handlers {
            handler(data.clone());
        }
        handlers.len()
    }

    /// Every distinct topic with at least one registration.
    pub fn topics(&self) -> Vec<String> {
        let entries = self.entries.lock();
        let mut topics: Vec<String> = Vec::new();
        for entry in entries.iter() {
            if !topics.contains(&entry.topic) {
                topics.push(entry.topic.clone());
            }
        }
        topics
    }
}
