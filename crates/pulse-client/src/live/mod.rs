//! Server-maintained live views of backend collections.
//!
//! A [`LiveDataManager`] subscribes to a collection's change topics
//! before issuing the bulk read, so nothing published during the load
//! can be missed. When the snapshot finally arrives, records that
//! streamed in while it was in flight win over their snapshot versions.
//! Streamed changes are applied to the records in place and update
//! callbacks are debounced so a burst becomes one notification.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use pulse_core::{ChangeKind, ResourceConfig};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::Client;
use crate::correlator::RequestContext;
use crate::pubsub::PushHandler;

mod merge;
use merge::{find_index, insert_without_duplication, merge_record};

/// What an observer hook wants done with the change it was shown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookDecision {
    /// Apply the change.
    Proceed,
    /// Drop the change; the local records stay as they were.
    Cancel,
}

/// Hooks into a collection's lifecycle. Every method has a default, so
/// implementors override only what they care about.
pub trait CollectionObserver: Send + Sync {
    /// A streamed record is about to be inserted.
    fn before_create(&self, _record: &Value) -> HookDecision {
        HookDecision::Proceed
    }

    /// A streamed update is about to be merged into `_current`.
    fn before_update(&self, _current: &Value, _update: &Value) -> HookDecision {
        HookDecision::Proceed
    }

    /// A streamed delete is about to remove `_current`.
    fn before_delete(&self, _current: &Value) -> HookDecision {
        HookDecision::Proceed
    }

    /// The bulk load finished and `_records` is the reconciled result.
    fn initial_load(&self, _records: &[Value]) {}
}

/// Debounced notification that the collection changed: the full record
/// set, then the changes since the last notification.
pub type UpdateFn = Arc<dyn Fn(&[Value], &[Value]) + Send + Sync>;
/// Notification that the bulk load failed.
pub type LoadFailureFn = Arc<dyn Fn(i32, Option<String>) + Send + Sync>;

/// Options for [`Client::maintained_list`].
#[derive(Default)]
pub struct CollectionOptions {
    /// Parameters for the bulk read.
    pub params: Value,
    /// Escalate failures to fatal events. Defaults to true exactly when
    /// no failure handler is given, matching per-request behavior.
    pub critical: Option<bool>,
    /// Called after each debounced batch of changes.
    pub on_update: Option<UpdateFn>,
    /// Called when the bulk load fails.
    pub on_failure: Option<LoadFailureFn>,
    /// Lifecycle hooks.
    pub observer: Option<Arc<dyn CollectionObserver>>,
}

/// Misuse of a live collection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LiveDataError {
    /// The operation was attempted after [`LiveDataManager::die`].
    #[error("collection already torn down ({0})")]
    UsedAfterTeardown(&'static str),
    /// The collection's configuration has no endpoint for the operation.
    #[error("collection has no {0} endpoint")]
    EndpointNotConfigured(&'static str),
}

/// One live collection: a locally mirrored record set kept current by
/// streamed changes.
pub struct LiveDataManager {
    client: Client,
    config: ResourceConfig,
    params: Mutex<Value>,
    critical: bool,
    on_update: Option<UpdateFn>,
    on_failure: Option<LoadFailureFn>,
    observer: Option<Arc<dyn CollectionObserver>>,
    data: RwLock<Vec<Value>>,
    changes: Mutex<Vec<Value>>,
    topics: Mutex<Vec<String>>,
    /// Bumped by [`reset`](Self::reset) so replies to superseded loads
    /// can be recognized and discarded.
    generation: AtomicU64,
    slain: AtomicBool,
    debounce: Mutex<Option<JoinHandle<()>>>,
    handler: Mutex<Option<PushHandler>>,
}

impl LiveDataManager {
    pub(crate) fn new(client: Client, config: ResourceConfig, options: CollectionOptions) -> Arc<Self> {
        let critical = options.critical.unwrap_or(options.on_failure.is_none());
        let manager = Arc::new(Self {
            client,
            params: Mutex::new(options.params),
            critical,
            on_update: options.on_update,
            on_failure: options.on_failure,
            observer: options.observer,
            data: RwLock::new(Vec::new()),
            changes: Mutex::new(Vec::new()),
            topics: Mutex::new(config.subscribe_topics.clone()),
            config,
            generation: AtomicU64::new(0),
            slain: AtomicBool::new(false),
            debounce: Mutex::new(None),
            handler: Mutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        let handler: PushHandler = Arc::new(move |record| {
            if let Some(manager) = weak.upgrade() {
                manager.on_new_message(record);
            }
        });
        *manager.handler.lock() = Some(Arc::clone(&handler));

        // Subscribe before reading so changes during the load are seen.
        let topics = manager.topics.lock().clone();
        manager.client.register_push_handler(&topics, &handler);
        manager.request_everything();
        manager
    }

    /// A copy of the current record set.
    #[must_use]
    pub fn records(&self) -> Vec<Value> {
        self.data.read().clone()
    }

    /// Whether [`die`](Self::die) has been called.
    #[must_use]
    pub fn is_slain(&self) -> bool {
        self.slain.load(Ordering::SeqCst)
    }

    /// Ask the server to create a record in this collection. The local
    /// record set changes only when the server publishes the result.
    pub fn create(&self, record: Value) -> Result<(), LiveDataError> {
        self.ensure_alive("create")?;
        let endpoint = self
            .config
            .create_api
            .clone()
            .ok_or(LiveDataError::EndpointNotConfigured("create"))?;
        self.client
            .request(RequestContext::new(endpoint).params(record).critical(self.critical));
        Ok(())
    }

    /// Ask the server to update a record in this collection.
    pub fn update(&self, record: Value) -> Result<(), LiveDataError> {
        self.ensure_alive("update")?;
        let endpoint = self
            .config
            .update_api
            .clone()
            .ok_or(LiveDataError::EndpointNotConfigured("update"))?;
        self.client
            .request(RequestContext::new(endpoint).params(record).critical(self.critical));
        Ok(())
    }

    /// Ask the server to delete the record identified by `id`.
    pub fn delete(&self, id: Value) -> Result<(), LiveDataError> {
        self.ensure_alive("delete")?;
        let endpoint = self
            .config
            .delete_api
            .clone()
            .ok_or(LiveDataError::EndpointNotConfigured("delete"))?;
        let mut params = Map::new();
        params.insert(self.config.id_field.clone(), id);
        self.client.request(
            RequestContext::new(endpoint)
                .params(Value::Object(params))
                .critical(self.critical),
        );
        Ok(())
    }

    /// Discard the local records and load again with new parameters,
    /// optionally moving to a different topic set. A reply to the
    /// superseded load that is still in flight will be discarded.
    pub fn reset(self: &Arc<Self>, params: Value, topics: Option<Vec<String>>) -> Result<(), LiveDataError> {
        self.ensure_alive("reset")?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.params.lock() = params;
        self.data.write().clear();
        self.changes.lock().clear();

        if let Some(new_topics) = topics {
            let old = {
                let mut current = self.topics.lock();
                std::mem::replace(&mut *current, new_topics.clone())
            };
            let removed: Vec<String> = old
                .iter()
                .filter(|topic| !new_topics.contains(topic))
                .cloned()
                .collect();
            let added: Vec<String> = new_topics
                .iter()
                .filter(|topic| !old.contains(topic))
                .cloned()
                .collect();
            if let Some(handler) = self.handler.lock().clone() {
                if !removed.is_empty() {
                    self.client.unregister_push_handler(&removed, &handler);
                }
                if !added.is_empty() {
                    self.client.register_push_handler(&added, &handler);
                }
            }
        }
        self.request_everything();
        Ok(())
    }

    /// Tear the collection down: unsubscribe its topics, stop the
    /// pending update notification, and refuse all further use.
    pub fn die(&self) -> Result<(), LiveDataError> {
        if self.slain.swap(true, Ordering::SeqCst) {
            return Err(LiveDataError::UsedAfterTeardown("die"));
        }
        let topics = self.topics.lock().clone();
        if let Some(handler) = self.handler.lock().take() {
            self.client.unregister_push_handler(&topics, &handler);
        }
        if let Some(handle) = self.debounce.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    fn ensure_alive(&self, operation: &'static str) -> Result<(), LiveDataError> {
        if self.slain.load(Ordering::SeqCst) {
            return Err(LiveDataError::UsedAfterTeardown(operation));
        }
        Ok(())
    }

    /// Apply one streamed record. Only a change that actually mutated
    /// the record set is recorded for the next update batch; a vetoed
    /// change or a delete for an unknown id leaves the batch alone.
    fn on_new_message(self: &Arc<Self>, record: Value) {
        if self.slain.load(Ordering::SeqCst) {
            return;
        }
        let Some(kind) = ChangeKind::from_record(&record) else {
            debug!("streamed record carries no usable change tag");
            return;
        };
        let Some(id) = record.get(&self.config.id_field).cloned() else {
            debug!(field = %self.config.id_field, "streamed record has no identifier");
            return;
        };
        let applied = match kind {
            ChangeKind::Create => self.apply_create(record.clone()),
            ChangeKind::Read | ChangeKind::Update => self.apply_update(&id, record.clone()),
            ChangeKind::Delete => self.apply_delete(&id),
        };
        if !applied {
            return;
        }
        self.changes.lock().push(record);
        self.schedule_update();
    }

    fn apply_create(&self, record: Value) -> bool {
        if let Some(observer) = &self.observer {
            if observer.before_create(&record) == HookDecision::Cancel {
                return false;
            }
        }
        let mut data = self.data.write();
        insert_without_duplication(&mut data, vec![record], &self.config.id_field);
        true
    }

    fn apply_update(&self, id: &Value, record: Value) -> bool {
        let current = {
            let data = self.data.read();
            find_index(&data, &self.config.id_field, id).map(|index| data[index].clone())
        };
        let Some(current) = current else {
            // An update for a record never seen locally is adopted whole.
            return self.apply_create(record);
        };
        if let Some(observer) = &self.observer {
            if observer.before_update(&current, &record) == HookDecision::Cancel {
                return false;
            }
        }
        let mut data = self.data.write();
        // Re-find: the hook ran without the lock held.
        match find_index(&data, &self.config.id_field, id) {
            Some(index) => merge_record(&mut data[index], &record),
            None => data.push(record),
        }
        true
    }

    fn apply_delete(&self, id: &Value) -> bool {
        let current = {
            let data = self.data.read();
            find_index(&data, &self.config.id_field, id).map(|index| data[index].clone())
        };
        let Some(current) = current else {
            return false;
        };
        if let Some(observer) = &self.observer {
            if observer.before_delete(&current) == HookDecision::Cancel {
                return false;
            }
        }
        let mut data = self.data.write();
        match find_index(&data, &self.config.id_field, id) {
            Some(index) => {
                data.remove(index);
                true
            }
            None => false,
        }
    }

    /// Arm the debounce timer if it is not already running. When it
    /// fires, the accumulated changes are handed to `on_update` as one
    /// batch.
    fn schedule_update(self: &Arc<Self>) {
        let mut slot = self.debounce.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let debounce = self.client.inner.config.update_debounce();
        let manager = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if manager.slain.load(Ordering::SeqCst) {
                return;
            }
            // Clear the slot first so changes arriving during the
            // callback arm a fresh timer.
            *manager.debounce.lock() = None;
            let changes: Vec<Value> = std::mem::take(&mut *manager.changes.lock());
            if let Some(on_update) = &manager.on_update {
                let snapshot = manager.data.read().clone();
                on_update(&snapshot, &changes);
            }
        }));
    }

    /// Issue the bulk read for the current parameters. The reply is
    /// tagged with the generation so resets can orphan it.
    fn request_everything(self: &Arc<Self>) {
        let generation = self.generation.load(Ordering::SeqCst);
        let params = self.params.lock().clone();
        let success = Arc::downgrade(self);
        let failure = Arc::downgrade(self);
        let ctx = RequestContext::new(self.config.read_api.clone())
            .params(params)
            .critical(self.critical)
            .on_success(move |payload| {
                if let Some(manager) = success.upgrade() {
                    manager.adopt_snapshot(generation, payload);
                }
            })
            .on_failure(move |status, additional| {
                let Some(manager) = failure.upgrade() else {
                    return;
                };
                if manager.slain.load(Ordering::SeqCst)
                    || manager.generation.load(Ordering::SeqCst) != generation
                {
                    return;
                }
                if let Some(on_failure) = &manager.on_failure {
                    on_failure(status, additional);
                } else {
                    warn!(status, resource = %manager.config.read_api, "collection load failed");
                }
            });
        self.client.request(ctx);
    }

    /// Reconcile the bulk-read snapshot with whatever streamed in while
    /// it was in flight. Streamed records are folded into the snapshot
    /// so their fields win, then the result replaces the record set.
    fn adopt_snapshot(self: &Arc<Self>, generation: u64, payload: Value) {
        if self.slain.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation
        {
            debug!("stale collection load discarded");
            return;
        }
        let mut snapshot: Vec<Value> = payload
            .get(&self.config.read_api_array_field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_else(|| {
                warn!(
                    field = %self.config.read_api_array_field,
                    "collection load reply carried no record array"
                );
                Vec::new()
            });
        {
            let mut data = self.data.write();
            let streamed: Vec<Value> = data.drain(..).collect();
            insert_without_duplication(&mut snapshot, streamed, &self.config.id_field);
            *data = snapshot;
        }
        if let Some(observer) = &self.observer {
            let records = self.data.read().clone();
            observer.initial_load(&records);
        }
        self.schedule_update();
    }
}
