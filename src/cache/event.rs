// Map events, listener registrations and the event dispatcher task

use super::resource::{Loader, Resource};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    Inserted,
    Updated,
    Deleted,
}

/// A change to one cache entry as seen through one cache view.
///
/// Values stay in whatever form the cache holds them in and are only
/// materialized when a listener asks for them.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub cache_name: Option<String>,
    pub key: String,
    /// Synthetic initial-state notification for a priming listener.
    pub priming: bool,
    old: Option<Resource>,
    new: Option<Resource>,
    loader: Option<Arc<Loader>>,
}

impl CacheEvent {
    pub fn new(
        kind: CacheEventKind,
        cache_name: Option<String>,
        key: impl Into<String>,
        old: Option<Resource>,
        new: Option<Resource>,
    ) -> Self {
        Self {
            kind,
            cache_name,
            key: key.into(),
            priming: false,
            old,
            new,
            loader: None,
        }
    }

    pub(crate) fn with_loader(mut self, loader: Option<Arc<Loader>>) -> Self {
        self.loader = loader;
        self
    }

    pub(crate) fn as_priming(mut self) -> Self {
        self.priming = true;
        self
    }

    /// The same event without values, for lite registrations.
    pub fn lite(&self) -> Self {
        Self {
            old: None,
            new: None,
            ..self.clone()
        }
    }

    pub fn old_value(&self) -> Result<Option<Value>> {
        self.materialize(self.old.as_ref())
    }

    pub fn new_value(&self) -> Result<Option<Value>> {
        self.materialize(self.new.as_ref())
    }

    fn materialize(&self, resource: Option<&Resource>) -> Result<Option<Value>> {
        let Some(resource) = resource else {
            return Ok(None);
        };
        match (resource, &self.loader) {
            (Resource::Object(value), _) => Ok(Some(value.as_ref().clone())),
            (Resource::Binary(bin), Some(loader)) => loader
                .serializer()
                .deserialize(bin)
                .map(Some)
                .map_err(|source| Error::Serialization {
                    cache: self.cache_name.clone().unwrap_or_default(),
                    key: self.key.clone(),
                    source,
                }),
            (Resource::Binary(_), None) => Err(Error::InvalidHandler(format!(
                "no loader to materialize event for key {}",
                self.key
            ))),
        }
    }
}

/// Receives entry change notifications.
pub trait MapListener: Send + Sync {
    fn entry_inserted(&self, _event: &CacheEvent) {}
    fn entry_updated(&self, _event: &CacheEvent) {}
    fn entry_deleted(&self, _event: &CacheEvent) {}

    /// Priming listeners get the current value of each key they register for.
    fn is_priming(&self) -> bool {
        false
    }
}

pub fn deliver(listener: &dyn MapListener, event: &CacheEvent) {
    match event.kind {
        CacheEventKind::Inserted => listener.entry_inserted(event),
        CacheEventKind::Updated => listener.entry_updated(event),
        CacheEventKind::Deleted => listener.entry_deleted(event),
    }
}

/// Receives the single "deactivated" notification of an invalidated cache.
pub trait DeactivationListener: Send + Sync {
    fn deactivated(&self, cache_name: Option<&str>);
}

pub trait Filter: Send + Sync + fmt::Debug {
    fn evaluate(&self, event: &CacheEvent) -> bool;

    /// The explicit key set of key-set filters.
    fn key_set(&self) -> Option<&HashSet<String>> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeySetFilter {
    keys: HashSet<String>,
}

impl KeySetFilter {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl Filter for KeySetFilter {
    fn evaluate(&self, event: &CacheEvent) -> bool {
        self.keys.contains(&event.key)
    }

    fn key_set(&self) -> Option<&HashSet<String>> {
        Some(&self.keys)
    }
}

#[derive(Debug, Clone)]
pub struct KeyPrefixFilter(pub String);

impl Filter for KeyPrefixFilter {
    fn evaluate(&self, event: &CacheEvent) -> bool {
        event.key.starts_with(&self.0)
    }
}

#[derive(Clone)]
struct Registration {
    listener: Arc<dyn MapListener>,
    lite: bool,
}

impl Registration {
    fn is(&self, listener: &Arc<dyn MapListener>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.listener), Arc::as_ptr(listener))
    }
}

/// Listener registrations of one cache view.
#[derive(Default)]
pub struct ListenerSupport {
    global: Vec<Registration>,
    filtered: Vec<(Arc<dyn Filter>, Registration)>,
    by_key: HashMap<String, Vec<Registration>>,
}

impl fmt::Debug for ListenerSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSupport")
            .field("global", &self.global.len())
            .field("filtered", &self.filtered.len())
            .field("keys", &self.by_key.len())
            .finish()
    }
}

impl ListenerSupport {
    pub fn add(&mut self, listener: Arc<dyn MapListener>, lite: bool) {
        self.global.push(Registration { listener, lite });
    }

    pub fn add_filtered(&mut self, listener: Arc<dyn MapListener>, filter: Arc<dyn Filter>, lite: bool) {
        self.filtered.push((filter, Registration { listener, lite }));
    }

    pub fn add_key(&mut self, listener: Arc<dyn MapListener>, key: impl Into<String>, lite: bool) {
        self.by_key
            .entry(key.into())
            .or_default()
            .push(Registration { listener, lite });
    }

    /// Drop every registration of the listener.
    pub fn remove(&mut self, listener: &Arc<dyn MapListener>) {
        self.global.retain(|r| !r.is(listener));
        self.filtered.retain(|(_, r)| !r.is(listener));
        self.by_key.retain(|_, regs| {
            regs.retain(|r| !r.is(listener));
            !regs.is_empty()
        });
    }

    pub fn remove_key(&mut self, listener: &Arc<dyn MapListener>, key: &str) {
        if let Some(regs) = self.by_key.get_mut(key) {
            regs.retain(|r| !r.is(listener));
            if regs.is_empty() {
                self.by_key.remove(key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.filtered.is_empty() && self.by_key.is_empty()
    }

    /// Listeners interested in an event, each with its lite flag. A listener
    /// registered several ways is reported once, non-lite winning.
    pub fn collect(&self, event: &CacheEvent) -> Vec<(Arc<dyn MapListener>, bool)> {
        let mut matched: Vec<(Arc<dyn MapListener>, bool)> = Vec::new();
        let regs = self
            .global
            .iter()
            .chain(
                self.filtered
                    .iter()
                    .filter(|(filter, _)| filter.evaluate(event))
                    .map(|(_, r)| r),
            )
            .chain(self.by_key.get(&event.key).into_iter().flatten());

        for reg in regs {
            match matched.iter_mut().find(|(l, _)| reg.is(l)) {
                Some(existing) => existing.1 &= reg.lite,
                None => matched.push((reg.listener.clone(), reg.lite)),
            }
        }
        matched
    }
}

/// Fire an event to collected listeners on the calling thread.
pub fn fire(event: &CacheEvent, listeners: &[(Arc<dyn MapListener>, bool)]) {
    let lite = listeners.iter().any(|(_, lite)| *lite).then(|| event.lite());
    for (listener, is_lite) in listeners {
        match (&lite, is_lite) {
            (Some(lite), true) => deliver(listener.as_ref(), lite),
            _ => deliver(listener.as_ref(), event),
        }
    }
}

enum DispatchTask {
    Deliver {
        event: CacheEvent,
        listeners: Vec<(Arc<dyn MapListener>, bool)>,
    },
    Flush(oneshot::Sender<()>),
}

/// Off-thread event delivery shared by the caches of one service.
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<DispatchTask>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DispatchTask>>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("started", &self.is_started())
            .finish()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Spawn the delivery task on the current tokio runtime unless it is
    /// already running. Returns false when there is no runtime to run it on.
    pub fn start(&self) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            return self.is_started();
        };
        let Some(mut rx) = self.rx.lock().take() else {
            return true;
        };
        runtime.spawn(async move {
            while let Some(task) = rx.recv().await {
                match task {
                    DispatchTask::Deliver { event, listeners } => fire(&event, &listeners),
                    DispatchTask::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("event dispatcher stopped");
        });
        true
    }

    pub fn is_started(&self) -> bool {
        self.rx.lock().is_none()
    }

    /// Queue an event for the delivery task, starting it on first use.
    /// Outside a runtime, or once the task is gone, listeners are called
    /// on the caller.
    pub fn enqueue(&self, event: CacheEvent, listeners: Vec<(Arc<dyn MapListener>, bool)>) {
        if listeners.is_empty() {
            return;
        }
        if !self.start() {
            trace!(key = %event.key, "no runtime for the event dispatcher; delivering on the caller");
            fire(&event, &listeners);
            return;
        }
        if let Err(mpsc::error::SendError(task)) = self.tx.send(DispatchTask::Deliver { event, listeners }) {
            warn!("event dispatcher is gone; delivering on the caller");
            if let DispatchTask::Deliver { event, listeners } = task {
                fire(&event, &listeners);
            }
        }
    }

    /// Wait until everything enqueued so far has been delivered.
    pub async fn drain(&self) {
        if !self.is_started() {
            return;
        }
        let (done, wait) = oneshot::channel();
        if self.tx.send(DispatchTask::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        inserted: AtomicUsize,
        deleted: AtomicUsize,
        saw_value: AtomicUsize,
    }

    impl MapListener for Counter {
        fn entry_inserted(&self, event: &CacheEvent) {
            self.inserted.fetch_add(1, Ordering::SeqCst);
            if matches!(event.new_value(), Ok(Some(_))) {
                self.saw_value.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn entry_deleted(&self, _event: &CacheEvent) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn inserted(key: &str) -> CacheEvent {
        CacheEvent::new(CacheEventKind::Inserted, None, key, None, Some(Resource::object(json!(1))))
    }

    #[test]
    fn test_collect_deduplicates_and_prefers_full_events() {
        let counter: Arc<dyn MapListener> = Arc::new(Counter::default());
        let mut support = ListenerSupport::default();
        support.add(counter.clone(), true);
        support.add_key(counter.clone(), "k", false);
        support.add_filtered(counter.clone(), Arc::new(KeyPrefixFilter("x".into())), true);

        let collected = support.collect(&inserted("k"));
        assert_eq!(collected.len(), 1);
        assert!(!collected[0].1);

        let collected = support.collect(&inserted("other"));
        assert_eq!(collected.len(), 1);
        assert!(collected[0].1);
    }

    #[test]
    fn test_lite_listeners_get_no_values() {
        let counter = Arc::new(Counter::default());
        let listener: Arc<dyn MapListener> = counter.clone();
        fire(&inserted("k"), &[(listener.clone(), true)]);
        fire(&inserted("k"), &[(listener, false)]);
        assert_eq!(counter.inserted.load(Ordering::SeqCst), 2);
        assert_eq!(counter.saw_value.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_drops_all_registrations() {
        let counter: Arc<dyn MapListener> = Arc::new(Counter::default());
        let mut support = ListenerSupport::default();
        support.add(counter.clone(), false);
        support.add_key(counter.clone(), "k", false);
        assert!(!support.is_empty());
        support.remove(&counter);
        assert!(support.is_empty());
    }

    #[test]
    fn test_key_set_filter_exposes_keys() {
        let filter = KeySetFilter::new(["a", "b"]);
        assert_eq!(filter.key_set().map(HashSet::len), Some(2));
        assert!(filter.evaluate(&inserted("a")));
        assert!(!filter.evaluate(&inserted("c")));
        assert!(KeyPrefixFilter("a".into()).key_set().is_none());
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_order() {
        let dispatcher = EventDispatcher::new();
        assert!(dispatcher.start());
        assert!(dispatcher.is_started());

        let counter = Arc::new(Counter::default());
        let listener: Arc<dyn MapListener> = counter.clone();
        dispatcher.enqueue(inserted("a"), vec![(listener.clone(), false)]);
        dispatcher.enqueue(
            CacheEvent::new(CacheEventKind::Deleted, None, "a", None, None),
            vec![(listener, false)],
        );
        dispatcher.drain().await;

        assert_eq!(counter.inserted.load(Ordering::SeqCst), 1);
        assert_eq!(counter.deleted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatcher_without_runtime_delivers_on_caller() {
        let dispatcher = EventDispatcher::new();
        assert!(!dispatcher.start());

        let counter = Arc::new(Counter::default());
        let listener: Arc<dyn MapListener> = counter.clone();
        dispatcher.enqueue(inserted("a"), vec![(listener, false)]);
        assert_eq!(counter.inserted.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.is_started());
    }

    #[tokio::test]
    async fn test_dispatcher_starts_on_first_enqueue() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(Counter::default());
        let listener: Arc<dyn MapListener> = counter.clone();
        dispatcher.enqueue(inserted("a"), vec![(listener, false)]);
        assert!(dispatcher.is_started());
        dispatcher.drain().await;
        assert_eq!(counter.inserted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_binary_event_needs_loader() {
        let event = CacheEvent::new(
            CacheEventKind::Updated,
            Some("c".into()),
            "k",
            None,
            Some(Resource::Binary(bytes::Bytes::from_static(b"2"))),
        );
        assert!(event.new_value().is_err());
        let event = event.with_loader(Some(Loader::new("app")));
        assert_eq!(event.new_value().unwrap(), Some(json!(2)));
    }
}
