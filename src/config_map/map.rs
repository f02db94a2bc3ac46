use super::listener::ConfigListener;
use super::message::{ConfigMessage, ConfigTransport, PollId};
use super::policy::{FailFast, MissingCoordinatorPolicy};
use crate::membership::{MemberId, MemberSnapshot, Membership};
use crate::{Error, Result};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Poll {
    to: MemberId,
    remove: bool,
}

#[derive(Debug)]
struct Deferred {
    from: MemberId,
    message: ConfigMessage,
    // membership view the message arrived under
    view: Arc<MemberSnapshot>,
}

/// Service-wide configuration map whose writes are serialized through the
/// coordinator (the oldest member).
///
/// Local writes update the local copy immediately and send a request to the
/// coordinator; until it answers, the key has a pending poll and inbound
/// updates for it are ignored. Updates from a member that is not the
/// coordinator are deferred until membership settles.
pub struct ConfigMap {
    name: String,
    membership: Arc<Membership>,
    transport: Arc<dyn ConfigTransport>,
    policy: Box<dyn MissingCoordinatorPolicy>,
    write_lock: ReentrantMutex<()>,
    data: RwLock<BTreeMap<String, Value>>,
    pending: Mutex<HashMap<String, PollId>>,
    polls: Mutex<HashMap<PollId, Poll>>,
    deferred: Mutex<VecDeque<Deferred>>,
    listeners: RwLock<Vec<Arc<dyn ConfigListener>>>,
    next_poll: AtomicU64,
    poll_closed: Notify,
}

impl fmt::Debug for ConfigMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigMap")
            .field("name", &self.name)
            .field("entries", &self.data.read().len())
            .field("pending", &self.pending.lock().len())
            .field("deferred", &self.deferred.lock().len())
            .finish_non_exhaustive()
    }
}

impl ConfigMap {
    pub fn new(name: impl Into<String>, membership: Arc<Membership>, transport: Arc<dyn ConfigTransport>) -> Self {
        Self {
            name: name.into(),
            membership,
            transport,
            policy: Box::new(FailFast),
            write_lock: ReentrantMutex::new(()),
            data: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(HashMap::new()),
            polls: Mutex::new(HashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
            listeners: RwLock::new(Vec::new()),
            next_poll: AtomicU64::new(1),
            poll_closed: Notify::new(),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn MissingCoordinatorPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn this_member(&self) -> MemberId {
        self.membership.this_member()
    }

    pub fn coordinator(&self) -> Option<MemberId> {
        self.membership.snapshot().oldest()
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator() == Some(self.this_member())
    }

    // ----- reads -----

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.data.read().clone()
    }

    // ----- writes -----

    pub fn put(&self, key: &str, value: Value) -> Result<Option<Value>> {
        let _guard = self.write_lock.lock();
        self.route(vec![(key.to_owned(), Some(value.clone()))], false)?;
        Ok(self.update_internal(key, Some(value)))
    }

    pub fn put_all(&self, entries: impl IntoIterator<Item = (String, Value)>) -> Result<()> {
        let entries: Vec<(String, Value)> = entries.into_iter().collect();
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        self.route(
            entries.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect(),
            false,
        )?;
        for (key, value) in entries {
            self.update_internal(&key, Some(value));
        }
        Ok(())
    }

    /// Remove a key. Absent keys are left alone and nothing is sent.
    pub fn remove(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.write_lock.lock();
        if !self.contains_key(key) {
            return Ok(None);
        }
        let old = self.update_internal(key, None);
        if self.coordinator().is_none() {
            self.policy.on_missing_coordinator(&self.name)?;
        } else if let Some(current) = self.get(key) {
            debug!(map = %self.name, key, value = %current, "recursive remove was replaced by a listener");
        } else {
            self.route(vec![(key.to_owned(), None)], true)?;
        }
        Ok(old)
    }

    pub fn clear(&self) -> Result<()> {
        for key in self.keys() {
            self.remove(&key)?;
        }
        Ok(())
    }

    /// Send a write to the coordinator, registering a poll for its keys, or
    /// broadcast it directly when this member is the coordinator.
    fn route(&self, entries: Vec<(String, Option<Value>)>, remove: bool) -> Result<()> {
        let this = self.this_member();
        match self.coordinator() {
            None => self.policy.on_missing_coordinator(&self.name),
            Some(coordinator) if coordinator == this => {
                self.broadcast(ConfigMessage::Update { entries, remove }, None);
                Ok(())
            }
            Some(coordinator) => {
                let poll = self.next_poll.fetch_add(1, Ordering::SeqCst);
                self.polls.lock().insert(poll, Poll { to: coordinator, remove });
                {
                    let mut pending = self.pending.lock();
                    for (key, _) in &entries {
                        pending.insert(key.clone(), poll);
                    }
                }
                self.transport
                    .send(this, coordinator, ConfigMessage::Request { poll, entries, remove });
                Ok(())
            }
        }
    }

    fn broadcast(&self, message: ConfigMessage, except: Option<MemberId>) {
        let this = self.this_member();
        let members = self.membership.snapshot();
        for member in members.others().filter(|m| Some(*m) != except) {
            self.transport.send(this, member, message.clone());
        }
    }

    /// Apply one change to the local copy and notify listeners.
    fn update_internal(&self, key: &str, value: Option<Value>) -> Option<Value> {
        let old = {
            let mut data = self.data.write();
            match &value {
                Some(value) => data.insert(key.to_owned(), value.clone()),
                None => data.remove(key),
            }
        };
        self.notify(key, old.as_ref(), value.as_ref());
        old
    }

    fn notify(&self, key: &str, old: Option<&Value>, new: Option<&Value>) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            match (old, new) {
                (None, Some(new)) => listener.entry_inserted(self, key, new),
                (Some(old), Some(new)) => listener.entry_updated(self, key, old, new),
                (Some(old), None) => listener.entry_deleted(self, key, old),
                (None, None) => {}
            }
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ConfigListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConfigListener>) {
        self.listeners
            .write()
            .retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
    }

    // ----- polls -----

    pub fn is_request_pending(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn clear_pending_polls(&self) {
        self.pending.lock().clear();
        self.polls.lock().clear();
        self.poll_closed.notify_waiters();
    }

    fn close_poll(&self, poll: PollId) {
        if self.polls.lock().remove(&poll).is_none() {
            return;
        }
        self.pending.lock().retain(|_, p| *p != poll);
        self.poll_closed.notify_waiters();
    }

    /// Wait until the coordinator has answered the request for a key.
    pub async fn wait_for_request(&self, key: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let closed = self.poll_closed.notified();
            if !self.is_request_pending(key) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, closed).await.is_err() {
                return Err(Error::Timeout {
                    what: format!("config request for {key}"),
                    millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
    }

    // ----- inbound -----

    /// Handle a message from another member. Runs on the service thread.
    pub fn on_message(&self, from: MemberId, message: ConfigMessage) {
        let _guard = self.write_lock.lock();
        match message {
            ConfigMessage::Request { poll, entries, remove } => self.on_request(from, poll, entries, remove),
            ConfigMessage::PollResponse { poll } => self.close_poll(poll),
            message @ (ConfigMessage::Update { .. } | ConfigMessage::Sync { .. }) => {
                let view = self.membership.snapshot();
                if Some(from) == view.oldest() {
                    self.apply(message);
                } else {
                    debug!(map = %self.name, %from, view = view.version(), message = %message, "deferring update from unexpected coordinator");
                    self.deferred.lock().push_back(Deferred { from, message, view });
                }
            }
        }
    }

    fn on_request(&self, from: MemberId, poll: PollId, entries: Vec<(String, Option<Value>)>, remove: bool) {
        if !self.is_coordinator() {
            warn!(map = %self.name, %from, poll, "ignoring config request; this member is not the coordinator");
            return;
        }
        for (key, value) in &entries {
            self.update_internal(key, if remove { None } else { value.clone() });
        }
        self.broadcast(ConfigMessage::Update { entries, remove }, Some(from));
        self.transport
            .send(self.this_member(), from, ConfigMessage::PollResponse { poll });
    }

    /// Apply an update or sync from the coordinator, skipping keys that
    /// have a request of our own in flight.
    fn apply(&self, message: ConfigMessage) {
        match message {
            ConfigMessage::Update { entries, remove } => {
                for (key, value) in entries {
                    if self.is_request_pending(&key) {
                        continue;
                    }
                    self.update_internal(&key, if remove { None } else { value });
                }
            }
            ConfigMessage::Sync { entries } => {
                let incoming: BTreeMap<String, Value> = entries.into_iter().collect();
                for key in self.keys() {
                    if !incoming.contains_key(&key) && !self.is_request_pending(&key) {
                        self.update_internal(&key, None);
                    }
                }
                for (key, value) in incoming {
                    if !self.is_request_pending(&key) && self.get(&key).as_ref() != Some(&value) {
                        self.update_internal(&key, Some(value));
                    }
                }
            }
            other => debug!(map = %self.name, message = %other, "not an update"),
        }
    }

    /// React to a member leaving: replay deferred updates now that the
    /// coordinator is known, move polls off a departed coordinator and, if
    /// this member took over, publish the full map.
    ///
    /// A deferred update is applied only once the view has moved past the
    /// one it arrived under and its sender is the coordinator of the newer
    /// view. Updates from senders no longer in the view are dropped. The
    /// first update that cannot be decided yet stops the replay so that
    /// order is preserved.
    pub fn on_service_left(&self, departed: MemberId, was_coordinator: bool) {
        let _guard = self.write_lock.lock();
        let members = self.membership.snapshot();
        let coordinator = members.oldest();

        loop {
            let Some(next) = self.deferred.lock().pop_front() else {
                break;
            };
            if !members.contains(next.from) {
                warn!(
                    map = %self.name,
                    from = %next.from,
                    deferred_under = next.view.version(),
                    view = members.version(),
                    message = %next.message,
                    "Ignoring stale message"
                );
            } else if members.version() > next.view.version() && Some(next.from) == coordinator {
                debug!(map = %self.name, from = %next.from, deferred_under = next.view.version(), view = members.version(), "replaying deferred update");
                self.apply(next.message);
            } else {
                self.deferred.lock().push_front(next);
                break;
            }
        }

        self.resubmit_polls(departed, coordinator);

        if was_coordinator && coordinator == Some(members.this_member()) {
            self.publish_config(None);
        }
    }

    fn resubmit_polls(&self, departed: MemberId, coordinator: Option<MemberId>) {
        let orphaned: Vec<(PollId, Poll)> = self
            .polls
            .lock()
            .iter()
            .filter(|(_, p)| p.to == departed)
            .map(|(id, p)| (*id, p.clone()))
            .collect();
        let this = self.this_member();

        for (poll, Poll { remove, .. }) in orphaned {
            match coordinator {
                Some(coordinator) if coordinator != this => {
                    let keys: Vec<String> = self
                        .pending
                        .lock()
                        .iter()
                        .filter(|(_, p)| **p == poll)
                        .map(|(k, _)| k.clone())
                        .collect();
                    let entries = keys
                        .into_iter()
                        .map(|key| {
                            let value = if remove { None } else { self.get(&key) };
                            (key, value)
                        })
                        .collect();
                    if let Some(p) = self.polls.lock().get_mut(&poll) {
                        p.to = coordinator;
                    }
                    debug!(map = %self.name, poll, %coordinator, "resubmitting config request");
                    self.transport
                        .send(this, coordinator, ConfigMessage::Request { poll, entries, remove });
                }
                // this member now decides; its local copy is authoritative
                Some(_) => self.close_poll(poll),
                None => {
                    if let Err(err) = self.policy.on_missing_coordinator(&self.name) {
                        warn!(map = %self.name, poll, error = %err, "config request left pending");
                    }
                }
            }
        }
    }

    /// Send the whole map to one member, or to every other member.
    pub fn publish_config(&self, to: Option<MemberId>) {
        let entries: Vec<(String, Value)> = self.entries().into_iter().collect();
        let message = ConfigMessage::Sync { entries };
        match to {
            Some(member) => {
                info!(map = %self.name, %member, entries = self.len(), "sending ConfigSync");
                self.transport.send(self.this_member(), member, message);
            }
            None => {
                info!(map = %self.name, entries = self.len(), "sending ConfigSync to all");
                self.broadcast(message, None);
            }
        }
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Versions of the membership views the queued updates arrived under.
    pub fn deferred_views(&self) -> Vec<u64> {
        self.deferred.lock().iter().map(|d| d.view.version()).collect()
    }
}
