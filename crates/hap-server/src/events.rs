//! Routing of characteristic changes to subscribed connections.
//!
//! The [`EventHub`] knows which connection listens to which `(aid, iid)` and
//! hands notifications to connection tasks through their command channel.
//! Each task batches them in an [`EventBuffer`] for the coalescing window.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use hap_core::connection::ConnectionId;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// One pending notification.
#[derive(Debug, Clone, PartialEq)]
pub struct EventItem {
    pub aid: u64,
    pub iid: u64,
    pub value: Value,
    /// Skip coalescing.
    pub immediate: bool,
}

/// Instructions for a connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionCommand {
    Event(EventItem),
    /// Close after finishing the current response.
    Close,
}

struct ConnectionEntry {
    controller: Option<String>,
    subscriptions: HashSet<(u64, u64)>,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

/// Registry of live connections and their subscriptions.
#[derive(Default)]
pub struct EventHub {
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: ConnectionId, commands: mpsc::UnboundedSender<ConnectionCommand>) {
        self.connections.lock().insert(
            connection,
            ConnectionEntry {
                controller: None,
                subscriptions: HashSet::new(),
                commands,
            },
        );
    }

    /// Forget a connection, returning the subscriptions it held.
    pub fn unregister(&self, connection: ConnectionId) -> Vec<(u64, u64)> {
        self.connections
            .lock()
            .remove(&connection)
            .map(|entry| entry.subscriptions.into_iter().collect())
            .unwrap_or_default()
    }

    /// Record the controller a connection verified as.
    pub fn set_controller(&self, connection: ConnectionId, controller: &str) {
        if let Some(entry) = self.connections.lock().get_mut(&connection) {
            entry.controller = Some(controller.to_string());
        }
    }

    /// Returns whether the subscription is new.
    pub fn subscribe(&self, connection: ConnectionId, aid: u64, iid: u64) -> bool {
        self.connections
            .lock()
            .get_mut(&connection)
            .is_some_and(|entry| entry.subscriptions.insert((aid, iid)))
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, connection: ConnectionId, aid: u64, iid: u64) -> bool {
        self.connections
            .lock()
            .get_mut(&connection)
            .is_some_and(|entry| entry.subscriptions.remove(&(aid, iid)))
    }

    pub fn is_subscribed(&self, connection: ConnectionId, aid: u64, iid: u64) -> bool {
        self.connections
            .lock()
            .get(&connection)
            .is_some_and(|entry| entry.subscriptions.contains(&(aid, iid)))
    }

    /// Notify every subscriber except `originator`.
    ///
    /// Returns the number of connections notified.
    pub fn publish(&self, item: EventItem, originator: Option<ConnectionId>) -> usize {
        let connections = self.connections.lock();
        let mut delivered = 0;
        for (id, entry) in connections.iter() {
            if Some(*id) == originator || !entry.subscriptions.contains(&(item.aid, item.iid)) {
                continue;
            }
            if entry.commands.send(ConnectionCommand::Event(item.clone())).is_ok() {
                delivered += 1;
            }
        }
        trace!(aid = item.aid, iid = item.iid, delivered, "Published event");
        delivered
    }

    /// Close every connection verified as one of `controllers`.
    pub fn close_controllers(&self, controllers: &[String]) {
        for (id, entry) in self.connections.lock().iter() {
            if entry
                .controller
                .as_ref()
                .is_some_and(|c| controllers.contains(c))
            {
                debug!(connection = %id, "Closing connection of removed controller");
                let _ = entry.commands.send(ConnectionCommand::Close);
            }
        }
    }

    /// Close every connection but `keep`.
    pub fn close_all_except(&self, keep: Option<ConnectionId>) {
        for (id, entry) in self.connections.lock().iter() {
            if Some(*id) != keep {
                let _ = entry.commands.send(ConnectionCommand::Close);
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

/// Per-connection batch of pending notifications.
///
/// A later value for the same characteristic replaces the earlier one.
#[derive(Debug)]
pub struct EventBuffer {
    window: Duration,
    pending: BTreeMap<(u64, u64), Value>,
    deadline: Option<Instant>,
}

impl EventBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeMap::new(),
            deadline: None,
        }
    }

    /// Queue `item`; returns true when the buffer must be flushed now.
    pub fn push(&mut self, item: EventItem) -> bool {
        self.pending.insert((item.aid, item.iid), item.value);
        if item.immediate || self.window.is_zero() {
            return true;
        }
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.window);
        }
        false
    }

    /// When the pending batch is due.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drain the batch as `{aid, iid, value}` entries.
    pub fn take(&mut self) -> Vec<Value> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|((aid, iid), value)| json!({ "aid": aid, "iid": iid, "value": value }))
            .collect()
    }
}
