//! Listener registry and topic dispatch.
//!
//! A flat, ordered list of listener entries evaluated linearly per
//! message. Subscription counts are small (tens), so a scan beats any
//! index. Two entry kinds share the list:
//!
//! - *raw* listeners receive every decoded frame
//! - *topic* listeners receive frames whose topic matches their pattern,
//!   together with the match result
//!
//! Removing an entry that is not registered is an error by contract: a
//! mismatched add/remove is a lifecycle bug in the consumer and masking it
//! makes "why am I receiving nothing" expensive to diagnose.

use crate::envelope::RawMessage;
use crate::error::{RobofleetLinkError, Result};
use crate::topics::{TopicMatch, TopicPattern};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Callback invoked with a frame and its topic match result.
pub type TopicCallback = Arc<dyn Fn(&RawMessage, &TopicMatch) + Send + Sync>;

/// Callback invoked with every decoded frame.
pub type RawCallback = Arc<dyn Fn(&RawMessage) + Send + Sync>;

/// Opaque handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum ListenerKind {
    Raw(RawCallback),
    Topic {
        pattern: TopicPattern,
        callback: TopicCallback,
    },
}

struct ListenerEntry {
    id: ListenerId,
    enabled: bool,
    kind: ListenerKind,
}

/// Ordered collection of message listeners.
///
/// Mutated only from the connection task, so no internal locking.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    entries: Vec<ListenerEntry>,
    next_id: u64,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: ListenerKind) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.push(ListenerEntry {
            id,
            enabled: true,
            kind,
        });
        id
    }

    /// Register a listener for every decoded frame. Registering the same
    /// callback twice creates two independent entries; the caller manages
    /// identity, not the registry.
    pub(crate) fn add_raw(&mut self, callback: RawCallback) -> ListenerId {
        self.push(ListenerKind::Raw(callback))
    }

    /// Register a topic-filtered listener.
    pub(crate) fn add_topic(&mut self, pattern: TopicPattern, callback: TopicCallback) -> ListenerId {
        self.push(ListenerKind::Topic { pattern, callback })
    }

    /// Remove one entry. Returns the pattern source for topic listeners so
    /// the caller can release the matching subscription refcount.
    pub(crate) fn remove(&mut self, id: ListenerId) -> Result<Option<String>> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| {
                RobofleetLinkError::UnregisteredListener(format!(
                    "listener {:?} is not registered (double remove?)",
                    id
                ))
            })?;
        let entry = self.entries.remove(index);
        Ok(match entry.kind {
            ListenerKind::Raw(_) => None,
            ListenerKind::Topic { pattern, .. } => Some(pattern.source().to_string()),
        })
    }

    /// Toggle whether an entry receives dispatches.
    pub(crate) fn set_enabled(&mut self, id: ListenerId, enabled: bool) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| {
                RobofleetLinkError::UnregisteredListener(format!(
                    "listener {:?} is not registered",
                    id
                ))
            })?;
        entry.enabled = enabled;
        Ok(())
    }

    /// Dispatch one message: every enabled entry, in registration order.
    /// Raw entries always fire; topic entries fire on match, all matches,
    /// no early exit. Returns the number of topic listeners that matched.
    ///
    /// A panicking listener is isolated so the rest of the dispatch still
    /// runs.
    pub(crate) fn dispatch(&self, message: &RawMessage) -> usize {
        let mut matched = 0;
        for entry in &self.entries {
            if !entry.enabled {
                continue;
            }
            match &entry.kind {
                ListenerKind::Raw(callback) => {
                    let cb = callback.clone();
                    if catch_unwind(AssertUnwindSafe(|| cb(message))).is_err() {
                        log::error!("Raw listener {:?} panicked; continuing dispatch", entry.id);
                    }
                }
                ListenerKind::Topic { pattern, callback } => {
                    if let Some(topic_match) = pattern.matches(message.topic()) {
                        matched += 1;
                        let cb = callback.clone();
                        if catch_unwind(AssertUnwindSafe(|| cb(message, &topic_match))).is_err() {
                            log::error!(
                                "Listener {:?} for pattern '{}' panicked; continuing dispatch",
                                entry.id,
                                pattern.source()
                            );
                        }
                    }
                }
            }
        }
        matched
    }
}
