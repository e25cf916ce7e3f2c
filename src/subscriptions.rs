//! Server-side subscription bookkeeping.
//!
//! The relay only forwards messages matching patterns this client has
//! subscribed to, so local listener registrations are reference-counted
//! per pattern source string: one subscribe wire message when a source's
//! refcount goes 0→1, one unsubscribe when it returns to 0. Distinct
//! source strings are distinct entries even when their topic sets overlap.
//!
//! The table is pure state: it computes which wire action (if any) a
//! transition requires, and the connection task performs the send. While
//! disconnected, transitions are recorded and flushed as one resubscribe
//! batch on reconnect.

use std::collections::HashMap;

/// Snapshot of one subscription entry, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Pattern source string as sent to the relay.
    pub topic_regex: String,
    /// Number of active local registrations relying on this entry.
    pub refcount: usize,
    /// Whether the entry is enabled (disabled entries are retained but
    /// unsubscribed server-side).
    pub enabled: bool,
    /// Whether the relay currently considers us subscribed.
    pub subscribed: bool,
}

/// A wire message the connection task must send for a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WireAction {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubState {
    /// Not yet (or no longer) known to the server; sent on next flush.
    PendingSubscribe,
    /// Subscribe message sent on the current connection.
    Subscribed,
}

#[derive(Debug)]
struct SubEntry {
    refcount: usize,
    enabled: bool,
    state: SubState,
}

/// Refcounted map from pattern source string to subscription state.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    entries: HashMap<String, SubEntry>,
}

impl SubscriptionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record one more local registration for `source`. Returns the wire
    /// action for a 0→1 transition while connected.
    pub(crate) fn acquire(&mut self, source: &str, connected: bool) -> Option<WireAction> {
        if let Some(entry) = self.entries.get_mut(source) {
            entry.refcount += 1;
            return None;
        }
        let state = if connected {
            SubState::Subscribed
        } else {
            SubState::PendingSubscribe
        };
        self.entries.insert(
            source.to_string(),
            SubEntry {
                refcount: 1,
                enabled: true,
                state,
            },
        );
        if connected {
            Some(WireAction::Subscribe(source.to_string()))
        } else {
            None
        }
    }

    /// Drop one local registration for `source`. Returns the wire action
    /// for a 1→0 transition on an entry the server knows about; entries
    /// that never reached the server are simply dropped.
    pub(crate) fn release(&mut self, source: &str, connected: bool) -> Option<WireAction> {
        let entry = self.entries.get_mut(source)?;
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return None;
        }
        let was_subscribed = entry.enabled && entry.state == SubState::Subscribed;
        self.entries.remove(source);
        if connected && was_subscribed {
            Some(WireAction::Unsubscribe(source.to_string()))
        } else {
            None
        }
    }

    /// Toggle an entry without touching its refcount. Disabling a
    /// subscribed entry unsubscribes server-side but keeps the entry for
    /// fast re-enable.
    pub(crate) fn set_enabled(
        &mut self,
        source: &str,
        enabled: bool,
        connected: bool,
    ) -> Option<WireAction> {
        let entry = self.entries.get_mut(source)?;
        if entry.enabled == enabled {
            return None;
        }
        entry.enabled = enabled;
        if enabled {
            if connected {
                entry.state = SubState::Subscribed;
                Some(WireAction::Subscribe(source.to_string()))
            } else {
                entry.state = SubState::PendingSubscribe;
                None
            }
        } else if connected && entry.state == SubState::Subscribed {
            entry.state = SubState::PendingSubscribe;
            Some(WireAction::Unsubscribe(source.to_string()))
        } else {
            entry.state = SubState::PendingSubscribe;
            None
        }
    }

    /// The socket died: nothing is subscribed server-side anymore.
    pub(crate) fn mark_disconnected(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state = SubState::PendingSubscribe;
        }
    }

    /// Collect every enabled entry that needs a subscribe on a fresh
    /// connection, marking each as subscribed. Each entry appears at most
    /// once per reconnect.
    pub(crate) fn take_resubscribe_batch(&mut self) -> Vec<String> {
        let mut batch = Vec::new();
        for (source, entry) in self.entries.iter_mut() {
            if entry.enabled && entry.state == SubState::PendingSubscribe {
                entry.state = SubState::Subscribed;
                batch.push(source.clone());
            }
        }
        batch
    }

    pub(crate) fn contains(&self, source: &str) -> bool {
        self.entries.contains_key(source)
    }

    pub(crate) fn snapshot(&self) -> Vec<SubscriptionInfo> {
        self.entries
            .iter()
            .map(|(source, entry)| SubscriptionInfo {
                topic_regex: source.clone(),
                refcount: entry.refcount,
                enabled: entry.enabled,
                subscribed: entry.state == SubState::Subscribed,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "^robot1/(?P<topic>.+)$";

    #[test]
    fn test_refcount_sends_one_subscribe_and_one_unsubscribe() {
        let mut table = SubscriptionTable::new();

        assert_eq!(
            table.acquire(SRC, true),
            Some(WireAction::Subscribe(SRC.to_string()))
        );
        assert_eq!(table.acquire(SRC, true), None);
        assert_eq!(table.release(SRC, true), None);
        assert_eq!(
            table.release(SRC, true),
            Some(WireAction::Unsubscribe(SRC.to_string()))
        );
        assert!(!table.contains(SRC));
    }

    #[test]
    fn test_subscribe_count_never_exceeds_unsubscribe_count_plus_one() {
        let mut table = SubscriptionTable::new();
        let mut subs = 0i64;
        let mut unsubs = 0i64;
        let ops = [true, true, false, true, false, false, true, false];
        for &add in &ops {
            let action = if add {
                table.acquire(SRC, true)
            } else {
                table.release(SRC, true)
            };
            match action {
                Some(WireAction::Subscribe(_)) => subs += 1,
                Some(WireAction::Unsubscribe(_)) => unsubs += 1,
                None => {}
            }
            assert!(subs - unsubs <= 1);
            assert!(subs - unsubs >= 0);
        }
        assert_eq!(subs, unsubs);
    }

    #[test]
    fn test_offline_acquire_defers_until_reconnect() {
        let mut table = SubscriptionTable::new();

        assert_eq!(table.acquire(SRC, false), None);
        let batch = table.take_resubscribe_batch();
        assert_eq!(batch, vec![SRC.to_string()]);

        // Flushed once; nothing left pending.
        assert!(table.take_resubscribe_batch().is_empty());
    }

    #[test]
    fn test_offline_release_of_unsent_entry_sends_nothing() {
        let mut table = SubscriptionTable::new();
        table.acquire(SRC, false);
        assert_eq!(table.release(SRC, false), None);
        assert!(!table.contains(SRC));
        assert!(table.take_resubscribe_batch().is_empty());
    }

    #[test]
    fn test_reconnect_resubscribes_each_enabled_entry_exactly_once() {
        let mut table = SubscriptionTable::new();
        table.acquire("^a$", true);
        table.acquire("^b$", true);
        table.acquire("^b$", true); // refcount 2, still one entry

        table.mark_disconnected();
        let mut batch = table.take_resubscribe_batch();
        batch.sort();
        assert_eq!(batch, vec!["^a$".to_string(), "^b$".to_string()]);
        assert!(table.take_resubscribe_batch().is_empty());
    }

    #[test]
    fn test_disabled_entry_is_not_resubscribed() {
        let mut table = SubscriptionTable::new();
        table.acquire("^a$", true);
        table.acquire("^b$", true);
        table.set_enabled("^a$", false, true);

        table.mark_disconnected();
        assert_eq!(table.take_resubscribe_batch(), vec!["^b$".to_string()]);
    }

    #[test]
    fn test_disable_unsubscribes_but_retains_refcount() {
        let mut table = SubscriptionTable::new();
        table.acquire(SRC, true);
        table.acquire(SRC, true);

        assert_eq!(
            table.set_enabled(SRC, false, true),
            Some(WireAction::Unsubscribe(SRC.to_string()))
        );
        // Redundant toggle is a no-op.
        assert_eq!(table.set_enabled(SRC, false, true), None);

        assert_eq!(
            table.set_enabled(SRC, true, true),
            Some(WireAction::Subscribe(SRC.to_string()))
        );

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].refcount, 2);
        assert!(snapshot[0].enabled);
        assert!(snapshot[0].subscribed);
    }

    #[test]
    fn test_release_of_disabled_entry_sends_nothing() {
        let mut table = SubscriptionTable::new();
        table.acquire(SRC, true);
        table.set_enabled(SRC, false, true);
        assert_eq!(table.release(SRC, true), None);
    }

    #[test]
    fn test_release_of_unknown_source_is_ignored() {
        let mut table = SubscriptionTable::new();
        assert_eq!(table.release("^never$", true), None);
    }
}
