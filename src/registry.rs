use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::oneshot;
use tracing::trace;

use crate::error::Outcome;

/// One pending caller's resolution handle. Sent to exactly once, at
/// delivery; a receiver that went away is ignored.
pub(crate) type Waiter<V> = oneshot::Sender<Outcome<V>>;

/// What a caller gets back from [`Registry::register`].
pub(crate) struct Registration<V> {
    /// Resolves when the target's outcome is delivered.
    pub(crate) waiter: oneshot::Receiver<Outcome<V>>,
    /// True iff this registration activated the target, i.e. the caller is
    /// responsible for triggering the dispatch.
    pub(crate) first: bool,
}

/// Per-instance map from key to the waiters attached to that key's
/// in-flight dispatch, plus one unkeyed queue for keyless requests.
///
/// A target is "active" iff it has an entry here. Entries are created
/// synchronously when a dispatch is triggered and removed exactly once,
/// at delivery. All mutation happens under the owning coalescer's lock,
/// never across an await point.
pub(crate) struct Registry<K, V> {
    global: Option<Vec<Waiter<V>>>,
    keyed: HashMap<K, Vec<Waiter<V>>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            global: None,
            keyed: HashMap::new(),
        }
    }

    /// True iff the key (or, with no key, the global queue) has an
    /// in-flight, undelivered dispatch. Pure lookup.
    pub(crate) fn is_active(&self, key: Option<&K>) -> bool {
        match key {
            Some(key) => self.keyed.contains_key(key),
            None => self.global.is_some(),
        }
    }

    /// Attach a waiter to the target, activating it if necessary.
    pub(crate) fn register(&mut self, key: Option<&K>) -> Registration<V> {
        let (tx, rx) = oneshot::channel();
        let first = match key {
            Some(key) => match self.keyed.entry(key.clone()) {
                Entry::Occupied(mut active) => {
                    active.get_mut().push(tx);
                    false
                }
                Entry::Vacant(inactive) => {
                    inactive.insert(vec![tx]);
                    true
                }
            },
            None => match &mut self.global {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    self.global = Some(vec![tx]);
                    true
                }
            },
        };
        if first {
            trace!(key = ?key, "activated");
        }
        Registration { waiter: rx, first }
    }

    /// Remove the target's entry and resolve every attached waiter with
    /// `outcome`, in attachment order. A no-op if the target is not active.
    pub(crate) fn deliver(&mut self, key: Option<&K>, outcome: &Outcome<V>) {
        let waiters = match key {
            Some(key) => self.keyed.remove(key).unwrap_or_default(),
            None => self.global.take().unwrap_or_default(),
        };
        trace!(key = ?key, waiters = waiters.len(), "delivered");
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registration_activates() {
        let mut registry: Registry<u32, String> = Registry::new();
        assert!(!registry.is_active(Some(&1)));

        let first = registry.register(Some(&1));
        assert!(first.first);
        assert!(registry.is_active(Some(&1)));

        let second = registry.register(Some(&1));
        assert!(!second.first);
    }

    #[test]
    fn delivery_resolves_all_waiters_and_deactivates() {
        let mut registry: Registry<u32, String> = Registry::new();
        let a = registry.register(Some(&1));
        let b = registry.register(Some(&1));

        registry.deliver(Some(&1), &Ok("value".to_string()));
        assert!(!registry.is_active(Some(&1)));

        let mut a = a.waiter;
        let mut b = b.waiter;
        assert_eq!(a.try_recv().unwrap().unwrap(), "value");
        assert_eq!(b.try_recv().unwrap().unwrap(), "value");
    }

    #[test]
    fn delivery_for_inactive_target_is_a_noop() {
        let mut registry: Registry<u32, String> = Registry::new();
        registry.deliver(Some(&9), &Ok("ignored".to_string()));
        registry.deliver(None, &Ok("ignored".to_string()));
        assert!(!registry.is_active(Some(&9)));
        assert!(!registry.is_active(None));
    }

    #[test]
    fn global_queue_is_independent_of_keys() {
        let mut registry: Registry<u32, String> = Registry::new();
        let global = registry.register(None);
        assert!(global.first);
        assert!(registry.is_active(None));
        assert!(!registry.is_active(Some(&0)));

        registry.deliver(None, &Ok("global".to_string()));
        assert!(!registry.is_active(None));

        let mut global = global.waiter;
        assert_eq!(global.try_recv().unwrap().unwrap(), "global");
    }
}
