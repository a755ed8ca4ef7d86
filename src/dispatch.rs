use std::any::Any;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use tracing::trace;

use crate::error::BoxError;
use crate::error::CoalesceError;
use crate::error::Outcome;
use crate::registry::Registry;

/// What a batch producer hands back when it completes.
///
/// A producer may resolve keys through its return value, through early
/// writes, or through a mix of both. Keys left unresolved after completion
/// fail with [`CoalesceError::MissingResult`].
pub enum BatchReply<K, V> {
    /// Ordered results, positionally aligned to the dispatched keys. The
    /// length must match the dispatched key count exactly; a mismatch fails
    /// the whole dispatch. Positions whose key was already resolved by an
    /// early write are skipped.
    Values(Vec<Result<V, BoxError>>),
    /// Results keyed by the dispatched key. Keys not mentioned fall through
    /// to the missing-result failure.
    Entries(HashMap<K, Result<V, BoxError>>),
    /// Every key was (or should have been) resolved by early writes.
    Done,
}

/// State shared between one producer dispatch and the early-write handles
/// it gave out. Tracks which dispatched keys are still unresolved, so the
/// first write for a key wins and later writes are ignored.
pub(crate) struct DispatchState<K, V> {
    name: String,
    registry: Arc<Mutex<Registry<K, V>>>,
    remaining: Mutex<HashSet<K>>,
    finished: AtomicBool,
}

impl<K, V> DispatchState<K, V>
where
    K: Clone + Eq + Hash + Debug,
    V: Clone,
{
    pub(crate) fn new(
        name: String,
        registry: Arc<Mutex<Registry<K, V>>>,
        keys: &[K],
    ) -> Self {
        Self {
            name,
            registry,
            remaining: Mutex::new(keys.iter().cloned().collect()),
            finished: AtomicBool::new(false),
        }
    }

    /// Deliver `outcome` for `key` unless the key was already resolved (or
    /// was never part of this dispatch). Returns whether it delivered.
    fn resolve(&self, key: &K, outcome: Outcome<V>) -> bool {
        {
            let mut remaining = self.remaining.lock();
            if !remaining.remove(key) {
                trace!(name = %self.name, key = ?key, "already resolved, write ignored");
                return false;
            }
        }
        self.registry.lock().deliver(Some(key), &outcome);
        true
    }

    /// Consume the producer's completion and resolve every dispatched key
    /// exactly once.
    ///
    /// `completion` is the caught producer invocation: the outer `Err` is a
    /// panic payload, the inner `Err` is an error the producer returned.
    /// Either one fails every still-unresolved key. After the reply (if
    /// any) is applied, keys left over fail with a missing-result error,
    /// each carrying its own key in the message.
    pub(crate) fn settle(
        &self,
        keys: &[K],
        completion: Result<Result<BatchReply<K, V>, BoxError>, Box<dyn Any + Send>>,
    ) {
        self.finished.store(true, Ordering::SeqCst);
        match completion {
            Ok(Ok(BatchReply::Values(values))) => {
                if values.len() != keys.len() {
                    let err = CoalesceError::LengthMismatch {
                        name: self.name.clone(),
                        expected: keys.len(),
                        actual: values.len(),
                    };
                    for key in keys {
                        self.resolve(key, Err(err.clone()));
                    }
                } else {
                    for (key, value) in keys.iter().zip(values) {
                        let outcome = value.map_err(|e| CoalesceError::wrap(&self.name, e));
                        self.resolve(key, outcome);
                    }
                }
            }
            Ok(Ok(BatchReply::Entries(entries))) => {
                for (key, value) in entries {
                    let outcome = value.map_err(|e| CoalesceError::wrap(&self.name, e));
                    self.resolve(&key, outcome);
                }
            }
            Ok(Ok(BatchReply::Done)) => {}
            Ok(Err(err)) => {
                let err = CoalesceError::wrap(&self.name, err);
                debug!(name = %self.name, error = %err, "batch producer failed");
                for key in keys {
                    self.resolve(key, Err(err.clone()));
                }
            }
            Err(panic) => {
                let err = CoalesceError::panicked(&self.name, panic);
                debug!(name = %self.name, error = %err, "batch producer panicked");
                for key in keys {
                    self.resolve(key, Err(err.clone()));
                }
            }
        }
        // The producer contract requires every dispatched key to be
        // resolved; enforce it for the ones it forgot.
        for key in keys {
            self.resolve(key, Err(CoalesceError::missing(&self.name, key)));
        }
    }
}

/// Handle a batch producer uses to unblock individual keys before the
/// whole batch finishes.
///
/// Only keys that were part of the dispatch can be written; the first
/// write for a key wins and later writes for it are silently ignored.
/// Writing after the producer invocation has completed panics: a retained
/// handle past that point is a bug in the producer, not a recoverable
/// condition.
pub struct EarlyWriter<K, V> {
    state: Arc<DispatchState<K, V>>,
}

impl<K, V> Clone for EarlyWriter<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K, V> EarlyWriter<K, V>
where
    K: Clone + Eq + Hash + Debug,
    V: Clone,
{
    pub(crate) fn new(state: &Arc<DispatchState<K, V>>) -> Self {
        Self {
            state: Arc::clone(state),
        }
    }

    /// Deliver `outcome` for `key` right now, waking every caller waiting
    /// on it.
    ///
    /// # Panics
    ///
    /// Panics if called after the batch producer invocation it was handed
    /// to has completed.
    pub fn write(&self, key: K, outcome: Result<V, BoxError>) {
        if self.state.finished.load(Ordering::SeqCst) {
            panic!(
                "{}: early write for key {:?} after batch producer completion",
                self.state.name, key
            );
        }
        let outcome = outcome.map_err(|e| CoalesceError::wrap(&self.state.name, e));
        self.state.resolve(&key, outcome);
    }
}
