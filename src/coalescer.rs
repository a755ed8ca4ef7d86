use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::join_all;
use futures::future::try_join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::dispatch::BatchReply;
use crate::dispatch::DispatchState;
use crate::dispatch::EarlyWriter;
use crate::error::BoxError;
use crate::error::CoalesceError;
use crate::error::Outcome;
use crate::registry::Registry;

/// Boxed Future yielding one fetched value or a producer error.
pub type FetchFuture<V> = Pin<Box<dyn Future<Output = Result<V, BoxError>> + Send>>;

/// Boxed Future yielding a batch producer's completion.
pub type BatchFuture<K, V> =
    Pin<Box<dyn Future<Output = Result<BatchReply<K, V>, BoxError>> + Send>>;

type FetchFn<K, V> = Box<dyn Fn(Option<K>) -> FetchFuture<V> + Send + Sync>;
type BatchFn<K, V> = Box<dyn Fn(Vec<K>, EarlyWriter<K, V>) -> BatchFuture<K, V> + Send + Sync>;

/// The one producer an instance is configured with.
enum Producer<K, V> {
    Fetch(FetchFn<K, V>),
    Batch(BatchFn<K, V>),
}

const DEFAULT_NAME: &str = "coalescer";

/// Request coalescing over a delegated producer.
///
/// For any given key, at most one producer invocation is in flight at a
/// time; concurrent callers for the same key attach to the in-flight
/// invocation and all receive its outcome. The coalescer holds no data
/// after delivery; it only deduplicates in-flight work.
///
/// An instance is configured with exactly one producer kind (see
/// [`CoalescerBuilder`]):
///
/// - a *fetch* producer resolving one optional key at a time, serving
///   [`fetch`](Coalescer::fetch), or
/// - a *batch* producer resolving a set of keys at once, serving
///   [`batch`](Coalescer::batch), [`try_batch`](Coalescer::try_batch),
///   [`stream`](Coalescer::stream) and keyed `fetch`.
#[derive(Clone)]
pub struct Coalescer<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    name: String,
    producer: Arc<Producer<K, V>>,
    registry: Arc<Mutex<Registry<K, V>>>,
    request_total_counter: Arc<AtomicU64>,
    request_coalesced_counter: Arc<AtomicU64>,
}

impl<K, V> Debug for Coalescer<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Configures and builds a [`Coalescer`].
///
/// Exactly one of [`fetch_fn`](CoalescerBuilder::fetch_fn) and
/// [`batch_fn`](CoalescerBuilder::batch_fn) must be supplied before
/// [`build`](CoalescerBuilder::build).
pub struct CoalescerBuilder<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    name: Option<String>,
    fetch: Option<FetchFn<K, V>>,
    batch: Option<BatchFn<K, V>>,
}

impl<K, V> CoalescerBuilder<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Set the diagnostic name used in failure messages.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Supply the single-key fetch producer.
    pub fn fetch_fn<F>(mut self, producer: F) -> Self
    where
        F: Fn(Option<K>) -> FetchFuture<V> + Send + Sync + 'static,
    {
        self.fetch = Some(Box::new(producer));
        self
    }

    /// Supply the batch producer. It receives the keys needing dispatch and
    /// an [`EarlyWriter`] for unblocking individual keys before the whole
    /// batch finishes.
    pub fn batch_fn<F>(mut self, producer: F) -> Self
    where
        F: Fn(Vec<K>, EarlyWriter<K, V>) -> BatchFuture<K, V> + Send + Sync + 'static,
    {
        self.batch = Some(Box::new(producer));
        self
    }

    /// Build the coalescer, failing with
    /// [`CoalesceError::InvalidConfiguration`] unless exactly one producer
    /// was supplied.
    pub fn build(self) -> Result<Coalescer<K, V>, CoalesceError> {
        let name = self.name.unwrap_or_else(|| DEFAULT_NAME.to_string());
        let producer = match (self.fetch, self.batch) {
            (Some(fetch), None) => Producer::Fetch(fetch),
            (None, Some(batch)) => Producer::Batch(batch),
            _ => return Err(CoalesceError::InvalidConfiguration { name }),
        };
        Ok(Coalescer {
            name,
            producer: Arc::new(producer),
            registry: Arc::new(Mutex::new(Registry::new())),
            request_total_counter: Arc::new(AtomicU64::new(0)),
            request_coalesced_counter: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Start configuring a new coalescer.
    pub fn builder() -> CoalescerBuilder<K, V> {
        CoalescerBuilder {
            name: None,
            fetch: None,
            batch: None,
        }
    }

    /// The diagnostic name used in failure messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff the key (or, with no key, the keyless queue) currently has
    /// an in-flight, undelivered dispatch.
    pub fn is_active(&self, key: Option<&K>) -> bool {
        self.registry.lock().is_active(key)
    }

    /// Return the total request count. Every requested key occurrence
    /// counts once, across all operations.
    pub fn request_count(&self) -> u64 {
        self.request_total_counter.load(Ordering::SeqCst)
    }

    /// Return the coalesced request count: requested key occurrences that
    /// attached to an in-flight dispatch instead of triggering one.
    pub fn request_coalesced_count(&self) -> u64 {
        self.request_coalesced_counter.load(Ordering::SeqCst)
    }

    /// Get the value for `key`, coalescing with any in-flight request.
    ///
    /// Many concurrent callers can fetch the same key, but the producer is
    /// only invoked once per burst of overlapping demand; every caller
    /// observes the same outcome. If the producer fails, errors or panics,
    /// every caller receives the resulting [`CoalesceError`].
    ///
    /// With a batch producer configured, a keyed fetch delegates to the
    /// batch path with a one-element key list; a keyless fetch is a usage
    /// error since there is no batch to join without a key.
    pub async fn fetch(&self, key: Option<K>) -> Result<V, CoalesceError> {
        match self.producer.as_ref() {
            Producer::Batch(_) => {
                let Some(key) = key else {
                    return Err(CoalesceError::KeylessFetch {
                        name: self.name.clone(),
                    });
                };
                let mut outcomes = self.batch(vec![key]).await?;
                match outcomes.pop() {
                    Some(outcome) => outcome,
                    None => Err(CoalesceError::abandoned(&self.name)),
                }
            }
            Producer::Fetch(_) => {
                self.request_total_counter.fetch_add(1, Ordering::SeqCst);
                let registration = self.registry.lock().register(key.as_ref());
                if registration.first {
                    self.spawn_fetch(key);
                } else {
                    self.request_coalesced_counter.fetch_add(1, Ordering::SeqCst);
                }
                match registration.waiter.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CoalesceError::abandoned(&self.name)),
                }
            }
        }
    }

    /// Get the values for `keys`, coalescing each against any in-flight
    /// request anywhere in this instance.
    ///
    /// The output is positionally aligned to the input: duplicates appear
    /// once per position, all carrying the identical outcome, and each
    /// position holds that key's success value or failure. The batch
    /// producer is invoked once, with only the keys that were not already
    /// active; keys in flight from unrelated concurrent calls are joined,
    /// not re-dispatched. The call itself only fails on misuse (no batch
    /// producer configured).
    pub async fn batch(&self, keys: Vec<K>) -> Result<Vec<Outcome<V>>, CoalesceError> {
        let (waiters, positions, inactive) = self.admit(&keys)?;
        let handle = self.dispatch(inactive);
        let mut outcomes = Vec::with_capacity(waiters.len());
        for (_key, waiter) in waiters {
            let outcome = match waiter.await {
                Ok(outcome) => outcome,
                Err(_) => Err(CoalesceError::abandoned(&self.name)),
            };
            outcomes.push(outcome);
        }
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(positions.into_iter().map(|slot| outcomes[slot].clone()).collect())
    }

    /// Like [`batch`](Coalescer::batch), but the first failure outcome for
    /// any requested key fails the whole call, as soon as it lands.
    ///
    /// Successfully resolved siblings are discarded from this caller's
    /// perspective; they still propagate normally to other concurrent
    /// callers sharing those keys.
    pub async fn try_batch(&self, keys: Vec<K>) -> Result<Vec<V>, CoalesceError> {
        let (waiters, positions, inactive) = self.admit(&keys)?;
        let handle = self.dispatch(inactive);
        let name = &self.name;
        let values = try_join_all(waiters.into_iter().map(|(_key, waiter)| async move {
            match waiter.await {
                Ok(outcome) => outcome,
                Err(_) => Err(CoalesceError::abandoned(name)),
            }
        }))
        .await?;
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(positions.into_iter().map(|slot| values[slot].clone()).collect())
    }

    /// Resolve `keys` and feed each distinct key's outcome to `on_result`
    /// as soon as it lands, independent of when sibling keys resolve.
    ///
    /// Uses the same dedup and dispatch path as
    /// [`batch`](Coalescer::batch): keys already in flight are joined, the
    /// batch producer sees only the rest. The call completes once the
    /// dispatch (if any) and every consumer invocation have completed.
    pub async fn stream<F, Fut>(&self, keys: Vec<K>, on_result: F) -> Result<(), CoalesceError>
    where
        F: Fn(K, Outcome<V>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let (waiters, _positions, inactive) = self.admit(&keys)?;
        let handle = self.dispatch(inactive);
        let name = &self.name;
        let on_result = &on_result;
        join_all(waiters.into_iter().map(|(key, waiter)| async move {
            let outcome = match waiter.await {
                Ok(outcome) => outcome,
                Err(_) => Err(CoalesceError::abandoned(name)),
            };
            on_result(key, outcome).await;
        }))
        .await;
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Partition `keys` into attached waiters and the inactive set needing
    /// dispatch.
    ///
    /// Everything here happens under one registry lock hold, before any
    /// suspension: by the time this returns, every key in the inactive set
    /// is already marked active, so a concurrent call for the same key
    /// attaches instead of double-dispatching.
    #[allow(clippy::type_complexity)]
    fn admit(
        &self,
        keys: &[K],
    ) -> Result<(Vec<(K, oneshot::Receiver<Outcome<V>>)>, Vec<usize>, Vec<K>), CoalesceError>
    {
        if !matches!(self.producer.as_ref(), Producer::Batch(_)) {
            return Err(CoalesceError::NoBatcher {
                name: self.name.clone(),
            });
        }
        let mut slots: HashMap<K, usize> = HashMap::new();
        let mut waiters = Vec::new();
        let mut positions = Vec::with_capacity(keys.len());
        let mut inactive = Vec::new();
        let mut registry = self.registry.lock();
        for key in keys {
            let slot = match slots.get(key) {
                Some(&slot) => slot,
                None => {
                    let registration = registry.register(Some(key));
                    if registration.first {
                        inactive.push(key.clone());
                    }
                    waiters.push((key.clone(), registration.waiter));
                    let slot = waiters.len() - 1;
                    slots.insert(key.clone(), slot);
                    slot
                }
            };
            positions.push(slot);
        }
        self.request_total_counter
            .fetch_add(keys.len() as u64, Ordering::SeqCst);
        self.request_coalesced_counter
            .fetch_add((keys.len() - inactive.len()) as u64, Ordering::SeqCst);
        Ok((waiters, positions, inactive))
    }

    /// Invoke the batch producer once for the inactive set, on its own
    /// task so delivery happens even if every caller goes away.
    fn dispatch(&self, inactive: Vec<K>) -> Option<JoinHandle<()>> {
        if inactive.is_empty() {
            return None;
        }
        debug!(name = %self.name, keys = ?inactive, "dispatching batch producer");
        let state = Arc::new(DispatchState::new(
            self.name.clone(),
            Arc::clone(&self.registry),
            &inactive,
        ));
        let writer = EarlyWriter::new(&state);
        let producer = Arc::clone(&self.producer);
        Some(tokio::spawn(async move {
            let Producer::Batch(batch) = producer.as_ref() else {
                return;
            };
            let batch_keys = inactive.clone();
            let completion = AssertUnwindSafe(async move { batch(batch_keys, writer).await })
                .catch_unwind()
                .await;
            state.settle(&inactive, completion);
        }))
    }

    /// Invoke the fetch producer for `key` on its own task, delivering to
    /// every waiter on completion. Panics and errors both become failure
    /// outcomes for the waiters.
    fn spawn_fetch(&self, key: Option<K>) {
        debug!(name = %self.name, key = ?key, "dispatching fetch producer");
        let producer = Arc::clone(&self.producer);
        let registry = Arc::clone(&self.registry);
        let name = self.name.clone();
        tokio::spawn(async move {
            let Producer::Fetch(fetch) = producer.as_ref() else {
                return;
            };
            let fetch_key = key.clone();
            let completion = AssertUnwindSafe(async move { fetch(fetch_key).await })
                .catch_unwind()
                .await;
            let outcome = match completion {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(CoalesceError::wrap(&name, err)),
                Err(panic) => Err(CoalesceError::panicked(&name, panic)),
            };
            registry.lock().deliver(key.as_ref(), &outcome);
        });
    }
}
