//! Provides a safe, asynchronous (tokio based) request coalescer.
//!
//! If you have a slow or expensive data retrieving operation, [`Coalescer`]
//! will help avoid work duplication: for any given key, at most one
//! producer invocation is ever in flight at a time, and concurrent callers
//! requesting the same key attach to it and share its outcome. Nothing is
//! cached: the coalescer holds no data after delivery, it only
//! deduplicates in-flight work. Furthermore, if your producer is "flaky",
//! failures (and panics) are delivered cleanly to every waiting caller and
//! the [`Coalescer`] continues to function.
//!
//! An instance is configured with exactly one producer. A *fetch* producer
//! resolves one optional key at a time:
//!
//! ```
//! use coalesce::Coalescer;
//! use coalesce::FetchFuture;
//!
//! let users = Coalescer::builder()
//!     .name("users")
//!     .fetch_fn(|key: Option<u64>| {
//!         let fut = async move {
//!             // Imagine something slow and expensive here.
//!             Ok(format!("user {}", key.unwrap_or_default()))
//!         };
//!         Box::pin(fut) as FetchFuture<String>
//!     })
//!     .build()
//!     .expect("a fetch producer is configured");
//!
//! tokio_test::block_on(async {
//!     // However many of these run concurrently, the producer is invoked
//!     // once per key per burst of overlapping demand.
//!     let value = users.fetch(Some(1)).await.unwrap();
//!     assert_eq!(value, "user 1");
//! });
//! ```
//!
//! A *batch* producer resolves many keys in one invocation. It may return
//! an ordered list aligned to the keys it was given, a key-to-result map,
//! or nothing at all, unblocking individual keys as it goes through the
//! [`EarlyWriter`] it receives:
//!
//! ```
//! use coalesce::BatchFuture;
//! use coalesce::BatchReply;
//! use coalesce::Coalescer;
//! use coalesce::EarlyWriter;
//!
//! let doubler = Coalescer::builder()
//!     .name("doubler")
//!     .batch_fn(|keys: Vec<u32>, early: EarlyWriter<u32, u32>| {
//!         let fut = async move {
//!             // Unblock the first key before the batch finishes...
//!             early.write(keys[0], Ok(keys[0] * 2));
//!             // ...and resolve the rest positionally on completion.
//!             Ok(BatchReply::Values(
//!                 keys.into_iter().map(|key| Ok(key * 2)).collect(),
//!             ))
//!         };
//!         Box::pin(fut) as BatchFuture<u32, u32>
//!     })
//!     .build()
//!     .expect("a batch producer is configured");
//!
//! tokio_test::block_on(async {
//!     let outcomes = doubler.batch(vec![1, 2, 3]).await.unwrap();
//!     let values: Vec<u32> = outcomes.into_iter().map(|o| o.unwrap()).collect();
//!     assert_eq!(values, vec![2, 4, 6]);
//! });
//! ```
//!
//! Batch instances also serve [`try_batch`](Coalescer::try_batch) (fails
//! the whole call on the first per-key failure), keyed
//! [`fetch`](Coalescer::fetch), and [`stream`](Coalescer::stream), which
//! feeds each key's outcome to an asynchronous consumer as soon as it
//! lands.
//!
//! Timeouts and retries are deliberately not provided: layer them around
//! the returned futures, or inside your producer, as appropriate.

mod coalescer;
mod dispatch;
mod error;
mod registry;

pub use crate::coalescer::BatchFuture;
pub use crate::coalescer::Coalescer;
pub use crate::coalescer::CoalescerBuilder;
pub use crate::coalescer::FetchFuture;
pub use crate::dispatch::BatchReply;
pub use crate::dispatch::EarlyWriter;
pub use crate::error::BoxError;
pub use crate::error::CoalesceError;
pub use crate::error::Outcome;
