use std::sync::Arc;

use coalesce::BatchFuture;
use coalesce::BatchReply;
use coalesce::Coalescer;
use coalesce::EarlyWriter;

/// A batch producer which doubles every key it is given. The first key is
/// unblocked early; the rest wait for the whole batch.
fn batch(keys: Vec<u32>, early: EarlyWriter<u32, u32>) -> BatchFuture<u32, u32> {
    println!("dispatching: {keys:?}");
    let fut = async move {
        early.write(keys[0], Ok(keys[0] * 2));
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        Ok(BatchReply::Values(
            keys.into_iter().map(|key| Ok(key * 2)).collect(),
        ))
    };
    Box::pin(fut)
}

#[tokio::main]
async fn main() {
    let coalescer = Arc::new(
        Coalescer::builder()
            .name("doubler")
            .batch_fn(batch)
            .build()
            .expect("batch producer configured"),
    );

    // Stream: each key prints as soon as its result lands, so key 1
    // appears roughly half a second before keys 2 and 3.
    let streaming = {
        let coalescer = coalescer.clone();
        tokio::spawn(async move {
            coalescer
                .stream(vec![1, 2, 3], |key, outcome| async move {
                    println!("streamed: {key} -> {outcome:?}");
                })
                .await
                .expect("batch producer configured")
        })
    };

    // An overlapping batch joins keys already in flight: only 5 and 8
    // reach the producer, key 3 shares the streaming dispatch above.
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    let outcomes = coalescer
        .batch(vec![3, 5, 8])
        .await
        .expect("batch producer configured");
    println!("batched: {outcomes:?}");

    streaming.await.expect("stream completes");
}
