use std::sync::Arc;

use coalesce::Coalescer;
use coalesce::FetchFuture;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;

// Deliberately slow getter so that coalescing overlapping demand is
// visible against the cost of the machinery itself.
fn getter(key: Option<u64>) -> FetchFuture<u64> {
    let fut = async move {
        tokio::time::sleep(tokio::time::Duration::from_micros(200)).await;
        Ok(key.unwrap_or_default() * 2)
    };
    Box::pin(fut)
}

fn burst_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch");
    // Concurrent requesters spread over a 4 key space. Higher concurrency
    // means more overlap, which is where the coalescer earns its keep.
    for concurrency in [1usize, 8, 64].iter() {
        let coalescer = Arc::new(
            Coalescer::builder()
                .name("bench")
                .fetch_fn(getter)
                .build()
                .expect("fetch producer configured"),
        );
        group.bench_with_input(
            BenchmarkId::new("coalesced fetch", concurrency),
            concurrency,
            |b, &concurrency| {
                let coalescer = coalescer.clone();
                b.to_async(tokio::runtime::Runtime::new().expect("build tokio runtime"))
                    .iter(|| {
                        let coalescer = coalescer.clone();
                        async move {
                            let mut hdls = vec![];
                            for _ in 0..concurrency {
                                let coalescer = coalescer.clone();
                                hdls.push(async move {
                                    let key = rand::rng().random_range(0..4);
                                    let _ = coalescer.fetch(Some(key)).await;
                                });
                            }
                            futures::future::join_all(hdls).await;
                        }
                    })
            },
        );
        group.bench_with_input(
            BenchmarkId::new("direct get", concurrency),
            concurrency,
            |b, &concurrency| {
                b.to_async(tokio::runtime::Runtime::new().expect("build tokio runtime"))
                    .iter(|| async move {
                        let mut hdls = vec![];
                        for _ in 0..concurrency {
                            hdls.push(async move {
                                let key = rand::rng().random_range(0..4);
                                let _ = getter(Some(key)).await;
                            });
                        }
                        futures::future::join_all(hdls).await;
                    })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, burst_get);
criterion_main!(benches);
