use std::sync::Arc;
use std::time::Instant;

use coalesce::Coalescer;
use coalesce::FetchFuture;

use rand::Rng;

/// If our delegated getter panics, all our concurrent fetches will fail
/// together. Let's cause that to happen sometimes by panicking on even
/// numbers.
fn get(_key: Option<usize>) -> FetchFuture<String> {
    let fut = async {
        let num = rand::rng().random_range(1000..2000);
        tokio::time::sleep(tokio::time::Duration::from_millis(num)).await;

        if num % 2 == 0 {
            panic!("BAD NUMBER");
        }
        Ok("test".to_string())
    };
    Box::pin(fut)
}

/// Create our coalescer and then loop around 5 times creating 100 jobs
/// which all fetch through our delegated get function.
/// We print out data about each iteration where we see how many succeed,
/// the range of times between each invocation and how long the iteration
/// took. Since nothing is cached, every iteration dispatches the producer
/// exactly once and all 100 jobs share that outcome: all pass, or all
/// fail, together.
#[tokio::main]
async fn main() {
    let coalescer = Arc::new(
        Coalescer::builder()
            .name("flaky")
            .fetch_fn(get)
            .build()
            .expect("fetch producer configured"),
    );

    for _i in 0..5 {
        let mut hdls = vec![];
        let start = Instant::now();
        for _i in 0..100 {
            let my_coalescer = coalescer.clone();
            hdls.push(async move {
                let is_ok = my_coalescer.fetch(Some(5)).await.is_ok();
                (Instant::now(), is_ok)
            });
        }
        let mut result: Vec<(Instant, bool)> =
            futures::future::join_all(hdls).await.into_iter().collect();
        result.sort();
        println!(
            "range: {:?}",
            result.last().unwrap().0 - result.first().unwrap().0
        );
        println!(
            "passed: {:?}",
            result
                .iter()
                .fold(0, |acc, x| if x.1 { acc + 1 } else { acc })
        );
        println!("elapsed: {:?}\n", Instant::now() - start);
    }
}
