use std::panic::AssertUnwindSafe;
use std::time::Instant;

use coalesce::Group;

use futures::FutureExt;
use rand::Rng;

/// If our shared work panics, every joined caller sees the panic. Let's
/// cause that to happen sometimes by panicking on even sleep durations.
async fn fetch(key: usize) -> Result<String, String> {
    let num = rand::rng().random_range(1000..2000);
    tokio::time::sleep(tokio::time::Duration::from_millis(num)).await;

    if num % 2 == 0 {
        panic!("BAD NUMBER");
    }
    Ok(format!("key: {key}, duration: {num}"))
}

/// Loop around 5 times creating 100 jobs which all request the same key.
/// Each iteration prints how many succeeded, the range of completion times
/// and how long the iteration took. Whole batches fail together (the work
/// panicked once, for everyone) or succeed together with a single fetch.
#[tokio::main]
async fn main() {
    let group: Group<usize, String, String> = Group::new();

    for _i in 0..5 {
        let mut hdls = vec![];
        let start = Instant::now();
        for _i in 0..100 {
            let my_group = group.clone();
            hdls.push(async move {
                let outcome = AssertUnwindSafe(my_group.execute(5, || fetch(5)))
                    .catch_unwind()
                    .await;
                let is_ok = matches!(&outcome, Ok(result) if result.value.is_ok());
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
        println!("fetches deduplicated: {}", group.request_deduplicated_count());
        println!("elapsed: {:?}\n", Instant::now() - start);
    }
}
