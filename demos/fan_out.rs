use coalesce::CoalesceError;
use coalesce::Group;

use tokio_util::sync::CancellationToken;

/// Ten detached subscribers sharing one execution, then two cancellable
/// waiters where the impatient one gives up without stopping the work.
#[tokio::main]
async fn main() {
    let group: Group<&'static str, String, String> = Group::new();

    let receivers: Vec<_> = (0..10)
        .map(|_| {
            group.dispatch("payload", || async {
                tokio::time::sleep(tokio::time::Duration::from_millis(250)).await;
                Ok("the one and only".to_string())
            })
        })
        .collect();
    for (i, rx) in receivers.into_iter().enumerate() {
        let result = rx.await.expect("work completed, so every channel resolves");
        println!("subscriber {i}: {:?} (shared: {})", result.value, result.shared);
    }
    println!("requests deduplicated: {}", group.request_deduplicated_count());

    let impatient = CancellationToken::new();
    let patient = CancellationToken::new();
    let work = |token: CancellationToken| async move {
        tokio::select! {
            _ = token.cancelled() => Err("stopped early".to_string()),
            _ = tokio::time::sleep(tokio::time::Duration::from_millis(500)) => {
                Ok("finished anyway".to_string())
            }
        }
    };
    let first = group.dispatch_with_token(impatient.clone(), "slow", work.clone());
    let second = group.dispatch_with_token(patient, "slow", work);

    impatient.cancel();
    let first = first.await.expect("cancelled waiters still get an answer");
    assert!(matches!(first.value, Err(CoalesceError::Cancelled)));
    println!("impatient waiter: {:?}", first.value);

    let second = second.await.expect("surviving waiter gets the shared value");
    println!("patient waiter: {:?} (shared: {})", second.value, second.shared);
}
