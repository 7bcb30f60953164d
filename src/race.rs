use std::future::Future;

use futures_util::{StreamExt as _, stream::FuturesUnordered};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs every task concurrently and returns the first result satisfying `predicate`.
///
/// Each task receives its own child of `ct`. As soon as a result is accepted,
/// every other task's token is cancelled and its future dropped, so a loser can
/// never write anything after the winner has been picked. Results rejected by
/// the predicate are discarded. Returns `None` if nothing satisfies the
/// predicate or `ct` itself gets cancelled.
pub async fn select_first<T, F, Fut, P, PFut>(
    ct: &CancellationToken,
    tasks: impl IntoIterator<Item = F>,
    predicate: P,
) -> Option<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> PFut,
    PFut: Future<Output = bool>,
{
    let race = ct.child_token();
    let predicate = &predicate;

    let mut pending = tasks
        .into_iter()
        .map(|task| {
            let token = race.child_token();
            async move {
                let fut = task(token.clone());
                select! {
                    biased;
                    () = token.cancelled() => None,
                    value = async {
                        let value = fut.await;
                        let accepted = predicate(&value).await;
                        (value, accepted)
                    } => Some(value),
                }
            }
        })
        .collect::<FuturesUnordered<_>>();

    let total = pending.len();
    let _cancel_losers = race.clone().drop_guard();

    let mut rejected = 0;
    while let Some(outcome) = pending.next().await {
        match outcome {
            Some((value, true)) => {
                debug!("Race settled after {rejected} of {total} rejected");
                race.cancel();
                return Some(value);
            }
            Some((_, false)) => rejected += 1,
            None => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use std::{
        future::ready,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tokio::time::sleep;

    use super::*;

    fn delayed(
        millis: u64,
        value: u32,
    ) -> impl FnOnce(CancellationToken) -> std::pin::Pin<Box<dyn Future<Output = u32> + Send>>
    {
        move |_| {
            Box::pin(async move {
                sleep(Duration::from_millis(millis)).await;
                value
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_satisfying_result() {
        let ct = CancellationToken::new();
        let tasks = vec![delayed(30, 3), delayed(10, 1), delayed(20, 2)];

        let winner = select_first(&ct, tasks, |v| ready(*v >= 2)).await;
        assert_eq!(winner, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_none_when_nothing_satisfies() {
        let ct = CancellationToken::new();
        let tasks = vec![delayed(10, 1), delayed(5, 0)];

        let winner = select_first(&ct, tasks, |v| ready(*v > 5)).await;
        assert_eq!(winner, None);
    }

    #[tokio::test]
    async fn empty_input_yields_none() {
        let ct = CancellationToken::new();
        let tasks: Vec<fn(CancellationToken) -> std::future::Ready<u8>> = Vec::new();

        assert_eq!(select_first(&ct, tasks, |_| ready(true)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn losers_are_cancelled_and_never_finish() {
        let ct = CancellationToken::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let tokens = Arc::new(std::sync::Mutex::new(Vec::new()));

        let tasks = (0..4_u64).map(|i| {
            let finished = finished.clone();
            let tokens = tokens.clone();
            move |token: CancellationToken| async move {
                tokens.lock().unwrap().push(token.clone());
                sleep(Duration::from_millis(10 + i * 100)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                i
            }
        });

        let winner = select_first(&ct, tasks, |_| ready(true)).await;
        assert_eq!(winner, Some(0));

        sleep(Duration::from_secs(5)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        let tokens = tokens.lock().unwrap();
        assert_eq!(tokens.len(), 4);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert!(!ct.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn async_predicate_is_awaited() {
        let ct = CancellationToken::new();
        let tasks = vec![delayed(10, 4), delayed(20, 8)];

        let winner = select_first(&ct, tasks, |v| {
            let v = *v;
            async move {
                sleep(Duration::from_millis(1)).await;
                v == 8
            }
        })
        .await;
        assert_eq!(winner, Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_the_race() {
        let ct = CancellationToken::new();
        let tasks = vec![delayed(1_000, 1), delayed(2_000, 2)];

        let canceller = ct.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });

        assert_eq!(select_first(&ct, tasks, |_| ready(true)).await, None);
    }
}
