//! Cancellable fan-out over independent tasks.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Failure of a fan-out run: the first task error, or a task that panicked.
#[derive(Debug)]
pub enum FanOutError<E> {
    Task { index: usize, error: E },
    Panicked(String),
}

impl<E: std::fmt::Display> std::fmt::Display for FanOutError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task { index, error } => write!(f, "Task {} failed: {}", index, error),
            Self::Panicked(message) => write!(f, "Task panicked: {}", message),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for FanOutError<E> {}

/// Spawn `count` tasks built by `make(index, token)` and collect their
/// results in index order.
///
/// The first failure cancels `token` for every other task, aborts them and is
/// returned as is. No partial results are returned.
pub async fn try_fan_out<T, E, F, Fut>(count: usize, make: F) -> Result<Vec<T>, FanOutError<E>>
where
    F: Fn(usize, CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let token = CancellationToken::new();
    let mut tasks = JoinSet::new();

    for index in 0..count {
        let fut = make(index, token.child_token());
        tasks.spawn(async move { (index, fut.await) });
    }

    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(count).collect();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(value))) => slots[index] = Some(value),
            Ok((index, Err(error))) => {
                token.cancel();
                tasks.abort_all();
                tracing::debug!(index, "fan-out task failed, cancelling the rest");
                return Err(FanOutError::Task { index, error });
            }
            Err(err) => {
                token.cancel();
                tasks.abort_all();
                return Err(FanOutError::Panicked(err.to_string()));
            }
        }
    }

    Ok(slots.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn results_keep_index_order() {
        let results = try_fan_out(5, |i, _| async move {
            tokio::time::sleep(Duration::from_millis((5 - i as u64) * 5)).await;
            Ok::<_, String>(i * 10)
        })
        .await
        .unwrap();

        assert_eq!(results, vec![0, 10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn first_error_cancels_the_rest() {
        let finished = Arc::new(AtomicUsize::new(0));

        let err = try_fan_out(4, |i, token| {
            let finished = finished.clone();
            async move {
                if i == 2 {
                    return Err(format!("task {i} broke"));
                }
                tokio::select! {
                    _ = token.cancelled() => Err("cancelled".to_string()),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(i)
                    }
                }
            }
        })
        .await
        .unwrap_err();

        match err {
            FanOutError::Task { index, error } => {
                assert_eq!(index, 2);
                assert_eq!(error, "task 2 broke");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_task_is_reported() {
        let err = try_fan_out(2, |i, _| async move {
            if i == 1 {
                panic!("boom");
            }
            Ok::<_, String>(i)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, FanOutError::Panicked(_)));
    }

    #[tokio::test]
    async fn zero_tasks_is_empty() {
        let results = try_fan_out(0, |_, _| async { Ok::<u8, String>(0) })
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
