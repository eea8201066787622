//! Datastore fan-out combinators.
//!
//! Each combinator is a different consistency contract and they are kept
//! apart on purpose:
//!
//! | Combinator        | Used for                       | Combination |
//! |-------------------|--------------------------------|-------------|
//! | [`first_success`] | concept lookup, property read  | first `Some` wins |
//! | [`write_all`]     | property write                 | every backend, best effort |
//! | [`any_true`]      | instance existence             | logical OR  |
//! | [`max_count`]     | instance counting              | maximum     |
//!
//! All of them fail only when every branch failed; a partial failure is
//! logged and the surviving branches decide the outcome.

use std::fmt::Display;
use std::future::Future;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::warn;

/// Races the futures and returns the first `Ok(Some(_))`.
///
/// Resolves `Ok(None)` when no branch produced a value and at least one
/// answered cleanly; returns the first error only if all branches failed.
pub async fn first_success<T, E, F, I>(futures: I) -> Result<Option<T>, E>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<Option<T>, E>>,
{
    let mut pending: FuturesUnordered<F> = futures.into_iter().collect();
    let mut first_error = None;
    let mut answered = false;

    while let Some(result) = pending.next().await {
        match result {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => answered = true,
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) if !answered => Err(e),
        _ => Ok(None),
    }
}

/// Runs every write and keeps the successful outcomes in input order.
///
/// Failing branches are logged under `label`. The call fails only if there
/// was at least one branch and every branch failed.
pub async fn write_all<T, E, F, I>(label: &str, futures: I) -> Result<Vec<T>, E>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    let results = join_all(futures).await;
    let total = results.len();
    let mut successes = Vec::with_capacity(total);
    let mut first_error = None;

    for result in results {
        match result {
            Ok(v) => successes.push(v),
            Err(e) => {
                warn!(target: "varv::fanout", %label, error = %e, "backend write failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) if successes.is_empty() => Err(e),
        _ => Ok(successes),
    }
}

/// Logical OR over existence checks.
pub async fn any_true<E, F, I>(futures: I) -> Result<bool, E>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<bool, E>>,
    E: Display,
{
    combine(join_all(futures).await, false, |acc, v| acc || v)
}

/// Maximum over per-store counts.
pub async fn max_count<E, F, I>(futures: I) -> Result<usize, E>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<usize, E>>,
    E: Display,
{
    combine(join_all(futures).await, 0, usize::max)
}

fn combine<T, E: Display>(
    results: Vec<Result<T, E>>,
    init: T,
    fold: impl Fn(T, T) -> T,
) -> Result<T, E> {
    let mut acc = init;
    let mut any_ok = false;
    let mut first_error = None;
    for result in results {
        match result {
            Ok(v) => {
                acc = fold(acc, v);
                any_ok = true;
            }
            Err(e) => {
                warn!(target: "varv::fanout", error = %e, "datastore query failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) if !any_ok => Err(e),
        _ => Ok(acc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type R<T> = Result<T, String>;

    #[tokio::test]
    async fn test_first_success_takes_fastest_value() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            R::Ok(Some("slow"))
        };
        let fast = async { R::Ok(Some("fast")) };
        let got = first_success(vec![
            Box::pin(slow) as std::pin::Pin<Box<dyn Future<Output = R<Option<&str>>> + Send>>,
            Box::pin(fast),
        ])
        .await
        .unwrap();
        assert_eq!(got, Some("fast"));
    }

    #[tokio::test]
    async fn test_first_success_none_when_nobody_knows() {
        let unknown = || async { R::<Option<u8>>::Ok(None) };
        assert_eq!(first_success(vec![unknown(), unknown()]).await, Ok(None));
    }

    #[tokio::test]
    async fn test_first_success_error_only_when_all_fail() {
        let down = |name: &'static str| async move { R::<Option<u8>>::Err(name.to_string()) };
        assert!(first_success(vec![down("a"), down("b")]).await.is_err());

        let f = |ok: bool| async move {
            if ok {
                R::Ok(Some(1u8))
            } else {
                R::Err("down".into())
            }
        };
        assert_eq!(first_success(vec![f(false), f(true)]).await, Ok(Some(1)));
    }

    #[tokio::test]
    async fn test_write_all_is_best_effort() {
        let f = |ok: bool| async move {
            if ok {
                R::Ok(1)
            } else {
                R::Err("down".into())
            }
        };
        assert_eq!(write_all("p", vec![f(true), f(false), f(true)]).await, Ok(vec![1, 1]));
        assert!(write_all("p", vec![f(false)]).await.is_err());
        let none: Vec<std::future::Ready<R<i32>>> = Vec::new();
        assert_eq!(write_all("p", none).await, Ok(vec![]));
    }

    #[tokio::test]
    async fn test_any_true_and_max_count() {
        let b = |v: bool| async move { R::Ok(v) };
        assert_eq!(any_true(vec![b(false), b(true)]).await, Ok(true));
        assert_eq!(any_true(vec![b(false), b(false)]).await, Ok(false));

        let c = |v: usize| async move { R::Ok(v) };
        assert_eq!(max_count(vec![c(2), c(5), c(3)]).await, Ok(5));
    }
}
