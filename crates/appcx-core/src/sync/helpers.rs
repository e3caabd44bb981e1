//! Small async combinators: sleep, once, squish, backoff, pmap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;

use super::barrier::{Barrier, BarrierState};
use super::BoxFuture;
use crate::error::ContextError;

/// Resolve after `ms` milliseconds; immediately for zero.
pub async fn sleep(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

type OnceFactory<T> = Box<dyn FnOnce() -> BoxFuture<Result<T, ContextError>> + Send>;

/// Memoize an async factory: the first call runs it, every later call
/// returns a clone of the cached outcome (errors are cached too).
pub struct Once<T> {
    cell: OnceCell<Result<T, ContextError>>,
    factory: std::sync::Mutex<Option<OnceFactory<T>>>,
}

impl<T: Clone> Once<T> {
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ContextError>> + Send + 'static,
    {
        Self {
            cell: OnceCell::new(),
            factory: std::sync::Mutex::new(Some(Box::new(move || Box::pin(factory())))),
        }
    }

    /// Run the factory at most once, even under concurrent callers.
    pub async fn call(&self) -> Result<T, ContextError> {
        self.cell
            .get_or_init(|| {
                // OnceCell runs this initializer at most once, so the
                // factory is present the one time we take it.
                let factory = self.factory.lock().ok().and_then(|mut slot| slot.take());
                async move {
                    match factory {
                        Some(factory) => factory().await,
                        None => Err(ContextError::other("once factory already consumed")),
                    }
                }
            })
            .await
            .clone()
    }
}

type SquishLambda<T> = Arc<dyn Fn() -> BoxFuture<Result<T, ContextError>> + Send + Sync>;

/// Coalesce overlapping calls: while an invocation is unsettled, further
/// calls join the same in-flight barrier instead of invoking again. Once
/// settled, the next call starts a fresh invocation.
pub struct Squish<T> {
    lambda: SquishLambda<T>,
    in_flight: tokio::sync::Mutex<Option<Barrier<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Squish<T> {
    pub fn new<F, Fut>(lambda: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ContextError>> + Send + 'static,
    {
        Self {
            lambda: Arc::new(move || Box::pin(lambda())),
            in_flight: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn call(&self) -> Result<T, ContextError> {
        self.claim().await.wait().await
    }

    /// The barrier shared by every caller of the current invocation.
    pub async fn claim(&self) -> Barrier<T> {
        let mut guard = self.in_flight.lock().await;
        if let Some(barrier) = guard.as_ref()
            && barrier.state() == BarrierState::Unresolved
        {
            return barrier.clone();
        }

        let barrier = Barrier::new();
        *guard = Some(barrier.clone());
        let fut = (self.lambda)();
        let done = barrier.clone();
        tokio::spawn(async move {
            match fut.await {
                Ok(value) => {
                    let _ = done.signal(value);
                }
                Err(err) => {
                    let _ = done.cancel(err);
                }
            }
        });
        barrier
    }
}

/// One step from a [`BackoffIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStep {
    pub done: bool,
    pub value: Duration,
}

/// Delay sequence for retries: 0, then a jittered base step (±10%), then
/// doubling, for `max_retries + 1` non-terminal values. After that every
/// step reports `done = true` with the last computed value repeated.
///
/// `max_retries` is silently clamped to [1, 10], the base delay to
/// [100, 10000] ms.
pub struct BackoffIterator {
    max_retries: u32,
    step_ms: u64,
    count: u32,
    last_ms: u64,
}

impl BackoffIterator {
    pub fn new(max_retries: u32, backoff_ms: u64) -> Self {
        let max_retries = max_retries.clamp(1, 10);
        let backoff_ms = backoff_ms.clamp(100, 10_000);
        let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 10);
        let step_ms = if rand::random() {
            backoff_ms + jitter
        } else {
            backoff_ms - jitter
        };
        Self {
            max_retries,
            step_ms,
            count: 0,
            last_ms: 0,
        }
    }

    pub fn next_step(&mut self) -> BackoffStep {
        let done = self.count > self.max_retries;
        let value_ms = self.last_ms * 2;
        if !done {
            self.last_ms = if value_ms == 0 {
                self.step_ms / 2
            } else {
                value_ms
            };
            self.count += 1;
        }
        BackoffStep {
            done,
            value: Duration::from_millis(value_ms),
        }
    }
}

impl Iterator for BackoffIterator {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let step = self.next_step();
        if step.done { None } else { Some(step.value) }
    }
}

/// Retry `lambda` with jittered exponential backoff, sleeping the
/// iterator's next value before each attempt. The terminal attempt's
/// outcome propagates as-is. Every call builds a fresh iterator, so the
/// returned future is independently retryable.
pub async fn backoff<T, E, F, Fut>(lambda: F, max_retries: u32, backoff_ms: u64) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut it = BackoffIterator::new(max_retries, backoff_ms);
    loop {
        let step = it.next_step();
        if !step.value.is_zero() {
            tokio::time::sleep(step.value).await;
        }
        match lambda().await {
            Ok(value) => return Ok(value),
            Err(err) if step.done => return Err(err),
            Err(_) => {}
        }
    }
}

/// Bounded-parallel ordered map: at most `batch` lambdas in flight at a
/// time, results in input order. The first error aborts the rest.
pub async fn pmap<I, T, F, Fut>(items: Vec<I>, batch: usize, lambda: F) -> Result<Vec<T>, ContextError>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, ContextError>> + Send + 'static,
{
    let batch = batch.max(1);
    let mut results: Vec<Option<T>> = Vec::new();
    results.resize_with(items.len(), || None);

    let mut pending = items.into_iter().enumerate();
    let mut set = JoinSet::new();
    loop {
        while set.len() < batch {
            let Some((idx, item)) = pending.next() else {
                break;
            };
            let fut = lambda(item);
            set.spawn(async move { (idx, fut.await) });
        }
        match set.join_next().await {
            Some(joined) => {
                let (idx, result) =
                    joined.map_err(|e| ContextError::other(format!("pmap task panicked: {e}")))?;
                results[idx] = Some(result?);
            }
            None => break,
        }
    }

    results
        .into_iter()
        .map(|slot| slot.ok_or_else(|| ContextError::other("pmap result slot never filled")))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;

    #[tokio::test]
    async fn sleep_zero_resolves_immediately() {
        let start = std::time::Instant::now();
        sleep(0).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn once_runs_the_factory_exactly_one_time() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let once = Arc::new(Once::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(42u32)
            }
        }));

        let mut joins = Vec::new();
        for _ in 0..8 {
            let once = Arc::clone(&once);
            joins.push(tokio::spawn(async move { once.call().await }));
        }
        for join in joins {
            assert_eq!(join.await.unwrap().unwrap(), 42);
        }
        assert_eq!(once.call().await.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn once_caches_errors_too() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let once: Once<u32> = Once::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ContextError::other("load failed"))
            }
        });

        assert!(once.call().await.is_err());
        assert!(once.call().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn squish_coalesces_overlapping_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let squish = Squish::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                sleep(500).await;
                Ok(counter.fetch_add(1, Ordering::SeqCst))
            }
        });

        let b1 = squish.claim().await;
        let b2 = squish.claim().await;
        // both callers joined the same in-flight invocation
        assert_eq!(b1.wait().await.unwrap(), 0);
        assert_eq!(b2.wait().await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // a call after settlement triggers a fresh invocation
        assert_eq!(squish.call().await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[rstest]
    #[case(3, 100, 4)]
    #[case(0, 100, 2)] // retries clamp up to 1
    #[case(100, 100, 11)] // retries clamp down to 10
    fn backoff_iterator_yields_expected_step_count(
        #[case] max_retries: u32,
        #[case] backoff_ms: u64,
        #[case] expected: usize,
    ) {
        let mut it = BackoffIterator::new(max_retries, backoff_ms);
        let mut steps = Vec::new();
        loop {
            let step = it.next_step();
            if step.done {
                break;
            }
            steps.push(step.value);
        }
        assert_eq!(steps.len(), expected);
        assert_eq!(steps[0], Duration::ZERO);
    }

    #[test]
    fn backoff_iterator_doubles_and_then_repeats_final_value() {
        let mut it = BackoffIterator::new(3, 100);
        let steps: Vec<u64> = (&mut it).map(|d| d.as_millis() as u64).collect();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0], 0);
        // first real step is the jittered base: 100ms ±10%, rounded down to even
        assert!((88..=110).contains(&steps[1]), "step {}", steps[1]);
        assert_eq!(steps[2], steps[1] * 2);
        assert_eq!(steps[3], steps[1] * 4);

        // exhausted iterator keeps reporting done with the same value
        let tail1 = it.next_step();
        let tail2 = it.next_step();
        assert!(tail1.done && tail2.done);
        assert_eq!(tail1.value, tail2.value);
        assert_eq!(tail1.value, Duration::from_millis(steps[1] * 8));
    }

    #[test]
    fn backoff_iterator_clamps_base_delay() {
        let mut it = BackoffIterator::new(1, 5);
        it.next_step(); // zero
        let step = it.next_step();
        // clamped up to 100ms, within jitter range
        assert!((88..=110).contains(&(step.value.as_millis() as u64)));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_retries_until_the_iterator_is_done() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<u32, ContextError> = backoff(
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ContextError::other("still failing"))
                }
            },
            3,
            100,
        )
        .await;

        assert!(result.is_err());
        // 1 initial attempt + 4 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_resolves_with_the_first_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let lambda = move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 2 {
                    Err(ContextError::other("warming up"))
                } else {
                    Ok(n)
                }
            }
        };

        let value = backoff(lambda, 3, 100).await.unwrap();
        assert_eq!(value, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pmap_preserves_order_and_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<u64> = (0..10).collect();
        let results = pmap(items, 3, |n| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(10).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(n * 2)
            }
        })
        .await
        .unwrap();

        assert_eq!(results, (0..10).map(|n| n * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn pmap_propagates_the_first_error() {
        let result = pmap(vec![1u32, 2, 3], 2, |n| async move {
            if n == 2 {
                Err(ContextError::other("bad item"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert!(result.is_err());
    }
}
