//! Gate - 同時実行数とレートで入場制限する待ち行列
//!
//! admission-control キュー。ロックではなく入場整理なので Mutex ではなく
//! Gate と呼ぶ。throttle 時のエラー文言は互換のため "mutex throttle"。

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::BoxFuture;
use super::barrier::Barrier;
use crate::error::ContextError;

/// The rolling window for rate accounting. Starts within one window are
/// capped at `max_reqs_per_sec * 5`.
const RATE_WINDOW: Duration = Duration::from_secs(5);

struct GateState {
    /// Waiting tickets, admitted in submission order.
    queue: VecDeque<Barrier<()>>,
    num_running: usize,
    window_start: Instant,
    window_count: usize,
    wakeup_scheduled: bool,
}

struct GateInner {
    max_concurrency: usize,
    max_starts_per_window: usize,
    max_queue_len: usize,
    state: tokio::sync::Mutex<GateState>,
}

/// Concurrency-and-rate-limited admission queue.
///
/// - at most `max_concurrency` lambdas run at once
/// - at most `max_reqs_per_sec * 5` lambdas start per 5-second window
/// - once `max_queue_len` callers are waiting, further calls fast-fail
///   with [`ContextError::Throttle`] (the circuit breaker)
///
/// Compose with `backoff` / `Squish` for retry and debounce. Clones share
/// the same queue and counters.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new(4, 20, 20)
    }
}

impl Gate {
    pub fn new(max_concurrency: usize, max_reqs_per_sec: usize, max_queue_len: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                max_concurrency: max_concurrency.max(1),
                max_starts_per_window: max_reqs_per_sec.max(1) * 5,
                max_queue_len,
                state: tokio::sync::Mutex::new(GateState {
                    queue: VecDeque::new(),
                    num_running: 0,
                    window_start: Instant::now(),
                    window_count: 0,
                    wakeup_scheduled: false,
                }),
            }),
        }
    }

    /// Queue up, wait for admission, run `lambda`, release the slot.
    ///
    /// Fast-fails with [`ContextError::Throttle`] when the wait queue is
    /// already full. An admitted call must be driven to completion; the
    /// gate does not track dropped futures.
    pub async fn enter<T, F, Fut>(&self, lambda: F) -> Result<T, ContextError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ContextError>>,
    {
        let ticket = {
            let mut state = self.inner.state.lock().await;
            if state.queue.len() >= self.inner.max_queue_len {
                return Err(ContextError::Throttle);
            }
            let ticket = Barrier::new();
            state.queue.push_back(ticket.clone());
            ticket
        };
        self.pump().await;
        ticket.wait().await?;

        let result = lambda().await;

        {
            let mut state = self.inner.state.lock().await;
            state.num_running = state.num_running.saturating_sub(1);
        }
        self.pump().await;
        result
    }

    /// Wrap `lambda` in a reusable handle whose every call goes through
    /// [`Gate::enter`].
    pub fn throttle<F>(&self, lambda: F) -> Throttled<F> {
        Throttled {
            gate: self.clone(),
            lambda,
        }
    }

    /// Drain the queue as far as concurrency and the rate window allow.
    ///
    /// Boxed so the window-boundary wakeup task can pump again without
    /// the future type containing itself.
    fn pump(&self) -> BoxFuture<()> {
        let gate = self.clone();
        Box::pin(async move { gate.pump_inner().await })
    }

    async fn pump_inner(&self) {
        let mut admitted: Vec<Barrier<()>> = Vec::new();
        let mut wake_after: Option<Duration> = None;
        {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();
            if now.duration_since(state.window_start) >= RATE_WINDOW {
                state.window_start = now;
                state.window_count = 0;
            }

            while state.num_running < self.inner.max_concurrency && !state.queue.is_empty() {
                if state.window_count >= self.inner.max_starts_per_window {
                    // rate-limited: if nothing is running there is no exit()
                    // coming to pump again, so wake at the window boundary
                    if state.num_running == 0 && !state.wakeup_scheduled {
                        state.wakeup_scheduled = true;
                        wake_after =
                            Some(RATE_WINDOW.saturating_sub(now.duration_since(state.window_start)));
                    }
                    break;
                }
                if let Some(ticket) = state.queue.pop_front() {
                    state.num_running += 1;
                    state.window_count += 1;
                    admitted.push(ticket);
                }
            }
        }

        // signal outside the lock
        for ticket in admitted {
            let _ = ticket.signal(());
        }

        if let Some(delay) = wake_after {
            let gate = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                {
                    let mut state = gate.inner.state.lock().await;
                    state.wakeup_scheduled = false;
                }
                gate.pump().await;
            });
        }
    }

    #[cfg(test)]
    pub(crate) async fn num_running(&self) -> usize {
        self.inner.state.lock().await.num_running
    }
}

/// A lambda bound to a [`Gate`]; see [`Gate::throttle`].
pub struct Throttled<F> {
    gate: Gate,
    lambda: F,
}

impl<F, Fut, T> Throttled<F>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ContextError>>,
{
    pub async fn call(&self) -> Result<T, ContextError> {
        self.gate.enter(|| (self.lambda)()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::sync::helpers::sleep;

    #[tokio::test(start_paused = true)]
    async fn runs_in_submission_order_with_bounded_concurrency() {
        let gate = Gate::new(2, 1000, 20);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut joins = Vec::new();
        for i in 0..6u32 {
            let gate = gate.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let order = Arc::clone(&order);
            joins.push(tokio::spawn(async move {
                gate.enter(|| async move {
                    order.lock().await.push(i);
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(50).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
                .await
            }));
            // make submission order deterministic
            tokio::task::yield_now().await;
        }
        for (i, join) in joins.into_iter().enumerate() {
            assert_eq!(join.await.unwrap().unwrap(), i as u32);
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(gate.num_running().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overfull_queue_fast_fails_with_throttle() {
        let gate = Gate::new(1, 1000, 2);
        let release: Barrier<()> = Barrier::new();

        // occupy the single slot
        let holder = {
            let gate = gate.clone();
            let release = release.clone();
            tokio::spawn(async move { gate.enter(|| async move { release.wait().await }).await })
        };
        tokio::task::yield_now().await;

        // fill the wait queue
        let mut queued = Vec::new();
        for _ in 0..2 {
            let gate = gate.clone();
            queued.push(tokio::spawn(async move {
                gate.enter(|| async move { Ok(()) }).await
            }));
            tokio::task::yield_now().await;
        }

        // circuit breaker trips on the next submission
        let err = gate.enter(|| async move { Ok(()) }).await.unwrap_err();
        assert_eq!(err, ContextError::Throttle);

        release.signal(());
        holder.await.unwrap().unwrap();
        for join in queued {
            join.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn throttled_handle_reuses_the_gate() {
        let gate = Gate::new(2, 1000, 20);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = gate.throttle(move || {
            let counter = Arc::clone(&counter);
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
        });

        assert_eq!(handle.call().await.unwrap(), 1);
        assert_eq!(handle.call().await.unwrap(), 2);
        assert_eq!(gate.num_running().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_exhausted_queue_wakes_at_the_window_boundary() {
        // 1 req/sec -> 5 starts per window
        let gate = Gate::new(4, 1, 20);
        let done = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for _ in 0..7 {
            let gate = gate.clone();
            let done = Arc::clone(&done);
            joins.push(tokio::spawn(async move {
                gate.enter(|| async move {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
            tokio::task::yield_now().await;
        }

        // the two over-rate submissions are parked until the window turns
        for join in joins {
            join.await.unwrap().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 7);
    }
}
