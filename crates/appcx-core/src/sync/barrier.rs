//! Barrier - 一回限りの同期ゲート
//!
//! Producer が一度だけ signal / cancel し、consumer は何人でも同じ結果を待てる。

use tokio::sync::watch;

use crate::error::ContextError;

/// Observable lifecycle of a [`Barrier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Unresolved,
    Resolved,
    Rejected,
}

/// One-shot gate between a producer and N consumers.
///
/// Design:
/// - `signal` / `cancel` take effect exactly once; later calls are no-ops
///   that return `false` so the caller can tell the race was lost.
/// - Every `wait()` call, issued before or after resolution, observes a
///   clone of the same outcome.
/// - No timeout, no retry. Cancellation is permanent.
///
/// Clones share the same underlying gate.
pub struct Barrier<T> {
    tx: watch::Sender<Option<Result<T, ContextError>>>,
}

impl<T> Clone for Barrier<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Default for Barrier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Barrier<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolve the gate with `value` iff still unresolved.
    ///
    /// Returns whether this call had effect.
    pub fn signal(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Reject the gate with `err` iff still unresolved.
    ///
    /// Returns whether this call had effect.
    pub fn cancel(&self, err: ContextError) -> bool {
        self.settle(Err(err))
    }

    pub fn state(&self) -> BarrierState {
        match &*self.tx.borrow() {
            None => BarrierState::Unresolved,
            Some(Ok(_)) => BarrierState::Resolved,
            Some(Err(_)) => BarrierState::Rejected,
        }
    }

    fn settle(&self, outcome: Result<T, ContextError>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }
}

impl<T: Clone> Barrier<T> {
    /// Wait for the outcome, however many times and from wherever.
    pub async fn wait(&self) -> Result<T, ContextError> {
        let mut rx = self.tx.subscribe();
        let slot = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| ContextError::Cancelled("closed before resolution".to_string()))?;
        match &*slot {
            Some(outcome) => outcome.clone(),
            None => Err(ContextError::other("barrier woke without outcome")),
        }
    }
}
