//! Sync - 並行制御のプリミティブ
//!
//! Promise ベースのランタイムを支える小さな部品たち:
//! - **barrier**: 一回限りの同期ゲート（producer 1 : consumer N）
//! - **helpers**: sleep / once / squish / backoff / pmap
//! - **gate**: 同時実行数とレートで入場制限する待ち行列
//!
//! Design:
//! - Everything here is idempotent or fails loudly on conflicting reuse.
//! - None of these primitives cancel in-flight work; `Barrier::cancel`
//!   only affects callers still waiting.

pub mod barrier;
pub mod gate;
pub mod helpers;

pub use barrier::{Barrier, BarrierState};
pub use gate::{Gate, Throttled};
pub use helpers::{BackoffIterator, BackoffStep, Once, Squish, backoff, pmap, sleep};

use std::future::Future;
use std::pin::Pin;

/// Boxed future alias used wherever a loader or factory has to be stored.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
