//! appcx-core - 非同期アプリケーションコンテキストランタイム
//!
//! 文字列キーのレジストリに provider / alias / config を登録し、
//! `start` 後に遅延解決する小さな DI ランタイム。
//!
//! # モジュール構成
//! - [`sync`]: barrier / once / squish / backoff / pmap / gate
//! - [`provider`]: TTL 付き遅延プロバイダ
//! - [`context`]: キー・設定・レジストリ本体
//! - [`loader`]: 設定取得の抽象化
//! - [`bus`]: プロセス内 pub/sub
//! - [`state`]: バス連動の共有状態
//! - [`logging`]: 構造化ログ
//!
//! # 最小の使い方
//! ```no_run
//! use std::sync::Arc;
//! use appcx_core::context::{AppContext, AppContextConfig};
//! use appcx_core::loader::StaticConfigLoader;
//!
//! # async fn demo() -> Result<(), appcx_core::error::ContextError> {
//! let cx = AppContext::new(AppContextConfig {
//!     config_hrefs: Vec::new(),
//!     loader: Arc::new(StaticConfigLoader::new()),
//! });
//! appcx_core::logging::register_console_logger(&cx).await?;
//! appcx_core::bus::register_bus(&cx).await?;
//! cx.start().await?;
//! let bus = appcx_core::bus::get_bus(&cx).await?;
//! bus.dispatch("app:ready", serde_json::json!({})).await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod context;
pub mod error;
pub mod loader;
pub mod logging;
pub mod provider;
pub mod state;
pub mod sync;

pub use context::{AppContext, AppContextConfig, ConfigEntry, ToolKey};
pub use error::ContextError;
pub use provider::{LazyProvider, SharedProvider, Tool, Ttl};
