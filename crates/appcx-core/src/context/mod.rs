//! Context - アプリケーション全体の依存解決
//!
//! - **key**: `driver/` / `alias/` / `config/` のタグ付きキー
//! - **config**: defaults / overrides の二層設定
//! - **toolbox**: 解決済み依存セット
//! - **context**: レジストリ本体と起動ライフサイクル

pub mod config;
#[allow(clippy::module_inception)]
pub mod context;
pub mod key;
pub mod toolbox;

pub use config::{ConfigDb, ConfigEntry, ConfigMap, shallow_merge};
pub use context::{AppContext, AppContextConfig};
pub use key::{ALIAS_PREFIX, CONFIG_PREFIX, DRIVER_PREFIX, ToolKey};
pub use toolbox::ToolBox;
