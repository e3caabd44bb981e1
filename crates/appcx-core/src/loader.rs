//! ConfigLoader - 設定取得の抽象化レイヤー
//!
//! `AppContext::start` が注入されたローダー経由で remote config を読む。
//! 失敗はそのまま start の呼び出し元へ伝播する（リトライは `sync::backoff`
//! を外側で組み合わせる）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{AppContext, ConfigDb};
use crate::error::ContextError;
use crate::provider::LazyProvider;

/// Registry key for the file-loader driver.
pub const LOADER_DRIVER: &str = "driver/appcx/simpleLoader";

/// Stable alias other modules use to look the loader up without knowing
/// the concrete driver.
pub const LOADER_ALIAS: &str = "alias/appcx/simpleLoader";

/// Port for fetching configuration by href. Implementations read local
/// files, network URLs, secret stores, and so on.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn load_config(&self, href: &str) -> Result<ConfigDb, ContextError>;
}

/// Loads JSON files from the filesystem; the href is a path. The file
/// must hold an object of objects keyed by config key.
#[derive(Debug, Default)]
pub struct FileConfigLoader;

#[async_trait]
impl ConfigLoader for FileConfigLoader {
    async fn load_config(&self, href: &str) -> Result<ConfigDb, ContextError> {
        let bytes = tokio::fs::read(href)
            .await
            .map_err(|e| ContextError::ConfigLoad {
                href: href.to_string(),
                message: e.to_string(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| ContextError::ConfigLoad {
            href: href.to_string(),
            message: e.to_string(),
        })
    }
}

/// Fixed in-memory configuration, handy for demos and tests.
#[derive(Debug, Default)]
pub struct StaticConfigLoader {
    sources: HashMap<String, ConfigDb>,
}

impl StaticConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, href: &str, db: ConfigDb) -> Self {
        self.sources.insert(href.to_string(), db);
        self
    }
}

#[async_trait]
impl ConfigLoader for StaticConfigLoader {
    async fn load_config(&self, href: &str) -> Result<ConfigDb, ContextError> {
        self.sources
            .get(href)
            .cloned()
            .ok_or_else(|| ContextError::ConfigLoad {
                href: href.to_string(),
                message: "unknown config source".to_string(),
            })
    }
}

/// Register the file loader as a driver behind the stable alias, so
/// tools that fetch extra config bundles after start can resolve it
/// without naming the concrete implementation.
pub async fn register_file_loader(cx: &Arc<AppContext>) -> Result<(), ContextError> {
    cx.put_provider(LOADER_DRIVER, &[], |_tools| async {
        let loader: Arc<dyn ConfigLoader> = Arc::new(FileConfigLoader);
        Ok(LazyProvider::singleton(move || {
            let loader = Arc::clone(&loader);
            async move { Ok(loader) }
        })
        .shared())
    })
    .await?;
    cx.put_alias(LOADER_ALIAS, LOADER_DRIVER).await
}
