//! Logging - 構造化ログの抽象とコンソール実装
//!
//! アプリ側は `alias/appcx/Logger` で引く。driver を差し替えれば実装が
//! 変わってもアプリのコードはそのまま。

use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, error, info, trace, warn};

use crate::context::{AppContext, ConfigEntry};
use crate::error::ContextError;
use crate::provider::LazyProvider;

/// Config key holding `{"level": "..."}`.
pub const LOGGING_CONFIG_KEY: &str = "appcx/logging";

/// Registry key for the console implementation.
pub const CONSOLE_LOGGER_DRIVER: &str = "driver/appcx/consoleLogger";

/// Stable alias applications resolve the logger through.
pub const LOGGER_ALIAS: &str = "alias/appcx/Logger";

/// Severity, ordered least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl FromStr for LogLevel {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            other => Err(ContextError::other(format!("unknown log level {other}"))),
        }
    }
}

impl LogLevel {
    /// Lenient parse for config values; anything unrecognized is `Info`.
    pub fn from_config(s: &str) -> LogLevel {
        s.parse().unwrap_or(LogLevel::Info)
    }
}

/// Structured logger: a JSON info payload plus an optional human message.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, info: &Value, msg: Option<&str>);

    fn fatal(&self, info: &Value, msg: Option<&str>) {
        self.log(LogLevel::Fatal, info, msg);
    }
    fn error(&self, info: &Value, msg: Option<&str>) {
        self.log(LogLevel::Error, info, msg);
    }
    fn warn(&self, info: &Value, msg: Option<&str>) {
        self.log(LogLevel::Warn, info, msg);
    }
    fn info(&self, info: &Value, msg: Option<&str>) {
        self.log(LogLevel::Info, info, msg);
    }
    fn debug(&self, info: &Value, msg: Option<&str>) {
        self.log(LogLevel::Debug, info, msg);
    }
    fn trace(&self, info: &Value, msg: Option<&str>) {
        self.log(LogLevel::Trace, info, msg);
    }
}

/// Forwards to the `tracing` macros, dropping records below `min_level`.
/// `Fatal` maps onto `tracing`'s `ERROR`, its highest severity.
pub struct ConsoleLogger {
    min_level: LogLevel,
}

impl ConsoleLogger {
    pub fn new(min_level: LogLevel) -> ConsoleLogger {
        ConsoleLogger { min_level }
    }

    pub fn from_config(entry: &ConfigEntry) -> ConsoleLogger {
        let level = entry
            .merged()
            .get("level")
            .and_then(Value::as_str)
            .map(LogLevel::from_config)
            .unwrap_or(LogLevel::Info);
        ConsoleLogger::new(level)
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }
}

impl Logger for ConsoleLogger {
    fn log(&self, level: LogLevel, info: &Value, msg: Option<&str>) {
        if !self.enabled(level) {
            return;
        }
        let msg = msg.unwrap_or("");
        match level {
            LogLevel::Fatal => error!(%info, fatal = true, "{msg}"),
            LogLevel::Error => error!(%info, "{msg}"),
            LogLevel::Warn => warn!(%info, "{msg}"),
            LogLevel::Info => info!(%info, "{msg}"),
            LogLevel::Debug => debug!(%info, "{msg}"),
            LogLevel::Trace => trace!(%info, "{msg}"),
        }
    }
}

/// Register the console logger driver and the `alias/appcx/Logger`
/// indirection, seeding `appcx/logging` defaults with `level: info`.
/// Runtime overrides loaded at `start` can change the level.
pub async fn register_console_logger(cx: &Arc<AppContext>) -> Result<(), ContextError> {
    let defaults = match json!({ "level": "info" }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    cx.put_default_config(LOGGING_CONFIG_KEY, defaults).await;
    cx.put_provider(
        CONSOLE_LOGGER_DRIVER,
        &[("config", "config/appcx/logging")],
        |tools| async move {
            let entry: ConfigEntry = tools.tool("config").await?;
            let logger: Arc<dyn Logger> = Arc::new(ConsoleLogger::from_config(&entry));
            Ok(LazyProvider::singleton(move || {
                let logger = Arc::clone(&logger);
                async move { Ok(logger) }
            })
            .shared())
        },
    )
    .await?;
    cx.put_alias(LOGGER_ALIAS, CONSOLE_LOGGER_DRIVER).await
}

/// Resolve the application logger from a started context.
pub async fn get_logger(cx: &Arc<AppContext>) -> Result<Arc<dyn Logger>, ContextError> {
    let provider = cx.get_provider(LOGGER_ALIAS).await?;
    let tool = provider.get_tool().await?;
    tool.downcast_ref::<Arc<dyn Logger>>()
        .cloned()
        .ok_or_else(|| ContextError::ToolType(LOGGER_ALIAS.to_string()))
}
