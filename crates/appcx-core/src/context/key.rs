//! ToolKey - レジストリのキー
//!
//! 文字列プレフィックス（`driver/`, `alias/`, `config/`）の規約を
//! tagged variant で表現する。Display / parse は文字列表記と往復できる。

use std::fmt;
use std::str::FromStr;

use crate::error::ContextError;

pub const DRIVER_PREFIX: &str = "driver/";
pub const ALIAS_PREFIX: &str = "alias/";
pub const CONFIG_PREFIX: &str = "config/";

/// A registry key, one variant per resolution semantic:
/// concrete implementation, named indirection, or layered configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolKey {
    Driver(String),
    Alias(String),
    Config(String),
}

impl ToolKey {
    /// Normalize a raw name into a driver key: leading slashes and any
    /// number of `driver/` prefixes collapse into exactly one.
    pub fn driver(raw: &str) -> ToolKey {
        let mut name = raw.trim_start_matches('/');
        loop {
            let stripped = name.strip_prefix(DRIVER_PREFIX).map(|s| s.trim_start_matches('/'));
            match stripped {
                Some(rest) => name = rest,
                None => break,
            }
        }
        ToolKey::Driver(name.to_string())
    }

    /// Same normalization for alias keys.
    pub fn alias(raw: &str) -> ToolKey {
        let mut name = raw.trim_start_matches('/');
        loop {
            let stripped = name.strip_prefix(ALIAS_PREFIX).map(|s| s.trim_start_matches('/'));
            match stripped {
                Some(rest) => name = rest,
                None => break,
            }
        }
        ToolKey::Alias(name.to_string())
    }

    pub fn config(name: &str) -> ToolKey {
        ToolKey::Config(name.to_string())
    }

    /// The bare name without its namespace prefix. For config keys this
    /// is the config-db key.
    pub fn name(&self) -> &str {
        match self {
            ToolKey::Driver(name) | ToolKey::Alias(name) | ToolKey::Config(name) => name,
        }
    }
}

impl fmt::Display for ToolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKey::Driver(name) => write!(f, "{DRIVER_PREFIX}{name}"),
            ToolKey::Alias(name) => write!(f, "{ALIAS_PREFIX}{name}"),
            ToolKey::Config(name) => write!(f, "{CONFIG_PREFIX}{name}"),
        }
    }
}

impl FromStr for ToolKey {
    type Err = ContextError;

    /// Parse a dependency reference. Unlike [`ToolKey::driver`] this does
    /// not normalize: a reference must carry one of the three namespace
    /// prefixes or it is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix(DRIVER_PREFIX) {
            Ok(ToolKey::Driver(name.to_string()))
        } else if let Some(name) = s.strip_prefix(ALIAS_PREFIX) {
            Ok(ToolKey::Alias(name.to_string()))
        } else if let Some(name) = s.strip_prefix(CONFIG_PREFIX) {
            Ok(ToolKey::Config(name.to_string()))
        } else {
            Err(ContextError::InvalidToolKey(s.to_string()))
        }
    }
}
