//! ToolBox - factory や起動コールバックに渡す依存セット

use std::collections::HashMap;

use crate::error::ContextError;
use crate::provider::{SharedProvider, Tool};

/// The resolved dependency set handed to a provider factory or an
/// `on_start` callback: local alias -> provider.
///
/// Values come out through [`ToolBox::tool`], which resolves the provider
/// and downcasts, or all at once through [`ToolBox::tools`].
pub struct ToolBox {
    tools: HashMap<String, SharedProvider>,
}

impl ToolBox {
    pub fn new(tools: HashMap<String, SharedProvider>) -> Self {
        Self { tools }
    }

    pub fn provider(&self, name: &str) -> Result<&SharedProvider, ContextError> {
        self.tools
            .get(name)
            .ok_or_else(|| ContextError::NoTool(name.to_string()))
    }

    /// Resolve one dependency and downcast it to its concrete type.
    pub async fn tool<T: Clone + 'static>(&self, name: &str) -> Result<T, ContextError> {
        let tool = self.provider(name)?.get_tool().await?;
        tool.downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| ContextError::ToolType(name.to_string()))
    }

    /// Resolve every dependency at once.
    pub async fn tools(&self) -> Result<HashMap<String, Tool>, ContextError> {
        let mut resolved = HashMap::with_capacity(self.tools.len());
        for (name, provider) in &self.tools {
            resolved.insert(name.clone(), provider.get_tool().await?);
        }
        Ok(resolved)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
