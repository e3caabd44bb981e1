//! SharedState - バス連動のキー付き状態ストア
//!
//! 値は `Arc<Value>` で凍結して保持し、変更のたびに `lw-sc:<key>` イベント
//! として new/old ペアをバスへ流す。
//!
//! Design:
//! - `change_state` runs the mutation lambda outside the store lock, so a
//!   slow lambda does not stall unrelated keys. Two concurrent changes to
//!   the same key can therefore interleave read-lambda-write and the
//!   second write wins; callers needing atomic read-modify-write must
//!   serialize their own calls (`sync::Gate` works).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::bus::{BusEvent, BusListener, EventBus};
use crate::context::AppContext;
use crate::error::ContextError;
use crate::logging::{LOGGER_ALIAS, Logger};
use crate::provider::LazyProvider;

/// Registry key for the shared-state driver.
pub const STATE_DRIVER: &str = "driver/appcx/sharedState";

/// Event-type prefix for state-change notifications; the full type is
/// this prefix followed by the cleaned state key.
pub const STATE_EVENT_PREFIX: &str = "lw-sc:";

/// Normalize a state key: slashes trimmed from both ends. All-slash or
/// empty keys are rejected.
fn clean_key(key: &str) -> Result<String, ContextError> {
    let cleaned = key.trim_matches('/');
    if cleaned.is_empty() {
        return Err(ContextError::InvalidStateKey(key.to_string()));
    }
    Ok(cleaned.to_string())
}

/// A state value must be an object so listeners can destructure it; bare
/// scalars and arrays get wrapped.
fn freeze(value: Value) -> Arc<Value> {
    match value {
        Value::Object(_) => Arc::new(value),
        other => Arc::new(json!({ "thing": other })),
    }
}

fn empty_object() -> Arc<Value> {
    Arc::new(json!({}))
}

/// Keyed state store publishing every change to the event bus.
pub struct SharedState {
    bus: Arc<EventBus>,
    logger: Arc<dyn Logger>,
    store: tokio::sync::Mutex<HashMap<String, Arc<Value>>>,
}

impl SharedState {
    pub fn new(bus: Arc<EventBus>, logger: Arc<dyn Logger>) -> Arc<SharedState> {
        Arc::new(SharedState {
            bus,
            logger,
            store: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Snapshot of the current value under `key`; an empty object when
    /// nothing was stored yet.
    pub async fn get_state(&self, key: &str) -> Result<Arc<Value>, ContextError> {
        let key = clean_key(key)?;
        let store = self.store.lock().await;
        Ok(store.get(&key).cloned().unwrap_or_else(empty_object))
    }

    /// Apply `lambda` to the current value. Returning `None` leaves the
    /// state untouched and publishes nothing; returning a value stores it
    /// (frozen, non-objects wrapped as `{"thing": …}`) and dispatches a
    /// `lw-sc:<key>` event carrying `{"old": …, "new": …}`.
    pub async fn change_state<F, Fut>(&self, key: &str, lambda: F) -> Result<Arc<Value>, ContextError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Option<Value>>,
    {
        let key = clean_key(key)?;
        let old = {
            let store = self.store.lock().await;
            store.get(&key).cloned().unwrap_or_else(empty_object)
        };

        // lambda runs unlocked; see the module note on interleaving
        let Some(next) = lambda((*old).clone()).await else {
            return Ok(old);
        };
        let next = freeze(next);
        {
            let mut store = self.store.lock().await;
            store.insert(key.clone(), Arc::clone(&next));
        }
        self.logger
            .debug(&json!({ "key": key }), Some("state changed"));
        self.bus
            .dispatch(
                &format!("{STATE_EVENT_PREFIX}{key}"),
                json!({ "old": (*old).clone(), "new": (*next).clone() }),
            )
            .await;
        Ok(next)
    }

    /// Subscribe to changes of `key`. The new listener (and only it)
    /// immediately receives a synthetic event with the current value as
    /// both `old` and `new`, so subscribers never have to special-case
    /// the initial read. A duplicate add is a no-op returning false with
    /// no synthetic event.
    pub async fn add_listener(
        &self,
        key: &str,
        listener: Arc<dyn BusListener>,
    ) -> Result<bool, ContextError> {
        let key = clean_key(key)?;
        let ev_type = format!("{STATE_EVENT_PREFIX}{key}");
        if !self.bus.add_listener(&ev_type, Arc::clone(&listener)).await {
            return Ok(false);
        }

        let current = {
            let store = self.store.lock().await;
            store.get(&key).cloned().unwrap_or_else(empty_object)
        };
        let event = BusEvent {
            ev_type,
            data: Arc::new(json!({ "old": (*current).clone(), "new": (*current).clone() })),
        };
        tokio::spawn(async move {
            listener.on_event(event).await;
        });
        Ok(true)
    }

    /// Unsubscribe `listener` from `key`; pointer identity, like the bus
    /// itself. Subscriptions on other keys stay.
    pub async fn remove_listener(
        &self,
        key: &str,
        listener: &Arc<dyn BusListener>,
    ) -> Result<bool, ContextError> {
        let key = clean_key(key)?;
        Ok(self
            .bus
            .remove_listener(&format!("{STATE_EVENT_PREFIX}{key}"), listener)
            .await)
    }
}

/// Register the shared-state driver; it depends on the logger and the
/// bus driver, so register those first.
pub async fn register_shared_state(cx: &Arc<AppContext>) -> Result<(), ContextError> {
    cx.put_provider(
        STATE_DRIVER,
        &[("logger", LOGGER_ALIAS), ("bus", crate::bus::BUS_DRIVER)],
        |tools| async move {
            let logger: Arc<dyn Logger> = tools.tool("logger").await?;
            let bus: Arc<EventBus> = tools.tool("bus").await?;
            let state = SharedState::new(bus, logger);
            Ok(LazyProvider::singleton(move || {
                let state = Arc::clone(&state);
                async move { Ok(state) }
            })
            .shared())
        },
    )
    .await
}

/// Resolve the shared state from a started context.
pub async fn get_shared_state(cx: &Arc<AppContext>) -> Result<Arc<SharedState>, ContextError> {
    let provider = cx.get_provider(STATE_DRIVER).await?;
    let tool = provider.get_tool().await?;
    tool.downcast_ref::<Arc<SharedState>>()
        .cloned()
        .ok_or_else(|| ContextError::ToolType(STATE_DRIVER.to_string()))
}
