//! EventBus - プロセス内 pub/sub
//!
//! リスナーはイベント型のプレフィックスで購読する。dispatch は一致した
//! リスナーごとに独立したタスクを起動するので、遅いリスナーが他を
//! ブロックすることはない。
//!
//! Design:
//! - Payloads are `Arc<Value>`: shared, never copied, immutable by
//!   construction. A listener cannot corrupt what its siblings see.
//! - Delivery order across listeners is unspecified.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::context::AppContext;
use crate::error::ContextError;
use crate::logging::{LOGGER_ALIAS, Logger};
use crate::provider::LazyProvider;

/// Registry key for the bus driver.
pub const BUS_DRIVER: &str = "driver/appcx/eventBus";

/// One published event: a type string plus a shared immutable payload.
#[derive(Clone)]
pub struct BusEvent {
    pub ev_type: String,
    pub data: Arc<Value>,
}

/// Subscriber interface.
#[async_trait]
pub trait BusListener: Send + Sync {
    async fn on_event(&self, event: BusEvent);
}

/// Adapt a closure into a [`BusListener`].
pub struct FnListener<F> {
    lambda: F,
}

impl<F> FnListener<F> {
    pub fn new(lambda: F) -> Arc<Self> {
        Arc::new(Self { lambda })
    }
}

#[async_trait]
impl<F, Fut> BusListener for FnListener<F>
where
    F: Fn(BusEvent) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn on_event(&self, event: BusEvent) {
        (self.lambda)(event).await;
    }
}

type Subscription = (String, Arc<dyn BusListener>);

/// In-process event bus. Cheap to clone through its `Arc`.
pub struct EventBus {
    logger: Arc<dyn Logger>,
    listeners: tokio::sync::Mutex<Vec<Subscription>>,
}

impl EventBus {
    pub fn new(logger: Arc<dyn Logger>) -> Arc<EventBus> {
        Arc::new(EventBus {
            logger,
            listeners: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Subscribe `listener` to every event whose type starts with
    /// `prefix`; the empty prefix matches everything. Returns false when
    /// this exact listener (pointer identity) is already subscribed under
    /// the same prefix.
    pub async fn add_listener(&self, prefix: &str, listener: Arc<dyn BusListener>) -> bool {
        let mut listeners = self.listeners.lock().await;
        let duplicate = listeners
            .iter()
            .any(|(existing, candidate)| existing == prefix && Arc::ptr_eq(candidate, &listener));
        if duplicate {
            return false;
        }
        listeners.push((prefix.to_string(), listener));
        true
    }

    /// Drop the subscription of this exact listener (pointer identity)
    /// under `prefix`; subscriptions under other prefixes stay. Returns
    /// whether anything was removed.
    pub async fn remove_listener(&self, prefix: &str, listener: &Arc<dyn BusListener>) -> bool {
        let mut listeners = self.listeners.lock().await;
        let before = listeners.len();
        listeners
            .retain(|(existing, candidate)| existing != prefix || !Arc::ptr_eq(candidate, listener));
        listeners.len() < before
    }

    /// Publish an event. The payload is frozen behind an `Arc` and every
    /// matching listener runs on its own spawned task; `dispatch` returns
    /// without waiting for any of them.
    pub async fn dispatch(&self, ev_type: &str, data: Value) {
        let event = BusEvent {
            ev_type: ev_type.to_string(),
            data: Arc::new(data),
        };
        let matched: Vec<Arc<dyn BusListener>> = {
            let listeners = self.listeners.lock().await;
            listeners
                .iter()
                .filter(|(prefix, _)| event.ev_type.starts_with(prefix.as_str()))
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };
        self.logger.debug(
            &json!({ "evType": event.ev_type, "listeners": matched.len() }),
            Some("dispatching event"),
        );
        for listener in matched {
            let event = event.clone();
            tokio::spawn(async move {
                listener.on_event(event).await;
            });
        }
    }

    pub async fn num_listeners(&self) -> usize {
        self.listeners.lock().await.len()
    }
}

/// Register the bus driver on a context. The bus logs through the
/// application logger, so register that first (see
/// [`crate::logging::register_console_logger`]).
pub async fn register_bus(cx: &Arc<AppContext>) -> Result<(), ContextError> {
    cx.put_provider(BUS_DRIVER, &[("logger", LOGGER_ALIAS)], |tools| async move {
        let logger: Arc<dyn Logger> = tools.tool("logger").await?;
        let bus = EventBus::new(logger);
        Ok(LazyProvider::singleton(move || {
            let bus = Arc::clone(&bus);
            async move { Ok(bus) }
        })
        .shared())
    })
    .await
}

/// Resolve the shared bus from a started context.
pub async fn get_bus(cx: &Arc<AppContext>) -> Result<Arc<EventBus>, ContextError> {
    let provider = cx.get_provider(BUS_DRIVER).await?;
    let tool = provider.get_tool().await?;
    tool.downcast_ref::<Arc<EventBus>>()
        .cloned()
        .ok_or_else(|| ContextError::ToolType(BUS_DRIVER.to_string()))
}
