//! AppContext - 中央レジストリと起動ライフサイクル
//!
//! キーから provider / alias / config を引く、フラットな DI グラフの中心。
//!
//! # LifeCycle
//! - built-unstarted: puts accepted, lookups block on the start barrier
//! - started: remote config merged, lookups and `on_start` resolve

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use tracing::{debug, warn};

use super::config::{ConfigDb, ConfigEntry, ConfigMap, shallow_merge};
use super::key::ToolKey;
use super::toolbox::ToolBox;
use crate::error::ContextError;
use crate::loader::ConfigLoader;
use crate::provider::{LazyProvider, SharedProvider};
use crate::sync::{Barrier, BarrierState, BoxFuture, Once, pmap};

/// How many config hrefs `start` fetches in parallel.
const CONFIG_FETCH_BATCH: usize = 4;

/// Immutable construction-time configuration for the context.
pub struct AppContextConfig {
    /// Remote configuration sources, later hrefs overriding earlier ones.
    pub config_hrefs: Vec<String>,
    /// Injected fetch collaborator; see [`crate::loader`].
    pub loader: Arc<dyn ConfigLoader>,
}

/// How a key resolves.
#[derive(Clone)]
enum Registration {
    /// A registered factory, memoized so it runs at most once.
    Slot(Arc<Once<SharedProvider>>),
    /// Indirection to another key.
    Alias(ToolKey),
    /// Already-built provider (auto-vivified config readers).
    Ready(SharedProvider),
}

#[derive(Default)]
struct Registry {
    providers: HashMap<ToolKey, Registration>,
    /// Every key ever requested as a dependency; start reports the ones
    /// that never got a registration.
    all_tool_keys: HashSet<ToolKey>,
    default_configs: ConfigDb,
    override_configs: ConfigDb,
}

/// Central application registry: string-keyed providers, aliases, and
/// layered configuration, resolved lazily behind a start barrier.
pub struct AppContext {
    config: AppContextConfig,
    registry: tokio::sync::Mutex<Registry>,
    /// Resolves to the unbound-tool report once `start` completes.
    start_barrier: Barrier<Vec<String>>,
    started: AtomicBool,
}

static SINGLETON: LazyLock<Barrier<Arc<AppContext>>> = LazyLock::new(Barrier::new);

impl AppContext {
    /// Explicit constructor. Prefer this and pass the handle around;
    /// [`AppContext::build`] exists for the one-per-process wiring style.
    pub fn new(config: AppContextConfig) -> Arc<AppContext> {
        Arc::new(AppContext {
            config,
            registry: tokio::sync::Mutex::new(Registry::default()),
            start_barrier: Barrier::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Build the process-wide context. Errors if one was already built.
    pub fn build(config: AppContextConfig) -> Result<Arc<AppContext>, ContextError> {
        let cx = AppContext::new(config);
        if SINGLETON.signal(Arc::clone(&cx)) {
            Ok(cx)
        } else {
            Err(ContextError::AlreadyBuilt)
        }
    }

    /// Wait for the process-wide context built by [`AppContext::build`].
    pub async fn get() -> Result<Arc<AppContext>, ContextError> {
        SINGLETON.wait().await
    }

    /// Register a provider under `driver/<key>`.
    ///
    /// - `key` is normalized: any leading slashes / `driver/` prefixes
    ///   collapse to one.
    /// - every dependency reference must carry a `driver/`, `alias/`, or
    ///   `config/` prefix; `config/*` references auto-vivify.
    /// - registering the same key twice errors.
    /// - `factory` is memoized: it runs at most once, even when
    ///   concurrent lookups race to resolve the key.
    pub async fn put_provider<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        tool_keys: &[(&str, &str)],
        factory: F,
    ) -> Result<(), ContextError>
    where
        F: FnOnce(ToolBox) -> Fut + Send + 'static,
        Fut: Future<Output = Result<SharedProvider, ContextError>> + Send + 'static,
    {
        let key = ToolKey::driver(key);
        let mut deps: Vec<(String, ToolKey)> = Vec::with_capacity(tool_keys.len());
        for (local, reference) in tool_keys {
            deps.push((local.to_string(), ToolKey::from_str(reference)?));
        }

        let mut registry = self.registry.lock().await;
        if registry.providers.contains_key(&key) {
            return Err(ContextError::AlreadyRegistered(key.to_string()));
        }
        for (_, dep) in &deps {
            registry.all_tool_keys.insert(dep.clone());
            if let ToolKey::Config(name) = dep {
                let name = name.clone();
                self.vivify_config(&mut registry, &name);
            }
        }

        let cx = Arc::downgrade(self);
        let key_str = key.to_string();
        let slot = Once::new(move || async move {
            let Some(cx) = cx.upgrade() else {
                return Err(ContextError::other("application context dropped"));
            };
            let mut tools = HashMap::with_capacity(deps.len());
            for (local, dep) in deps {
                let provider = cx.resolve(dep).await.map_err(|err| match err {
                    ContextError::NoProvider(dependency) => ContextError::MissingDependency {
                        provider: key_str.clone(),
                        dependency,
                    },
                    other => other,
                })?;
                tools.insert(local, provider);
            }
            factory(ToolBox::new(tools)).await
        });
        registry
            .providers
            .insert(key, Registration::Slot(Arc::new(slot)));
        Ok(())
    }

    /// Register `alias/<alias>` as an indirection to `driver/<driver>`.
    pub async fn put_alias(self: &Arc<Self>, alias: &str, driver: &str) -> Result<(), ContextError> {
        let key = ToolKey::alias(alias);
        let target = ToolKey::driver(driver);
        let mut registry = self.registry.lock().await;
        if registry.providers.contains_key(&key) {
            return Err(ContextError::AlreadyRegistered(key.to_string()));
        }
        // dangling aliases show up in the unbound-tool report
        registry.all_tool_keys.insert(target.clone());
        registry.providers.insert(key, Registration::Alias(target));
        Ok(())
    }

    /// Merge `value` into the defaults under `key`. Repeated calls
    /// accumulate, last write wins per field. Runtime overrides loaded at
    /// `start` still win over anything put here.
    pub async fn put_default_config(self: &Arc<Self>, key: &str, value: ConfigMap) {
        let mut registry = self.registry.lock().await;
        let entry = registry.default_configs.entry(key.to_string()).or_default();
        shallow_merge(entry, &value);
        self.vivify_config(&mut registry, key);
    }

    /// Look a provider up by its full key (`driver/…`, `alias/…`, or
    /// `config/…`). Blocks until the context has started.
    pub async fn get_provider(self: &Arc<Self>, key: &str) -> Result<SharedProvider, ContextError> {
        let key = ToolKey::from_str(key)?;
        self.start_barrier.wait().await?;
        self.resolve(key).await
    }

    /// Wait for start, resolve `tool_keys` into a toolbox, run `lambda`.
    pub async fn on_start<T, F, Fut>(
        self: &Arc<Self>,
        tool_keys: &[(&str, &str)],
        lambda: F,
    ) -> Result<T, ContextError>
    where
        F: FnOnce(ToolBox) -> Fut,
        Fut: Future<Output = Result<T, ContextError>>,
    {
        let mut deps: Vec<(String, ToolKey)> = Vec::with_capacity(tool_keys.len());
        for (local, reference) in tool_keys {
            deps.push((local.to_string(), ToolKey::from_str(reference)?));
        }
        {
            let mut registry = self.registry.lock().await;
            for (_, dep) in &deps {
                registry.all_tool_keys.insert(dep.clone());
                if let ToolKey::Config(name) = dep {
                    let name = name.clone();
                    self.vivify_config(&mut registry, &name);
                }
            }
        }

        self.start_barrier.wait().await?;
        let mut tools = HashMap::with_capacity(deps.len());
        for (local, dep) in deps {
            tools.insert(local, self.resolve(dep).await?);
        }
        lambda(ToolBox::new(tools)).await
    }

    /// Layered config snapshot for `key`; empty maps when absent.
    /// Blocks until the context has started.
    pub async fn get_config(&self, key: &str) -> Result<ConfigEntry, ContextError> {
        self.start_barrier.wait().await?;
        Ok(self.config_entry(key).await)
    }

    /// Has `start` completed (successfully or not)?
    pub fn started(&self) -> bool {
        self.start_barrier.state() != BarrierState::Unresolved
    }

    /// Launch the context. Runs at most once.
    ///
    /// Fetches every configured href in parallel (bounded batch), merges
    /// the results into the override layer (later hrefs win per config
    /// key), vivifies config providers for override keys, then unblocks
    /// the start barrier with the unbound-tool report: every key that was
    /// requested as a dependency but never registered.
    ///
    /// A fetch failure cancels the start barrier, so lookups waiting on
    /// it fail instead of hanging, and propagates to the caller.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<String>, ContextError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ContextError::AlreadyStarted);
        }

        let loader = Arc::clone(&self.config.loader);
        let hrefs = self.config.config_hrefs.clone();
        let loaded = pmap(hrefs, CONFIG_FETCH_BATCH, |href| {
            let loader = Arc::clone(&loader);
            async move { loader.load_config(&href).await }
        })
        .await;
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                let _ = self.start_barrier.cancel(err.clone());
                return Err(err);
            }
        };

        let unbound = {
            let mut registry = self.registry.lock().await;
            for db in loaded {
                for (config_key, map) in db {
                    let entry = registry.override_configs.entry(config_key).or_default();
                    shallow_merge(entry, &map);
                }
            }
            let override_keys: Vec<String> = registry.override_configs.keys().cloned().collect();
            for name in override_keys {
                self.vivify_config(&mut registry, &name);
            }

            let mut unbound: Vec<String> = registry
                .all_tool_keys
                .iter()
                .filter(|key| !registry.providers.contains_key(key))
                .map(|key| key.to_string())
                .collect();
            unbound.sort();
            unbound
        };

        if unbound.is_empty() {
            debug!("context started, all tool keys bound");
        } else {
            warn!(unbound = ?unbound, "context started with unbound tool keys");
        }
        let _ = self.start_barrier.signal(unbound.clone());
        Ok(unbound)
    }

    /// Resolve a key to its provider, following aliases and vivifying
    /// absent `config/*` keys.
    fn resolve(self: &Arc<Self>, key: ToolKey) -> BoxFuture<Result<SharedProvider, ContextError>> {
        let cx = Arc::clone(self);
        Box::pin(async move {
            let registration = {
                let mut registry = cx.registry.lock().await;
                match registry.providers.get(&key) {
                    Some(registration) => registration.clone(),
                    None => match &key {
                        ToolKey::Config(name) => {
                            let name = name.clone();
                            cx.vivify_config(&mut registry, &name);
                            registry
                                .providers
                                .get(&key)
                                .cloned()
                                .ok_or_else(|| ContextError::NoProvider(key.to_string()))?
                        }
                        _ => return Err(ContextError::NoProvider(key.to_string())),
                    },
                }
            };
            match registration {
                Registration::Ready(provider) => Ok(provider),
                Registration::Alias(target) => cx.resolve(target).await,
                Registration::Slot(slot) => slot.call().await,
            }
        })
    }

    /// Idempotently install the virtual config-reading provider.
    fn vivify_config(self: &Arc<Self>, registry: &mut Registry, name: &str) {
        let key = ToolKey::config(name);
        if !registry.providers.contains_key(&key) {
            registry
                .providers
                .insert(key, Registration::Ready(self.config_provider(name)));
        }
    }

    /// Pass-through provider serving the live layered snapshot for one
    /// config key.
    fn config_provider(self: &Arc<Self>, name: &str) -> SharedProvider {
        let cx = Arc::downgrade(self);
        let name = name.to_string();
        LazyProvider::pass_through(move || {
            let cx = cx.clone();
            let name = name.clone();
            async move {
                let Some(cx) = cx.upgrade() else {
                    return Err(ContextError::other("application context dropped"));
                };
                Ok(cx.config_entry(&name).await)
            }
        })
        .shared()
    }

    async fn config_entry(&self, name: &str) -> ConfigEntry {
        let registry = self.registry.lock().await;
        ConfigEntry {
            defaults: registry.default_configs.get(name).cloned().unwrap_or_default(),
            overrides: registry.override_configs.get(name).cloned().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::loader::StaticConfigLoader;
    use crate::provider::LazyProvider;

    fn config_map(value: serde_json::Value) -> ConfigMap {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn empty_context() -> Arc<AppContext> {
        AppContext::new(AppContextConfig {
            config_hrefs: Vec::new(),
            loader: Arc::new(StaticConfigLoader::new()),
        })
    }

    async fn put_string_provider(cx: &Arc<AppContext>, key: &str, value: &str) {
        let value = value.to_string();
        cx.put_provider(key, &[], move |_tools| async move {
            Ok(LazyProvider::singleton(move || {
                let value = value.clone();
                async move { Ok(value) }
            })
            .shared())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn duplicate_provider_registration_errors() {
        let cx = empty_context();
        put_string_provider(&cx, "dup", "one").await;
        let err = cx
            .put_provider("dup", &[], |_tools| async {
                Ok(LazyProvider::singleton(|| async { Ok(()) }).shared())
            })
            .await
            .unwrap_err();
        assert_eq!(err, ContextError::AlreadyRegistered("driver/dup".to_string()));
    }

    #[tokio::test]
    async fn dependency_references_must_be_namespaced() {
        let cx = empty_context();
        let err = cx
            .put_provider("thing", &[("dep", "not-namespaced")], |_tools| async {
                Ok(LazyProvider::singleton(|| async { Ok(()) }).shared())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::InvalidToolKey(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn lookups_block_until_start() {
        let cx = empty_context();
        put_string_provider(&cx, "thing", "value").await;

        let pending = {
            let cx = Arc::clone(&cx);
            tokio::spawn(async move { cx.get_provider("driver/thing").await })
        };
        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), async { tokio::task::yield_now().await })
                .await;
        assert!(timed_out.is_ok());
        assert!(!pending.is_finished());

        cx.start().await.unwrap();
        let provider = pending.await.unwrap().unwrap();
        let tool = provider.get_tool().await.unwrap();
        assert_eq!(tool.downcast_ref::<String>().unwrap(), "value");
    }

    #[tokio::test]
    async fn unregistered_non_config_key_rejects() {
        let cx = empty_context();
        cx.start().await.unwrap();
        let err = cx.get_provider("driver/ghost").await.unwrap_err();
        assert_eq!(err, ContextError::NoProvider("driver/ghost".to_string()));
    }

    #[tokio::test]
    async fn start_runs_at_most_once() {
        let cx = empty_context();
        cx.start().await.unwrap();
        assert!(cx.started());
        assert_eq!(cx.start().await.unwrap_err(), ContextError::AlreadyStarted);
    }

    #[tokio::test]
    async fn default_configs_accumulate_by_shallow_merge() {
        let cx = empty_context();
        cx.put_default_config("svc", config_map(json!({"a": 1, "b": 1}))).await;
        cx.put_default_config("svc", config_map(json!({"b": 2, "c": 3}))).await;
        cx.start().await.unwrap();

        let entry = cx.get_config("svc").await.unwrap();
        assert_eq!(
            serde_json::Value::Object(entry.defaults),
            json!({"a": 1, "b": 2, "c": 3})
        );
        assert!(entry.overrides.is_empty());
    }

    #[tokio::test]
    async fn overrides_win_and_later_hrefs_override_earlier() {
        let loader = StaticConfigLoader::new()
            .with_source(
                "mem://base",
                serde_json::from_value(json!({"svc": {"level": "info", "url": "a"}})).unwrap(),
            )
            .with_source(
                "mem://site",
                serde_json::from_value(json!({"svc": {"level": "debug"}})).unwrap(),
            );
        let cx = AppContext::new(AppContextConfig {
            config_hrefs: vec!["mem://base".to_string(), "mem://site".to_string()],
            loader: Arc::new(loader),
        });
        cx.put_default_config("svc", config_map(json!({"level": "warn", "retries": 3})))
            .await;
        cx.start().await.unwrap();

        let entry = cx.get_config("svc").await.unwrap();
        assert_eq!(
            serde_json::Value::Object(entry.merged()),
            json!({"level": "debug", "url": "a", "retries": 3})
        );
    }

    #[tokio::test]
    async fn config_load_failure_propagates_and_unblocks_waiters() {
        let cx = AppContext::new(AppContextConfig {
            config_hrefs: vec!["mem://absent".to_string()],
            loader: Arc::new(StaticConfigLoader::new()),
        });
        let waiter = {
            let cx = Arc::clone(&cx);
            tokio::spawn(async move { cx.get_config("svc").await })
        };

        assert!(matches!(
            cx.start().await.unwrap_err(),
            ContextError::ConfigLoad { .. }
        ));
        assert!(waiter.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn aliases_resolve_to_their_driver() {
        let cx = empty_context();
        put_string_provider(&cx, "concrete", "the driver").await;
        cx.put_alias("alias/stable-name", "concrete").await.unwrap();
        cx.start().await.unwrap();

        let provider = cx.get_provider("alias/stable-name").await.unwrap();
        let tool = provider.get_tool().await.unwrap();
        assert_eq!(tool.downcast_ref::<String>().unwrap(), "the driver");
    }

    #[tokio::test]
    async fn factory_runs_once_under_concurrent_lookups() {
        let cx = empty_context();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        cx.put_provider("expensive", &[], move |_tools| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(LazyProvider::singleton(|| async { Ok(1u32) }).shared())
        })
        .await
        .unwrap();
        cx.start().await.unwrap();

        let mut joins = Vec::new();
        for _ in 0..8 {
            let cx = Arc::clone(&cx);
            joins.push(tokio::spawn(async move {
                cx.get_provider("driver/expensive").await
            }));
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_dependency_is_reported_with_both_keys() {
        let cx = empty_context();
        cx.put_provider("needy", &[("dep", "driver/ghost")], |_tools| async {
            Ok(LazyProvider::singleton(|| async { Ok(()) }).shared())
        })
        .await
        .unwrap();
        let unbound = cx.start().await.unwrap();
        assert_eq!(unbound, vec!["driver/ghost".to_string()]);

        let err = cx.get_provider("driver/needy").await.unwrap_err();
        assert_eq!(
            err,
            ContextError::MissingDependency {
                provider: "driver/needy".to_string(),
                dependency: "driver/ghost".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn end_to_end_config_dependency() {
        let cx = empty_context();
        cx.put_default_config("y", config_map(json!({"a": 1}))).await;
        cx.put_provider("x", &[("config", "config/y")], |tools| async move {
            let entry: ConfigEntry = tools.tool("config").await?;
            assert_eq!(serde_json::Value::Object(entry.defaults.clone()), json!({"a": 1}));
            assert!(entry.overrides.is_empty());
            let merged = entry.merged();
            Ok(LazyProvider::singleton(move || {
                let merged = merged.clone();
                async move { Ok(serde_json::Value::Object(merged)) }
            })
            .shared())
        })
        .await
        .unwrap();
        let unbound = cx.start().await.unwrap();
        assert!(unbound.is_empty());

        let provider = cx.get_provider("driver/x").await.unwrap();
        let tool = provider.get_tool().await.unwrap();
        assert_eq!(
            tool.downcast_ref::<serde_json::Value>().unwrap(),
            &json!({"a": 1})
        );
    }

    #[tokio::test]
    async fn on_start_fills_a_toolbox() {
        let cx = empty_context();
        put_string_provider(&cx, "greeter", "hello").await;
        let started = {
            let cx = Arc::clone(&cx);
            tokio::spawn(async move {
                cx.on_start(&[("greeter", "driver/greeter")], |tools| async move {
                    tools.tool::<String>("greeter").await
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        cx.start().await.unwrap();
        assert_eq!(started.await.unwrap().unwrap(), "hello");
    }

    // the one test that touches the process-wide handle
    #[tokio::test]
    async fn build_installs_the_singleton_exactly_once() {
        let first = AppContext::build(AppContextConfig {
            config_hrefs: Vec::new(),
            loader: Arc::new(StaticConfigLoader::new()),
        })
        .unwrap();
        let again = AppContext::build(AppContextConfig {
            config_hrefs: Vec::new(),
            loader: Arc::new(StaticConfigLoader::new()),
        });
        assert!(matches!(again, Err(ContextError::AlreadyBuilt)));

        let fetched = AppContext::get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &fetched));
    }
}
