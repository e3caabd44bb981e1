use std::sync::Arc;

use serde_json::json;

use appcx_core::bus::{BusEvent, FnListener, register_bus};
use appcx_core::context::{AppContext, AppContextConfig, ConfigEntry};
use appcx_core::loader::StaticConfigLoader;
use appcx_core::logging::{get_logger, register_console_logger};
use appcx_core::provider::LazyProvider;
use appcx_core::state::{get_shared_state, register_shared_state};
use appcx_core::sync::Barrier;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // (A) 設定ソースを用意（サンプルなので in-memory、本番は FileConfigLoader）
    let loader = StaticConfigLoader::new().with_source(
        "mem://site",
        serde_json::from_value(json!({
            "appcx/logging": { "level": "debug" },
            "demo/greeter": { "greeting": "こんにちは" }
        }))
        .expect("valid config db"),
    );
    let cx = AppContext::new(AppContextConfig {
        config_hrefs: vec!["mem://site".to_string()],
        loader: Arc::new(loader),
    });

    // (B) 標準ドライバを登録（logger / bus / sharedState）
    register_console_logger(&cx).await.unwrap();
    register_bus(&cx).await.unwrap();
    register_shared_state(&cx).await.unwrap();

    // (C) 設定依存の greeter provider を登録
    cx.put_provider(
        "demo/greeter",
        &[("config", "config/demo/greeter")],
        |tools| async move {
            let entry: ConfigEntry = tools.tool("config").await?;
            let greeting = entry
                .merged()
                .get("greeting")
                .and_then(|v| v.as_str())
                .unwrap_or("hello")
                .to_string();
            Ok(LazyProvider::singleton(move || {
                let greeting = greeting.clone();
                async move { Ok(greeting) }
            })
            .shared())
        },
    )
    .await
    .unwrap();

    // (D) 起動。未登録キーのレポートが返る
    let unbound = cx.start().await.unwrap();
    println!("started, unbound keys: {unbound:?}");

    let logger = get_logger(&cx).await.unwrap();
    logger.info(&json!({"phase": "started"}), Some("context up"));

    // (E) greeter を解決して使う
    let provider = cx.get_provider("driver/demo/greeter").await.unwrap();
    let tool = provider.get_tool().await.unwrap();
    let greeting = tool.downcast_ref::<String>().expect("greeter is a string");
    println!("greeter says: {greeting}");

    // (F) 状態変更をバス経由で観測する
    let state = get_shared_state(&cx).await.unwrap();
    let observed: Barrier<()> = Barrier::new();
    let done = observed.clone();
    state
        .add_listener(
            "session",
            FnListener::new(move |event: BusEvent| {
                let done = done.clone();
                async move {
                    println!("state event {}: {}", event.ev_type, event.data);
                    done.signal(());
                }
            }),
        )
        .await
        .unwrap();
    state
        .change_state("session", |_| async { Some(json!({"user": "demo"})) })
        .await
        .unwrap();
    observed.wait().await.unwrap();
}
