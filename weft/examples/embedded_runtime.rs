//! Embedding the runtime as a library: wire a local bus, register a custom
//! chaining handler, seed one event, and serve until ctrl-c.
//!
//! Run with an agent server available:
//! `WEFT_AGENT_URL=ws://localhost:8080/session cargo run --example embedded_runtime`

use std::sync::Arc;

use weft::{
    AgentConfig, ChainHandler, HandlerRegistry, LocalBus, MessageBus, Metrics, Router,
    SessionDeps, ToolServerRegistry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::load_and_apply("weft", None)?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let settings = config::Settings::from_env()?;

    let catalog = Arc::new(AgentConfig::load(&settings.catalog_path)?);

    // triage succeeds -> fix; fix ends the chain via the default handler.
    let handlers = HandlerRegistry::new();
    handlers.register("triage", Arc::new(ChainHandler::to("fix")));

    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new(settings.messaging.clone()));
    let deps = Arc::new(SessionDeps {
        settings: settings.clone(),
        bus: Arc::clone(&bus),
        tools: Arc::new(ToolServerRegistry::new(settings.toolserver.clone())),
        handlers: Arc::new(handlers),
        metrics: Arc::new(Metrics::new()),
    });

    let router = Arc::new(Router::with_defaults(catalog, deps));
    router.attach(bus.as_ref()).await?;

    bus.publish(
        &settings.messaging.topics.event,
        serde_json::json!({
            "type": "triage",
            "EventKey": "demo-1",
            "issue": "crash on startup when the config file is missing",
        }),
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    bus.shutdown().await;
    Ok(())
}
