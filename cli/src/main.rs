//! weft CLI: load configuration, build the runtime, and serve until ctrl-c.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::{Provider, Settings};
use weft::{
    AgentConfig, BrokerBus, HandlerRegistry, LocalBus, MessageBus, Metrics, Router, SessionDeps,
    ToolServerRegistry,
};

#[derive(Parser)]
#[command(name = "weft", version, about = "Event-driven agent orchestration runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the runtime: subscribe the router and process events.
    Run {
        /// Path of the YAML command catalog (overrides WEFT_CATALOG_PATH).
        #[arg(long)]
        catalog: Option<String>,
        /// Messaging provider: local or amqp (overrides WEFT_MESSAGING_PROVIDER).
        #[arg(long)]
        provider: Option<String>,
    },
    /// Validate the command catalog and list its commands.
    Check {
        #[arg(long)]
        catalog: Option<String>,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = config::load_and_apply("weft", None) {
        eprintln!("warning: config load: {e}");
    }
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { catalog, provider } => run(catalog, provider).await,
        Command::Check { catalog } => check(catalog),
    }
}

async fn run(
    catalog_path: Option<String>,
    provider: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = Settings::from_env()?;
    if let Some(path) = catalog_path {
        settings.catalog_path = path;
    }
    if let Some(provider) = provider {
        settings.messaging.provider = provider
            .parse::<Provider>()
            .map_err(|_| format!("unknown provider {provider:?} (expected local or amqp)"))?;
    }

    let catalog = Arc::new(AgentConfig::load(&settings.catalog_path)?);
    tracing::info!(
        catalog = %settings.catalog_path,
        commands = catalog.len(),
        "command catalog loaded"
    );

    let bus: Arc<dyn MessageBus> = match settings.messaging.provider {
        Provider::Local => Arc::new(LocalBus::new(settings.messaging.clone())),
        Provider::Amqp => {
            tracing::info!(url = %settings.messaging.broker_url, "connecting to broker");
            Arc::new(BrokerBus::connect(settings.messaging.clone()).await?)
        }
    };

    let deps = Arc::new(SessionDeps {
        settings: settings.clone(),
        bus: Arc::clone(&bus),
        tools: Arc::new(ToolServerRegistry::new(settings.toolserver.clone())),
        handlers: Arc::new(HandlerRegistry::new()),
        metrics: Arc::new(Metrics::new()),
    });

    let router = Arc::new(Router::with_defaults(catalog, deps));
    router.attach(bus.as_ref()).await?;
    tracing::info!(
        event_topic = %settings.messaging.topics.event,
        response_topic = %settings.messaging.topics.response,
        "router attached, runtime serving"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    bus.shutdown().await;
    Ok(())
}

fn check(catalog_path: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    let path = catalog_path.unwrap_or(settings.catalog_path);
    let catalog = AgentConfig::load(&path)?;
    println!("catalog {} (version {})", path, catalog.version);
    let mut names: Vec<&str> = catalog.command_names().collect();
    names.sort_unstable();
    for name in names {
        if let Some(cmd) = catalog.get(name) {
            println!(
                "  {name}: model={} tools={} servers={}",
                cmd.model.as_deref().unwrap_or("default"),
                cmd.tools.len(),
                cmd.tool_servers.len(),
            );
        }
    }
    Ok(())
}
