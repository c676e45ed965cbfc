use clap::{Parser, Subcommand};
use nexus_mcp::{ConnectionManager, NexusConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nexus", about = "Nexus: resilient MCP connection manager")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "nexus.toml")]
    config: PathBuf,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every configured server and show its status
    Servers,
    /// List the aggregated tool catalog
    Tools {
        /// Only tools in this category
        #[arg(long)]
        category: Option<String>,
    },
    /// Call a tool on whichever server provides it
    Call {
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// List the resources a server exposes
    Resources { server: String },
    /// List the prompts a server exposes
    Prompts { server: String },
    /// Let health monitors run, then print the health table
    Health {
        /// Seconds to wait before reading the table
        #[arg(long, default_value_t = 1)]
        wait: u64,
    },
    /// Stream manager signals until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr);
    if cli.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    let config = NexusConfig::load(&cli.config).await?;
    info!(servers = config.servers.len(), "Configuration loaded");

    let manager = ConnectionManager::new();
    // Subscribe before connecting so `watch` sees the connect signals.
    let signals = manager.subscribe();

    for error in manager.connect_all(&config.servers).await {
        warn!(error = %error, "Server unavailable");
        if !cli.json {
            eprintln!("warning: {error}");
        }
    }

    let outcome = run(&cli, &manager, signals).await;
    manager.cleanup().await;
    outcome
}

async fn run(
    cli: &Cli,
    manager: &ConnectionManager,
    signals: tokio::sync::broadcast::Receiver<nexus_mcp::ManagerEvent>,
) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Servers => {
            let status = manager.status().await;
            if cli.json {
                return print_json(&status);
            }
            if status.is_empty() {
                println!("No servers connected.");
                println!("Configure servers in nexus.toml under [[servers]]");
                return Ok(());
            }
            for server in &status {
                println!(
                    "  {} [{}] - {} tool(s), {} reconnect(s)",
                    server.name, server.state, server.tool_count, server.reconnect_count
                );
            }
            println!(
                "\nConnected: {}/{}",
                manager.connected_count().await,
                status.len()
            );
        }
        Commands::Tools { category } => {
            let tools = manager.get_tools_by_category(category.as_deref()).await;
            if cli.json {
                return print_json(&tools);
            }
            for entry in &tools {
                let category = entry.category.as_deref().unwrap_or("-");
                println!(
                    "  {} ({}, {}) - {}",
                    entry.tool.name, entry.server, category, entry.tool.description
                );
            }
            println!("\nTotal: {} tool(s)", tools.len());
        }
        Commands::Call { tool, args } => {
            let arguments: serde_json::Value = serde_json::from_str(args)
                .map_err(|e| anyhow::anyhow!("--args must be a JSON object: {e}"))?;
            let result = manager.call_tool(tool, arguments).await?;
            if cli.json {
                return print_json(&result);
            }
            println!("{}", result.text());
            if result.is_error {
                anyhow::bail!("tool '{tool}' reported an error");
            }
        }
        Commands::Resources { server } => {
            let client = manager
                .get_client(server)
                .await
                .ok_or_else(|| nexus_core::NexusError::UnknownServer(server.clone()))?;
            let resources = client.list_resources().await?;
            if cli.json {
                return print_json(&resources);
            }
            for resource in &resources {
                println!("  {} - {}", resource.uri, resource.name);
            }
        }
        Commands::Prompts { server } => {
            let client = manager
                .get_client(server)
                .await
                .ok_or_else(|| nexus_core::NexusError::UnknownServer(server.clone()))?;
            let prompts = client.list_prompts().await?;
            if cli.json {
                return print_json(&prompts);
            }
            for prompt in &prompts {
                let args: Vec<&str> = prompt.arguments.iter().map(|a| a.name.as_str()).collect();
                println!(
                    "  {}({}) - {}",
                    prompt.name,
                    args.join(", "),
                    prompt.description.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Health { wait } => {
            tokio::time::sleep(Duration::from_secs(*wait)).await;
            let health = manager.get_server_health(None).await;
            if cli.json {
                return print_json(&health);
            }
            if health.is_empty() {
                println!("No health data. Add [servers.health_check] to a server.");
            }
            let mut names: Vec<&String> = health.keys().collect();
            names.sort();
            for name in names {
                let h = &health[name];
                println!(
                    "  {name}: {:?} ({}ms) {}",
                    h.status,
                    h.latency_ms,
                    h.errors.join("; ")
                );
            }
        }
        Commands::Watch => {
            let mut stream = BroadcastStream::new(signals);
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    next = stream.next() => match next {
                        Some(Ok(event)) => println!("{}", serde_json::to_string(&event)?),
                        Some(Err(e)) => warn!(error = %e, "Signal stream lagged"),
                        None => break,
                    },
                }
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
