//! Pinwire - connector protocol engine
//!
//! Runs a demo server with the hello route, or a client that talks to one.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pinwire::config::{self, Config};
use pinwire::network::{
    self, hello_handler, Client, ClientEvent, HandlerTable, Server, ServerEvent,
};
use pinwire::protocol;

/// Route served by the demo server
const HELLO_ROUTE: &str = "connector.entryHandler.hello";

/// Pinwire - length-framed connector protocol
#[derive(Parser)]
#[command(name = "pinwire")]
#[command(author = "Pinwire Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Connector protocol client and server", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server answering the hello route
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Heartbeat interval in seconds (0 disables)
        #[arg(long)]
        heartbeat: Option<u64>,
    },

    /// Connect to a server and send hello requests
    Client {
        /// Server address (host or host:port)
        #[arg(short, long)]
        server: Option<String>,

        /// Number of hello requests to send
        #[arg(short = 'n', long, default_value_t = 3)]
        requests: u64,

        /// Stay connected and print pushes until Ctrl+C
        #[arg(short, long)]
        listen: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Server { port, heartbeat } => {
            run_server(config, port, heartbeat).await?;
        }
        Commands::Client {
            server,
            requests,
            listen,
        } => {
            run_client(config, server, requests, listen).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Initialize logging; `RUST_LOG` overrides the level
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose || config.general.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match &config.general.log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Cannot open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .init();
    Ok(())
}

/// Run the demo server
async fn run_server(
    config: Config,
    port: Option<u16>,
    heartbeat: Option<u64>,
) -> anyhow::Result<()> {
    let mut server_config = config.server_config()?;
    if let Some(port) = port {
        server_config.port = port;
    }
    if let Some(secs) = heartbeat {
        server_config.heartbeat_secs = secs;
    }
    let heartbeat_secs = server_config.heartbeat_secs;

    let mut handlers = HandlerTable::new();
    handlers.register(HELLO_ROUTE, hello_handler);

    let mut server = Server::new(server_config, handlers);
    let mut event_rx = server
        .take_event_receiver()
        .context("event receiver already taken")?;

    let local_addr = server.start().await?;

    println!("\n========================================");
    println!("  Pinwire Server Running");
    println!("========================================");
    println!("  Address: {}", local_addr);
    println!("  Heartbeat: {}s", heartbeat_secs);
    println!("  Protocol: {}", protocol::PROTOCOL_VERSION);
    println!("========================================");
    println!("\nWaiting for clients to connect...");
    println!("Press Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::SessionStarted { addr, client_type, client_version } => {
                        println!(
                            "+ Client connected: {} ({} {})",
                            addr, client_type, client_version
                        );
                    }
                    ServerEvent::SessionClosed { addr, reason } => {
                        println!("- Client disconnected: {} ({})", addr, reason);
                    }
                    ServerEvent::Notify { addr, route, body } => {
                        tracing::info!("Notify from {} on {}: {}", addr, route, body);
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Split `host[:port]`, defaulting the port
fn parse_server(addr: &str) -> anyhow::Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .with_context(|| format!("Invalid port in server address '{}'", addr))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((addr.to_string(), protocol::DEFAULT_PORT)),
    }
}

/// Run the demo client
async fn run_client(
    config: Config,
    server: Option<String>,
    requests: u64,
    listen: bool,
) -> anyhow::Result<()> {
    let server = server
        .or_else(|| config.client.server.clone())
        .context("Please specify --server address or set client.server in the config")?;
    let (host, port) = parse_server(&server)?;
    let addr = network::resolve_host(&host, port).await?;

    let mut client = Client::new(config.client_config());
    let mut event_rx = client
        .take_event_receiver()
        .context("event receiver already taken")?;

    println!("Connecting to {}...", addr);
    client.connect(addr).await?;

    let heartbeat = client
        .negotiated()
        .await
        .map_or(0, |negotiated| negotiated.heartbeat_secs);
    println!("Connected to {} (heartbeat {}s)", addr, heartbeat);

    for n in 1..=requests {
        let body = json!({ "data": format!("world{}", n) });
        let response = client.request(HELLO_ROUTE, body).await?;
        println!("{} -> {}", HELLO_ROUTE, response);
    }

    if !listen {
        client.disconnect().await?;
        return Ok(());
    }

    println!("\nListening for pushes. Press Ctrl+C to disconnect.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::Push { route, body } => {
                        println!("push {}: {}", route, body);
                    }
                    ClientEvent::Kicked { reason } => {
                        println!("Kicked: {}", reason);
                    }
                    ClientEvent::HeartbeatTimeout => {
                        println!("Server heartbeat timeout");
                    }
                    ClientEvent::Disconnected { reason } => {
                        println!("Disconnected: {}", reason);
                        return Ok(());
                    }
                    ClientEvent::Connected { .. } => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    client.disconnect().await?;
    tracing::info!("Client disconnected");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from([
            "pinwire", "client", "--server", "localhost:3010", "-n", "5", "--listen",
        ]);
        assert!(cli.is_ok());
        let cli = Cli::try_parse_from(["pinwire", "server", "--heartbeat", "0"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_parse_server() {
        assert_eq!(parse_server("example.com:4000").unwrap(), ("example.com".to_string(), 4000));
        assert_eq!(
            parse_server("localhost").unwrap(),
            ("localhost".to_string(), protocol::DEFAULT_PORT)
        );
        assert!(parse_server("host:abc").is_err());
    }
}
