mod config_watcher;

use clap::{Parser, Subcommand};
use config_watcher::{ConfigWatcher, WatchedConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use toolmesh_core::{InvocationRequest, InvocationResult};
use toolmesh_mcp::{
    ConfigLayer, ServerRecord, TomlFileLayer, ToolDescriptor, ToolHub, TransportKind,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "toolmesh", about = "toolmesh: MCP tool discovery, catalog and routing")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "toolmesh.toml")]
    config: PathBuf,

    /// Writable user layer (default: toolmesh.user.toml beside the config)
    #[arg(long)]
    user_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage configured MCP servers
    Servers {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// Connect to every server and list the discovered tools
    Tools {
        /// Only tools in this category
        #[arg(long)]
        category: Option<String>,
        /// Only tools of this server
        #[arg(long)]
        server: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Invoke a tool through the router
    Call {
        /// Tool name
        tool: String,
        /// Pin the call to one server
        #[arg(long)]
        server: Option<String>,
        /// Prefer tools in this category
        #[arg(long)]
        domain: Option<String>,
        /// JSON arguments
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Classify a free-text request
    Classify {
        /// Request text
        text: String,
    },
    /// Keep connections open, reload on config changes and print events
    Watch {
        /// Debounce window for config file changes
        #[arg(long, default_value_t = 500)]
        debounce_ms: u64,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// List configured servers
    List {
        /// Connect and show connection status
        #[arg(long)]
        status: bool,
    },
    /// Add or replace a server in the user layer
    Add {
        /// Server id
        id: String,
        /// Endpoint URL for http-stream / server-push servers
        #[arg(long, conflicts_with = "command")]
        url: Option<String>,
        /// Executable for local-process servers
        #[arg(long)]
        command: Option<String>,
        /// Argument for the local command (repeatable)
        #[arg(long = "arg", requires = "command")]
        args: Vec<String>,
        /// KEY=VALUE environment entry for the local command (repeatable)
        #[arg(long = "env", value_parser = parse_env, requires = "command")]
        env: Vec<(String, String)>,
        /// Transport; inferred from --command / --url when omitted
        #[arg(long)]
        transport: Option<TransportKind>,
        /// Display label
        #[arg(long)]
        label: Option<String>,
        /// Category hint applied to all of the server's tools (repeatable)
        #[arg(long = "category")]
        categories: Vec<String>,
    },
    /// Remove a server
    Remove {
        /// Server id
        id: String,
    },
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

fn default_user_config(config: &Path) -> PathBuf {
    config.with_file_name("toolmesh.user.toml")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        config_watcher::parse_config(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
        WatchedConfig::default()
    };

    let user_path = cli
        .user_config
        .clone()
        .unwrap_or_else(|| default_user_config(&cli.config));
    let base: Vec<Arc<dyn ConfigLayer>> = vec![Arc::new(TomlFileLayer::optional(&cli.config))];
    let user: Arc<dyn ConfigLayer> = Arc::new(TomlFileLayer::optional(&user_path));
    let hub = Arc::new(ToolHub::new(config.settings.clone(), base, user)?);

    match cli.command {
        Commands::Servers { action } => match action {
            ServerAction::List { status } => {
                let servers = hub.registry().load().await?;
                if status {
                    hub.sync().await;
                    for s in hub.connections().status() {
                        let error = s.last_error.as_deref().unwrap_or("");
                        println!(
                            "  {:<20} {:<14} {:<12} {error}",
                            s.server_id,
                            s.transport,
                            format!("{:?}", s.state).to_lowercase()
                        );
                    }
                    hub.shutdown().await;
                } else {
                    for s in &servers {
                        let record = ServerRecord::from(s.clone());
                        let target = record
                            .url
                            .or(record.command)
                            .unwrap_or_default();
                        println!("  {:<20} {:<14} {target}", s.id, s.kind());
                    }
                }
                println!("\nTotal: {} server(s)", servers.len());
            }
            ServerAction::Add {
                id,
                url,
                command,
                args,
                env,
                transport,
                label,
                categories,
            } => {
                let kind = match (transport, &command) {
                    (Some(kind), _) => kind,
                    (None, Some(_)) => TransportKind::LocalProcess,
                    (None, None) => TransportKind::HttpStream,
                };
                let mut record = match kind {
                    TransportKind::LocalProcess => {
                        ServerRecord::local(&id, command.clone().unwrap_or_default())
                    }
                    TransportKind::HttpStream => {
                        ServerRecord::http(&id, url.clone().unwrap_or_default())
                    }
                    TransportKind::ServerPush => {
                        ServerRecord::server_push(&id, url.clone().unwrap_or_default())
                    }
                }
                .with_args(args)
                .with_categories(categories);
                for (key, value) in env {
                    record = record.with_env(key, value);
                }
                if let Some(label) = label {
                    record = record.with_label(label);
                }
                // Let validation report a url/command given to the wrong transport.
                if kind == TransportKind::LocalProcess {
                    record.url = url;
                } else {
                    record.command = command;
                }

                hub.registry().load().await?;
                let added = hub.add_server(record).await?;
                println!(
                    "Added server '{}' ({}) to {}",
                    added.id,
                    added.kind(),
                    user_path.display()
                );
            }
            ServerAction::Remove { id } => {
                hub.registry().load().await?;
                let removed = hub.remove_server(&id).await?;
                println!("Removed server '{}' via {}", removed.id, user_path.display());
            }
        },
        Commands::Tools {
            category,
            server,
            json,
        } => {
            hub.start().await?;
            let mut tools: Vec<ToolDescriptor> = match (&category, &server) {
                (Some(category), _) => hub.catalog().by_category(category),
                (None, Some(server)) => hub.catalog().by_server(server),
                (None, None) => hub.catalog().list_all(),
            };
            if let (Some(_), Some(server)) = (&category, &server) {
                tools.retain(|t| &t.server_id == server);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&tools)?);
            } else if tools.is_empty() {
                println!("No tools discovered.");
                println!("Configure servers in toolmesh.toml under [[servers]] or run `toolmesh servers add`.");
            } else {
                for tool in &tools {
                    println!(
                        "  {:<40} [{}] {}",
                        tool.qualified_name(),
                        tool.category,
                        tool.description
                    );
                }
                println!(
                    "\nTotal: {} tool(s) in {}",
                    tools.len(),
                    hub.catalog().available_domains().join(", ")
                );
            }
            hub.shutdown().await;
        }
        Commands::Call {
            tool,
            server,
            domain,
            args,
        } => {
            let arguments: serde_json::Value = serde_json::from_str(&args)
                .map_err(|e| anyhow::anyhow!("--args is not valid JSON: {e}"))?;
            let mut request = InvocationRequest::new(tool).with_arguments(arguments);
            if let Some(server) = server {
                request = request.with_server(server);
            }
            if let Some(domain) = domain {
                request = request.with_domain(domain);
            }

            hub.start().await?;
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });
            let result = hub.route_with_cancel(request, cancel).await;
            hub.shutdown().await;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if let InvocationResult::Failure { kind, .. } = result {
                anyhow::bail!("tool call failed: {kind}");
            }
        }
        Commands::Classify { text } => {
            let classification = hub.classify(&text);
            println!("{}", serde_json::to_string_pretty(&classification)?);
        }
        Commands::Watch { debounce_ms } => {
            let mut events = hub.subscribe();
            hub.start().await?;
            let sync_loop = hub.spawn_sync_loop();
            let refresh_loop = hub.spawn_refresh_loop();

            let (reload_tx, mut reload_rx) = tokio::sync::mpsc::unbounded_channel();
            let _watcher = ConfigWatcher::start(cli.config.clone(), debounce_ms, move |cfg| {
                let _ = reload_tx.send(cfg);
            })?;

            info!(servers = hub.connections().server_count(), "Watching for changes");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    Some(cfg) = reload_rx.recv() => {
                        if cfg.settings != *hub.settings() {
                            warn!("Settings changes take effect after a restart");
                        }
                        if let Err(e) = hub.reload().await {
                            warn!(error = %e, "Config reload failed");
                        }
                    }
                    event = events.recv() => match event {
                        Ok(event) => println!("{}", serde_json::to_string(&event)?),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Dropped change events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            hub.shutdown().await;
            let _ = sync_loop.await;
            if let Some(handle) = refresh_loop {
                let _ = handle.await;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_add_local() {
        let cli = Cli::try_parse_from([
            "toolmesh", "servers", "add", "files", "--command", "mcp-files", "--arg", "/srv",
            "--env", "LOG=debug",
        ])
        .unwrap();
        match cli.command {
            Commands::Servers {
                action:
                    ServerAction::Add {
                        id,
                        command,
                        args,
                        env,
                        ..
                    },
            } => {
                assert_eq!(id, "files");
                assert_eq!(command.as_deref(), Some("mcp-files"));
                assert_eq!(args, vec!["/srv"]);
                assert_eq!(env, vec![("LOG".to_string(), "debug".to_string())]);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_cli_parses_transport_kind() {
        let cli = Cli::try_parse_from([
            "toolmesh",
            "servers",
            "add",
            "events",
            "--url",
            "http://localhost:9000/sse",
            "--transport",
            "server-push",
        ])
        .unwrap();
        match cli.command {
            Commands::Servers {
                action: ServerAction::Add { transport, .. },
            } => assert_eq!(transport, Some(TransportKind::ServerPush)),
            _ => panic!("wrong command"),
        }
        assert!(Cli::try_parse_from([
            "toolmesh", "servers", "add", "x", "--url", "http://x", "--transport", "carrier-pigeon",
        ])
        .is_err());
    }

    #[test]
    fn test_parse_env_requires_equals() {
        assert_eq!(
            parse_env("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_env("nope").is_err());
    }

    #[test]
    fn test_user_config_sits_beside_config() {
        assert_eq!(
            default_user_config(Path::new("/etc/toolmesh/toolmesh.toml")),
            PathBuf::from("/etc/toolmesh/toolmesh.user.toml")
        );
        assert_eq!(
            default_user_config(Path::new("toolmesh.toml")),
            PathBuf::from("toolmesh.user.toml")
        );
    }
}
