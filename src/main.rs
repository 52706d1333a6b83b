//! Binary entrypoint for the meshchat CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `start [--target <hint>] [--simulate]` - run the client with a line-oriented console
//! - `history [--channel <n> | --peer <name>]` - print the stored conversation log
//! - `status` - print configuration and cache statistics
//!
//! See the library crate docs for module-level details: `meshchat::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use meshchat::client::{MeshClient, UiCommand, UiEvent};
use meshchat::config::Config;
use meshchat::models::{format_timestamp, ConversationSelector, Message};
use meshchat::responder::{CannedResponder, Responder};
use meshchat::storage::MessageStore;
use meshchat::supervisor::ConnectionState;
use meshchat::transport::sim::SimDevice;

#[derive(Parser)]
#[command(name = "meshchat")]
#[command(about = "Chat client core for mesh radio companion devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the client
    Start {
        /// Device connect target (BLE address, serial path, host:port)
        #[arg(short, long)]
        target: Option<String>,

        /// Talk to the built-in simulated radio
        #[arg(long)]
        simulate: bool,
    },
    /// Write a default configuration file
    Init,
    /// Print stored messages
    History {
        /// Only this channel index
        #[arg(long, conflicts_with = "peer")]
        channel: Option<u8>,
        /// Only direct messages with this contact
        #[arg(long)]
        peer: Option<String>,
    },
    /// Show configuration and cache statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    if !matches!(cli.command, Commands::Init) {
        init_logging(&pre_config, cli.verbose);
    }

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("Created default configuration at {}", cli.config);
            println!("Set [device] target, then run: meshchat start");
        }
        Commands::Start { target, simulate } => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            run_client(config, target, simulate).await?;
        }
        Commands::History { channel, peer } => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            let store = MessageStore::load(&config.storage.cache_file);
            let selector = match (channel, peer) {
                (Some(idx), _) => Some(ConversationSelector::Channel(idx)),
                (None, Some(name)) => Some(ConversationSelector::Direct(name)),
                (None, None) => None,
            };
            let lines: Vec<&Message> = match &selector {
                Some(sel) => store.filter_for(sel),
                None => store.messages().iter().collect(),
            };
            if lines.is_empty() {
                println!("No messages.");
            }
            for m in lines {
                println!("{}", render_line(m));
            }
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            let store = MessageStore::load(&config.storage.cache_file);
            println!("meshchat v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Target: {}",
                if config.device.target.is_empty() {
                    "(not set)"
                } else {
                    config.device.target.as_str()
                }
            );
            println!("Cache: {} ({} messages)", config.storage.cache_file, store.len());
            let policy = config.delivery_policy();
            let backoff = config.backoff_policy();
            println!(
                "Delivery: {} retries, +{}ms ack margin; reconnect {}ms..{}ms",
                policy.max_retries,
                policy.ack_margin.as_millis(),
                backoff.base.as_millis(),
                backoff.cap.as_millis()
            );
            for conv in store.conversations() {
                let msgs = store.filter_for(&conv);
                let failed = msgs
                    .iter()
                    .filter(|m| m.delivery_status == Some(meshchat::models::DeliveryStatus::Failed))
                    .count();
                println!("  {:<24} {:>5} messages, {} failed", conv.to_string(), msgs.len(), failed);
            }
        }
    }

    Ok(())
}

async fn run_client(config: Config, target: Option<String>, simulate: bool) -> Result<()> {
    let mut config = config;
    if let Some(t) = target {
        config.device.target = t;
    }
    if !simulate {
        warn!("No hardware radio driver is built into this binary; using the simulated device");
    }
    if config.device.target.is_empty() {
        config.device.target = "sim".to_string();
    }

    info!("Starting meshchat v{}", env!("CARGO_PKG_VERSION"));
    let store = MessageStore::load(&config.storage.cache_file);
    let responder: Option<Arc<dyn Responder>> = if config.responder.enabled {
        Some(Arc::new(CannedResponder::new(config.responder.canned_reply.clone())))
    } else {
        None
    };
    let (client, mut handle) =
        MeshClient::new(&config, store, Arc::new(SimDevice::demo()), responder);
    let client_task = tokio::spawn(client.run());

    let commands = handle.commander();
    tokio::spawn(read_console(commands.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; shutting down");
            let _ = commands.send(UiCommand::Shutdown);
        }
    });

    let mut last_state = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            UiEvent::StateChanged(state) => {
                let line = match (state.connection, state.retry_in_secs) {
                    (ConnectionState::Disconnected, Some(secs)) => {
                        format!("disconnected, retry in {}s", secs)
                    }
                    (s, _) => format!("{} ({})", format!("{:?}", s).to_lowercase(), state.target),
                };
                if last_state.as_ref() != Some(&line) {
                    println!("-- {}", line);
                    last_state = Some(line);
                }
            }
            UiEvent::MessageAdded(m) => println!("{}", render_line(&m)),
            UiEvent::MessageStatusChanged { id, status } => {
                println!("   {} {}", short_id(&id), status.glyph())
            }
            UiEvent::Notice(n) => println!("!! {}", n),
        }
    }
    let _ = client_task.await;
    Ok(())
}

/// Read console lines into UI commands until EOF or `/quit`.
async fn read_console(commands: mpsc::UnboundedSender<UiCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut current = ConversationSelector::Channel(0);
    let _ = commands.send(UiCommand::SelectConversation(current.clone()));
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        let cmd = if let Some(rest) = line.strip_prefix("/c ") {
            match rest.trim().parse::<u8>() {
                Ok(idx) => {
                    current = ConversationSelector::Channel(idx);
                    UiCommand::SelectConversation(current.clone())
                }
                Err(_) => {
                    println!("!! usage: /c <channel index>");
                    continue;
                }
            }
        } else if let Some(rest) = line.strip_prefix("/d ") {
            current = ConversationSelector::Direct(rest.trim().to_string());
            UiCommand::SelectConversation(current.clone())
        } else if let Some(rest) = line.strip_prefix("/connect ") {
            UiCommand::ConnectTo(rest.trim().to_string())
        } else {
            match line {
                "" => continue,
                "/reconnect" => UiCommand::Reconnect,
                "/disconnect" => UiCommand::Disconnect,
                "/quit" => UiCommand::Shutdown,
                text => UiCommand::SendMessage {
                    conversation: current.clone(),
                    text: text.to_string(),
                },
            }
        };
        let quit = cmd == UiCommand::Shutdown;
        if commands.send(cmd).is_err() || quit {
            return;
        }
    }
    let _ = commands.send(UiCommand::Shutdown);
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn render_line(m: &Message) -> String {
    let conv = m
        .conversation()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "?".to_string());
    let status = m.delivery_status.map(|s| s.glyph()).unwrap_or("");
    let auto = if m.is_automated_reply { " [auto]" } else { "" };
    format!(
        "{} [{}] {} {}: {}{} {}",
        format_timestamp(m.timestamp),
        conv,
        short_id(&m.id),
        m.sender_label(),
        m.text,
        auto,
        status
    )
    .trim_end()
    .to_string()
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // -v overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    match log_file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Echo to the console only in an interactive terminal
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
