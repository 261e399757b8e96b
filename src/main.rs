//! fritzlink - command line client for the Fritz!Box.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use fritzlink as app;
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;

use app::call_list::{CallElement, CallType};
use app::config::{AppConfig, ConfigLoadResult};
use app::fonbook::Fonbook;
use app::listener::{CallInfo, EventHandler};
use app::service::FritzService;

/// Command line client for the Fritz!Box call monitor, call list and phonebooks.
#[derive(Parser)]
#[command(name = "fritzlink", version)]
struct Cli {
    /// Config file to use instead of the one next to the executable
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use fritzlink.toml from current directory (dev mode)
    #[arg(long, global = true)]
    dev: bool,

    /// Also write a daily rotated log file into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print calls reported by the call monitor until interrupted
    Monitor,
    /// Print the call list
    Calls {
        #[arg(long, value_enum, default_value_t = Kind::All)]
        kind: Kind,
        #[arg(long, value_enum, default_value_t = SortBy::Date)]
        sort: SortBy,
        /// Sort descending
        #[arg(long)]
        desc: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the entries of a phonebook
    Phonebook {
        /// Tech id of the phonebook, the active one if omitted
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Look up the name for a phone number
    Resolve { number: String },
    /// Let the device dial a number
    Dial { number: String },
    /// Reconnect the internet connection
    Reconnect,
    /// Print the external IP address
    Ip,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    All,
    Incoming,
    Missed,
    Outgoing,
}

impl From<Kind> for CallType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::All => CallType::All,
            Kind::Incoming => CallType::Incoming,
            Kind::Missed => CallType::Missed,
            Kind::Outgoing => CallType::Outgoing,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SortBy {
    Type,
    Date,
    Name,
    Number,
    Local,
    Duration,
}

impl From<SortBy> for CallElement {
    fn from(sort: SortBy) -> Self {
        match sort {
            SortBy::Type => CallElement::Type,
            SortBy::Date => CallElement::Date,
            SortBy::Name => CallElement::RemoteName,
            SortBy::Number => CallElement::RemoteNumber,
            SortBy::Local => CallElement::LocalNumber,
            SortBy::Duration => CallElement::Duration,
        }
    }
}

/// Prints call monitor events to stdout.
struct PrintHandler;

#[async_trait]
impl EventHandler for PrintHandler {
    async fn handle_call(&self, call: CallInfo) {
        let direction = if call.outgoing { "->" } else { "<-" };
        println!(
            "[{}] {direction} {} ({}) on {} via {}",
            call.conn_id, call.remote_name, call.remote_number, call.local_number, call.medium_name
        );
    }

    async fn handle_connect(&self, conn_id: u32) {
        println!("[{conn_id}] connected");
    }

    async fn handle_disconnect(&self, conn_id: u32, duration: &str) {
        println!("[{conn_id}] finished after {duration} s");
    }
}

fn init_logging(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "fritzlink.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_env_filter(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
            None
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_dir.as_ref());

    // Determine config path based on mode
    let config_path = match (&cli.config, cli.dev) {
        (Some(path), _) => path.clone(),
        (None, true) => {
            tracing::info!("Dev mode: loading config from current directory");
            PathBuf::from("fritzlink.toml")
        }
        (None, false) => AppConfig::default_path(),
    };
    tracing::debug!("Config path: {:?}", config_path);

    let command = match cli.command {
        Command::Init { force } => return write_default_config(&config_path, force),
        command => command,
    };

    let config = match AppConfig::try_load(&config_path) {
        ConfigLoadResult::Loaded(config) => config,
        ConfigLoadResult::Missing => {
            bail!("{} not found, create it with 'fritzlink init'", config_path.display())
        }
        ConfigLoadResult::Invalid(e) => bail!("Config invalid: {e}"),
    };

    let mut service = FritzService::setup(config)?;
    let report = service.init().await;
    if !report.valid_password {
        tracing::warn!("Login failed, check username and password");
    }

    let result = run(&mut service, command).await;
    service.shutdown().await;
    result
}

fn write_default_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, use --force to overwrite", path.display());
    }
    AppConfig::default()
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn run(service: &mut FritzService, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Init { .. } => {}
        Command::Monitor => {
            service.create_fonbook_manager().await;
            service.create_call_list().await;
            service.create_listener(Some(Arc::new(PrintHandler)))?;
            println!("Listening for calls, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
        }
        Command::Calls { kind, sort, desc, json } => {
            let call_list = service.create_call_list().await;
            call_list.wait_ready().await;
            if !call_list.is_valid() {
                bail!("Could not fetch the call list");
            }
            call_list.sort(sort.into(), !desc);
            let kind = CallType::from(kind);
            let calls: Vec<_> = call_list
                .entries(CallType::All)
                .into_iter()
                .filter(|call| kind == CallType::All || call.call_type == kind)
                .collect();
            if json {
                print_json(&calls)?;
            } else {
                for call in &calls {
                    println!(
                        "{:<9} {} {:<5} {:<24} {:<16} {:<16} {}",
                        format!("{:?}", call.call_type),
                        call.date,
                        call.time,
                        call.remote_name,
                        call.remote_number,
                        call.local_number,
                        call.duration
                    );
                }
            }
        }
        Command::Phonebook { id, json } => {
            let fonbooks = service.create_fonbook_manager().await;
            fonbooks.wait_ready().await;
            let fonbook = match &id {
                Some(id) => fonbooks.fonbook(id).with_context(|| format!("unknown phonebook {id}"))?,
                None => fonbooks.active_fonbook().context("no displayable phonebook enabled")?,
            };
            let entries = fonbook.entries();
            if json {
                print_json(&entries)?;
            } else {
                println!("{} ({} entries)", fonbook.title(), entries.len());
                for entry in &entries {
                    let numbers: Vec<String> = entry
                        .numbers
                        .iter()
                        .map(|n| format!("{} ({})", n.number, n.kind.xml_name()))
                        .collect();
                    let mark = if entry.important { "*" } else { " " };
                    println!("{mark} {:<30} {}", entry.name, numbers.join(", "));
                }
            }
        }
        Command::Resolve { number } => {
            let fonbooks = service.create_fonbook_manager().await;
            fonbooks.wait_ready().await;
            let result = fonbooks.resolve_to_name(&number).await;
            if result.successful {
                println!("{} ({})", result.name, result.kind.xml_name());
            } else {
                println!("{number} not found");
            }
        }
        Command::Dial { number } => {
            if !service.api().init_call(&number).await {
                bail!("Could not dial {number}");
            }
            println!("Dialing {number}, pick up the phone");
        }
        Command::Reconnect => {
            if !service.api().reconnect_isp().await {
                bail!("Reconnect failed");
            }
            println!("Reconnect requested");
        }
        Command::Ip => match service.api().current_ip().await {
            Some(ip) => println!("{ip}"),
            None => bail!("Could not determine the external IP address"),
        },
    }
    Ok(())
}
