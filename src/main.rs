//! Binary entrypoint for the meshgate CLI.
//!
//! Commands:
//! - `start [--bind <addr>]` - connect the configured radios and serve the HTTP API
//! - `init` - write a starter `config.toml`
//! - `check` - load and validate the configuration, then print a summary
//!
//! See the library crate docs for module-level details: `meshgate::`.
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::net::SocketAddr;

use meshgate::config::Config;
use meshgate::gateway::{api, Gateway};

#[derive(Parser)]
#[command(name = "meshgate")]
#[command(about = "Gateway and aggregation engine for Meshtastic mesh networks")]
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
    /// Connect to the configured devices and serve the API
    Start {
        /// HTTP bind address, overrides server.bind
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Write a starter configuration file
    Init,
    /// Validate the configuration file
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { bind } => {
            let mut config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            config.validate()?;
            info!("Starting meshgate v{}", env!("CARGO_PKG_VERSION"));
            if config.devices.is_empty() && !config.mqtt.enabled {
                warn!("No devices configured and MQTT disabled; the gateway will stay idle");
            }

            let addr: SocketAddr = config.server.bind.parse()?;
            let (gateway, tasks) = Gateway::start(&config)?;
            gateway.connect_on_start(&config);

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
            };
            let result = api::serve(gateway.clone(), addr, shutdown).await;
            gateway.shutdown().await;
            tasks.abort();
            result?;
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if std::path::Path::new(&cli.config).exists() {
                bail!("{} already exists; refusing to overwrite it", cli.config);
            }
            Config::create_default(&cli.config).await?;
            info!("Created default configuration at {}", cli.config);
            println!("Wrote {}. Edit the [[devices]] entries, then run `meshgate start`.", cli.config);
        }
        Commands::Check => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            config.validate()?;
            println!("Configuration OK: {}", cli.config);
            println!("  HTTP API:   {}", config.server.bind);
            for d in &config.devices {
                println!("  device:     {} ({}:{})", d.name, d.host, d.port);
            }
            println!("  channels:   {} extra key(s)", config.channel_keys()?.len());
            if config.mqtt.enabled {
                println!(
                    "  mqtt:       {}:{} root {}",
                    config.mqtt.host, config.mqtt.port, config.mqtt.root_topic
                );
            } else {
                println!("  mqtt:       disabled");
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    let file = log_file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("Cannot open log file {}: {}", path, e))
            .ok()
    });

    if let Some(f) = file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Mirror to the console only when someone is watching it
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
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
