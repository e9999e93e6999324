//! genproxy CLI

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use genproxy::config::{Config, Mode};
use genproxy::network::{HttpHandler, NetworkHandler};
use genproxy::storage::RedisStore;

struct Args {
    mode: Option<Mode>,
    config: Option<PathBuf>,
    destination: Option<String>,
    verbose: bool,
}

fn usage() -> ! {
    eprintln!("genproxy v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: genproxy [record|playback] [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <FILE>          TOML configuration file");
    eprintln!("  --destination <REGEX>    Hosts to record or play back");
    eprintln!("  -v                       Verbose logging");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  ProxyPort                Listen port (default 8500)");
    eprintln!("  RedisAddress             Redis URL for recorded responses");
    process::exit(1);
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        mode: None,
        config: None,
        destination: None,
        verbose: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "record" | "-record" | "--record" => args.mode = Some(Mode::Record),
            "playback" => args.mode = Some(Mode::Playback),
            "-v" | "--verbose" => args.verbose = true,
            "--config" => {
                let path = iter.next().context("--config needs a file")?;
                args.config = Some(PathBuf::from(path));
            }
            "-destination" | "--destination" => {
                args.destination = Some(iter.next().context("--destination needs a pattern")?);
            }
            "-h" | "--help" => usage(),
            other => bail!("Unknown argument: {other}"),
        }
    }

    Ok(args)
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Run 'genproxy --help' for usage information.");
            process::exit(1);
        }
    };

    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(destination) = args.destination {
        config.destination = destination;
    }
    config.apply_env().context("reading environment")?;
    config.validate()?;

    let store = RedisStore::connect(
        &config.store.address,
        config.store.prefix.clone(),
        config.timeouts.store(),
    )
    .await
        .with_context(|| format!("connecting to Redis at {}", config.store.address))?;

    info!(
        "Starting proxy in {:?} mode: store {}, destination {}, port {}",
        config.mode, config.store.address, config.destination, config.listen_port
    );
    if config.mode.is_record() {
        info!("Live responses for matching hosts will overwrite existing recordings");
    }

    let http = HttpHandler::from_config(&config, Arc::new(store))?;
    NetworkHandler::new(&config, Arc::new(http)).run().await?;

    Ok(())
}
