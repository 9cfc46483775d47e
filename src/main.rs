use std::{error::Error, process};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};

use sandtable::{config::Config, events::sync_listener, table::Table};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Table address
    ///
    /// Hostname or IP address of the table on the local network.
    #[arg(value_name = "HOST", value_hint = ValueHint::Hostname)]
    host: String,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("sandtable", level);
    }

    logger.init();
}

/// Connects to the table and logs its state until interrupted.
///
/// # Errors
///
/// This function returns an error when the table cannot be reached on the
/// initial connection. Once connected, push channel drops are retried
/// internally and surface here only as state changes.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = Config::new();
    let table = Table::connect(&config, &args.host).await?;

    {
        let snapshot = table.clone();
        table.add_listener(sync_listener(move || {
            info!(
                "{}: {} (connected: {}), {:?} left of {:?}",
                snapshot.name().unwrap_or_else(|| snapshot.host().to_owned()),
                snapshot.state().unwrap_or_else(|| String::from("unknown")),
                snapshot.is_connected(),
                snapshot.remaining_time(),
                snapshot.total_time(),
            );
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down gracefully");
    table.close().await;

    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
