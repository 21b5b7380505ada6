use std::{io::BufRead, path::PathBuf, process, sync::Arc, thread, time::Duration};

use clap::{command, Parser, Subcommand, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::sync::mpsc;
use url::Url;

use lockstep::{
    client::{Client, Command},
    clock,
    config::Config,
    discovery::Discovery,
    error::{Error, ErrorKind, Result},
    host::Host,
    http::{self, SyncServer},
    player::Player,
    remote::HttpProvider,
    resolver::Resolver,
    secrets::Secrets,
    signal::Signals,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, PartialEq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Configuration file
    ///
    /// Values from the file are overridden by command line arguments and
    /// environment variables.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Secrets file
    ///
    /// Ensure that this file is kept secure and not shared publicly, as it
    /// contains the token that grants access to your music account.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value = "secrets.toml")]
    secrets_file: PathBuf,

    /// Sync server URL
    ///
    /// [default: http://localhost:5400]
    #[arg(long, value_hint = ValueHint::Url, env = "SYNC_SERVER")]
    server: Option<Url>,

    /// Room to host or join
    #[arg(short, long, env = "SYNC_ROOM")]
    room: Option<String>,

    /// Initial volume, from 0.0 to 1.0
    #[arg(long)]
    volume: Option<f32>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
enum Mode {
    /// Publish what is playing to a room
    Host,

    /// Play along with a room
    ///
    /// Reads commands from standard input: `vol N` sets the volume (0 to 1,
    /// or a percentage), `resync` reloads the track at the host's position.
    Join,
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
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Layers command line arguments over the configuration file.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(server) = &args.server {
        config.server = server.clone();
    }
    if let Some(room) = &args.room {
        config.room = Some(room.clone());
    }
    if let Some(volume) = args.volume {
        config.volume = volume;
    }

    config.validate()?;
    Ok(config)
}

/// Loads the secrets file. A missing file means running without a token.
fn load_secrets(path: &PathBuf) -> Result<Secrets> {
    match Secrets::from_file(path) {
        Ok(secrets) => Ok(secrets),
        Err(e) if e.kind == ErrorKind::NotFound => {
            info!(
                "{} not found; continuing without a token (see secrets.toml.example)",
                path.display()
            );
            Ok(Secrets::default())
        }
        Err(e) => Err(e),
    }
}

async fn host(config: Config, secrets: Secrets) -> Result<()> {
    let clock = clock::system();
    let client = Arc::new(http::Client::new(&config)?);

    let mut builder = Discovery::builder(Arc::clone(&clock))
        .prefer(config.prefer)
        .poll_mode(config.poll_mode);
    for source in &config.require {
        builder = builder.require(*source);
    }
    if let Some(remote) = &config.remote {
        builder = builder.remote(Arc::new(HttpProvider::new(
            Arc::clone(&client),
            remote.endpoint.clone(),
            remote.source,
            secrets.token.clone(),
            tokio::runtime::Handle::current(),
        )));
    }
    let discovery = Arc::new(builder.build()?);

    // Retry with jitter so that a fleet of hosts does not hammer a server
    // that just came back.
    let mut host = loop {
        let server = SyncServer::new(Arc::clone(&client), config.server.clone());
        match Host::create(server, Arc::clone(&discovery), config.room.as_deref()).await {
            Ok(host) => break host,
            Err(e) if e.is_transient() => {
                let duration = Duration::from_millis(fastrand::u64(5_000..6_000));
                warn!("{e}; retrying in {:.1}s", duration.as_secs_f32());
                tokio::time::sleep(duration).await;
            }
            Err(e) => return Err(e),
        }
    };

    let mut signals = Signals::new()?;
    let result = loop {
        tokio::select! {
            // Prioritize signals.
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("received {signal}, shutting down gracefully");
                    break Ok(());
                }
                info!("received {signal}, republishing");
                host.resync();
            }

            result = host.run() => break result,
        }
    };

    host.stop();
    result
}

async fn join(config: Config, secrets: Secrets) -> Result<()> {
    let room = config
        .room
        .clone()
        .ok_or_else(|| Error::invalid_argument("a room is required to join"))?;

    let clock = clock::system();
    let client = Arc::new(http::Client::new(&config)?);

    let mut resolver = Resolver::new(Arc::clone(&client), secrets.token.clone());
    if let Some(endpoint) = config.resolver.clone() {
        resolver = resolver.with_endpoint(endpoint);
    } else {
        warn!("no resolver configured; tracks cannot be played");
    }

    let player = Player::from_config(&config, Arc::clone(&clock))?;
    let server = SyncServer::new(client, config.server.clone());
    let mut client = Client::new(server, resolver, player, room, config.poll_interval, clock);

    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    let stdin_tx = commands_tx.clone();
    thread::Builder::new()
        .name("stdin".to_owned())
        .spawn(move || {
            for line in std::io::stdin().lock().lines().map_while(std::result::Result::ok) {
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Some(command) => {
                        if stdin_tx.send(command).is_err() {
                            break;
                        }
                    }
                    None => warn!("unknown command: {line}"),
                }
            }
        })?;

    info!("joining room {}", client.room());
    let mut signals = Signals::new()?;
    loop {
        tokio::select! {
            // Prioritize signals.
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("received {signal}, shutting down gracefully");
                    break;
                }
                let _ = commands_tx.send(Command::Resync);
            }

            () = client.run(&mut commands) => break,
        }
    }

    client.close()
}

/// Main application entry.
///
/// # Errors
///
/// Returns an error for invalid configuration, a missing playback source or
/// audio device, or an unreachable sync server that refuses to recover.
async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let secrets = load_secrets(&args.secrets_file)?;
    debug!("{secrets:?}");

    match args.mode {
        Mode::Host => host(config, secrets).await,
        Mode::Join => join(config, secrets).await,
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the selected mode.
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
