use std::{error::Error, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use exponential_backoff::Backoff;
use log::{debug, error, info, warn, LevelFilter};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use advouch::{
    config::Config,
    events::Event,
    handshake::Handshake,
    identity::{AuthError, FakeIdentityProvider, HttpIdentityProvider, IdentityProvider},
    profile::{FakeProfileApi, HttpProfileApi, ProfileApi},
    refresh::RefreshLoop,
    session::Session,
    store::Storage,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Session file
    ///
    /// Holds the persisted session, including credentials that grant access
    /// to your AdVouch account. Keep this file secure and do not share it.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("session.toml"))]
    session_file: String,

    /// Identity backend base URL
    #[arg(long, value_name = "URL", env = "ADVOUCH_IDENTITY_URL")]
    identity_url: Option<Url>,

    /// Resource backend base URL
    #[arg(long, value_name = "URL", env = "ADVOUCH_RESOURCE_URL")]
    resource_url: Option<Url>,

    /// Run against an in-memory identity provider
    ///
    /// No network access is made and the session is not persisted. The
    /// account type of the demo user can be set with --user-type.
    #[arg(long, default_value_t = false)]
    demo: bool,

    /// Account type reported for the demo user
    ///
    /// For example "business_owner" or "advertiser".
    #[arg(long, value_name = "TYPE", requires = "demo")]
    user_type: Option<String>,

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
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Starts the handshake, backing off while the identity backend is
/// unreachable. Non-retryable errors are returned immediately.
async fn authorize_with_retry(handshake: &Handshake) -> Result<String, AuthError> {
    const ATTEMPTS: u32 = 5;
    let backoff = Backoff::new(ATTEMPTS, Duration::from_secs(1), Duration::from_secs(30));

    for duration in &backoff {
        match handshake.authorize().await {
            Ok(auth_url) => return Ok(auth_url),
            Err(e) if e.is_retryable() => match duration {
                Some(duration) => {
                    warn!("{e}, retrying in {:.1}s", duration.as_secs_f32());
                    tokio::time::sleep(duration).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }

    Err(AuthError::Connection(format!(
        "identity backend unreachable after {ATTEMPTS} attempts"
    )))
}

/// Extracts the handshake triple from a pasted callback URL.
///
/// Absent parameters come back as empty strings; the handshake rejects
/// those. Only an unparseable line returns `None`.
fn parse_callback(line: &str) -> Option<(String, String, String)> {
    let url = Url::parse(line.trim()).ok()?;

    let mut session_id = String::new();
    let mut state = String::new();
    let mut code = String::new();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "session_id" => session_id = value.into_owned(),
            "state" => state = value.into_owned(),
            "code" => code = value.into_owned(),
            _ => {}
        }
    }

    Some((session_id, state, code))
}

/// Interactive login: prints the authorization URL, reads the callback URL
/// from stdin and completes the handshake.
///
/// Rejected callbacks restart the flow with a fresh handshake; only an
/// unreachable backend or a closed stdin aborts.
async fn login(handshake: &Handshake) -> Result<(), Box<dyn Error>> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        let auth_url = authorize_with_retry(handshake).await?;

        // Deliberately on stdout, not the logger: this is the user prompt.
        println!("Open this URL in your browser and sign in:");
        println!("\n    {auth_url}\n");
        println!("Then paste the URL you were redirected to:");

        let Some(line) = lines.next_line().await? else {
            return Err("stdin closed before the callback URL was provided".into());
        };

        let Some((session_id, state, code)) = parse_callback(&line) else {
            warn!("that does not look like a URL, starting over");
            continue;
        };

        match handshake
            .complete_authentication(&session_id, &state, &code)
            .await
        {
            Ok(route) => {
                info!("signed in, landing at {route}");
                return Ok(());
            }
            Err(e) => {
                // The handshake is spent either way; start a fresh one.
                error!("{e}");
                info!("restarting login");
            }
        }
    }
}

/// Main application loop.
///
/// Composes the session, identity provider and refresh loop, performs the
/// interactive login unless a persisted session was restored, then keeps the
/// session alive until interrupted or logged out.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = Config::new();
    if let Some(url) = args.identity_url {
        config.identity_url = url;
    }
    if let Some(url) = args.resource_url {
        config.resource_url = url;
    }
    config.device_name =
        sysinfo::System::host_name().unwrap_or_else(|| config.app_name.clone());

    let session = if args.demo {
        Arc::new(Session::in_memory())
    } else {
        Arc::new(Session::with_storage(Storage::new(&args.session_file)))
    };

    let provider: Arc<dyn IdentityProvider> = if args.demo {
        let mut provider = FakeIdentityProvider::new();
        if let Some(user_type) = args.user_type {
            provider = provider.with_user_type(user_type);
        }
        Arc::new(provider)
    } else {
        Arc::new(HttpIdentityProvider::new(&config)?)
    };

    let profiles: Arc<dyn ProfileApi> = if args.demo {
        Arc::new(FakeProfileApi::new())
    } else {
        Arc::new(HttpProfileApi::new(&config)?)
    };

    let handshake = Handshake::new(
        Arc::clone(&provider),
        Arc::clone(&profiles),
        Arc::clone(&session),
    );

    if session.is_authenticated() {
        info!("restored persisted session from {}", args.session_file);
    } else {
        login(&handshake).await?;
    }

    let refresh = Arc::new(RefreshLoop::new(
        Arc::clone(&provider),
        Arc::clone(&session),
    ));
    let shutdown = CancellationToken::new();
    let refresh_task = tokio::spawn({
        let refresh = Arc::clone(&refresh);
        let shutdown = shutdown.child_token();
        async move { refresh.run(shutdown).await }
    });

    let mut events = session.subscribe();
    let result = loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                handshake.logout().await;
                break Ok(());
            }

            event = events.recv() => match event {
                Ok(Event::LoggedOut) => {
                    info!("logged out");
                    break Ok(());
                }
                Ok(Event::SessionExpired) => {
                    // A browser client would keep going until the next 401.
                    // Headless there is no next request coming, so the
                    // deferred logout is finalized here.
                    warn!("session expired");
                    handshake.logout().await;
                    break Ok(());
                }
                Ok(event) => debug!("session event: {event:?}"),
                Err(e) => break Err(e.into()),
            }
        }
    };

    shutdown.cancel();
    let _ = refresh_task.await;

    result
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
