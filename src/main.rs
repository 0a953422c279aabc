//! BloomBell CLI - headless host for the roster watcher and platform linking.
//!
//! This is the main binary entry point. See the `bloombell` library for the
//! core functionality.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bloombell::auth::{Launchers, SystemBrowser};
use bloombell::context::{IdentityProvider, SharedIdentity};
use bloombell::notifications::NotificationSender;
use bloombell::platforms::{HttpPlatformClient, PlatformLinks, PlatformService};
use bloombell::roster::{FileRosterSource, RosterSource};
use bloombell::{
    constants, AuthCoordinator, AuthLifecycleEvent, AuthState, Config, Monitor, Provider,
    RosterTracker, Services, SocketChannel, ThresholdNotifier,
};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Global allocator.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "bloombell")]
#[command(version)]
#[command(about = "Get pinged when your party fills up")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a roster file and notify when the party reaches the threshold
    Watch {
        /// JSON roster document, re-read on every poll
        #[arg(long)]
        roster: PathBuf,
        /// Frame interval in milliseconds
        #[arg(long, default_value_t = constants::FRAME_INTERVAL.as_millis() as u64)]
        interval_ms: u64,
    },
    /// Link a notification platform via OAuth
    Link {
        /// Provider key (e.g. "discord")
        provider: String,
        /// Local identity id
        #[arg(long)]
        user_id: u64,
    },
    /// Show which platforms are linked
    Status {
        /// Local identity id
        #[arg(long)]
        user_id: u64,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("BLOOMBELL_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    } else {
        builder.target(env_logger::Target::Stderr);
    }

    builder.init();
    Ok(())
}

async fn run_watch(config: Config, roster: PathBuf, interval: Duration) -> Result<()> {
    let source = Arc::new(FileRosterSource::new(&roster));
    source
        .read()
        .with_context(|| format!("Cannot watch {}", roster.display()))?;

    let services = Services::headless(Arc::clone(&source) as Arc<dyn IdentityProvider>);
    let tracker = RosterTracker::new(
        Arc::clone(&source) as Arc<dyn RosterSource>,
        Arc::clone(&services.identity),
        Arc::clone(&services.clock),
    );
    let sender = NotificationSender::with_default_client(config.notify_url())?;
    let notifier = ThresholdNotifier::new(
        config.notifier_settings(),
        Arc::clone(&services.focus),
        Arc::new(sender),
    );
    let monitor = Monitor::new(tracker, notifier, Arc::clone(&services.identity));

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    log::info!(
        "Watching {} (threshold {}, paused: {})",
        roster.display(),
        config.max_party_size,
        config.pause_notifications
    );
    monitor.run(interval, shutdown).await;
    Ok(())
}

async fn run_link(mut config: Config, provider: &str, user_id: u64) -> Result<()> {
    let identity = Arc::new(SharedIdentity::new(user_id));
    let services = Services::headless(identity);
    let links = Arc::new(PlatformLinks::new(config.platform_status()));

    let (channel, channel_events) = SocketChannel::new(config.socket_url.clone());
    let launchers = Launchers::standard(&channel, &config.callback_url(), Arc::new(SystemBrowser));
    let coordinator = AuthCoordinator::new(
        Arc::clone(&services.identity),
        Arc::clone(&services.bus),
        launchers,
        Arc::clone(&links),
        channel_events,
    );

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    services.bus.subscribe(move |event: &AuthLifecycleEvent| {
        println!("{}: {:?}", event.provider.display_name(), event.state);
        if event.state.is_terminal() {
            let _ = done_tx.send(*event);
        }
    });

    let provider: Provider = coordinator.authenticate_with(provider)?;
    println!(
        "Waiting for {}. If no browser opens, sign in at {}",
        provider.display_name(),
        config.login_url()
    );

    let outcome = tokio::select! {
        event = done_rx.recv() => event,
        _ = tokio::signal::ctrl_c() => {
            // Cancelling publishes the terminal event synchronously.
            let _ = coordinator.cancel_authentication();
            done_rx.recv().await
        }
    };

    coordinator.dispose();
    channel.dispose();
    services.bus.dispose();

    match outcome.map(|event| event.state) {
        Some(AuthState::Completed) => {
            config.discord_linked = links.snapshot().discord;
            config.save()?;
            println!("{} linked.", provider.display_name());
            Ok(())
        }
        Some(state) => anyhow::bail!("{} linking ended: {:?}", provider.display_name(), state),
        None => anyhow::bail!("{} linking ended without a result", provider.display_name()),
    }
}

async fn run_status(mut config: Config, user_id: u64) -> Result<()> {
    let client = HttpPlatformClient::with_default_client(config.platforms_url())?;
    let links = Arc::new(PlatformLinks::new(config.platform_status()));
    let service = PlatformService::new(Arc::new(client), links);

    let status = service.refresh(user_id).await;
    for provider in Provider::ALL {
        let state = if status.is_linked(provider) {
            "linked"
        } else {
            "not linked"
        };
        println!("{}: {}", provider.display_name(), state);
    }

    config.discord_linked = status.discord;
    config.save()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Watch {
            roster,
            interval_ms,
        } => run_watch(config, roster, Duration::from_millis(interval_ms.max(1))).await,
        Commands::Link { provider, user_id } => run_link(config, &provider, user_id).await,
        Commands::Status { user_id } => run_status(config, user_id).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
