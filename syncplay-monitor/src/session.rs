//! Session wiring for the monitor
//!
//! Connects to the coordination service, binds the simulated player and
//! keeps the shared metrics in step with the session.

use clap::Parser;
use parking_lot::RwLock;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use syncplay_core::player::new_shared_registry;
use syncplay_core::{
    logging, HttpGroupService, PlayerKind, Session, SessionEvent, SessionHandle, SyncProfile, SyncSettings,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::metrics::{describe, LogLevel, Metrics};
use crate::player::{SimTiming, SimulatedPlayer};

/// How often the dashboard view is refreshed from a full snapshot
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// SyncPlay Monitor
///
/// Follows the group you are in with a simulated player.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(author, version, about, long_about = None)]
pub struct Options {
    /// Base URL of the media server
    #[arg(long, env = "SYNCPLAY_SERVER")]
    pub server: String,

    /// Access token sent with every request
    #[arg(long, env = "SYNCPLAY_TOKEN")]
    pub token: Option<String>,

    /// Sync settings file (JSON), created by the core on save
    #[arg(long = "settings")]
    pub settings_path: Option<PathBuf>,

    /// Threshold preset: conservative, balanced, aggressive, custom
    #[arg(long)]
    pub profile: Option<SyncProfile>,

    /// Plain logging instead of the dashboard
    #[arg(long)]
    pub no_dashboard: bool,
}

impl Options {
    pub fn dashboard(&self) -> bool {
        !self.no_dashboard
    }

    fn settings(&self) -> Result<SyncSettings, Box<dyn Error>> {
        let mut settings = match &self.settings_path {
            Some(path) => SyncSettings::load_or_default(path)?,
            None => SyncSettings::default(),
        };
        if let Some(profile) = self.profile {
            settings.apply_profile(profile);
        }
        Ok(settings)
    }
}

/// A running session with the simulated player bound
pub struct Connection {
    pub handle: SessionHandle,
    pub events: broadcast::Receiver<SessionEvent>,
    pub player: Arc<SimulatedPlayer>,
}

/// Start the session, bind the simulated player and look for a group to follow
pub async fn connect(options: &Options) -> Result<Connection, Box<dyn Error>> {
    let mut service = HttpGroupService::new(options.server.clone())?;
    if let Some(token) = &options.token {
        service = service.with_token(token.clone());
    }
    let settings = options.settings()?;
    info!("Using {} sync profile", settings.profile.as_str());

    let (handle, events) = Session::new(settings, Arc::new(service), new_shared_registry()).start();

    let player = SimulatedPlayer::new(handle.player_events(), SimTiming::default());
    player.spawn_ticker();
    handle.register_player(player.clone());
    handle.bind_player(PlayerKind::Video)?;

    Ok(Connection { handle, events, player })
}

/// Ask the service which group we are in and join it
async fn join(handle: &SessionHandle, metrics: Option<&RwLock<Metrics>>) {
    let outcome = handle.refresh_joined_state(true).await;
    let line = match &outcome {
        Ok(true) => (LogLevel::Group, "Following the current group".to_string()),
        Ok(false) => (LogLevel::Warning, "Not in a group; join one from a client first".to_string()),
        Err(e) => (LogLevel::Error, format!("Joined state unavailable: {}", e)),
    };
    match metrics {
        Some(metrics) => metrics.write().log(line.0, line.1),
        None if outcome.is_err() => error!("{}", line.1),
        None => info!("{}", line.1),
    }
}

/// Keep the metrics in step with the session until it closes
pub async fn run_with_dashboard(connection: Connection, metrics: Arc<RwLock<Metrics>>) {
    let Connection {
        handle,
        mut events,
        player,
    } = connection;

    join(&handle, Some(metrics.as_ref())).await;

    let mut refresh = tokio::time::interval(SNAPSHOT_INTERVAL);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => metrics.write().apply_event(&event),
                Err(RecvError::Lagged(n)) => {
                    metrics.write().log(LogLevel::Warning, format!("Dropped {} session events", n));
                }
                Err(RecvError::Closed) => break,
            },
            _ = refresh.tick() => {
                let Ok(snapshot) = handle.snapshot().await else {
                    break;
                };
                let mut m = metrics.write();
                m.apply_snapshot(&snapshot);
                m.position_ms = player.position_ms();
            }
        }
    }

    metrics.write().log(LogLevel::Error, "Session closed");
}

/// Plain logging mode: session events go to the tracing output
pub async fn run_with_logging(options: &Options) -> Result<(), Box<dyn Error>> {
    logging::init_tracing();
    info!("SyncPlay monitor starting against {}", options.server);

    let Connection {
        handle,
        mut events,
        player,
    } = connect(options).await?;

    join(&handle, None).await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some((level, message)) = describe(&event) {
                        match level {
                            LogLevel::Error => error!("{}", message),
                            LogLevel::Warning => warn!("{}", message),
                            _ => info!("[{}] {}", level.as_str(), message),
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Dropped {} session events", n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!(
                    "Shutting down at {:.0}ms (rate x{:.2})",
                    player.position_ms(),
                    player.rate()
                );
                handle.shutdown();
                break;
            }
        }
    }

    Ok(())
}
