//! Bridge Coordinator — thin CLI front-end over the coordinator library:
//! `run` drives the foreground supervisor loop, `status` and `restart`
//! talk to an already-running instance over its own HTTP surface.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use bridge_core::audio::AudioAdapter;
use bridge_core::config::SettingsStore;
use bridge_core::hotkey::HotkeyListener;
use bridge_core::logring::{LogRing, LogRingLayer};
use bridge_core::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "bridge-coordinator", about = "Local control plane for remote mic-mute and volume control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor loop in the foreground.
    Run,
    /// Query a running instance's status over HTTP.
    Status,
    /// Ask a running instance to restart its HTTP component.
    Restart,
}

/// Install the global tracing subscriber, composing the usual formatted
/// output layer with `LogRingLayer` so `GET /logs` can surface recent
/// entries from the same stream.
fn init_logging(log_ring: Arc<LogRing>) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(LogRingLayer::new(log_ring))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_ring = Arc::new(LogRing::default());
    init_logging(Arc::clone(&log_ring));

    match cli.command {
        Commands::Run => run(log_ring).await,
        Commands::Status => query("/status").await,
        Commands::Restart => post("/restart").await,
    }
}

async fn run(log_ring: Arc<LogRing>) {
    let settings = SettingsStore::load_from_disk();
    let port = settings.current().port;
    let hotkey_str = settings.current().hotkey.clone();

    let audio = match build_audio_adapter() {
        Ok(adapter) => adapter,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize audio device adapter, exiting");
            std::process::exit(1);
        }
    };

    let hotkey_listener = HotkeyListener::new(&hotkey_str);
    if !hotkey_listener.is_active() {
        tracing::warn!(hotkey = %hotkey_str, "hotkey registration failed, continuing without it");
    }
    let mut supervisor = Supervisor::new(settings, audio, log_ring);
    let hotkey_state = supervisor.app_state();
    let _hotkey_task = bridge_core::hotkey::spawn_listener(hotkey_state);

    #[cfg(not(windows))]
    {
        let _ = ctrlc::set_handler(|| {
            tracing::info!("received interrupt, shutting down");
            std::process::exit(0);
        });
    }

    tracing::info!(port, "starting bridge coordinator");
    supervisor.run().await;
    // hotkey_listener must outlive the supervisor loop so the registration
    // stays alive; dropping it here unregisters on exit.
    drop(hotkey_listener);
}

#[cfg(target_os = "linux")]
fn build_audio_adapter() -> Result<Arc<dyn AudioAdapter>, bridge_core::error::BridgeError> {
    let adapter = bridge_core::audio::PulseAdapter::new()?;
    Ok(Arc::new(adapter))
}

#[cfg(windows)]
fn build_audio_adapter() -> Result<Arc<dyn AudioAdapter>, bridge_core::error::BridgeError> {
    bridge_core::audio::com_init()?;
    let adapter = bridge_core::audio::WasapiAdapter::new()?;
    Ok(Arc::new(adapter))
}

#[cfg(not(any(target_os = "linux", windows)))]
fn build_audio_adapter() -> Result<Arc<dyn AudioAdapter>, bridge_core::error::BridgeError> {
    Err(bridge_core::error::BridgeError::Config(
        "no audio backend for this platform".into(),
    ))
}

fn base_url() -> String {
    let settings = SettingsStore::load_from_disk();
    format!("http://127.0.0.1:{}", settings.current().port)
}

async fn query(path: &str) {
    let url = format!("{}{path}", base_url());
    match reqwest::get(&url).await {
        Ok(response) => match response.text().await {
            Ok(body) => println!("{body}"),
            Err(e) => eprintln!("failed to read response: {e}"),
        },
        Err(e) => {
            eprintln!("request failed: {e} (is the coordinator running?)");
            std::process::exit(1);
        }
    }
}

async fn post(path: &str) {
    let url = format!("{}{path}", base_url());
    let client = reqwest::Client::new();
    match client.post(&url).send().await {
        Ok(response) => match response.text().await {
            Ok(body) => println!("{body}"),
            Err(e) => eprintln!("failed to read response: {e}"),
        },
        Err(e) => {
            eprintln!("request failed: {e} (is the coordinator running?)");
            std::process::exit(1);
        }
    }
}
