//! Supervisor — composes every component, owns the HTTP server task, and
//! reacts to settings changes (enable/disable, port change) and crashes
//! with a bounded restart policy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioAdapter, AudioEvent};
use crate::bus::EventBus;
use crate::confirmation::ConfirmationRegistry;
use crate::config::{Settings, SettingsStore};
use crate::http::{self, AppState};
use crate::logring::LogRing;
use crate::port;
use crate::state::BridgeState;

/// Maximum consecutive crashes before giving up and settling in `Stopped`.
pub const N_MAX: u32 = 3;
/// Backoff applied after each crash before the next restart attempt.
pub const T_COOL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    CrashedCooldown,
}

/// Owns the long-lived shared components and the currently-running HTTP
/// server task, if any.
pub struct Supervisor {
    pub bus: Arc<EventBus>,
    pub confirmations: Arc<ConfirmationRegistry>,
    pub bridge: Arc<BridgeState>,
    pub settings: SettingsStore,
    pub audio: Arc<dyn AudioAdapter>,
    pub log_ring: Arc<LogRing>,
    state: SupervisorState,
    error_count: u32,
    server_task: Option<JoinHandle<()>>,
    shutdown: Option<CancellationToken>,
    restart_tx: mpsc::UnboundedSender<()>,
    restart_rx: mpsc::UnboundedReceiver<()>,
    audio_events_started: bool,
}

impl Supervisor {
    pub fn new(settings: SettingsStore, audio: Arc<dyn AudioAdapter>, log_ring: Arc<LogRing>) -> Self {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        Supervisor {
            bus: Arc::new(EventBus::new()),
            confirmations: Arc::new(ConfirmationRegistry::new()),
            bridge: Arc::new(BridgeState::new()),
            settings,
            audio,
            log_ring,
            state: SupervisorState::Stopped,
            error_count: 0,
            server_task: None,
            shutdown: None,
            restart_tx,
            restart_rx,
            audio_events_started: false,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            bus: Arc::clone(&self.bus),
            confirmations: Arc::clone(&self.confirmations),
            bridge: Arc::clone(&self.bridge),
            settings: self.settings.clone(),
            audio: Arc::clone(&self.audio),
            log_ring: Arc::clone(&self.log_ring),
            restart: self.restart_tx.clone(),
        })
    }

    /// Start draining the audio adapter's change-notification channel, if it
    /// has one, applying observed events to `BridgeState`. Only takes the
    /// receiver once; safe to call on every `start()`.
    fn spawn_audio_event_drain(&mut self) {
        if self.audio_events_started {
            return;
        }
        let Some(mut rx) = self.audio.take_events() else {
            return;
        };
        self.audio_events_started = true;
        let bridge = Arc::clone(&self.bridge);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                apply_audio_event(&bridge, event);
            }
        });
    }

    /// Bind the listener and spawn the HTTP server task. On port conflict,
    /// attempts custodian reclamation once before giving up.
    async fn start(&mut self) {
        self.state = SupervisorState::Starting;
        let settings = self.settings.current();

        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", settings.port)).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(port = settings.port, "port in use, attempting reclamation");
                match port::reclaim(settings.port, &settings.program_identity).await {
                    Ok(()) => match tokio::net::TcpListener::bind(("0.0.0.0", settings.port)).await
                    {
                        Ok(listener) => listener,
                        Err(e) => {
                            tracing::error!(error = %e, "bind still failed after reclamation");
                            self.state = SupervisorState::Stopped;
                            return;
                        }
                    },
                    Err(e) => {
                        tracing::error!(error = %e, port = settings.port, "port reclamation failed");
                        self.state = SupervisorState::Stopped;
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "bind failed");
                self.state = SupervisorState::Stopped;
                return;
            }
        };

        let app = http::router(self.app_state());
        let shutdown = CancellationToken::new();
        let shutdown_signal = shutdown.clone();

        let handle = tokio::spawn(async move {
            let serve_result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_signal.cancelled().await;
                tokio::time::sleep(Duration::from_millis(100)).await;
            })
            .await;
            if let Err(e) = serve_result {
                tracing::error!(error = %e, "http server task ended with error");
            }
        });

        self.shutdown = Some(shutdown);
        self.server_task = Some(handle);
        self.state = SupervisorState::Running;
        self.error_count = 0;
        self.spawn_audio_event_drain();
        tracing::info!(port = settings.port, "bridge coordinator listening");
    }

    /// Cancel all pending confirmations and bus waiters, then stop the
    /// server task (graceful shutdown sequence from §4.5).
    async fn stop(&mut self) {
        self.state = SupervisorState::Stopping;
        self.confirmations.abort_all();
        self.bus.cancel_all();

        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
        }
        if let Some(handle) = self.server_task.take() {
            let _ = handle.await;
        }
        self.state = SupervisorState::Stopped;
    }

    async fn restart_with_cooldown(&mut self) {
        self.error_count += 1;
        if self.error_count > N_MAX {
            tracing::error!("exceeded max consecutive crashes, giving up");
            self.state = SupervisorState::Stopped;
            return;
        }
        self.state = SupervisorState::CrashedCooldown;
        tokio::time::sleep(T_COOL).await;
        self.start().await;
    }

    /// Drive the supervisor loop: react to settings changes and to the
    /// server task's completion (success or crash), applying the restart
    /// policy. The initial settings value is not treated as a change.
    pub async fn run(&mut self) {
        let mut settings_rx = self.settings.subscribe();
        let mut observed = settings_rx.borrow().clone();

        if observed.server_enabled {
            self.start().await;
        }

        loop {
            tokio::select! {
                changed = settings_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let new_settings = settings_rx.borrow_and_update().clone();
                    self.react_to_settings_change(&observed, &new_settings).await;
                    observed = new_settings;
                }
                result = wait_server_task(&mut self.server_task), if self.server_task.is_some() => {
                    self.server_task = None;
                    match result {
                        Ok(()) => {
                            // graceful stop already reset state via stop()
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "http server task crashed");
                            self.restart_with_cooldown().await;
                        }
                    }
                }
                signal = self.restart_rx.recv() => {
                    if signal.is_some() {
                        tracing::info!("restart requested over http");
                        self.stop().await;
                        self.start().await;
                    }
                }
            }
        }
    }

    async fn react_to_settings_change(&mut self, previous: &Settings, current: &Settings) {
        let enabled_changed = previous.server_enabled != current.server_enabled;
        let port_changed = previous.port != current.port;

        if enabled_changed && !current.server_enabled {
            self.stop().await;
        } else if enabled_changed && current.server_enabled {
            self.start().await;
        } else if port_changed && current.server_enabled {
            self.stop().await;
            self.start().await;
        }
    }
}

/// Apply a change observed outside the process to `BridgeState`. Never
/// broadcasts on the Event Bus — the bus is for extension-facing actions,
/// not telemetry of state the extension will pick up on its next poll.
fn apply_audio_event(bridge: &BridgeState, event: AudioEvent) {
    match event {
        AudioEvent::InputVolumeChanged(scalar) => bridge.apply_input_volume_change(scalar),
        AudioEvent::OutputVolumeChanged(scalar) => bridge.apply_output_change(scalar),
        AudioEvent::DefaultInputChanged(name) => bridge.set_input_device_name(name),
    }
}

/// Await the server task's `JoinHandle`, converting a panic (`JoinError`)
/// into an `InternalCrash`-shaped `Err` so the caller's restart policy
/// applies uniformly whether the task returned an error or panicked.
async fn wait_server_task(task: &mut Option<JoinHandle<()>>) -> Result<(), String> {
    match task.as_mut() {
        Some(handle) => match handle.await {
            Ok(()) => Ok(()),
            Err(join_error) => Err(join_error.to_string()),
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stub::StubAdapter;

    #[tokio::test]
    async fn new_supervisor_starts_stopped() {
        let settings = SettingsStore::new(Settings {
            server_enabled: false,
            ..Settings::default()
        });
        let supervisor = Supervisor::new(
            settings,
            Arc::new(StubAdapter::new(1.0, 1.0)),
            Arc::new(LogRing::default()),
        );
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn start_transitions_to_running_on_successful_bind() {
        let settings = SettingsStore::new(Settings {
            server_enabled: true,
            port: 0, // ephemeral port for the test
            ..Settings::default()
        });
        let mut supervisor = Supervisor::new(
            settings,
            Arc::new(StubAdapter::new(1.0, 1.0)),
            Arc::new(LogRing::default()),
        );
        supervisor.start().await;
        assert_eq!(supervisor.state(), SupervisorState::Running);
        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn start_drains_audio_events_into_bridge_state() {
        let settings = SettingsStore::new(Settings {
            server_enabled: true,
            port: 0,
            ..Settings::default()
        });
        let (adapter, tx) = StubAdapter::with_events(1.0, 1.0);
        let mut supervisor = Supervisor::new(settings, Arc::new(adapter), Arc::new(LogRing::default()));
        supervisor.start().await;

        tx.send(AudioEvent::OutputVolumeChanged(0.25)).unwrap();
        let bridge = Arc::clone(&supervisor.bridge);
        for _ in 0..50 {
            if bridge.snapshot().output_scalar == 0.25 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bridge.snapshot().output_scalar, 0.25);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn app_state_restart_signal_drives_restart() {
        let settings = SettingsStore::new(Settings {
            server_enabled: true,
            port: 0,
            ..Settings::default()
        });
        let mut supervisor = Supervisor::new(
            settings,
            Arc::new(StubAdapter::new(1.0, 1.0)),
            Arc::new(LogRing::default()),
        );
        supervisor.start().await;
        let app_state = supervisor.app_state();
        app_state.restart.send(()).unwrap();

        let run_handle = tokio::spawn(async move {
            tokio::select! {
                _ = supervisor.run() => {}
                _ = tokio::time::sleep(Duration::from_millis(300)) => {}
            }
            supervisor
        });
        let mut supervisor = run_handle.await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);
        supervisor.stop().await;
    }
}
