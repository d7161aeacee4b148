//! Settings — TOML-based, platform-aware paths, with a change-stream for the
//! supervisor to react to enable/disable and port changes.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Header comment prepended to saved settings files.
const SETTINGS_HEADER: &str =
    "# Bridge Coordinator settings — changes made outside the app may be overwritten.\n\n";

/// How the Audio Device Adapter applies a local mute when invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuteMode {
    /// Use the device's dedicated hardware-mute property.
    Hardware,
    /// Emulate mute by driving the volume scalar to zero.
    ScalarZero,
}

impl fmt::Display for MuteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuteMode::Hardware => write!(f, "hardware"),
            MuteMode::ScalarZero => write!(f, "scalar_zero"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// If false, the HTTP Surface is stopped.
    #[serde(default = "default_true")]
    pub server_enabled: bool,

    /// Listener port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Increment for volume_up/down, in `(0, 1]`.
    #[serde(default = "default_volume_step")]
    pub volume_step: f32,

    /// How a local mute is applied.
    #[serde(default = "default_mute_mode")]
    pub mute_mode: MuteMode,

    /// Monotonic counter of accepted toggles.
    #[serde(default)]
    pub request_count: u64,

    /// Global hotkey spec, e.g. "Alt+M".
    #[serde(default = "default_hotkey")]
    pub hotkey: String,

    /// Executable-name allow-list the Port Custodian may terminate.
    #[serde(default = "default_program_identity")]
    pub program_identity: Vec<String>,

    /// Fields this version doesn't recognize, preserved verbatim across a
    /// load/save cycle instead of being dropped.
    #[serde(flatten)]
    pub extra: toml::value::Table,
}

fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    8765
}
fn default_volume_step() -> f32 {
    0.10
}
fn default_mute_mode() -> MuteMode {
    MuteMode::Hardware
}
fn default_hotkey() -> String {
    "Alt+M".into()
}
fn default_program_identity() -> Vec<String> {
    vec!["BridgeCoordinator".into()]
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server_enabled: default_true(),
            port: default_port(),
            volume_step: default_volume_step(),
            mute_mode: default_mute_mode(),
            request_count: 0,
            hotkey: default_hotkey(),
            program_identity: default_program_identity(),
            extra: toml::value::Table::new(),
        }
    }
}

/// Validation errors that [`Settings::validate`] can return.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// `volume_step` is not in `(0, 1]`.
    InvalidVolumeStep(f32),
    /// `hotkey` is empty or whitespace-only.
    EmptyHotkey,
    /// `port` is zero.
    InvalidPort,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidVolumeStep(v) => {
                write!(f, "volume_step must be in (0, 1], got {v}")
            }
            ValidationError::EmptyHotkey => write!(f, "hotkey cannot be empty"),
            ValidationError::InvalidPort => write!(f, "port cannot be 0"),
        }
    }
}

impl Settings {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("bridge-coordinator"))
    }

    /// Full path to the settings file.
    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("settings.toml"))
    }

    /// Load settings from disk, or return defaults if not found.
    pub fn load() -> Self {
        let (settings, warnings) = Self::load_with_warnings();
        for w in &warnings {
            tracing::warn!(%w, "settings load warning");
        }
        settings
    }

    /// Save settings to an arbitrary path atomically (write to temp file, then rename).
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{SETTINGS_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(_) => {
                let result = std::fs::write(path, &contents);
                let _ = std::fs::remove_file(&tmp);
                result
            }
        }
    }

    /// Save settings to the default platform path.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    /// Load settings from an arbitrary path, returning the settings and any parse warnings.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => (settings, vec![]),
                Err(e) => {
                    let warning = format!(
                        "settings parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    /// Load settings from the default path, returning the settings and any parse warnings.
    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// Validate the settings, collecting all errors.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.volume_step <= 0.0 || self.volume_step > 1.0 {
            errors.push(ValidationError::InvalidVolumeStep(self.volume_step));
        }
        if self.hotkey.trim().is_empty() {
            errors.push(ValidationError::EmptyHotkey);
        }
        if self.port == 0 {
            errors.push(ValidationError::InvalidPort);
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Typed settings store with load/save and a change-stream (`tokio::sync::watch`)
/// the Supervisor subscribes to for enable/disable and port-change transitions.
///
/// The initial value is published at construction, so subscribers should
/// compare against the value they observe at subscribe time rather than
/// treating the first tick as a change, to avoid double-starting on boot.
#[derive(Clone)]
pub struct SettingsStore {
    tx: watch::Sender<Settings>,
}

impl SettingsStore {
    pub fn new(initial: Settings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        SettingsStore { tx }
    }

    pub fn load_from_disk() -> Self {
        Self::new(Settings::load())
    }

    pub fn current(&self) -> Settings {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Replace the settings, persist to disk, and notify subscribers.
    pub fn update(&self, settings: Settings) -> std::io::Result<()> {
        settings.save()?;
        let _ = self.tx.send(settings);
        Ok(())
    }

    /// Increment `request_count` and persist, without treating it as a
    /// supervisor-relevant change (server/port/mode are untouched).
    pub fn bump_request_count(&self) {
        let mut settings = self.current();
        settings.request_count = settings.request_count.saturating_add(1);
        let _ = settings.save();
        let _ = self.tx.send(settings);
    }
}
