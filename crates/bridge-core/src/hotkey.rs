//! Hotkey Listener — a process-global shortcut that injects a toggle through
//! the Event Bus, the same path as the HTTP fast endpoint. Registration can
//! fail silently (missing OS accessibility permission); the rest of the
//! system must keep functioning without it.

use std::sync::Arc;

use global_hotkey::hotkey::HotKey;
use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager};

use crate::http::{self, AppState};

/// Tracks the currently registered global hotkey, if registration succeeded.
pub struct HotkeyListener {
    manager: Option<GlobalHotKeyManager>,
    current: Option<HotKey>,
}

impl HotkeyListener {
    /// Parse and register `hotkey_str` (e.g. "Alt+M"). Logs and continues
    /// with no active shortcut if the manager can't be created or the
    /// string fails to parse or register — a missing hotkey must never be
    /// fatal to the rest of the process.
    pub fn new(hotkey_str: &str) -> Self {
        let manager = match GlobalHotKeyManager::new() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "failed to init hotkey manager");
                return HotkeyListener {
                    manager: None,
                    current: None,
                };
            }
        };

        let current = register(&manager, hotkey_str);
        HotkeyListener {
            manager: Some(manager),
            current,
        }
    }

    /// Unregister the current hotkey (if any) and register `new_hotkey_str`.
    pub fn rebind(&mut self, new_hotkey_str: &str) {
        let Some(manager) = &self.manager else {
            return;
        };
        if let Some(hotkey) = self.current.take() {
            let _ = manager.unregister(hotkey);
        }
        self.current = register(manager, new_hotkey_str);
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }
}

fn register(manager: &GlobalHotKeyManager, hotkey_str: &str) -> Option<HotKey> {
    let hotkey: HotKey = match hotkey_str.parse() {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(hotkey = hotkey_str, error = %e, "invalid hotkey string");
            return None;
        }
    };
    match manager.register(hotkey) {
        Ok(()) => Some(hotkey),
        Err(e) => {
            tracing::warn!(hotkey = hotkey_str, error = %e, "could not register hotkey");
            None
        }
    }
}

/// Drain the global hotkey event channel on a blocking thread and run a fast
/// mic toggle for every press, the same sequence `POST /toggle-mic/fast`
/// runs: flip `BridgeState`, attempt the hardware mute, and broadcast the
/// specific mute/unmute event followed by the generic toggle. Runs until the
/// process exits; registration lifetime is owned by the `HotkeyListener`
/// passed in, which must outlive this task.
pub fn spawn_listener(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let receiver = GlobalHotKeyEvent::receiver();
        while receiver.recv().is_ok() {
            http::fast_toggle_mic(&state);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_hotkey_string_does_not_panic() {
        if let Ok(manager) = GlobalHotKeyManager::new() {
            let result = register(&manager, "not a real hotkey spec ###");
            assert!(result.is_none());
        }
    }
}
