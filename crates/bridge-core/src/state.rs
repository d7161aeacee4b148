//! Bridge State — the authoritative in-memory mute/volume state, published
//! to the UI adapter via a `tokio::sync::watch` channel (copy-on-write,
//! readers take snapshots).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::audio::clamp01;

/// How long a long-poll attachment is remembered after the waiter leaves,
/// for the purposes of `extension_attached`.
pub const ATTACHMENT_WINDOW: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeStateView {
    pub mic_muted: bool,
    pub mic_scalar: f32,
    pub output_scalar: f32,
    pub output_muted: bool,
    pub input_device_name: String,
    pub extension_attached: bool,
}

impl Default for BridgeStateView {
    fn default() -> Self {
        BridgeStateView {
            mic_muted: false,
            mic_scalar: 1.0,
            output_scalar: 1.0,
            output_muted: false,
            input_device_name: String::new(),
            extension_attached: false,
        }
    }
}

struct Inner {
    view: BridgeStateView,
    last_attached_at: Option<Instant>,
    currently_parked: u32,
}

/// Single logical owner of the mute/volume state; mutations are serialized
/// through `&self` methods backed by a `Mutex`, matching this component's
/// "single-writer" requirement even though many tasks hold a shared `Arc`.
pub struct BridgeState {
    inner: Mutex<Inner>,
    tx: watch::Sender<BridgeStateView>,
}

impl Default for BridgeState {
    fn default() -> Self {
        BridgeState::new()
    }
}

impl BridgeState {
    pub fn new() -> Self {
        let view = BridgeStateView::default();
        let (tx, _rx) = watch::channel(view.clone());
        BridgeState {
            inner: Mutex::new(Inner {
                view,
                last_attached_at: None,
                currently_parked: 0,
            }),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeStateView> {
        self.tx.subscribe()
    }

    fn publish(&self, view: BridgeStateView) {
        let _ = self.tx.send(view);
    }

    pub fn snapshot(&self) -> BridgeStateView {
        let mut inner = self.inner.lock().unwrap();
        inner.view.extension_attached = self.is_attached(&inner);
        inner.view.clone()
    }

    fn is_attached(&self, inner: &Inner) -> bool {
        inner.currently_parked > 0
            || inner
                .last_attached_at
                .is_some_and(|t| t.elapsed() < ATTACHMENT_WINDOW)
    }

    /// Apply the extension's reported mic mute state. Canonicalizes
    /// `mic_scalar` to 1.0/0.0 to match the reported boolean.
    pub fn apply_mic_report(&self, muted: bool) {
        let view = {
            let mut inner = self.inner.lock().unwrap();
            inner.view.mic_muted = muted;
            inner.view.mic_scalar = if muted { 0.0 } else { 1.0 };
            inner.view.clone()
        };
        self.publish(view);
    }

    /// Apply a locally-initiated mic mute (no extension involved).
    pub fn apply_local_mic_mute(&self, muted: bool) {
        self.apply_mic_report(muted);
    }

    pub fn apply_output_change(&self, scalar: f32) {
        let view = {
            let mut inner = self.inner.lock().unwrap();
            let clamped = clamp01(scalar);
            inner.view.output_scalar = clamped;
            inner.view.output_muted = clamped == 0.0;
            inner.view.clone()
        };
        self.publish(view);
    }

    /// Apply an input volume change observed from outside the process (the
    /// user moved a system slider). Does not touch `mic_muted`.
    pub fn apply_input_volume_change(&self, scalar: f32) {
        let view = {
            let mut inner = self.inner.lock().unwrap();
            inner.view.mic_scalar = clamp01(scalar);
            inner.view.clone()
        };
        self.publish(view);
    }

    pub fn set_input_device_name(&self, name: String) {
        let view = {
            let mut inner = self.inner.lock().unwrap();
            inner.view.input_device_name = name;
            inner.view.clone()
        };
        self.publish(view);
    }

    pub fn mark_attached(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.currently_parked += 1;
        inner.last_attached_at = Some(Instant::now());
    }

    pub fn mark_detached(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.currently_parked = inner.currently_parked.saturating_sub(1);
        inner.last_attached_at = Some(Instant::now());
    }
}
