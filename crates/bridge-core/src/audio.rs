//! Audio Device Adapter — capability interface over the host's default input
//! and output devices: volume scalar, hardware mute, and change notification.

use std::fmt;

use tokio::sync::mpsc;

#[derive(Debug)]
pub enum AudioError {
    /// The underlying default device could not be queried.
    DeviceUnavailable(String),
    /// The property is not settable on the current device.
    Unsupported(String),
    OperationFailed(String),
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioError::DeviceUnavailable(e) => write!(f, "Audio device unavailable: {e}"),
            AudioError::Unsupported(e) => write!(f, "Audio operation unsupported: {e}"),
            AudioError::OperationFailed(e) => write!(f, "Audio operation failed: {e}"),
        }
    }
}

impl std::error::Error for AudioError {}

pub type Result<T> = std::result::Result<T, AudioError>;

pub type DeviceId = String;

/// A change observed on a device the process does not itself control
/// (the user moved a system slider, a headset was plugged in, ...).
///
/// Always delivered on the supervisor's control channel, never from the
/// native callback thread that detected it.
#[derive(Debug, Clone)]
pub enum AudioEvent {
    InputVolumeChanged(f32),
    OutputVolumeChanged(f32),
    DefaultInputChanged(DeviceId),
}

/// Clamp a volume scalar into `[0.0, 1.0]`, saturating rather than rejecting.
pub fn clamp01(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

/// Capability interface over the host's default input and output devices.
///
/// Hardware mute applies to the input (microphone) device only: the output
/// side is represented purely by its volume scalar, with `output_muted`
/// derived as `output_scalar == 0` by the caller (see `BridgeState`).
pub trait AudioAdapter: Send + Sync {
    fn default_input_id(&self) -> Result<DeviceId>;
    fn default_output_id(&self) -> Result<DeviceId>;

    fn input_volume(&self) -> Result<f32>;
    fn set_input_volume(&self, volume: f32) -> Result<()>;

    fn output_volume(&self) -> Result<f32>;
    fn set_output_volume(&self, volume: f32) -> Result<()>;

    fn hardware_mute_supported(&self) -> bool;
    fn hardware_mute(&self) -> Result<bool>;
    fn set_hardware_mute(&self, muted: bool) -> Result<()>;

    /// Take the receiving half of this adapter's change-notification
    /// channel. Returns `None` if already taken or if the backend never
    /// produces external-change notifications. The events arrive here
    /// already marshalled off the native callback thread (COM/PulseAudio);
    /// the caller (the supervisor) is expected to drain this once, on its
    /// own control channel, for the lifetime of the adapter.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AudioEvent>>;
}

// ── Windows WASAPI implementation ──

#[cfg(windows)]
mod wasapi {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
    use windows::Win32::Media::Audio::Endpoints::*;
    use windows::Win32::Media::Audio::*;
    use windows::Win32::System::Com::STGM_READ;
    use windows::Win32::System::Com::*;
    use windows::Win32::System::Variant::VT_LPWSTR;
    use windows::core::implement;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Kind {
        Input,
        Output,
    }

    #[implement(IAudioEndpointVolumeCallback)]
    struct EndpointCallback {
        kind: Kind,
        scalar_bits: Arc<AtomicU32>,
        muted: Arc<AtomicBool>,
        events_tx: mpsc::UnboundedSender<AudioEvent>,
    }

    impl IAudioEndpointVolumeCallback_Impl for EndpointCallback_Impl {
        fn OnNotify(
            &self,
            pnotify: *mut AUDIO_VOLUME_NOTIFICATION_DATA,
        ) -> windows::core::Result<()> {
            if pnotify.is_null() {
                return Ok(());
            }
            let (scalar, muted) = unsafe { ((*pnotify).fMasterVolume, (*pnotify).bMuted.as_bool()) };
            self.scalar_bits.store(scalar.to_bits(), Ordering::SeqCst);
            self.muted.store(muted, Ordering::SeqCst);
            let event = match self.kind {
                Kind::Input => AudioEvent::InputVolumeChanged(scalar),
                Kind::Output => AudioEvent::OutputVolumeChanged(scalar),
            };
            let _ = self.events_tx.send(event);
            Ok(())
        }
    }

    /// A single endpoint (capture or render), generalized from the
    /// inherited mute monitor which only ever opened the capture side.
    struct Endpoint {
        volume: IAudioEndpointVolume,
        device_name: Option<String>,
        scalar_bits: Arc<AtomicU32>,
        muted: Arc<AtomicBool>,
        _callback: IAudioEndpointVolumeCallback,
    }

    // SAFETY: `volume` is only ever touched from the worker thread that owns
    // this adapter (every call is routed through spawn_blocking onto a single
    // blocking task); the COM apartment that created it is never crossed.
    unsafe impl Send for Endpoint {}
    unsafe impl Sync for Endpoint {}

    impl Endpoint {
        fn new(kind: Kind, events_tx: mpsc::UnboundedSender<AudioEvent>) -> Result<Self> {
            unsafe {
                let enumerator: IMMDeviceEnumerator =
                    CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL).map_err(|e| {
                        AudioError::DeviceUnavailable(format!("MMDeviceEnumerator: {e}"))
                    })?;

                let role = match kind {
                    Kind::Input => eCapture,
                    Kind::Output => eRender,
                };
                let device = enumerator
                    .GetDefaultAudioEndpoint(role, eConsole)
                    .map_err(|e| {
                        AudioError::DeviceUnavailable(format!("GetDefaultAudioEndpoint: {e}"))
                    })?;

                let device_name = match device.OpenPropertyStore(STGM_READ) {
                    Ok(store) => match store.GetValue(&PKEY_Device_FriendlyName) {
                        Ok(prop) => {
                            if prop.Anonymous.Anonymous.vt == VT_LPWSTR {
                                prop.Anonymous.Anonymous.Anonymous.pwszVal.to_string().ok()
                            } else {
                                None
                            }
                        }
                        Err(_) => None,
                    },
                    Err(_) => None,
                };

                let volume: IAudioEndpointVolume = device.Activate(CLSCTX_ALL, None).map_err(|e| {
                    AudioError::DeviceUnavailable(format!("IAudioEndpointVolume: {e}"))
                })?;

                let initial_scalar = volume.GetMasterVolumeLevelScalar().unwrap_or(0.0);
                let initial_muted = volume.GetMute().map(|b| b.as_bool()).unwrap_or(false);

                let scalar_bits = Arc::new(AtomicU32::new(initial_scalar.to_bits()));
                let muted = Arc::new(AtomicBool::new(initial_muted));

                let callback: IAudioEndpointVolumeCallback = EndpointCallback {
                    kind,
                    scalar_bits: Arc::clone(&scalar_bits),
                    muted: Arc::clone(&muted),
                    events_tx,
                }
                .into();
                volume.RegisterControlChangeNotify(&callback).map_err(|e| {
                    AudioError::DeviceUnavailable(format!("RegisterControlChangeNotify: {e}"))
                })?;

                Ok(Endpoint {
                    volume,
                    device_name,
                    scalar_bits,
                    muted,
                    _callback: callback,
                })
            }
        }

        fn volume(&self) -> f32 {
            f32::from_bits(self.scalar_bits.load(Ordering::SeqCst))
        }

        fn set_volume(&self, volume: f32) -> Result<()> {
            let clamped = clamp01(volume);
            unsafe {
                self.volume
                    .SetMasterVolumeLevelScalar(clamped, std::ptr::null())
                    .map_err(|e| AudioError::OperationFailed(format!("SetMasterVolumeLevelScalar: {e}")))?;
            }
            self.scalar_bits.store(clamped.to_bits(), Ordering::SeqCst);
            Ok(())
        }

        fn muted(&self) -> bool {
            self.muted.load(Ordering::SeqCst)
        }

        fn set_muted(&self, muted: bool) -> Result<()> {
            unsafe {
                self.volume
                    .SetMute(muted, std::ptr::null())
                    .map_err(|e| AudioError::OperationFailed(format!("SetMute: {e}")))?;
            }
            self.muted.store(muted, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Drop for Endpoint {
        fn drop(&mut self) {
            unsafe {
                let _ = self.volume.UnregisterControlChangeNotify(&self._callback);
            }
        }
    }

    pub struct WasapiAdapter {
        input: Endpoint,
        output: Endpoint,
        events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<AudioEvent>>>,
    }

    impl WasapiAdapter {
        /// Caller must ensure COM is initialized on this thread.
        pub fn new() -> Result<Self> {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let input = Endpoint::new(Kind::Input, events_tx.clone())?;
            let output = Endpoint::new(Kind::Output, events_tx)?;
            Ok(WasapiAdapter {
                input,
                output,
                events_rx: std::sync::Mutex::new(Some(events_rx)),
            })
        }
    }

    impl AudioAdapter for WasapiAdapter {
        fn default_input_id(&self) -> Result<DeviceId> {
            Ok(self.input.device_name.clone().unwrap_or_default())
        }

        fn default_output_id(&self) -> Result<DeviceId> {
            Ok(self.output.device_name.clone().unwrap_or_default())
        }

        fn input_volume(&self) -> Result<f32> {
            Ok(self.input.volume())
        }

        fn set_input_volume(&self, volume: f32) -> Result<()> {
            self.input.set_volume(volume)
        }

        fn output_volume(&self) -> Result<f32> {
            Ok(self.output.volume())
        }

        fn set_output_volume(&self, volume: f32) -> Result<()> {
            self.output.set_volume(volume)
        }

        fn hardware_mute_supported(&self) -> bool {
            true
        }

        fn hardware_mute(&self) -> Result<bool> {
            Ok(self.input.muted())
        }

        fn set_hardware_mute(&self, muted: bool) -> Result<()> {
            self.input.set_muted(muted)
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AudioEvent>> {
            self.events_rx.lock().unwrap().take()
        }
    }

    /// Initialize COM for the current thread (apartment-threaded).
    pub fn com_init() -> Result<()> {
        unsafe {
            CoInitializeEx(None, COINIT_APARTMENTTHREADED)
                .ok()
                .map_err(|e| AudioError::DeviceUnavailable(format!("CoInitializeEx: {e}")))
        }
    }
}

#[cfg(windows)]
pub use wasapi::{WasapiAdapter, com_init};

// ── Linux PulseAudio implementation ──

#[cfg(target_os = "linux")]
mod pulse {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use libpulse_binding::callbacks::ListResult;
    use libpulse_binding::context::subscribe::InterestMaskSet;
    use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
    use libpulse_binding::mainloop::threaded::Mainloop;

    struct PulseInner {
        mainloop: Mainloop,
        context: Context,
    }

    pub struct PulseAdapter {
        inner: Mutex<PulseInner>,
        input_scalar_bits: Arc<AtomicU32>,
        input_muted: Arc<AtomicBool>,
        input_name: Arc<Mutex<Option<String>>>,
        output_scalar_bits: Arc<AtomicU32>,
        output_name: Arc<Mutex<Option<String>>>,
        events_rx: Mutex<Option<mpsc::UnboundedReceiver<AudioEvent>>>,
    }

    // The threaded mainloop is designed for concurrent access; all mutable
    // state is additionally behind Mutex/Atomic.
    unsafe impl Send for PulseAdapter {}
    unsafe impl Sync for PulseAdapter {}

    const SCALAR_MAX: f64 = 65536.0; // PulseAudio's PA_VOLUME_NORM

    impl PulseAdapter {
        pub fn new() -> Result<Self> {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let mut mainloop = Mainloop::new().ok_or_else(|| {
                AudioError::DeviceUnavailable("PulseAudio mainloop creation failed".into())
            })?;

            let mut context = Context::new(&mainloop, "bridge-coordinator").ok_or_else(|| {
                AudioError::DeviceUnavailable("PulseAudio context creation failed".into())
            })?;

            context
                .connect(None, ContextFlagSet::NOFLAGS, None)
                .map_err(|e| AudioError::DeviceUnavailable(format!("PulseAudio connect: {e}")))?;

            mainloop
                .start()
                .map_err(|e| AudioError::DeviceUnavailable(format!("PulseAudio mainloop start: {e}")))?;

            loop {
                mainloop.lock();
                let state = context.get_state();
                mainloop.unlock();
                match state {
                    ContextState::Ready => break,
                    ContextState::Failed | ContextState::Terminated => {
                        return Err(AudioError::DeviceUnavailable(
                            "PulseAudio context connection failed".into(),
                        ));
                    }
                    _ => std::thread::sleep(Duration::from_millis(10)),
                }
            }

            let input_scalar_bits = Arc::new(AtomicU32::new(0f32.to_bits()));
            let input_muted = Arc::new(AtomicBool::new(false));
            let input_name: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
            let output_scalar_bits = Arc::new(AtomicU32::new(0f32.to_bits()));
            let output_name: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

            {
                mainloop.lock();

                let tx_source = events_tx.clone();
                let tx_sink = events_tx;
                context.set_subscribe_callback(Some(Box::new(move |facility, _operation, _index| {
                    use libpulse_binding::context::subscribe::Facility;
                    match facility {
                        Some(Facility::Source) => {
                            let _ = tx_source.send(AudioEvent::DefaultInputChanged(String::new()));
                        }
                        Some(Facility::Sink) => {
                            let _ = tx_sink.send(AudioEvent::OutputVolumeChanged(0.0));
                        }
                        _ => {}
                    }
                })));
                context.subscribe(InterestMaskSet::SOURCE | InterestMaskSet::SINK, |_| {});

                let scalar_init = Arc::clone(&input_scalar_bits);
                let muted_init = Arc::clone(&input_muted);
                let name_init = Arc::clone(&input_name);
                context
                    .introspect()
                    .get_source_info_by_name("@DEFAULT_SOURCE@", move |result| {
                        if let ListResult::Item(info) = result {
                            let scalar = (info.volume.avg().0 as f64 / SCALAR_MAX) as f32;
                            scalar_init.store(scalar.to_bits(), Ordering::SeqCst);
                            muted_init.store(info.mute, Ordering::SeqCst);
                            if let Some(ref desc) = info.description
                                && let Ok(mut n) = name_init.lock()
                            {
                                *n = Some(desc.to_string());
                            }
                        }
                    });

                let scalar_out_init = Arc::clone(&output_scalar_bits);
                let name_out_init = Arc::clone(&output_name);
                context
                    .introspect()
                    .get_sink_info_by_name("@DEFAULT_SINK@", move |result| {
                        if let ListResult::Item(info) = result {
                            let scalar = (info.volume.avg().0 as f64 / SCALAR_MAX) as f32;
                            scalar_out_init.store(scalar.to_bits(), Ordering::SeqCst);
                            if let Some(ref desc) = info.description
                                && let Ok(mut n) = name_out_init.lock()
                            {
                                *n = Some(desc.to_string());
                            }
                        }
                    });

                mainloop.unlock();
            }

            Ok(PulseAdapter {
                inner: Mutex::new(PulseInner { mainloop, context }),
                input_scalar_bits,
                input_muted,
                input_name,
                output_scalar_bits,
                output_name,
                events_rx: Mutex::new(Some(events_rx)),
            })
        }

        fn cvolume_for(scalar: f32) -> libpulse_binding::volume::ChannelVolumes {
            let mut cv = libpulse_binding::volume::ChannelVolumes::default();
            let value = (clamp01(scalar) as f64 * SCALAR_MAX) as u32;
            cv.set(1, libpulse_binding::volume::Volume(value));
            cv
        }
    }

    impl AudioAdapter for PulseAdapter {
        fn default_input_id(&self) -> Result<DeviceId> {
            Ok(self.input_name.lock().ok().and_then(|n| n.clone()).unwrap_or_default())
        }

        fn default_output_id(&self) -> Result<DeviceId> {
            Ok(self.output_name.lock().ok().and_then(|n| n.clone()).unwrap_or_default())
        }

        fn input_volume(&self) -> Result<f32> {
            Ok(f32::from_bits(self.input_scalar_bits.load(Ordering::SeqCst)))
        }

        fn set_input_volume(&self, volume: f32) -> Result<()> {
            let clamped = clamp01(volume);
            let mut inner = self
                .inner
                .lock()
                .map_err(|e| AudioError::OperationFailed(format!("PulseAudio mutex poisoned: {e}")))?;
            inner.mainloop.lock();
            let cv = Self::cvolume_for(clamped);
            inner
                .context
                .introspect()
                .set_source_volume_by_name("@DEFAULT_SOURCE@", &cv, None);
            inner.mainloop.unlock();
            self.input_scalar_bits.store(clamped.to_bits(), Ordering::SeqCst);
            Ok(())
        }

        fn output_volume(&self) -> Result<f32> {
            Ok(f32::from_bits(self.output_scalar_bits.load(Ordering::SeqCst)))
        }

        fn set_output_volume(&self, volume: f32) -> Result<()> {
            let clamped = clamp01(volume);
            let mut inner = self
                .inner
                .lock()
                .map_err(|e| AudioError::OperationFailed(format!("PulseAudio mutex poisoned: {e}")))?;
            inner.mainloop.lock();
            let cv = Self::cvolume_for(clamped);
            inner
                .context
                .introspect()
                .set_sink_volume_by_name("@DEFAULT_SINK@", &cv, None);
            inner.mainloop.unlock();
            self.output_scalar_bits.store(clamped.to_bits(), Ordering::SeqCst);
            Ok(())
        }

        fn hardware_mute_supported(&self) -> bool {
            true
        }

        fn hardware_mute(&self) -> Result<bool> {
            Ok(self.input_muted.load(Ordering::SeqCst))
        }

        fn set_hardware_mute(&self, muted: bool) -> Result<()> {
            let mut inner = self
                .inner
                .lock()
                .map_err(|e| AudioError::OperationFailed(format!("PulseAudio mutex poisoned: {e}")))?;
            inner.mainloop.lock();
            inner
                .context
                .introspect()
                .set_source_mute_by_name("@DEFAULT_SOURCE@", muted, None);
            inner.mainloop.unlock();
            self.input_muted.store(muted, Ordering::SeqCst);
            Ok(())
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AudioEvent>> {
            self.events_rx.lock().unwrap().take()
        }
    }

    impl Drop for PulseAdapter {
        fn drop(&mut self) {
            if let Ok(mut inner) = self.inner.lock() {
                inner.mainloop.lock();
                inner.context.disconnect();
                inner.mainloop.unlock();
                inner.mainloop.stop();
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use pulse::PulseAdapter;

// ── Test stub ──

#[cfg(test)]
pub mod stub {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// In-memory adapter for unit tests; `set_*` methods mutate state without
    /// touching any OS API, mirroring the inherited codebase's `StubMonitor`.
    pub struct StubAdapter {
        input_scalar_bits: AtomicU32,
        output_scalar_bits: AtomicU32,
        hw_muted: AtomicBool,
        events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<AudioEvent>>>,
    }

    impl StubAdapter {
        pub fn new(input_volume: f32, output_volume: f32) -> Self {
            StubAdapter {
                input_scalar_bits: AtomicU32::new(input_volume.to_bits()),
                output_scalar_bits: AtomicU32::new(output_volume.to_bits()),
                hw_muted: AtomicBool::new(false),
                events_rx: std::sync::Mutex::new(None),
            }
        }

        /// Build a stub whose `take_events()` yields a receiver fed by the
        /// returned sender, for exercising the supervisor's event-drain wiring.
        pub fn with_events(
            input_volume: f32,
            output_volume: f32,
        ) -> (Self, mpsc::UnboundedSender<AudioEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let adapter = StubAdapter {
                input_scalar_bits: AtomicU32::new(input_volume.to_bits()),
                output_scalar_bits: AtomicU32::new(output_volume.to_bits()),
                hw_muted: AtomicBool::new(false),
                events_rx: std::sync::Mutex::new(Some(rx)),
            };
            (adapter, tx)
        }
    }

    impl AudioAdapter for StubAdapter {
        fn default_input_id(&self) -> Result<DeviceId> {
            Ok("stub-input".into())
        }

        fn default_output_id(&self) -> Result<DeviceId> {
            Ok("stub-output".into())
        }

        fn input_volume(&self) -> Result<f32> {
            Ok(f32::from_bits(self.input_scalar_bits.load(Ordering::SeqCst)))
        }

        fn set_input_volume(&self, volume: f32) -> Result<()> {
            self.input_scalar_bits
                .store(clamp01(volume).to_bits(), Ordering::SeqCst);
            Ok(())
        }

        fn output_volume(&self) -> Result<f32> {
            Ok(f32::from_bits(self.output_scalar_bits.load(Ordering::SeqCst)))
        }

        fn set_output_volume(&self, volume: f32) -> Result<()> {
            self.output_scalar_bits
                .store(clamp01(volume).to_bits(), Ordering::SeqCst);
            Ok(())
        }

        fn hardware_mute_supported(&self) -> bool {
            true
        }

        fn hardware_mute(&self) -> Result<bool> {
            Ok(self.hw_muted.load(Ordering::SeqCst))
        }

        fn set_hardware_mute(&self, muted: bool) -> Result<()> {
            self.hw_muted.store(muted, Ordering::SeqCst);
            Ok(())
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AudioEvent>> {
            self.events_rx.lock().unwrap().take()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stub::StubAdapter;
    use super::*;

    #[test]
    fn clamp_saturates_above_one() {
        assert_eq!(clamp01(1.5), 1.0);
    }

    #[test]
    fn clamp_saturates_below_zero() {
        assert_eq!(clamp01(-0.2), 0.0);
    }

    #[test]
    fn clamp_passes_through_in_range() {
        assert_eq!(clamp01(0.42), 0.42);
    }

    #[test]
    fn stub_adapter_set_input_volume_clamps() {
        let adapter = StubAdapter::new(0.5, 0.5);
        adapter.set_input_volume(2.0).unwrap();
        assert_eq!(adapter.input_volume().unwrap(), 1.0);
    }

    #[test]
    fn stub_adapter_hardware_mute_distinct_from_zero_volume() {
        let adapter = StubAdapter::new(0.8, 0.8);
        adapter.set_hardware_mute(true).unwrap();
        assert!(adapter.hardware_mute().unwrap());
        // setting hardware mute does not touch the scalar
        assert_eq!(adapter.input_volume().unwrap(), 0.8);
    }

    #[test]
    fn display_device_unavailable() {
        let e = AudioError::DeviceUnavailable("no default device".into());
        assert_eq!(e.to_string(), "Audio device unavailable: no default device");
    }

    #[test]
    fn stub_without_events_returns_none() {
        let adapter = StubAdapter::new(1.0, 1.0);
        assert!(adapter.take_events().is_none());
    }

    #[tokio::test]
    async fn stub_with_events_delivers_sent_event() {
        let (adapter, tx) = StubAdapter::with_events(1.0, 1.0);
        let mut rx = adapter.take_events().expect("receiver should be present once");
        assert!(adapter.take_events().is_none(), "receiver can only be taken once");

        tx.send(AudioEvent::OutputVolumeChanged(0.3)).unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, AudioEvent::OutputVolumeChanged(v) if v == 0.3));
    }
}
