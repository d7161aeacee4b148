//! Event Bus — fan-out delivery to zero-or-more suspended long-poll waiters.
//!
//! A broadcast resumes every waiter currently parked with a copy of the
//! event and empties the waiter set; there is no replay and no per-waiter
//! queue. A waiter that cancels before a broadcast simply drops its half of
//! the oneshot channel and is never delivered to.

use std::sync::Mutex;

use tokio::sync::oneshot;

/// A tagged event, carrying no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ToggleMic,
    MuteMic,
    UnmuteMic,
    ToggleSpeaker,
    VolumeUp,
    VolumeDown,
}

impl Event {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Event::ToggleMic => "toggle-mic",
            Event::MuteMic => "mute-mic",
            Event::UnmuteMic => "unmute-mic",
            Event::ToggleSpeaker => "toggle-speaker",
            Event::VolumeUp => "volume-up",
            Event::VolumeDown => "volume-down",
        }
    }
}

/// Error returned to a long-poll waiter when the bus is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown;

#[derive(Default)]
pub struct EventBus {
    waiters: Mutex<Vec<oneshot::Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Park until the next broadcast delivers an event, or the bus is torn
    /// down via `cancel_all`. Dropping the returned future before it
    /// resolves removes this waiter without delivery (cancellation-safe).
    pub async fn wait_next(&self) -> Result<Event, Shutdown> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().push(tx);
        rx.await.map_err(|_| Shutdown)
    }

    /// Resume every currently-parked waiter with a copy of `event`, then
    /// empty the waiter set. O(waiters).
    pub fn broadcast(&self, event: Event) {
        let waiters = std::mem::take(&mut *self.waiters.lock().unwrap());
        for waiter in waiters {
            let _ = waiter.send(event);
        }
    }

    /// Resume all parked waiters with a shutdown sentinel (drop their sender
    /// without sending, which the receiver observes as `Err`).
    pub fn cancel_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock().unwrap());
        drop(waiters);
    }

    /// Number of currently-parked waiters. For tests and diagnostics.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn broadcast_delivers_to_single_waiter() {
        let bus = Arc::new(EventBus::new());
        let bus2 = Arc::clone(&bus);
        let handle = tokio::spawn(async move { bus2.wait_next().await });

        // give the waiter a chance to park
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bus.waiter_count(), 1);
        bus.broadcast(Event::ToggleMic);

        let received = handle.await.unwrap().unwrap();
        assert_eq!(received, Event::ToggleMic);
        assert_eq!(bus.waiter_count(), 0);
    }

    #[tokio::test]
    async fn fan_out_to_n_waiters_empties_set() {
        let bus = Arc::new(EventBus::new());
        let mut handles = Vec::new();
        for _ in 0..5 {
            let bus2 = Arc::clone(&bus);
            handles.push(tokio::spawn(async move { bus2.wait_next().await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bus.waiter_count(), 5);

        bus.broadcast(Event::MuteMic);

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Event::MuteMic);
        }
        assert_eq!(bus.waiter_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_receives_nothing() {
        let bus = Arc::new(EventBus::new());
        let bus2 = Arc::clone(&bus);
        let handle = tokio::spawn(async move { bus2.wait_next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        handle.abort();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // the aborted task's oneshot sender is dropped; a subsequent
        // broadcast should find no waiters left to deliver to
        bus.broadcast(Event::VolumeUp);
        assert_eq!(bus.waiter_count(), 0);
    }

    #[tokio::test]
    async fn two_broadcasts_observed_in_order_by_separate_waits() {
        let bus = Arc::new(EventBus::new());

        let bus2 = Arc::clone(&bus);
        let first = tokio::spawn(async move { bus2.wait_next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.broadcast(Event::MuteMic);
        assert_eq!(first.await.unwrap().unwrap(), Event::MuteMic);

        let bus3 = Arc::clone(&bus);
        let second = tokio::spawn(async move { bus3.wait_next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.broadcast(Event::ToggleMic);
        assert_eq!(second.await.unwrap().unwrap(), Event::ToggleMic);
    }

    #[tokio::test]
    async fn cancel_all_resolves_waiters_with_shutdown() {
        let bus = Arc::new(EventBus::new());
        let bus2 = Arc::clone(&bus);
        let handle = tokio::spawn(async move { bus2.wait_next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        bus.cancel_all();
        assert_eq!(handle.await.unwrap(), Err(Shutdown));
    }

    #[test]
    fn event_wire_names() {
        assert_eq!(Event::ToggleMic.as_wire(), "toggle-mic");
        assert_eq!(Event::MuteMic.as_wire(), "mute-mic");
        assert_eq!(Event::UnmuteMic.as_wire(), "unmute-mic");
        assert_eq!(Event::ToggleSpeaker.as_wire(), "toggle-speaker");
        assert_eq!(Event::VolumeUp.as_wire(), "volume-up");
        assert_eq!(Event::VolumeDown.as_wire(), "volume-down");
    }
}
