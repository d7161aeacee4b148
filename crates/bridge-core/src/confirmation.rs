//! Confirmation Registry — per-request pending confirmations keyed by an
//! opaque id, resolved on extension state report or bounded timeout.
//!
//! The handle is resumed exactly once: the registry removes the entry under
//! a single critical section (the map's mutex), so the report path and the
//! timeout path race to be the one that finds the entry still present —
//! first writer wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

/// Default confirmation deadline.
pub const T_CONF: Duration = Duration::from_secs(3);

/// Opaque identifier for a pending confirmation, unique for the process
/// lifetime.
pub type ConfirmationId = u64;

/// Why a confirmation resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Extension,
    Local,
}

/// The outcome delivered to a suspended confirming-toggle handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationOutcome {
    pub muted: bool,
    pub confirmed: bool,
    pub source: Source,
    pub timed_out: bool,
}

#[derive(Default)]
pub struct ConfirmationRegistry {
    next_id: AtomicU64,
    pending: Mutex<HashMap<ConfirmationId, oneshot::Sender<ConfirmationOutcome>>>,
}

impl ConfirmationRegistry {
    pub fn new() -> Self {
        ConfirmationRegistry::default()
    }

    /// Register a new pending confirmation for `expected_new_state`, returning
    /// its id and a receiver the HTTP handler awaits (raced against a timer).
    pub fn register(&self) -> (ConfirmationId, oneshot::Receiver<ConfirmationOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    /// Resolve *every* currently pending confirmation with the reported
    /// state (extension state report). Returns how many were resolved.
    pub fn resolve_all(&self, muted: bool) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        let count = pending.len();
        for (_, tx) in pending {
            let _ = tx.send(ConfirmationOutcome {
                muted,
                confirmed: true,
                source: Source::Extension,
                timed_out: false,
            });
        }
        count
    }

    /// Resolve a single id on timeout, with the optimistic state that was
    /// already applied to BridgeState. No-op if the id was already resolved
    /// by a report (first-writer-wins via `remove`).
    pub fn resolve_timeout(&self, id: ConfirmationId, optimistic_muted: bool) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&id) {
            let _ = tx.send(ConfirmationOutcome {
                muted: optimistic_muted,
                confirmed: false,
                source: Source::Local,
                timed_out: true,
            });
        }
    }

    /// Resolve every pending confirmation with `aborted` (process shutdown).
    pub fn abort_all(&self) {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_, tx) in pending {
            drop(tx);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Await `rx`, racing the confirmation deadline. Returns the report's
/// outcome if it wins, otherwise resolves `id` as a timeout and returns that.
pub async fn await_with_deadline(
    registry: &ConfirmationRegistry,
    id: ConfirmationId,
    rx: oneshot::Receiver<ConfirmationOutcome>,
    optimistic_muted: bool,
    deadline: Duration,
) -> ConfirmationOutcome {
    tokio::select! {
        result = rx => {
            result.unwrap_or(ConfirmationOutcome {
                muted: optimistic_muted,
                confirmed: false,
                source: Source::Local,
                timed_out: false,
            })
        }
        _ = tokio::time::sleep(deadline) => {
            registry.resolve_timeout(id, optimistic_muted);
            ConfirmationOutcome {
                muted: optimistic_muted,
                confirmed: false,
                source: Source::Local,
                timed_out: true,
            }
        }
    }
}
