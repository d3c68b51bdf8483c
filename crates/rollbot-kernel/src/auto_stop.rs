//! [`AutoStop`] – the single pending "stop when the drive window ends" timer.
//!
//! At most one timer is live at a time. Scheduling a new one cancels the
//! previous one first. Each timer runs on its own short-lived thread that
//! waits on a cancel channel with a timeout: a timeout means *fire*, a closed
//! channel means *cancelled*.
//!
//! A timer that wakes up must still win the slot before it fires, so a
//! cancel that lands at the same instant as the deadline always suppresses
//! the callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use tracing::{debug, info, warn};

struct Pending {
    generation: u64,
    // Dropping the sender wakes the timer thread with `Disconnected`.
    _cancel: Sender<()>,
}

/// Holder of the at-most-one pending auto-stop timer.
#[derive(Default)]
pub struct AutoStop {
    slot: Arc<Mutex<Option<Pending>>>,
    generation: AtomicU64,
}

impl AutoStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending timer and arm a new one.
    ///
    /// After `after` has elapsed, `may_fire` is consulted; `stop_fn` runs only
    /// if it returns `true`. Returns the timer's generation number.
    pub fn schedule<P, F>(&self, after: Duration, may_fire: P, stop_fn: F) -> u64
    where
        P: Fn() -> bool + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, cancel_rx) = bounded::<()>(0);

        {
            let mut slot = lock(&self.slot);
            if slot.take().is_some() {
                debug!("auto-stop replaced");
            }
            *slot = Some(Pending {
                generation,
                _cancel: cancel_tx,
            });
        }

        let slot = Arc::clone(&self.slot);
        let spawned = thread::Builder::new()
            .name("rollbot-auto-stop".into())
            .spawn(move || {
                match cancel_rx.recv_timeout(after) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!(generation, "auto-stop cancelled");
                        return;
                    }
                }

                {
                    let mut slot = lock(&slot);
                    match slot.as_ref() {
                        Some(p) if p.generation == generation => {
                            slot.take();
                        }
                        _ => return,
                    }
                }

                if !may_fire() {
                    info!(generation, "auto-stop suppressed");
                    return;
                }
                debug!(generation, after_ms = after.as_millis() as u64, "auto-stop firing");
                stop_fn();
            });

        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn auto-stop timer");
            let mut slot = lock(&self.slot);
            if slot.as_ref().is_some_and(|p| p.generation == generation) {
                slot.take();
            }
        }
        generation
    }

    /// Cancel the pending timer. Returns `true` if one was pending.
    pub fn cancel(&self) -> bool {
        lock(&self.slot).take().is_some()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
