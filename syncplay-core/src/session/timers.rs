//! Named, cancellable one-shot timers for the session task

use futures::future::{abortable, AbortHandle};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    /// Next scheduled transport command
    ScheduledCommand,
    /// Re-arm corrections / restore playback rate
    SyncTimeout,
    /// Timeout of a pending player-event wait
    PlayerWait,
    /// A stall has lasted long enough to count as buffering
    BufferingNotice,
    /// Timeout waiting for playback to start after a queue change
    PlaybackStartWait,
    /// Debounced outbound seek
    SeekFlush,
    /// Transport toggle held back by the cooldown
    TransportFlush,
    /// Periodic joined-state fetch
    Reconcile,
    /// Deferred disable after an unconfirmed membership loss
    PendingDisable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerFired {
    pub key: TimerKey,
    pub generation: u64,
}

/// At most one pending timer per key. Re-arming a key cancels the previous
/// one; a fire that lost the race against a cancel is recognised by its
/// generation and ignored.
pub(crate) struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    armed: HashMap<TimerKey, (u64, AbortHandle)>,
    next_generation: u64,
}

impl Timers {
    pub fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            armed: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn arm(&mut self, key: TimerKey, delay: Duration) {
        self.cancel(key);

        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();

        let (task, handle) = abortable(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired { key, generation });
        });
        tokio::spawn(task);

        self.armed.insert(key, (generation, handle));
    }

    pub fn arm_ms(&mut self, key: TimerKey, delay_ms: i64) {
        self.arm(key, Duration::from_millis(delay_ms.max(0) as u64));
    }

    pub fn cancel(&mut self, key: TimerKey) -> bool {
        match self.armed.remove(&key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.armed.contains_key(&key)
    }

    /// Accept a fire if it belongs to the currently armed timer
    pub fn take(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.key) {
            Some((generation, _)) if *generation == fired.generation => {
                self.armed.remove(&fired.key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
