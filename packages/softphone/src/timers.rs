//! Named, cancellable timers that post into the control loop.
//!
//! A timer never touches state. When it fires it sends a [`TimerFired`] into
//! the same queue the engine lines travel through, and the loop decides what
//! to do with it. Each schedule bumps a generation number so a firing that
//! raced with a cancel or reschedule is recognised and dropped by
//! [`Timers::accept`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Re-checks registration while the session is connecting
    LoginConfirm,
    /// Periodic status query while registered
    StatusPoll,
    /// One-second call duration tick
    CallTick,
    /// Synthesizes a disconnect if the engine never confirms a hang-up
    ForcedHangup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

/// What a state machine asks the controller to do after a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    Schedule(TimerKind),
    Cancel(TimerKind),
    QueryStatus,
}

pub struct Timers<E> {
    queue: mpsc::Sender<E>,
    pending: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

impl<E> Timers<E>
where
    E: From<TimerFired> + Send + 'static,
{
    pub fn new(queue: mpsc::Sender<E>) -> Self {
        Self {
            queue,
            pending: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm `kind` to fire after `delay`, replacing any pending instance
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);

        self.next_generation += 1;
        let generation = self.next_generation;
        let queue = self.queue.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.send(TimerFired { kind, generation }.into()).await;
        });

        debug!(?kind, generation, ?delay, "timer scheduled");
        self.pending.insert(kind, (generation, task));
    }

    /// Returns whether a pending timer was cancelled
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.pending.remove(&kind) {
            Some((generation, task)) => {
                task.abort();
                debug!(?kind, generation, "timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, task)) in self.pending.drain() {
            task.abort();
        }
    }

    /// Claim a firing. False when the timer was cancelled or rescheduled
    /// after this firing was queued.
    pub fn accept(&mut self, fired: &TimerFired) -> bool {
        match self.pending.get(&fired.kind) {
            Some((generation, _)) if *generation == fired.generation => {
                self.pending.remove(&fired.kind);
                true
            }
            _ => {
                debug!(kind = ?fired.kind, generation = fired.generation, "stale timer firing dropped");
                false
            }
        }
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.pending.contains_key(&kind)
    }

    pub fn pending(&self) -> Vec<TimerKind> {
        let mut kinds: Vec<_> = self.pending.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl<E> Drop for Timers<E> {
    fn drop(&mut self) {
        for (_, (_, task)) in self.pending.drain() {
            task.abort();
        }
    }
}
