//! Signal channel: external events a running stage can suspend on.
//!
//! Signals are keyed by `(run_id, name)` so concurrent runs never
//! cross-deliver. A `send` with no waiter is buffered and handed to the next
//! `wait_for` on the same key; waiters are served in arrival order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("timed out after {0:?} waiting for signal '{1}'")]
    Timeout(Duration, String),

    #[error("signal channel closed for run")]
    Closed,
}

#[derive(Default)]
struct Slot {
    buffered: VecDeque<Value>,
    waiters: VecDeque<oneshot::Sender<Value>>,
}

/// Receiver side of one `wait_for`; prunes its slot when dropped.
struct Waiting<'a> {
    channel: &'a SignalChannel,
    run_id: Uuid,
    name: &'a str,
    rx: Option<oneshot::Receiver<Value>>,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        // Close the receiver first so `prune` sees this waiter as gone.
        drop(self.rx.take());
        self.channel.prune(self.run_id, self.name);
    }
}

/// An outstanding `wait_for` (e.g. a stage waiting on human input).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSignal {
    pub run_id: Uuid,
    pub name: String,
    pub waiters: usize,
}

#[derive(Clone, Default)]
pub struct SignalChannel {
    slots: Arc<Mutex<HashMap<(Uuid, String), Slot>>>,
}

impl SignalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(Uuid, String), Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver `payload` to the oldest live waiter, or buffer it.
    ///
    /// Returns `true` when a waiter received it directly.
    pub fn send(&self, run_id: Uuid, name: &str, payload: Value) -> bool {
        let mut slots = self.lock();
        let slot = slots.entry((run_id, name.to_string())).or_default();
        let mut payload = payload;
        while let Some(waiter) = slot.waiters.pop_front() {
            match waiter.send(payload) {
                Ok(()) => {
                    tracing::debug!(run_id = %run_id, signal = name, "signal delivered");
                    return true;
                }
                // Receiver timed out or was dropped; try the next one.
                Err(returned) => payload = returned,
            }
        }
        slot.buffered.push_back(payload);
        tracing::debug!(run_id = %run_id, signal = name, "signal buffered");
        false
    }

    /// Suspend until a matching `send` arrives or `timeout` elapses.
    ///
    /// A wait that ends without a payload (timeout, or the future dropped)
    /// leaves no slot behind unless payloads are still buffered for it.
    pub async fn wait_for(
        &self,
        run_id: Uuid,
        name: &str,
        timeout: Duration,
    ) -> Result<Value, SignalError> {
        let rx = {
            let mut slots = self.lock();
            let slot = slots.entry((run_id, name.to_string())).or_default();
            if let Some(payload) = slot.buffered.pop_front() {
                if slot.buffered.is_empty() && slot.waiters.is_empty() {
                    slots.remove(&(run_id, name.to_string()));
                }
                return Ok(payload);
            }
            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(tx);
            rx
        };
        let mut waiting = Waiting {
            channel: self,
            run_id,
            name,
            rx: Some(rx),
        };
        let Some(rx) = waiting.rx.as_mut() else {
            return Err(SignalError::Closed);
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(SignalError::Closed),
            Err(_) => Err(SignalError::Timeout(timeout, name.to_string())),
        }
    }

    /// Forget closed waiters of one key; drop the key once nothing is left.
    fn prune(&self, run_id: Uuid, name: &str) {
        let mut slots = self.lock();
        let key = (run_id, name.to_string());
        if let Some(slot) = slots.get_mut(&key) {
            slot.waiters.retain(|w| !w.is_closed());
            if slot.waiters.is_empty() && slot.buffered.is_empty() {
                slots.remove(&key);
            }
        }
    }

    /// Outstanding waits, optionally restricted to one run.
    pub fn pending(&self, run_id: Option<Uuid>) -> Vec<PendingSignal> {
        let slots = self.lock();
        let mut pending: Vec<PendingSignal> = slots
            .iter()
            .filter(|((id, _), _)| run_id.is_none_or(|r| r == *id))
            .filter_map(|((id, name), slot)| {
                let waiters = slot.waiters.iter().filter(|w| !w.is_closed()).count();
                (waiters > 0).then(|| PendingSignal {
                    run_id: *id,
                    name: name.clone(),
                    waiters,
                })
            })
            .collect();
        pending.sort_by(|a, b| (a.run_id, &a.name).cmp(&(b.run_id, &b.name)));
        pending
    }

    /// Drop buffered payloads and wake every waiter of `run_id` with `Closed`.
    pub fn close_run(&self, run_id: Uuid) {
        self.lock().retain(|(id, _), _| *id != run_id);
    }
}

impl std::fmt::Debug for SignalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalChannel")
            .field("keys", &self.lock().len())
            .finish()
    }
}
