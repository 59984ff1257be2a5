//! Cancellable, replaceable timers
//!
//! A [`TimerSlot`] holds at most one pending timer of its kind. Scheduling a new
//! timer aborts the previous one, and every firing carries an id so the owner can
//! discard a firing that raced with a cancel or replace ([`TimerSlot::claim`]).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Timer kinds owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Reconnect,
    ScanTimeout,
}

/// Delivered to the owning task when a timer elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub id: u64,
}

/// Single-occupancy timer slot
#[derive(Debug)]
pub struct TimerSlot {
    kind: TimerKind,
    next_id: u64,
    active: Option<(u64, JoinHandle<()>)>,
}

impl TimerSlot {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            next_id: 0,
            active: None,
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// Arm the slot, cancelling any pending timer of this kind
    pub fn schedule<M>(&mut self, delay: Duration, tx: &mpsc::UnboundedSender<M>) -> u64
    where
        M: From<TimerFired> + Send + 'static,
    {
        self.cancel();
        self.next_id += 1;
        let fired = TimerFired {
            kind: self.kind,
            id: self.next_id,
        };
        let tx = tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(M::from(fired));
        });
        trace!("Scheduled {:?} timer #{} in {:?}", self.kind, fired.id, delay);
        self.active = Some((fired.id, task));
        fired.id
    }

    /// Cancel the pending timer, if any
    pub fn cancel(&mut self) -> bool {
        match self.active.take() {
            Some((id, task)) => {
                task.abort();
                trace!("Cancelled {:?} timer #{}", self.kind, id);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.active.is_some()
    }

    /// Accept a firing only if it belongs to the currently armed timer
    pub fn claim(&mut self, fired: TimerFired) -> bool {
        if fired.kind != self.kind {
            return false;
        }
        match &self.active {
            Some((id, _)) if *id == fired.id => {
                self.active = None;
                true
            }
            _ => {
                trace!("Discarding stale {:?} timer #{}", self.kind, fired.id);
                false
            }
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut slot = TimerSlot::new(TimerKind::Reconnect);
        let id = slot.schedule(Duration::from_secs(10), &tx);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, TimerFired { kind: TimerKind::Reconnect, id });
        assert!(slot.claim(fired));
        assert!(!slot.is_pending());
        assert!(!slot.claim(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_cancels_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut slot = TimerSlot::new(TimerKind::ScanTimeout);
        slot.schedule(Duration::from_secs(1), &tx);
        let second = slot.schedule(Duration::from_secs(5), &tx);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.id, second);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut slot = TimerSlot::new(TimerKind::Reconnect);
        slot.schedule(Duration::from_secs(1), &tx);
        assert!(slot.cancel());
        assert!(!slot.cancel());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
