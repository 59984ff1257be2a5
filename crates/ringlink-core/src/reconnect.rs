//! Auto-reconnect engine
//!
//! Armed after a successful connection (or from the persisted record at start-up)
//! and triggered only by an unexpected link loss. The attempt counter counts failed
//! attempts: it starts at 0 when a reconnect cycle begins, grows by one per failure
//! and resets on success or manual disconnect. Attempts are unbounded; only the
//! delay is capped.
//!
//! While the radio is off the pending attempt is paused rather than cancelled.
//! Resuming fires the attempt at once and keeps the counter.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::backoff::BackoffPolicy;
use crate::persistence::PersistenceRecord;
use crate::timer::{TimerFired, TimerKind, TimerSlot};
use crate::types::Peripheral;

/// What the engine did after a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Next attempt armed on the reconnect timer
    Scheduled { attempt: u32, delay: Duration },
    /// Radio is off; the attempt waits for it to come back
    Paused,
    /// Not armed or nothing to reconnect to
    Idle,
}

/// Backoff-driven retry scheduler for a single ring
#[derive(Debug)]
pub struct ReconnectEngine {
    policy: BackoffPolicy,
    armed: bool,
    attempt: u32,
    paused: bool,
    target: Option<Peripheral>,
    timer: TimerSlot,
    rng: StdRng,
}

impl ReconnectEngine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests
    pub fn with_rng(policy: BackoffPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            armed: false,
            attempt: 0,
            paused: false,
            target: None,
            timer: TimerSlot::new(TimerKind::Reconnect),
            rng,
        }
    }

    /// Arm auto-reconnect for `target`
    pub fn arm(&mut self, target: Peripheral) {
        debug!("Auto-reconnect armed for {}", target);
        self.target = Some(target);
        self.armed = true;
    }

    /// Disarm and forget everything; returns true if a pending attempt was cancelled
    pub fn disarm(&mut self) -> bool {
        self.armed = false;
        self.attempt = 0;
        self.paused = false;
        self.target = None;
        self.timer.cancel()
    }

    /// Restore the armed flag and target from a persisted record
    pub fn seed(&mut self, record: &PersistenceRecord) {
        match record.peripheral() {
            Some(target) => {
                self.target = Some(target);
                self.armed = record.auto_reconnect;
            }
            None => {
                self.disarm();
            }
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Failed attempts in the current cycle
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_pending(&self) -> bool {
        self.timer.is_pending()
    }

    pub fn target(&self) -> Option<&Peripheral> {
        self.target.as_ref()
    }

    /// Start a new cycle after an unexpected loss
    pub fn begin<M>(&mut self, radio_enabled: bool, tx: &mpsc::UnboundedSender<M>) -> ReconnectStep
    where
        M: From<TimerFired> + Send + 'static,
    {
        if !self.armed || self.target.is_none() {
            return ReconnectStep::Idle;
        }
        self.attempt = 0;
        self.paused = false;
        info!("Starting auto-reconnect cycle");
        self.schedule(radio_enabled, tx)
    }

    /// Count a failed attempt and schedule the next one
    pub fn on_attempt_failed<M>(
        &mut self,
        radio_enabled: bool,
        tx: &mpsc::UnboundedSender<M>,
    ) -> ReconnectStep
    where
        M: From<TimerFired> + Send + 'static,
    {
        if !self.armed {
            return ReconnectStep::Idle;
        }
        self.attempt = self.attempt.saturating_add(1);
        self.schedule(radio_enabled, tx)
    }

    fn schedule<M>(&mut self, radio_enabled: bool, tx: &mpsc::UnboundedSender<M>) -> ReconnectStep
    where
        M: From<TimerFired> + Send + 'static,
    {
        if !radio_enabled {
            self.timer.cancel();
            self.paused = true;
            debug!("Radio off; reconnect attempt {} paused", self.attempt + 1);
            return ReconnectStep::Paused;
        }
        let next = self.attempt.saturating_add(1);
        let delay = self.policy.next_delay(next, &mut self.rng);
        self.timer.schedule(delay, tx);
        info!("Reconnect attempt {} in {:?}", next, delay);
        ReconnectStep::Scheduled {
            attempt: next,
            delay,
        }
    }

    /// Accept a reconnect timer firing; false for stale or foreign firings
    pub fn claim(&mut self, fired: TimerFired) -> bool {
        self.armed && self.timer.claim(fired)
    }

    /// Hold the pending attempt while the radio is off
    pub fn pause(&mut self) -> bool {
        if !self.armed || self.paused {
            return false;
        }
        self.timer.cancel();
        self.paused = true;
        debug!("Auto-reconnect paused at attempt {}", self.attempt + 1);
        true
    }

    /// Release a paused attempt; the caller fires it immediately
    pub fn resume(&mut self) -> bool {
        if !self.paused {
            return false;
        }
        self.paused = false;
        self.armed
    }

    /// Reset the cycle after a successful connection; stays armed
    pub fn on_success(&mut self) {
        self.attempt = 0;
        self.paused = false;
        self.timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;

    fn engine() -> ReconnectEngine {
        ReconnectEngine::with_rng(
            BackoffPolicy::new(ReconnectConfig::default()),
            StdRng::seed_from_u64(42),
        )
    }

    fn ring() -> Peripheral {
        Peripheral::parse("AA:BB:CC:DD:EE:01", Some("Q_Ring_1")).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unarmed_engine_does_nothing() {
        let (tx, _rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut engine = engine();
        assert_eq!(engine.begin(true, &tx), ReconnectStep::Idle);
        assert!(!engine.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_grows_per_failure_and_resets() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut engine = engine();
        engine.arm(ring());

        assert!(matches!(
            engine.begin(true, &tx),
            ReconnectStep::Scheduled { attempt: 1, .. }
        ));
        assert_eq!(engine.attempt(), 0);

        let fired = rx.recv().await.unwrap();
        assert!(engine.claim(fired));
        assert!(matches!(
            engine.on_attempt_failed(true, &tx),
            ReconnectStep::Scheduled { attempt: 2, .. }
        ));
        assert_eq!(engine.attempt(), 1);

        engine.on_success();
        assert_eq!(engine.attempt(), 0);
        assert!(engine.is_armed());
        assert!(!engine.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_preserve_counter() {
        let (tx, _rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut engine = engine();
        engine.arm(ring());
        engine.begin(true, &tx);
        engine.on_attempt_failed(true, &tx);
        engine.on_attempt_failed(true, &tx);
        assert_eq!(engine.attempt(), 2);

        assert!(engine.pause());
        assert!(!engine.is_pending());
        assert!(engine.is_paused());
        assert!(engine.resume());
        assert_eq!(engine.attempt(), 2);
        assert!(!engine.resume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduling_with_radio_off_pauses() {
        let (tx, _rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut engine = engine();
        engine.arm(ring());
        assert_eq!(engine.begin(false, &tx), ReconnectStep::Paused);
        assert!(engine.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_pending_attempt() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut engine = engine();
        engine.arm(ring());
        engine.begin(true, &tx);
        assert!(engine.disarm());
        assert!(!engine.is_armed());
        assert!(engine.target().is_none());

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_seed_from_record() {
        let mut engine = engine();
        engine.seed(&PersistenceRecord::new(&ring(), 1, true));
        assert!(engine.is_armed());
        assert_eq!(engine.target(), Some(&ring()));

        engine.seed(&PersistenceRecord::new(&ring(), 1, false));
        assert!(!engine.is_armed());
    }
}
