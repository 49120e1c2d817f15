//! Debounce timing for filesystem event batches.
//!
//! A classic timer-per-batch scheme: each new event restarts the debounce
//! window, but a batch is never delayed more than `max_debounce` past its
//! first event.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::trace;

struct DebounceState {
    /// When the first event of the current batch arrived.
    first_event: Option<Instant>,
    /// When the batch should fire absent further events.
    deadline: Option<Instant>,
    bounces: u64,
}

/// Restartable debounce timer. `start_or_bounce` on each event; the fire
/// channel receives one `()` per expired batch.
#[derive(Clone)]
pub struct DebounceController {
    name: String,
    debounce: Duration,
    max_debounce: Duration,
    state: Arc<Mutex<DebounceState>>,
    notify: Arc<Notify>,
}

impl DebounceController {
    /// Create the controller and its timer task. Fired batches arrive on
    /// the returned receiver; the timer task ends when the controller and
    /// all clones of the receiver are gone.
    pub fn new(
        name: impl Into<String>,
        debounce: Duration,
        max_debounce: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<()>) {
        let name = name.into();
        let state = Arc::new(Mutex::new(DebounceState {
            first_event: None,
            deadline: None,
            bounces: 0,
        }));
        let notify = Arc::new(Notify::new());
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();

        let timer_state = state.clone();
        let timer_notify = notify.clone();
        let timer_name = name.clone();
        tokio::spawn(async move {
            loop {
                let fire_at = { timer_state.lock().unwrap().deadline };
                match fire_at {
                    None => timer_notify.notified().await,
                    Some(deadline) => {
                        let now = Instant::now();
                        if deadline > now {
                            tokio::select! {
                                _ = tokio::time::sleep(deadline - now) => {}
                                _ = timer_notify.notified() => continue,
                            }
                        }
                        // Re-check: the deadline may have moved while we slept.
                        let should_fire = {
                            let mut state = timer_state.lock().unwrap();
                            match state.deadline {
                                Some(current) if current <= Instant::now() => {
                                    trace!("debounce {} firing after {} bounces", timer_name, state.bounces);
                                    state.first_event = None;
                                    state.deadline = None;
                                    state.bounces = 0;
                                    true
                                }
                                _ => false,
                            }
                        };
                        if should_fire && fire_tx.send(()).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        (
            DebounceController {
                name,
                debounce,
                max_debounce,
                state,
                notify,
            },
            fire_rx,
        )
    }

    /// Record an event: start the window, or push the deadline out, bounded
    /// by `max_debounce` past the first event.
    pub fn start_or_bounce(&self) {
        let now = Instant::now();
        {
            let mut state = self.state.lock().unwrap();
            let first = *state.first_event.get_or_insert(now);
            let cap = first + self.max_debounce;
            let candidate = now + self.debounce;
            let new_deadline = candidate.min(cap);
            match state.deadline {
                Some(existing) if existing == new_deadline => {
                    trace!("debounce {} at max delay, not extending", self.name);
                }
                _ => {
                    state.deadline = Some(new_deadline);
                    state.bounces += 1;
                }
            }
        }
        self.notify.notify_one();
    }

    /// Abandon the pending batch without firing.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.first_event = None;
        state.deadline = None;
        state.bounces = 0;
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().unwrap().deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fires_after_quiet_period() {
        let (controller, mut fired) = DebounceController::new(
            "t",
            Duration::from_millis(50),
            Duration::from_millis(500),
        );
        controller.start_or_bounce();
        let start = Instant::now();
        tokio::time::timeout(Duration::from_secs(1), fired.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert!(!controller.is_pending());
    }

    #[tokio::test]
    async fn test_new_events_restart_the_window() {
        let (controller, mut fired) = DebounceController::new(
            "t",
            Duration::from_millis(80),
            Duration::from_secs(5),
        );
        let start = Instant::now();
        controller.start_or_bounce();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            controller.start_or_bounce();
        }
        tokio::time::timeout(Duration::from_secs(1), fired.recv())
            .await
            .unwrap()
            .unwrap();
        // Three bounces at 40ms each push the fire past 120ms + the window.
        assert!(start.elapsed() >= Duration::from_millis(180));
    }

    #[tokio::test]
    async fn test_max_debounce_caps_the_delay() {
        let (controller, mut fired) = DebounceController::new(
            "t",
            Duration::from_millis(100),
            Duration::from_millis(250),
        );
        let start = Instant::now();
        controller.start_or_bounce();
        // Keep bouncing more often than the debounce window forever.
        let bouncer = tokio::spawn({
            let controller = controller.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    controller.start_or_bounce();
                }
            }
        });
        tokio::time::timeout(Duration::from_secs(2), fired.recv())
            .await
            .unwrap()
            .unwrap();
        bouncer.abort();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(240), "fired too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1000), "max debounce did not cap: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_clear_cancels_pending_fire() {
        let (controller, mut fired) = DebounceController::new(
            "t",
            Duration::from_millis(50),
            Duration::from_millis(500),
        );
        controller.start_or_bounce();
        controller.clear();
        let result = tokio::time::timeout(Duration::from_millis(200), fired.recv()).await;
        assert!(result.is_err(), "cleared batch must not fire");
    }
}
