//! Session Timer
//!
//! Counts down from the session's duration target and emits one-shot signals
//! at fixed remaining-time thresholds. Each signal fires at most once, even
//! when a coarse tick jumps over several thresholds at a time.

use crate::EngineEvent;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerSignal {
    /// 3 minutes left.
    PreClose,
    /// 2 minutes left.
    Close,
    /// 30 seconds left.
    FinalWarning,
    /// Time is up.
    HardStop,
}

impl TimerSignal {
    /// All signals, in firing order.
    pub const ALL: [TimerSignal; 4] = [
        TimerSignal::PreClose,
        TimerSignal::Close,
        TimerSignal::FinalWarning,
        TimerSignal::HardStop,
    ];

    pub fn remaining(self) -> Duration {
        match self {
            TimerSignal::PreClose => Duration::from_secs(180),
            TimerSignal::Close => Duration::from_secs(120),
            TimerSignal::FinalWarning => Duration::from_secs(30),
            TimerSignal::HardStop => Duration::ZERO,
        }
    }

    /// Notice spoken to the candidate when the signal fires, if any.
    pub fn spoken_notice(self) -> Option<&'static str> {
        match self {
            TimerSignal::Close => Some("You have two minutes remaining."),
            TimerSignal::FinalWarning => Some("Thirty seconds remaining."),
            TimerSignal::PreClose | TimerSignal::HardStop => None,
        }
    }

    fn index(self) -> usize {
        match self {
            TimerSignal::PreClose => 0,
            TimerSignal::Close => 1,
            TimerSignal::FinalWarning => 2,
            TimerSignal::HardStop => 3,
        }
    }
}

/// Pure threshold bookkeeping, independent of any clock.
#[derive(Debug, Clone)]
pub struct Countdown {
    fired: [bool; 4],
}

impl Countdown {
    /// Warning thresholds at or above `total` are skipped; the session starts
    /// already past them. The hard stop is always armed.
    pub fn new(total: Duration) -> Self {
        let mut fired = [false; 4];
        for signal in TimerSignal::ALL {
            if signal != TimerSignal::HardStop && signal.remaining() >= total {
                fired[signal.index()] = true;
            }
        }
        Self { fired }
    }

    /// Signals newly crossed at `remaining`, in order.
    pub fn observe(&mut self, remaining: Duration) -> Vec<TimerSignal> {
        let mut crossed = Vec::new();
        for signal in TimerSignal::ALL {
            let slot = &mut self.fired[signal.index()];
            if !*slot && remaining <= signal.remaining() {
                *slot = true;
                crossed.push(signal);
            }
        }
        crossed
    }

    pub fn is_finished(&self) -> bool {
        self.fired[TimerSignal::HardStop.index()]
    }
}

/// Background countdown task feeding `EngineEvent::Timer` into a session.
///
/// The task is aborted on `stop` or drop.
#[derive(Debug)]
pub struct SessionTimer {
    handle: Option<JoinHandle<()>>,
}

impl SessionTimer {
    pub fn start(
        total: Duration,
        tick: Duration,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        info!(total_secs = total.as_secs(), "Session timer started");
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut countdown = Countdown::new(total);
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let remaining = total.saturating_sub(started.elapsed());
                for signal in countdown.observe(remaining) {
                    debug!(?signal, remaining_secs = remaining.as_secs(), "Timer threshold crossed");
                    if events.send(EngineEvent::Timer(signal)).is_err() {
                        return;
                    }
                }
                if countdown.is_finished() {
                    return;
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
