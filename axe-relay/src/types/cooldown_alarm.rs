//! An alarm that fires at most once per cooldown window.
//!
//! Useful for notifying about a condition that may flap on and off
//! every poll without spamming the channel each time it comes back.
//!
//! # State Machine
//!
//! ```text
//!               check(true) && cooldown elapsed
//!   Normal ─────────────────────────────────────► Alerted
//!     ▲  │                                          │  ▲
//!     │  │ check(true), within cooldown             │  │ check(true)
//!     │  └──► (Suppressed, stays Normal)            │  │ (Triggered again once
//!     │                                             │  │  the window has passed,
//!     │              check(false)                   │  │  Suppressed before)
//!     └─────────────────────────────────────────────┘  │
//!                                                   └──┘
//! ```
//!
//! - **Normal:** Condition is false, or true but still inside the
//!   window opened by the last firing.
//! - **Alerted:** The alarm fired during the current episode.
//!
//! The cooldown is measured from the last firing, not from the last
//! transition. A condition that clears and comes back a minute later
//! is still suppressed until the full window has passed.

use std::time::Duration;

use tokio::time::Instant;

/// Result of [`CooldownAlarm::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmStatus {
    /// Condition is false, nothing was active.
    Idle,

    /// Condition is true and the cooldown has elapsed. The caller
    /// should notify.
    Triggered,

    /// Condition is true but an alert fired less than one cooldown ago.
    Suppressed,

    /// Was alerted, condition just became false. Returned once.
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Alerted,
}

/// Time-based alarm for one (device, alert kind) pair.
#[derive(Debug)]
pub struct CooldownAlarm {
    cooldown: Duration,
    state: State,
    last_fired: Option<Instant>,
}

impl CooldownAlarm {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            state: State::Normal,
            last_fired: None,
        }
    }

    /// Update the alarm with the current condition as observed at `now`.
    ///
    /// | State | condition | window passed | Result |
    /// |-------|-----------|---------------|--------|
    /// | Normal | false | - | `Idle` |
    /// | Alerted | false | - | `Resolved` |
    /// | any | true | yes (or never fired) | `Triggered` |
    /// | any | true | no | `Suppressed` |
    pub fn check(&mut self, condition: bool, now: Instant) -> AlarmStatus {
        if !condition {
            return match self.state {
                State::Normal => AlarmStatus::Idle,
                State::Alerted => {
                    self.state = State::Normal;
                    AlarmStatus::Resolved
                }
            };
        }

        let window_passed = self
            .last_fired
            .is_none_or(|fired| now.duration_since(fired) >= self.cooldown);

        if window_passed {
            self.state = State::Alerted;
            self.last_fired = Some(now);
            AlarmStatus::Triggered
        } else {
            AlarmStatus::Suppressed
        }
    }

    pub fn last_fired(&self) -> Option<Instant> {
        self.last_fired
    }

    pub fn is_alerted(&self) -> bool {
        self.state == State::Alerted
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(15 * 60);

    // start_paused makes Instant::now() deterministic and lets
    // time::advance() move the clock.

    #[tokio::test(start_paused = true)]
    async fn idle_stays_idle_on_false() {
        let mut alarm = CooldownAlarm::new(COOLDOWN);
        assert_eq!(alarm.check(false, Instant::now()), AlarmStatus::Idle);
        assert_eq!(alarm.check(false, Instant::now()), AlarmStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn first_true_triggers_immediately() {
        let mut alarm = CooldownAlarm::new(COOLDOWN);
        assert_eq!(alarm.check(true, Instant::now()), AlarmStatus::Triggered);
        assert!(alarm.is_alerted());
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_condition_is_suppressed_within_window() {
        let mut alarm = CooldownAlarm::new(COOLDOWN);
        assert_eq!(alarm.check(true, Instant::now()), AlarmStatus::Triggered);

        for _ in 0..29 {
            time::advance(Duration::from_secs(30)).await;
            assert_eq!(alarm.check(true, Instant::now()), AlarmStatus::Suppressed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_condition_refires_after_window() {
        let mut alarm = CooldownAlarm::new(COOLDOWN);
        alarm.check(true, Instant::now());

        time::advance(COOLDOWN).await;
        assert_eq!(alarm.check(true, Instant::now()), AlarmStatus::Triggered);
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_is_one_shot() {
        let mut alarm = CooldownAlarm::new(COOLDOWN);
        alarm.check(true, Instant::now());

        assert_eq!(alarm.check(false, Instant::now()), AlarmStatus::Resolved);
        assert_eq!(alarm.check(false, Instant::now()), AlarmStatus::Idle);
        assert!(!alarm.is_alerted());
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_does_not_refire_before_window() {
        let mut alarm = CooldownAlarm::new(COOLDOWN);
        let fired_at = Instant::now();
        assert_eq!(alarm.check(true, fired_at), AlarmStatus::Triggered);

        time::advance(Duration::from_secs(60)).await;
        assert_eq!(alarm.check(false, Instant::now()), AlarmStatus::Resolved);

        // Condition returns a minute later: still inside the window
        // opened by the first firing.
        time::advance(Duration::from_secs(60)).await;
        assert_eq!(alarm.check(true, Instant::now()), AlarmStatus::Suppressed);
        assert_eq!(alarm.last_fired(), Some(fired_at));

        time::advance(COOLDOWN - Duration::from_secs(120)).await;
        assert_eq!(alarm.check(true, Instant::now()), AlarmStatus::Triggered);
    }

    #[tokio::test(start_paused = true)]
    async fn suppressed_episode_clears_without_resolved() {
        let mut alarm = CooldownAlarm::new(COOLDOWN);
        alarm.check(true, Instant::now());
        alarm.check(false, Instant::now());

        // A suppressed episode never alerted, so there is nothing to
        // resolve when it ends.
        assert_eq!(alarm.check(true, Instant::now()), AlarmStatus::Suppressed);
        assert_eq!(alarm.check(false, Instant::now()), AlarmStatus::Idle);
    }
}
