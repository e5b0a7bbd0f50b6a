//! Per-subscription throttle.
//!
//! Trailing edge: the first trigger on an idle subscription opens a window,
//! and every trigger up to its end collapses into one dispatch when it
//! closes. Triggers inside the window of the previous dispatch, or while one
//! is in flight, wait for that window instead. A zero interval dispatches at
//! once. A dispatch never overlaps another one of the same subscription.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Dispatch now
    RunNow,
    /// Arm a timer for this instant
    Wait(Instant),
    /// Folded into an already scheduled dispatch
    Coalesced,
}

#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_start: Option<Instant>,
    in_flight: bool,
    pending: bool,
    timer_armed: bool,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_start: None,
            in_flight: false,
            pending: false,
            timer_armed: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Mark a dispatch as started; the initial fetch goes through here too
    pub fn start(&mut self, now: Instant) {
        self.last_start = Some(now);
        self.in_flight = true;
        self.pending = false;
    }

    fn deadline(&self) -> Option<Instant> {
        self.last_start.map(|t| t + self.interval)
    }

    pub fn on_trigger(&mut self, now: Instant) -> ThrottleDecision {
        if self.in_flight || self.timer_armed {
            self.pending = true;
            return ThrottleDecision::Coalesced;
        }
        if self.interval.is_zero() {
            self.start(now);
            return ThrottleDecision::RunNow;
        }
        let deadline = match self.deadline() {
            Some(deadline) if now < deadline => deadline,
            _ => now + self.interval,
        };
        self.pending = true;
        self.timer_armed = true;
        ThrottleDecision::Wait(deadline)
    }

    /// Timer fired; `true` when the trailing dispatch should run now
    pub fn on_timer(&mut self, now: Instant) -> bool {
        self.timer_armed = false;
        if self.pending && !self.in_flight {
            self.start(now);
            true
        } else {
            false
        }
    }

    /// Dispatch finished; schedules the trailing dispatch if one is owed
    pub fn on_done(&mut self, now: Instant) -> Option<ThrottleDecision> {
        self.in_flight = false;
        if !self.pending || self.timer_armed {
            return None;
        }
        match self.deadline() {
            Some(deadline) if now < deadline => {
                self.timer_armed = true;
                Some(ThrottleDecision::Wait(deadline))
            }
            _ => {
                self.start(now);
                Some(ThrottleDecision::RunNow)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn idle_trigger_opens_a_window() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(100 * MS);
        assert_eq!(throttle.on_trigger(t0), ThrottleDecision::Wait(t0 + 100 * MS));
        for i in 1..10u32 {
            assert_eq!(throttle.on_trigger(t0 + i * 5 * MS), ThrottleDecision::Coalesced);
        }
        assert!(throttle.on_timer(t0 + 100 * MS));
        assert!(throttle.on_done(t0 + 110 * MS).is_none());

        // Inside the window of the last dispatch
        assert_eq!(throttle.on_trigger(t0 + 150 * MS), ThrottleDecision::Wait(t0 + 200 * MS));
        assert!(throttle.on_timer(t0 + 200 * MS));
        assert!(throttle.on_done(t0 + 205 * MS).is_none());

        assert_eq!(throttle.on_trigger(t0 + 900 * MS), ThrottleDecision::Wait(t0 + 1000 * MS));
    }

    #[test]
    fn zero_interval_runs_at_once() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(Duration::ZERO);
        assert_eq!(throttle.on_trigger(t0), ThrottleDecision::RunNow);
        assert!(throttle.on_done(t0 + MS).is_none());
        assert_eq!(throttle.on_trigger(t0 + 2 * MS), ThrottleDecision::RunNow);
    }

    #[test]
    fn trigger_during_flight_runs_after_completion() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(Duration::ZERO);
        throttle.start(t0);
        assert_eq!(throttle.on_trigger(t0 + MS), ThrottleDecision::Coalesced);
        assert_eq!(throttle.on_done(t0 + 2 * MS), Some(ThrottleDecision::RunNow));
        assert!(throttle.in_flight());
    }

    #[test]
    fn slow_dispatch_with_window_waits_for_deadline() {
        let t0 = Instant::now();
        let mut throttle = Throttle::new(100 * MS);
        throttle.start(t0);
        throttle.on_trigger(t0 + 10 * MS);
        assert_eq!(
            throttle.on_done(t0 + 20 * MS),
            Some(ThrottleDecision::Wait(t0 + 100 * MS))
        );
        assert_eq!(throttle.on_trigger(t0 + 30 * MS), ThrottleDecision::Coalesced);
        assert!(throttle.on_timer(t0 + 100 * MS));
    }
}
