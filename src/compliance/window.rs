// ABOUTME: Fixed-duration counting windows with lazy reset, grouped per identifier.
// ABOUTME: The four windows of an identifier are checked and incremented as one unit.

use chrono::{DateTime, Utc};

use crate::clock::{add_saturating, millis_until};
use crate::config::{GovernorConfig, WindowLimit};

/// Which rate window a check refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    Burst,
    Minute,
    Hour,
    Day,
}

impl WindowKind {
    /// Evaluation order: shortest and strictest first.
    pub const ORDER: [WindowKind; 4] = [
        WindowKind::Burst,
        WindowKind::Minute,
        WindowKind::Hour,
        WindowKind::Day,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Burst => "burst",
            WindowKind::Minute => "minute",
            WindowKind::Hour => "hour",
            WindowKind::Day => "day",
        }
    }
}

/// One counter with a limit and a reset instant.
#[derive(Debug, Clone, PartialEq)]
pub struct RateWindow {
    pub limit: WindowLimit,
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateWindow {
    pub fn new(limit: WindowLimit, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            count: 0,
            reset_at: add_saturating(now, limit.duration),
        }
    }

    /// Zero the counter once `reset_at` has passed.
    pub fn roll(&mut self, now: DateTime<Utc>) {
        if now >= self.reset_at {
            self.count = 0;
            self.reset_at = add_saturating(now, self.limit.duration);
        }
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.limit.limit
    }

    pub fn retry_after_ms(&self, now: DateTime<Utc>) -> u64 {
        millis_until(now, self.reset_at)
    }
}

/// The burst, minute, hour and day windows of one identifier.
#[derive(Debug, Clone)]
pub(crate) struct WindowSet {
    windows: [RateWindow; 4],
    last_admitted_at: Option<DateTime<Utc>>,
}

impl WindowSet {
    pub(crate) fn new(config: &GovernorConfig, now: DateTime<Utc>) -> Self {
        Self {
            windows: [
                RateWindow::new(config.burst, now),
                RateWindow::new(config.minute, now),
                RateWindow::new(config.hour, now),
                RateWindow::new(config.day, now),
            ],
            last_admitted_at: None,
        }
    }

    pub(crate) fn roll(&mut self, now: DateTime<Utc>) {
        for window in &mut self.windows {
            window.roll(now);
        }
    }

    /// The first full window in evaluation order, if any.
    pub(crate) fn first_full(&self) -> Option<(WindowKind, &RateWindow)> {
        WindowKind::ORDER
            .iter()
            .zip(self.windows.iter())
            .find(|(_, w)| w.is_full())
            .map(|(k, w)| (*k, w))
    }

    /// Count one admission in every window.
    pub(crate) fn increment(&mut self, now: DateTime<Utc>) {
        for window in &mut self.windows {
            window.count += 1;
        }
        self.last_admitted_at = Some(now);
    }

    /// A full day has passed since the last admission, or every window
    /// would reset on the next roll anyway.
    pub(crate) fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let day = self.windows[3].limit.duration;
        let idle = self
            .last_admitted_at
            .is_none_or(|at| now >= add_saturating(at, day));
        idle || self.windows.iter().all(|w| w.reset_at <= now)
    }

    pub(crate) fn snapshot(&self) -> Vec<(WindowKind, RateWindow)> {
        WindowKind::ORDER
            .iter()
            .copied()
            .zip(self.windows.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_window_resets_only_at_reset_time() {
        let now = Utc::now();
        let mut window = RateWindow::new(WindowLimit::new(2, Duration::from_secs(10)), now);
        window.count = 2;
        assert!(window.is_full());

        window.roll(now + chrono::Duration::milliseconds(9_999));
        assert_eq!(window.count, 2);
        assert_eq!(window.retry_after_ms(now + chrono::Duration::seconds(4)), 6_000);

        let later = now + chrono::Duration::seconds(10);
        window.roll(later);
        assert_eq!(window.count, 0);
        assert_eq!(window.reset_at, later + chrono::Duration::seconds(10));
    }

    #[test]
    fn test_first_full_follows_evaluation_order() {
        let now = Utc::now();
        let config = GovernorConfig::default().burst(1, Duration::from_secs(10)).per_minute(1);
        let mut set = WindowSet::new(&config, now);
        assert!(set.first_full().is_none());

        set.increment(now);
        let (kind, _) = set.first_full().unwrap();
        assert_eq!(kind, WindowKind::Burst);
    }

    #[test]
    fn test_recent_admissions_keep_the_set_alive() {
        let start = Utc::now();
        let config = GovernorConfig::default().burst(3, Duration::from_secs(10));
        let mut set = WindowSet::new(&config, start);
        set.increment(start);

        let late = start + chrono::Duration::seconds(86_400 - 2);
        set.roll(late);
        set.increment(late);

        // day window has rolled over, but the burst window is still live
        let after = start + chrono::Duration::seconds(86_401);
        assert!(!set.is_stale(after));
        assert!(set.is_stale(late + chrono::Duration::seconds(86_400)));
    }
}
