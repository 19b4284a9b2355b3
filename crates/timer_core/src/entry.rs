use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::alarm::{Alarm, AlarmSchedule};
use crate::error::{Result, TimerError};
use crate::notification::TimerNotification;

/// Everything a caller supplies to register a timer notification.
///
/// Defaults match a one-shot, fixed-delay notification: no payload, period
/// 0, occurrences 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub notif_type: String,
    pub message: String,
    pub user_data: Value,
    pub date: DateTime<Utc>,
    /// Milliseconds between occurrences; 0 means one-shot.
    pub period_ms: i64,
    /// Total occurrences; 0 means unbounded. Ignored for one-shots.
    pub occurrences: i64,
    pub fixed_rate: bool,
}

impl NotificationRequest {
    pub fn new(notif_type: impl Into<String>, message: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            notif_type: notif_type.into(),
            message: message.into(),
            user_data: Value::Null,
            date,
            period_ms: 0,
            occurrences: 0,
            fixed_rate: false,
        }
    }

    pub fn user_data(mut self, user_data: Value) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn period(mut self, period_ms: i64) -> Self {
        self.period_ms = period_ms;
        self
    }

    pub fn occurrences(mut self, occurrences: i64) -> Self {
        self.occurrences = occurrences;
        self
    }

    pub fn fixed_rate(mut self, fixed_rate: bool) -> Self {
        self.fixed_rate = fixed_rate;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.period_ms < 0 {
            return Err(TimerError::InvalidArgument(format!(
                "negative period {}ms",
                self.period_ms
            )));
        }
        if self.occurrences < 0 {
            return Err(TimerError::InvalidArgument(format!(
                "negative occurrence count {}",
                self.occurrences
            )));
        }
        Ok(())
    }
}

/// Outcome of the reschedule step after an occurrence was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Repeat,
    Retire,
}

/// One registered notification inside a timer's table.
#[derive(Debug)]
pub(crate) struct TimerEntry {
    pub(crate) template: TimerNotification,
    pub(crate) date: DateTime<Utc>,
    pub(crate) period_ms: u64,
    pub(crate) remaining: u64,
    pub(crate) fixed_rate: bool,
    pub(crate) alarm: Option<Alarm>,
}

impl TimerEntry {
    pub(crate) fn new(
        template: TimerNotification,
        date: DateTime<Utc>,
        period_ms: u64,
        remaining: u64,
        fixed_rate: bool,
    ) -> Self {
        Self {
            template,
            date,
            period_ms,
            remaining,
            fixed_rate,
            alarm: None,
        }
    }

    pub(crate) fn notif_type(&self) -> &str {
        self.template.notif_type()
    }

    pub(crate) fn cancel_alarm(&mut self) {
        if let Some(alarm) = self.alarm.take() {
            alarm.cancel();
        }
    }

    /// Schedule used when arming from `start()` or `add`, relative to `now`.
    pub(crate) fn initial_schedule(&self, now: DateTime<Utc>) -> AlarmSchedule {
        if self.fixed_rate {
            AlarmSchedule::At(self.date)
        } else {
            AlarmSchedule::after_millis((self.date - now).num_milliseconds())
        }
    }

    /// Schedule for the occurrence after the one that just fired.
    pub(crate) fn next_schedule(&self) -> AlarmSchedule {
        if self.fixed_rate {
            AlarmSchedule::At(self.date)
        } else {
            AlarmSchedule::After(Duration::from_millis(self.period_ms))
        }
    }

    /// Moves the entry to its next occurrence, or reports that the occurrence
    /// just handled was its last.
    pub(crate) fn advance(&mut self) -> Step {
        if self.period_ms == 0 {
            return Step::Retire;
        }
        if self.remaining == 0 || self.remaining > 1 {
            self.date = self
                .date
                .checked_add_signed(chrono::Duration::milliseconds(self.period_ms as i64))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.remaining = self.remaining.saturating_sub(1);
            Step::Repeat
        } else {
            Step::Retire
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(period_ms: u64, remaining: u64, fixed_rate: bool) -> TimerEntry {
        let template = TimerNotification::template(
            "test".into(),
            "timer".into(),
            String::new(),
            Value::Null,
            1,
        );
        let date = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        TimerEntry::new(template, date, period_ms, remaining, fixed_rate)
    }

    #[test]
    fn rejects_negative_period_and_occurrences() {
        let now = Utc::now();
        let bad_period = NotificationRequest::new("t", "m", now).period(-1);
        let bad_count = NotificationRequest::new("t", "m", now).occurrences(-3);
        assert!(matches!(
            bad_period.validate(),
            Err(TimerError::InvalidArgument(_))
        ));
        assert!(matches!(
            bad_count.validate(),
            Err(TimerError::InvalidArgument(_))
        ));
        assert!(NotificationRequest::new("t", "m", now)
            .period(10)
            .occurrences(2)
            .validate()
            .is_ok());
    }

    #[test]
    fn one_shot_retires_immediately() {
        let mut one_shot = entry(0, 5, false);
        let date = one_shot.date;
        assert_eq!(one_shot.advance(), Step::Retire);
        assert_eq!(one_shot.date, date);
    }

    #[test]
    fn bounded_entry_counts_down_to_last_occurrence() {
        let mut bounded = entry(1_000, 3, false);
        let start = bounded.date;

        assert_eq!(bounded.advance(), Step::Repeat);
        assert_eq!(bounded.remaining, 2);
        assert_eq!(bounded.advance(), Step::Repeat);
        assert_eq!(bounded.remaining, 1);
        assert_eq!(bounded.date, start + chrono::Duration::milliseconds(2_000));
        assert_eq!(bounded.advance(), Step::Retire);
    }

    #[test]
    fn unbounded_entry_never_decrements() {
        let mut unbounded = entry(250, 0, true);
        for _ in 0..10 {
            assert_eq!(unbounded.advance(), Step::Repeat);
        }
        assert_eq!(unbounded.remaining, 0);
    }

    #[test]
    fn schedules_follow_fixed_rate_flag() {
        let fixed_rate = entry(500, 0, true);
        let fixed_delay = entry(500, 0, false);
        let now = fixed_delay.date - chrono::Duration::milliseconds(1_500);

        assert_eq!(fixed_rate.initial_schedule(now), AlarmSchedule::At(fixed_rate.date));
        assert_eq!(fixed_rate.next_schedule(), AlarmSchedule::At(fixed_rate.date));
        assert_eq!(
            fixed_delay.initial_schedule(now),
            AlarmSchedule::After(Duration::from_millis(1_500))
        );
        assert_eq!(
            fixed_delay.next_schedule(),
            AlarmSchedule::After(Duration::from_millis(500))
        );
    }
}
