//! Awake/Asleep duty cycle.
//!
//! The state is a pure function of the current UTC time, the wake window and
//! the active weekdays; nothing is persisted between checks.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use tracing::warn;

use crate::config::ScheduleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyState {
    Awake,
    Asleep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub wake_time: NaiveTime,
    pub sleep_time: NaiveTime,
    pub wake_days: Vec<Weekday>,
    pub wake_frequency: Duration,
    /// Slow-work cadence while asleep; `None` means no work while asleep.
    pub sleep_frequency: Option<Duration>,
    pub default_pause: Duration,
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

fn default_wake_time() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default()
}

fn default_sleep_time() -> NaiveTime {
    NaiveTime::from_hms_opt(19, 0, 0).unwrap_or_default()
}

const WEEKDAYS: [Weekday; 5] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
];

impl Default for Schedule {
    fn default() -> Self {
        Self {
            wake_time: default_wake_time(),
            sleep_time: default_sleep_time(),
            wake_days: WEEKDAYS.to_vec(),
            wake_frequency: minutes(5),
            sleep_frequency: None,
            default_pause: minutes(60),
        }
    }
}

/// `HH:MM` or `HHMM`.
pub fn parse_time(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    let (h, m) = match text.split_once(':') {
        Some((h, m)) => (h, m),
        None if text.len() == 4 => text.split_at(2),
        None => return None,
    };
    NaiveTime::from_hms_opt(h.trim().parse().ok()?, m.trim().parse().ok()?, 0)
}

/// ISO weekday numbers (`1` = Monday) or English names, separated by any of
/// `,` `;` `:` or whitespace. Unknown tokens are ignored.
pub fn parse_weekdays(text: &str) -> Vec<Weekday> {
    let mut days = Vec::new();
    for token in text
        .split([',', ';', ':', ' ', '\t'])
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        let day = match token.parse::<u32>() {
            Ok(n @ 1..=7) => Weekday::try_from((n - 1) as u8).ok(),
            Ok(_) => None,
            Err(_) => token.parse::<Weekday>().ok(),
        };
        match day {
            Some(d) if !days.contains(&d) => days.push(d),
            Some(_) => {}
            None => warn!(token, "Ignoring unknown weekday"),
        }
    }
    days
}

impl Schedule {
    /// Build from configuration, falling back to defaults (with a warning)
    /// on anything unparsable.
    pub fn from_config(config: &ScheduleConfig) -> Self {
        let wake_time = parse_time(&config.wake_time).unwrap_or_else(|| {
            warn!(value = %config.wake_time, "Invalid wake time, using 08:00");
            default_wake_time()
        });
        let sleep_time = parse_time(&config.sleep_time).unwrap_or_else(|| {
            warn!(value = %config.sleep_time, "Invalid sleep time, using 19:00");
            default_sleep_time()
        });
        let mut wake_days = parse_weekdays(&config.wake_days);
        if wake_days.is_empty() {
            warn!(value = %config.wake_days, "No valid wake days, using Monday-Friday");
            wake_days = WEEKDAYS.to_vec();
        }

        Self {
            wake_time,
            sleep_time,
            wake_days,
            wake_frequency: minutes(config.wake_frequency_mins.max(1)),
            sleep_frequency: (config.sleep_frequency_mins > 0)
                .then(|| minutes(config.sleep_frequency_mins)),
            default_pause: minutes(config.default_pause_mins.max(1)),
        }
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> DutyState {
        if !self.wake_days.contains(&now.weekday()) {
            return DutyState::Asleep;
        }
        let t = now.time();
        let awake = if self.wake_time <= self.sleep_time {
            self.wake_time <= t && t < self.sleep_time
        } else {
            // Window spans midnight.
            t >= self.wake_time || t < self.sleep_time
        };
        if awake {
            DutyState::Awake
        } else {
            DutyState::Asleep
        }
    }

    pub fn should_work_at(&self, now: DateTime<Utc>) -> bool {
        self.state_at(now) == DutyState::Awake || self.sleep_frequency.is_some()
    }

    pub fn pause_at(&self, now: DateTime<Utc>) -> Duration {
        match (self.state_at(now), self.sleep_frequency) {
            (DutyState::Awake, _) => self.wake_frequency,
            (DutyState::Asleep, Some(slow)) => slow,
            (DutyState::Asleep, None) => self.default_pause,
        }
    }

    pub fn state(&self) -> DutyState {
        self.state_at(Utc::now())
    }

    pub fn should_work(&self) -> bool {
        self.should_work_at(Utc::now())
    }

    pub fn pause(&self) -> Duration {
        self.pause_at(Utc::now())
    }
}
