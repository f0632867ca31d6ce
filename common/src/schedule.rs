use std::{fmt, str::FromStr};

use chrono::{NaiveDateTime, Timelike};

use crate::{
    error::ConfigError,
    types::{DayType, Direction},
};

/// A signed time-of-day boundary such as `+08:00` (power on) or `-18:30`
/// (power off).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRule {
    pub direction: Direction,
    pub minute: u16,
}

impl TimeRule {
    pub fn new(direction: Direction, minute: u16) -> Self {
        Self { direction, minute }
    }

    /// Inclusive on both ends. A window that wraps past midnight
    /// (`prev > now`) matches nothing.
    pub fn fires(&self, direction: Direction, time_prev: u16, time_now: u16) -> bool {
        self.direction == direction && time_prev <= self.minute && self.minute <= time_now
    }
}

impl FromStr for TimeRule {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidTime(value.to_string());

        let mut chars = value.chars();
        let direction = match chars.next() {
            Some('+') => Direction::Start,
            Some('-') => Direction::Stop,
            _ => return Err(invalid()),
        };

        let (hour, minute) = chars.as_str().split_once(':').ok_or_else(invalid)?;
        if hour.is_empty()
            || hour.len() > 2
            || minute.len() != 2
            || !hour.bytes().all(|b| b.is_ascii_digit())
            || !minute.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let hour: u16 = hour.parse().map_err(|_| invalid())?;
        let minute: u16 = minute.parse().map_err(|_| invalid())?;
        if hour > 23 || minute > 59 {
            return Err(invalid());
        }

        Ok(Self::new(direction, hour * 60 + minute))
    }
}

impl fmt::Display for TimeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:02}:{:02}",
            self.direction.sign(),
            self.minute / 60,
            self.minute % 60
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSchedule {
    pub workday: Option<Vec<TimeRule>>,
    pub holiday: Option<Vec<TimeRule>>,
    pub anyday: Option<Vec<TimeRule>>,
}

impl DeviceSchedule {
    pub fn parse_rules(raw: Option<&[String]>) -> Result<Option<Vec<TimeRule>>, ConfigError> {
        raw.map(|rules| rules.iter().map(|rule| rule.parse()).collect())
            .transpose()
    }

    pub fn has_schedule(&self) -> bool {
        [&self.workday, &self.holiday, &self.anyday]
            .into_iter()
            .any(|rules| rules.as_ref().is_some_and(|rules| !rules.is_empty()))
    }

    /// Workday rules on a workday, holiday rules on a holiday, otherwise the
    /// anyday rules. Empty lists count as absent.
    pub fn rules_for(&self, day: Option<DayType>) -> Option<&[TimeRule]> {
        fn non_empty(rules: &Option<Vec<TimeRule>>) -> Option<&[TimeRule]> {
            rules.as_deref().filter(|rules| !rules.is_empty())
        }

        match day {
            Some(DayType::Workday) if non_empty(&self.workday).is_some() => {
                non_empty(&self.workday)
            }
            Some(DayType::Holiday) if non_empty(&self.holiday).is_some() => {
                non_empty(&self.holiday)
            }
            _ => non_empty(&self.anyday),
        }
    }

    pub fn check(
        &self,
        direction: Direction,
        day: Option<DayType>,
        time_prev: u16,
        time_now: u16,
    ) -> bool {
        self.rules_for(day).is_some_and(|rules| {
            rules
                .iter()
                .any(|rule| rule.fires(direction, time_prev, time_now))
        })
    }

    pub fn check_startup(&self, day: Option<DayType>, time_prev: u16, time_now: u16) -> bool {
        self.check(Direction::Start, day, time_prev, time_now)
    }

    pub fn check_shutdown(&self, day: Option<DayType>, time_prev: u16, time_now: u16) -> bool {
        self.check(Direction::Stop, day, time_prev, time_now)
    }
}

pub fn minute_of_day(now: NaiveDateTime) -> u16 {
    (now.hour() * 60 + now.minute()) as u16
}

/// Previous and current minute-of-day seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleCursor {
    time_now: u16,
}

impl ScheduleCursor {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            time_now: minute_of_day(now),
        }
    }

    /// Moves the cursor to `now` and returns `(time_prev, time_now)`.
    pub fn advance(&mut self, now: NaiveDateTime) -> (u16, u16) {
        let time_prev = self.time_now;
        self.time_now = minute_of_day(now);
        (time_prev, self.time_now)
    }
}
