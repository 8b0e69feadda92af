use std::{fmt, str::FromStr};

use chrono::{DateTime, FixedOffset, NaiveDate, Timelike};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Time of day for a reminder, written `HH:MM` on the wire and in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReminderTime {
    hour: u8,
    minute: u8,
}

impl ReminderTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self, ConfigError> {
        if hour > 23 || minute > 59 {
            return Err(ConfigError::InvalidReminder(format!(
                "{hour:02}:{minute:02} is not a time of day"
            )));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    pub fn minutes_of_day(self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }
}

impl fmt::Display for ReminderTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for ReminderTime {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidReminder(format!("`{value}` is not HH:MM"));

        let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
        let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 || !digits(hour) || !digits(minute) {
            return Err(invalid());
        }
        let hour = hour.parse::<u8>().map_err(|_| invalid())?;
        let minute = minute.parse::<u8>().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for ReminderTime {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReminderTime> for String {
    fn from(value: ReminderTime) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Fired { at: DateTime<FixedOffset> },
    /// Window passed without a tick inside it. Consumed for the day, never fired late.
    Missed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub time: ReminderTime,
    pub state: EntryState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReminderEvent {
    pub scheduled: ReminderTime,
    /// Set once the actuator actually started.
    pub fired_at: Option<DateTime<FixedOffset>>,
}

/// Daily reminder schedule with one fire per entry per calendar day.
#[derive(Debug, Clone)]
pub struct ReminderScheduler {
    entries: Vec<ScheduleEntry>,
    window_minutes: u16,
    last_seen_date: Option<NaiveDate>,
    last_fired: Option<DateTime<FixedOffset>>,
}

impl ReminderScheduler {
    pub fn new(times: &[ReminderTime], window_minutes: u16) -> Self {
        let mut scheduler = Self {
            entries: Vec::new(),
            window_minutes,
            last_seen_date: None,
            last_fired: None,
        };
        scheduler.set_times(times, None);
        scheduler
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn times(&self) -> Vec<ReminderTime> {
        self.entries.iter().map(|entry| entry.time).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state == EntryState::Pending)
            .count()
    }

    pub fn last_fired(&self) -> Option<DateTime<FixedOffset>> {
        self.last_fired
    }

    pub fn record_fired(&mut self, event: &ReminderEvent) {
        if let Some(at) = event.fired_at {
            self.last_fired = Some(at);
        }
    }

    /// Replaces the schedule. Entries kept from the previous schedule keep
    /// today's state; new entries whose window already passed today are
    /// marked missed so they do not fire late.
    pub fn set_times(&mut self, times: &[ReminderTime], now: Option<DateTime<FixedOffset>>) {
        let mut times = times.to_vec();
        times.sort();
        times.dedup();

        let previous = std::mem::take(&mut self.entries);
        let now_minute = now
            .filter(|now| Some(now.date_naive()) == self.last_seen_date)
            .map(minute_of_day);

        self.entries = times
            .into_iter()
            .map(|time| {
                let state = previous
                    .iter()
                    .find(|entry| entry.time == time)
                    .map(|entry| entry.state)
                    .unwrap_or_else(|| match now_minute {
                        Some(minute) if minute > time.minutes_of_day() + self.window_minutes => {
                            EntryState::Missed
                        }
                        _ => EntryState::Pending,
                    });
                ScheduleEntry { time, state }
            })
            .collect();

        info!("reminder schedule set to {} entr(ies)", self.entries.len());
    }

    pub fn check_due(&mut self, now: DateTime<FixedOffset>) -> Vec<ReminderEvent> {
        self.roll_over_if_needed(now.date_naive());

        let now_minute = minute_of_day(now);
        let mut due = Vec::new();

        for entry in self
            .entries
            .iter_mut()
            .filter(|entry| entry.state == EntryState::Pending)
        {
            let start = entry.time.minutes_of_day();
            if now_minute < start {
                continue;
            }

            if now_minute <= start + self.window_minutes {
                entry.state = EntryState::Fired { at: now };
                due.push(ReminderEvent {
                    scheduled: entry.time,
                    fired_at: None,
                });
            } else {
                warn!("reminder {} missed its window; not firing late", entry.time);
                entry.state = EntryState::Missed;
            }
        }

        due
    }

    fn roll_over_if_needed(&mut self, today: NaiveDate) {
        match self.last_seen_date {
            Some(last) if last == today => {}
            Some(last) if last > today => {
                // Wall clock stepped back; re-arming would fire twice on one day.
                warn!("local date moved backwards from {last} to {today}; keeping reminder state");
            }
            previous => {
                if previous.is_some() {
                    info!("new day {today}; re-arming {} reminder(s)", self.entries.len());
                }
                for entry in &mut self.entries {
                    entry.state = EntryState::Pending;
                }
                self.last_seen_date = Some(today);
            }
        }
    }
}

fn minute_of_day(now: DateTime<FixedOffset>) -> u16 {
    (now.hour() * 60 + now.minute()) as u16
}
