use crate::error::{Error, Result};
use crate::messages::control::capture::CaptureKind;
use chrono::{Duration, NaiveDateTime, NaiveTime};
use priority_queue::DoublePriorityQueue;
use serde::{de::Visitor, Deserialize, Serialize, Serializer};
use std::{fmt::Display, str::FromStr};

/// Wall clock time of day a scheduled capture fires at, written as
/// `HH:MM` or `HH:MM:SS` in config files.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(pub NaiveTime);

impl FromStr for TimeOfDay {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
            .map(TimeOfDay)
            .map_err(|e| Error::InvalidSchedule(format!("{s:?} is not a time of day: {e}")))
    }
}

impl Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%H:%M:%S"))
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(TimeOfDayVisitor {})
    }
}

/// Wrapper type for the serde implementation.
struct TimeOfDayVisitor {}

impl<'de> Visitor<'de> for TimeOfDayVisitor {
    type Value = TimeOfDay;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("a time of day formatted as HH:MM or HH:MM:SS")
    }

    fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        TimeOfDay::from_str(v).map_err(serde::de::Error::custom)
    }
}

/// A capture that should happen every day at `time`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScheduleEntry {
    /// Local wall clock time.
    pub time: TimeOfDay,
    /// What to capture.
    pub command: CaptureKind,
}

impl ScheduleEntry {
    /// Create a new entry.
    pub fn new(time: TimeOfDay, command: CaptureKind) -> Self {
        Self { time, command }
    }
}

/// Calendar evaluation used by the trigger router.
pub trait ScheduleSource: Send {
    /// Entries that are due at `now` and have not been returned for this
    /// occurrence yet. Each occurrence is returned once.
    fn next_due_entries(&mut self, now: NaiveDateTime) -> Vec<ScheduleEntry>;

    /// When the next entry becomes due, `None` if nothing is scheduled.
    fn next_due_time(&self) -> Option<NaiveDateTime>;
}

/// Entries that repeat every day. Upcoming occurrences are kept in a
/// priority queue keyed on the time they fire.
pub struct DailySchedule {
    /// Entries as configured.
    entries: Vec<ScheduleEntry>,
    /// Index into `entries` prioritised by next occurrence.
    queue: DoublePriorityQueue<usize, NaiveDateTime>,
}

impl DailySchedule {
    /// Build the schedule and plan each entry's first occurrence after `now`.
    ///
    /// * `entries`: configured entries.
    /// * `now`: local wall clock time.
    pub fn new(entries: Vec<ScheduleEntry>, now: NaiveDateTime) -> Self {
        let mut queue = DoublePriorityQueue::new();
        for (idx, entry) in entries.iter().enumerate() {
            queue.push(idx, next_occurrence(entry.time, now));
        }
        Self { entries, queue }
    }

    /// Configured entries.
    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }
}

/// First time strictly after `after` that the wall clock reads `time`.
fn next_occurrence(time: TimeOfDay, after: NaiveDateTime) -> NaiveDateTime {
    let today = after.date().and_time(time.0);
    if today > after {
        today
    } else {
        today + Duration::days(1)
    }
}

impl ScheduleSource for DailySchedule {
    fn next_due_entries(&mut self, now: NaiveDateTime) -> Vec<ScheduleEntry> {
        let mut due = Vec::new();
        while let Some((&idx, &at)) = self.queue.peek_min() {
            if at > now {
                break;
            }
            self.queue.pop_min();
            // A missed run (suspended process, clock jump) fires once and
            // then continues from today.
            self.queue.push(idx, next_occurrence(self.entries[idx].time, now));
            due.push((at, idx));
        }
        // Ties keep configuration order.
        due.sort_unstable();
        due.into_iter().map(|(_, idx)| self.entries[idx]).collect()
    }

    fn next_due_time(&self) -> Option<NaiveDateTime> {
        self.queue.peek_min().map(|(_, at)| *at)
    }
}
