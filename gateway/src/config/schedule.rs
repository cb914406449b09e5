//! Weekly schedule windows of `scheduled` domains.

use core::{fmt, str::FromStr};

use chrono::{Datelike as _, NaiveDateTime, Timelike as _, Weekday};
use chrono_tz::Tz;

/// Minutes in a day; also the largest valid [`TimeOfDay`] (`24:00`).
const MINUTES_PER_DAY: u16 = 24 * 60;

/// A wall-clock time with minute resolution, `00:00` to `24:00` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    /// Returns `None` unless `0 <= hour*60+minute <= 24:00` and `minute < 60`.
    #[must_use]
    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        let total = hour.checked_mul(60)?.checked_add(minute)?;
        (minute < 60 && total <= MINUTES_PER_DAY).then_some(Self(total))
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hour, minute) = s
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got '{s}'"))?;
        let hour: u16 = hour
            .parse()
            .map_err(|_| format!("invalid hour in '{s}'"))?;
        let minute: u16 = minute
            .parse()
            .map_err(|_| format!("invalid minute in '{s}'"))?;
        Self::from_hm(hour, minute).ok_or_else(|| format!("time '{s}' is out of range"))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// A set of weekdays stored as a bitmask, Monday being bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Weekdays(u8);

impl Weekdays {
    pub const ALL: Self = Self(0b111_1111);

    #[must_use]
    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    #[must_use]
    pub fn with(self, day: Weekday) -> Self {
        Self(self.0 | (1 << day.num_days_from_monday()))
    }

    /// The contained days, Monday first.
    pub fn iter(self) -> impl Iterator<Item = Weekday> {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter(move |&day| self.contains(day))
    }

    /// Parses day names such as `mon` or `Monday`. An empty list means every day.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        if names.is_empty() {
            return Ok(Self::ALL);
        }
        names.iter().try_fold(Self::default(), |set, name| {
            let name = name.as_ref();
            name.trim()
                .parse::<Weekday>()
                .map(|day| set.with(day))
                .map_err(|_| format!("unknown weekday '{name}'"))
        })
    }
}

/// A daily time window active on some weekdays.
///
/// Windows are inclusive-start, exclusive-end. A window whose end is before
/// its start wraps past midnight and the part after midnight belongs to the
/// day the window started on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub days: Weekdays,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl ScheduleWindow {
    /// Returns an error for empty windows (`start == end`).
    pub fn new(days: Weekdays, start: TimeOfDay, end: TimeOfDay) -> Result<Self, String> {
        if start == end {
            return Err(format!("window {start}-{end} is empty"));
        }
        Ok(Self { days, start, end })
    }

    #[must_use]
    pub const fn wraps_midnight(&self) -> bool {
        self.end.0 < self.start.0
    }

    /// Whether a local weekday/time falls inside this window.
    #[must_use]
    pub fn contains(&self, day: Weekday, time: TimeOfDay) -> bool {
        if self.wraps_midnight() {
            (self.days.contains(day) && time >= self.start)
                || (self.days.contains(day.pred()) && time < self.end)
        } else {
            self.days.contains(day) && self.start <= time && time < self.end
        }
    }
}

/// A domain's weekly schedule: a union of windows in one timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub windows: Vec<ScheduleWindow>,
    pub timezone: Tz,
}

impl Schedule {
    /// Whether the local time (already converted to [`Self::timezone`]) is inside any window.
    #[must_use]
    pub fn contains_local(&self, local: NaiveDateTime) -> bool {
        // `hour * 60 + minute` never exceeds 23:59, which always fits.
        let Some(time) = TimeOfDay::from_hm(
            u16::try_from(local.hour()).unwrap_or_default(),
            u16::try_from(local.minute()).unwrap_or_default(),
        ) else {
            return false;
        };
        let day = local.weekday();
        self.windows.iter().any(|w| w.contains(day, time))
    }
}
