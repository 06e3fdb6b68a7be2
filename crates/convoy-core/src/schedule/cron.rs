//! 5-field cron expression parsing and next-fire computation.
//!
//! Field order: minute, hour, day-of-month, month, day-of-week. Each field
//! accepts `*`, literals, lists (`a,b,c`), ranges (`a-b`), and steps
//! (`*/n`, `a-b/n`, `a/n`). Day-of-week runs 0–7 with both 0 and 7 meaning
//! Sunday. When day-of-month and day-of-week are both restricted, a time
//! matches if either does (standard cron semantics).

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronParseError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field} value {value} out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

// ---------------------------------------------------------------------------
// CronField
// ---------------------------------------------------------------------------

/// The set of values one field matches, as a bitmask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    mask: u64,
    /// True when the field was a bare `*`. Day fields use this to decide
    /// the day-of-month / day-of-week OR rule.
    any: bool,
}

impl CronField {
    pub fn contains(&self, value: u32) -> bool {
        self.any || (value < 64 && self.mask & (1 << value) != 0)
    }

    /// A field is restricted when it was anything other than a bare `*`.
    pub fn is_restricted(&self) -> bool {
        !self.any
    }

    fn parse(text: &str, field: &'static str, min: u32, max: u32, sunday_wraps: bool) -> Result<Self, CronParseError> {
        if text == "*" {
            return Ok(Self { mask: 0, any: true });
        }

        let invalid = || CronParseError::InvalidValue {
            field,
            value: text.to_string(),
        };

        let mut mask = 0u64;
        for part in text.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid())?;
                    if step == 0 {
                        return Err(invalid());
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let parse_value = |s: &str| -> Result<u32, CronParseError> {
                let v: u32 = s.parse().map_err(|_| invalid())?;
                if v < min || v > max {
                    return Err(CronParseError::OutOfRange {
                        field,
                        value: v,
                        min,
                        max,
                    });
                }
                Ok(v)
            };

            let (lo, hi) = if range == "*" {
                (min, max)
            } else if let Some((lo, hi)) = range.split_once('-') {
                let (lo, hi) = (parse_value(lo)?, parse_value(hi)?);
                if lo > hi {
                    return Err(invalid());
                }
                (lo, hi)
            } else {
                let v = parse_value(range)?;
                // `a/n` extends from a to the field maximum, like Vixie cron
                if part.contains('/') {
                    (v, max)
                } else {
                    (v, v)
                }
            };

            let mut v = lo;
            while v <= hi {
                let stored = if sunday_wraps && v == 7 { 0 } else { v };
                mask |= 1 << stored;
                v += step;
            }
        }

        Ok(Self { mask, any: false })
    }
}

// ---------------------------------------------------------------------------
// CronExpr
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }
        Ok(Self {
            minute: CronField::parse(fields[0], "minute", 0, 59, false)?,
            hour: CronField::parse(fields[1], "hour", 0, 23, false)?,
            day_of_month: CronField::parse(fields[2], "day-of-month", 1, 31, false)?,
            month: CronField::parse(fields[3], "month", 1, 12, false)?,
            day_of_week: CronField::parse(fields[4], "day-of-week", 0, 7, true)?,
        })
    }

    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.contains(t.minute())
            && self.hour.contains(t.hour())
            && self.month.contains(t.month())
            && self.day_matches(t)
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.day_of_month.contains(t.day());
        let dow = self.day_of_week.contains(t.weekday().num_days_from_sunday());
        if self.day_of_month.is_restricted() && self.day_of_week.is_restricted() {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// The next matching minute strictly after `after`, or `None` when no
    /// minute within the next five years matches (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = after + Duration::days(366 * 5);

        while t <= limit {
            if !self.month.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                let first = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                t = Utc.from_utc_datetime(&first);
                continue;
            }
            if !self.day_matches(t) {
                let next_day = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?;
                t = Utc.from_utc_datetime(&next_day);
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t = t + Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
