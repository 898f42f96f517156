//! Cron expressions: aliases, a small builder and a schedule wrapper.
//!
//! Accepted inputs:
//! - 5-field cron `min hour dom month dow`,
//! - 6-field cron with seconds *last* `min hour dom month dow sec`,
//! - aliases (`@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly`,
//!   `@workdays`, `@weekends`),
//! - `@every <n><unit>` with unit `s`, `m`, `h`, `d` or `mo`.
//!
//! Day-of-week numbers follow the usual 0-7 convention (0 and 7 are Sunday).

use std::str::FromStr;

use chrono::{DateTime, TimeZone};
use cron::Schedule;

use crate::error::CronError;

fn invalid(expr: &str, reason: impl Into<String>) -> CronError {
    CronError::Invalid {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

/// Interval for [`Cron::every`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Every {
    Seconds(u32),
    Minutes(u32),
    Hours(u32),
    Days(u32),
    Months(u32),
    /// Not expressible as a cron expression; always rejected.
    Weeks(u32),
}

impl Every {
    fn parse(interval: &str) -> Result<Self, CronError> {
        let interval = interval.trim();
        let split = interval
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid(interval, "missing unit"))?;
        let (count, unit) = interval.split_at(split);
        let count: u32 = count
            .parse()
            .map_err(|_| invalid(interval, "missing interval count"))?;
        match unit {
            "s" => Ok(Self::Seconds(count)),
            "m" => Ok(Self::Minutes(count)),
            "h" => Ok(Self::Hours(count)),
            "d" => Ok(Self::Days(count)),
            "mo" => Ok(Self::Months(count)),
            "w" => Ok(Self::Weeks(count)),
            other => Err(invalid(interval, format!("unknown unit `{other}`"))),
        }
    }
}

/// Builders producing cron strings.
pub struct Cron;

impl Cron {
    pub fn every(interval: Every) -> Result<String, CronError> {
        let expr = match interval {
            Every::Seconds(n) => format!("* * * * * */{}", positive(n)?),
            Every::Minutes(n) => format!("*/{} * * * *", positive(n)?),
            Every::Hours(n) => format!("0 */{} * * *", positive(n)?),
            Every::Days(n) => format!("0 0 */{} * *", positive(n)?),
            Every::Months(n) => format!("0 0 1 */{} *", positive(n)?),
            Every::Weeks(_) => return Err(CronError::UnsupportedInterval("weeks".into())),
        };
        Ok(expr)
    }

    /// Every day at `at` (`HH:MM` or `HH:MM:SS`).
    pub fn daily(at: &str) -> Result<String, CronError> {
        Ok(with_time(at_time(at)?, "* * *"))
    }

    /// On the given weekdays (names like `mon`, or numbers 0-7).
    pub fn weekly(days: &[&str], at: &str) -> Result<String, CronError> {
        if days.is_empty() {
            return Err(invalid("weekly", "no weekday given"));
        }
        let days = days
            .iter()
            .map(|day| weekday_number(day))
            .collect::<Result<Vec<_>, _>>()?;
        let days = days
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Ok(with_time(at_time(at)?, &format!("* * {days}")))
    }

    /// On the given days of month (1-31).
    pub fn monthly(days: &[u32], at: &str) -> Result<String, CronError> {
        if days.is_empty() {
            return Err(invalid("monthly", "no day given"));
        }
        if let Some(day) = days.iter().find(|d| !(1..=31).contains(*d)) {
            return Err(invalid("monthly", format!("day {day} out of range")));
        }
        let days = days
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Ok(with_time(at_time(at)?, &format!("{days} * *")))
    }

    pub fn yearly(month: u32, day: u32, at: &str) -> Result<String, CronError> {
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(invalid("yearly", format!("{month}-{day} is not a date")));
        }
        Ok(with_time(at_time(at)?, &format!("{day} {month} *")))
    }

    /// `daily` and `@daily` both give `0 0 * * *`.
    pub fn alias(name: &str) -> Result<String, CronError> {
        let name = name.trim();
        if name.starts_with('@') {
            resolve_cron(name)
        } else {
            resolve_cron(&format!("@{name}"))
        }
    }
}

fn positive(n: u32) -> Result<u32, CronError> {
    if n == 0 {
        return Err(invalid("@every", "interval must be positive"));
    }
    Ok(n)
}

struct AtTime {
    hour: u32,
    minute: u32,
    second: Option<u32>,
}

fn at_time(at: &str) -> Result<AtTime, CronError> {
    let parts = at
        .split(':')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid(at, "time must be HH:MM or HH:MM:SS"))?;
    let time = match parts.as_slice() {
        [hour, minute] => AtTime {
            hour: *hour,
            minute: *minute,
            second: None,
        },
        [hour, minute, second] => AtTime {
            hour: *hour,
            minute: *minute,
            second: Some(*second),
        },
        _ => return Err(invalid(at, "time must be HH:MM or HH:MM:SS")),
    };
    if time.hour > 23 || time.minute > 59 || time.second.is_some_and(|s| s > 59) {
        return Err(invalid(at, "time out of range"));
    }
    Ok(time)
}

/// `rest` is the `dom month dow` part.
fn with_time(at: AtTime, rest: &str) -> String {
    match at.second {
        Some(second) => format!("{} {} {rest} {second}", at.minute, at.hour),
        None => format!("{} {} {rest}", at.minute, at.hour),
    }
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

fn weekday_number(day: &str) -> Result<u32, CronError> {
    let day = day.trim();
    if let Ok(n) = day.parse::<u32>() {
        return if n <= 7 {
            Ok(n % 7)
        } else {
            Err(invalid(day, "weekday out of range"))
        };
    }
    WEEKDAYS
        .iter()
        .position(|name| day.get(..3).is_some_and(|prefix| name.eq_ignore_ascii_case(prefix)))
        .map(|i| i as u32)
        .ok_or_else(|| invalid(day, "unknown weekday"))
}

/// Expands aliases and `@every` into a plain cron string.
/// Anything else is returned unchanged.
pub fn resolve_cron(expr: &str) -> Result<String, CronError> {
    let trimmed = expr.trim();
    if !trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }
    let resolved = match trimmed.to_ascii_lowercase().as_str() {
        "@hourly" => "0 * * * *".to_string(),
        "@daily" => "0 0 * * *".to_string(),
        "@weekly" => "0 0 * * 0".to_string(),
        "@monthly" => "0 0 1 * *".to_string(),
        "@yearly" => "0 0 1 1 *".to_string(),
        "@workdays" => "0 0 * * 1-5".to_string(),
        "@weekends" => "0 0 * * 0,6".to_string(),
        other => match other.strip_prefix("@every") {
            Some(interval) => Cron::every(Every::parse(interval)?)?,
            None => return Err(invalid(expr, "unknown alias")),
        },
    };
    Ok(resolved)
}

/// A parsed, ready-to-iterate cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let resolved = resolve_cron(expr)?;
        let fields: Vec<&str> = resolved.split_whitespace().collect();
        let (second, [minute, hour, dom, month, dow]) = match fields.as_slice() {
            [m, h, dom, mon, dow] => ("0", [*m, *h, *dom, *mon, *dow]),
            [m, h, dom, mon, dow, s] => (*s, [*m, *h, *dom, *mon, *dow]),
            _ => return Err(invalid(expr, "expected 5 or 6 fields")),
        };
        let dow = translate_dow(expr, dow)?;
        // cron crate は秒が先頭
        let canonical = format!("{second} {minute} {hour} {dom} {month} {dow}");
        let schedule =
            Schedule::from_str(&canonical).map_err(|e| invalid(expr, e.to_string()))?;
        Ok(Self {
            expr: resolved,
            schedule,
        })
    }

    /// The resolved (alias-free) expression.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `after`.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }

    pub fn upcoming<Tz: TimeZone>(&self, after: &DateTime<Tz>, count: usize) -> Vec<DateTime<Tz>> {
        self.schedule.after(after).take(count).collect()
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Rewrites numeric weekdays (0-7, Sunday = 0 or 7) into names.
fn translate_dow(expr: &str, field: &str) -> Result<String, CronError> {
    field
        .split(',')
        .map(|part| {
            let (base, step) = match part.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (part, None),
            };
            let base = match base {
                "*" | "?" => base.to_string(),
                range if range.contains('-') => {
                    let (from, to) = range
                        .split_once('-')
                        .ok_or_else(|| invalid(expr, "bad weekday range"))?;
                    let from = weekday_number(from).map_err(|_| invalid(expr, "bad weekday"))?;
                    let to_raw = to.trim();
                    // 5-7 のように日曜(7)で終わる範囲は Fri-Sat,Sun に分ける
                    if to_raw == "7" && from > 0 {
                        format!("{}-Sat,Sun", WEEKDAYS[from as usize])
                    } else {
                        let to = weekday_number(to_raw).map_err(|_| invalid(expr, "bad weekday"))?;
                        format!("{}-{}", WEEKDAYS[from as usize], WEEKDAYS[to as usize])
                    }
                }
                single => {
                    let n = weekday_number(single).map_err(|_| invalid(expr, "bad weekday"))?;
                    WEEKDAYS[n as usize].to_string()
                }
            };
            Ok(match step {
                Some(step) => format!("{base}/{step}"),
                None => base,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|parts| parts.join(","))
}
