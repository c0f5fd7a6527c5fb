use std::collections::BTreeSet;
use std::str::FromStr;

use cadence_core::{AppError, AppResult};
use chrono::{DateTime, Local, Utc};

/// A validated cron schedule.
///
/// Expressions come in two shapes: five fields (`min hour dom month dow`)
/// or six fields with a leading seconds column. Descriptors such as
/// `@hourly` are accepted in either mode. Day-of-week numbers use the
/// usual crontab numbering: `0` and `7` are Sunday, `1` is Monday. Names
/// (`SUN`..`SAT`) are accepted as well.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    includes_seconds: bool,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parses and validates one cron expression.
    pub fn parse(expression: &str, includes_seconds: bool) -> AppResult<Self> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation(
                "cron expression must not be empty".to_owned(),
            ));
        }

        let normalized = if trimmed.starts_with('@') {
            trimmed.to_owned()
        } else {
            let mut fields: Vec<String> = trimmed.split_whitespace().map(str::to_owned).collect();
            let expected = if includes_seconds { 6 } else { 5 };
            if fields.len() != expected {
                return Err(AppError::Validation(format!(
                    "cron expression '{trimmed}' must have {expected} fields, got {}",
                    fields.len()
                )));
            }

            if let Some(day_of_week) = fields.last_mut() {
                *day_of_week = normalize_day_of_week(day_of_week.as_str()).map_err(|reason| {
                    AppError::Validation(format!("invalid cron expression '{trimmed}': {reason}"))
                })?;
            }

            if includes_seconds {
                fields.join(" ")
            } else {
                format!("0 {}", fields.join(" "))
            }
        };

        let schedule = cron::Schedule::from_str(normalized.as_str()).map_err(|error| {
            AppError::Validation(format!("invalid cron expression '{trimmed}': {error}"))
        })?;

        if schedule.after(&Utc::now()).next().is_none() {
            return Err(AppError::Validation(format!(
                "cron expression '{trimmed}' never fires"
            )));
        }

        Ok(Self {
            expression: trimmed.to_owned(),
            includes_seconds,
            schedule,
        })
    }

    /// Parses an expression, inferring whether it carries a seconds field.
    pub fn parse_guessed(expression: &str) -> AppResult<Self> {
        Self::parse(expression, Self::guess_includes_seconds(expression))
    }

    /// Returns true when the expression parses as a six-field schedule.
    #[must_use]
    pub fn guess_includes_seconds(expression: &str) -> bool {
        let trimmed = expression.trim();
        trimmed.split_whitespace().count() == 6 && Self::parse(trimmed, true).is_ok()
    }

    /// Builds a six-field expression firing every `n` seconds.
    #[must_use]
    pub fn every_seconds(n: u32) -> String {
        format!("*/{n} * * * * *")
    }

    /// Builds a six-field expression firing every `n` minutes.
    #[must_use]
    pub fn every_minutes(n: u32) -> String {
        format!("0 */{n} * * * *")
    }

    /// Builds a six-field expression firing every `n` hours.
    #[must_use]
    pub fn every_hours(n: u32) -> String {
        format!("0 0 */{n} * * *")
    }

    /// Returns the expression as written by the caller.
    #[must_use]
    pub fn expression(&self) -> &str {
        self.expression.as_str()
    }

    /// Returns whether the expression carries a seconds field.
    #[must_use]
    pub fn includes_seconds(&self) -> bool {
        self.includes_seconds
    }

    /// Returns the first trigger time strictly after `after`, reading the
    /// fields as UTC wall-clock time.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Returns the first trigger time strictly after `after`, reading the
    /// fields as wall-clock time in `zone`.
    #[must_use]
    pub fn next_after_in(
        &self,
        after: DateTime<Utc>,
        zone: ScheduleZone,
    ) -> Option<DateTime<Utc>> {
        match zone {
            ScheduleZone::Utc => self.next_after(after),
            ScheduleZone::Local => self
                .schedule
                .after(&after.with_timezone(&Local))
                .next()
                .map(|next| next.with_timezone(&Utc)),
        }
    }
}

/// Time zone whose wall clock cron fields are matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleZone {
    /// Coordinated universal time.
    #[default]
    Utc,
    /// The host's local zone.
    Local,
}

impl ScheduleZone {
    /// Parses `utc` or `local`, ignoring case.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "utc" => Ok(Self::Utc),
            "local" => Ok(Self::Local),
            other => Err(AppError::Validation(format!(
                "unknown schedule time zone '{other}', expected 'utc' or 'local'"
            ))),
        }
    }
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrites numeric day-of-week items into day names.
///
/// The `cron` crate counts days from 1 with Sunday first, so numbers are
/// expanded here and never reach it. Items without digits pass through.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    if !field.bytes().any(|byte| byte.is_ascii_digit()) {
        return Ok(field.to_owned());
    }

    let mut days = BTreeSet::new();
    let mut named = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let numeric = range.bytes().any(|byte| byte.is_ascii_digit())
            || (step.is_some() && matches!(range, "*" | "?"));
        if !numeric {
            named.push(item);
            continue;
        }

        let step = step.map(parse_day_number).transpose()?;
        if step == Some(0) {
            return Err(format!("day-of-week step in '{item}' must be positive"));
        }

        let (first, last) = match range {
            "*" | "?" => (0, 6),
            _ => match range.split_once('-') {
                Some((first, last)) => (parse_day_number(first)?, parse_day_number(last)?),
                None => {
                    let day = parse_day_number(range)?;
                    (day, if step.is_some() { 6 } else { day })
                }
            },
        };
        if first > last {
            return Err(format!("day-of-week range '{range}' is reversed"));
        }

        let step = usize::try_from(step.unwrap_or(1)).unwrap_or(1);
        for day in (first..=last).step_by(step) {
            days.insert(day % 7);
        }
    }

    let mut items: Vec<&str> = days
        .into_iter()
        .filter_map(|day| usize::try_from(day).ok())
        .filter_map(|day| DAY_NAMES.get(day).copied())
        .collect();
    items.extend(named);
    Ok(items.join(","))
}

fn parse_day_number(value: &str) -> Result<u32, String> {
    let day = value
        .parse::<u32>()
        .map_err(|_| format!("day-of-week value '{value}' is not a number"))?;
    if day > 7 {
        return Err(format!("day-of-week value {day} is outside 0-7"));
    }
    Ok(day)
}
