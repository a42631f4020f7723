//! Cron schedule evaluation for recurring jobs.
//!
//! Accepts the classic 5-field form (`min hour dom month dow`) as well as the
//! 6/7-field form with seconds (and year) understood by the `cron` crate.
//!
//! Weekday numbers differ between the two: crontab counts 0-6 from Sunday
//! (7 is Sunday too), the `cron` crate counts 1-7 from Sunday. Numeric
//! weekdays in 5-field input are rewritten to names before parsing.

use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parse a schedule expression, adding a seconds field to 5-field input.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, day, month, weekday] => {
            let weekday =
                crontab_weekdays(weekday).with_context(|| format!("invalid schedule {expr:?}"))?;
            format!("0 {minute} {hour} {day} {month} {weekday}")
        }
        fields if matches!(fields.len(), 6 | 7) => expr.to_string(),
        fields => {
            return Err(anyhow!(
                "schedule {expr:?} has {} fields, expected 5 to 7",
                fields.len()
            ))
        }
    };
    Schedule::from_str(&normalized).with_context(|| format!("invalid schedule {expr:?}"))
}

/// Rewrite a crontab day-of-week field (`1-5`, `0,6`, `*/2`) as weekday names.
fn crontab_weekdays(field: &str) -> Result<String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days: Vec<&str> = Vec::new();
    let mut named: Vec<&str> = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };
        if range.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(part);
            continue;
        }

        let step = match step {
            Some(step) => match step.parse::<usize>() {
                Ok(step) if step > 0 => step,
                _ => bail!("bad weekday step {step:?}"),
            },
            None => 1,
        };
        let (start, end) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((start, end)) => (weekday_number(start)?, weekday_number(end)?),
            // `n/step` runs from n to the end of the week
            None if step > 1 => (weekday_number(range)?, 6),
            None => {
                let day = weekday_number(range)?;
                (day, day)
            }
        };
        if start > end {
            bail!("weekday range {range:?} runs backwards");
        }

        for day in (start..=end).step_by(step) {
            let name = WEEKDAYS[day % 7];
            if !days.contains(&name) {
                days.push(name);
            }
        }
    }

    days.extend(named);
    Ok(days.join(","))
}

fn weekday_number(raw: &str) -> Result<usize> {
    match raw.parse::<usize>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => bail!("weekday {raw:?} is not between 0 and 7"),
    }
}

/// Next occurrence strictly after `after`.
pub fn next_run_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse_schedule(expr)?
        .after(&after)
        .next()
        .ok_or_else(|| anyhow!("schedule {expr:?} has no future occurrence"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn five_field_expressions_run_on_the_minute() {
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 10, 2, 30).unwrap();
        let next = next_run_after("*/5 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn six_field_expressions_keep_seconds() {
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let next = next_run_after("30 * * * * *", after).unwrap();
        assert_eq!(next.second(), 30);
        assert_eq!(next.minute(), 0);
    }

    // 2025-03-01 is a Saturday
    fn saturday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn crontab_weekday_numbers_count_from_sunday() {
        let monday = next_run_after("0 9 * * 1", saturday()).unwrap();
        assert_eq!(monday.weekday(), Weekday::Mon);
        assert_eq!(monday, Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap());

        let sunday = next_run_after("0 9 * * 0", saturday()).unwrap();
        assert_eq!(sunday.weekday(), Weekday::Sun);
        assert_eq!(next_run_after("0 9 * * 7", saturday()).unwrap(), sunday);
    }

    #[test]
    fn crontab_weekday_ranges_and_lists() {
        let workday = next_run_after("0 9 * * 1-5", saturday()).unwrap();
        assert_eq!(workday.weekday(), Weekday::Mon);

        let weekend = next_run_after("0 9 * * 6,0", saturday() - chrono::Duration::days(1)).unwrap();
        assert_eq!(weekend.weekday(), Weekday::Sat);

        let sunday = next_run_after("0 9 * * 5-7", saturday()).unwrap();
        assert_eq!(sunday.weekday(), Weekday::Sun);

        assert_eq!(crontab_weekdays("*/2").unwrap(), "SUN,TUE,THU,SAT");
        assert_eq!(crontab_weekdays("MON-FRI").unwrap(), "MON-FRI");
    }

    #[test]
    fn rejects_bad_weekdays() {
        assert!(parse_schedule("0 9 * * 8").is_err());
        assert!(parse_schedule("0 9 * * 5-1").is_err());
        assert!(parse_schedule("0 9 * * */0").is_err());
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(parse_schedule("* * *").is_err());
        assert!(parse_schedule("").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_schedule("every five minutes please ok").is_err());
    }
}
