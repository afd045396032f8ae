//! Schedule input normalisation.
//!
//! Task definitions arrive from a management surface that accepts a little
//! more than strict five-field cron: Quartz-style six-field expressions with
//! a leading seconds field, `?` placeholders, and short Chinese phrases such
//! as `每天9点`. Everything is rewritten to a canonical five-field expression
//! and validated before a task is admitted.

use crate::ScheduleError;
use crate::cron::CronSchedule;

/// Normalise user-supplied schedule text into a validated cron schedule.
pub fn normalize_schedule(input: &str) -> Result<CronSchedule, ScheduleError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ScheduleError::Unrecognised(input.to_string()));
    }

    let fields: Vec<&str> = input.split_whitespace().collect();
    match fields.len() {
        5 => CronSchedule::parse(&rewrite_fields(&fields)),
        // Quartz-style: leading seconds field is not supported, drop it.
        6 => CronSchedule::parse(&rewrite_fields(&fields[1..])),
        _ => match parse_phrase(input) {
            Some(expression) => CronSchedule::parse(&expression),
            None => Err(ScheduleError::Unrecognised(input.to_string())),
        },
    }
}

fn rewrite_fields(fields: &[&str]) -> String {
    fields
        .iter()
        .enumerate()
        .map(|(index, field)| {
            let field = field.replace('?', "*");
            // Day-of-month and month are 1-based; a bare 0 means "the first".
            if (index == 2 || index == 3) && field == "0" {
                "1".to_string()
            } else {
                field
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Translate the supported natural-language phrases into a cron expression.
fn parse_phrase(input: &str) -> Option<String> {
    let text = input.to_lowercase();

    if let Some(rest) = text.split_once("每天").map(|(_, rest)| rest) {
        let (hour, minute) = parse_clock(rest)?;
        return Some(format!("{} {} * * *", minute, hour));
    }

    for prefix in ["每周", "每星期"] {
        if let Some((_, rest)) = text.split_once(prefix) {
            let mut chars = rest.chars();
            let weekday = weekday_number(chars.next()?)?;
            let (hour, minute) = parse_clock(chars.as_str())?;
            return Some(format!("{} {} * * {}", minute, hour, weekday));
        }
    }

    if let Some((_, rest)) = text.split_once("每月") {
        let (day, time) = rest.split_once('号')?;
        let day: u32 = day.trim().parse().ok()?;
        let (hour, minute) = if time.contains('点') {
            parse_clock(time)?
        } else {
            (0, 0)
        };
        return Some(format!("{} {} {} * *", minute, hour, day));
    }

    None
}

/// Parse `H点`, `H:M点` or `H：M点` into (hour, minute).
fn parse_clock(text: &str) -> Option<(u32, u32)> {
    let (clock, _) = text.split_once('点')?;
    let clock = clock.trim();
    let (hour, minute) = match clock.split_once([':', '：']) {
        Some((hour, minute)) => (hour.trim(), minute.trim()),
        None => (clock, "0"),
    };
    Some((hour.parse().ok()?, minute.parse().ok()?))
}

fn weekday_number(c: char) -> Option<u32> {
    match c {
        '日' | '天' | '0' | '7' => Some(0),
        '一' | '1' => Some(1),
        '二' | '2' => Some(2),
        '三' | '3' => Some(3),
        '四' | '4' => Some(4),
        '五' | '5' => Some(5),
        '六' | '6' => Some(6),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalized(input: &str) -> String {
        normalize_schedule(input).unwrap().expression().to_string()
    }

    #[test]
    fn test_five_field_passthrough() {
        assert_eq!(normalized("0 9 * * 1-5"), "0 9 * * 1-5");
    }

    #[test]
    fn test_six_field_drops_seconds() {
        assert_eq!(normalized("0 30 9 * * ?"), "30 9 * * *");
    }

    #[test]
    fn test_zero_day_and_month_become_one() {
        assert_eq!(normalized("0 0 0 0 *"), "0 0 1 1 *");
    }

    #[test]
    fn test_daily_phrase() {
        assert_eq!(normalized("每天9点"), "0 9 * * *");
        assert_eq!(normalized("每天 18:30点"), "30 18 * * *");
        assert_eq!(normalized("每天8：15点"), "15 8 * * *");
    }

    #[test]
    fn test_weekly_phrase() {
        assert_eq!(normalized("每周一9点"), "0 9 * * 1");
        assert_eq!(normalized("每星期日10:00点"), "0 10 * * 0");
        assert_eq!(normalized("每周7 7点"), "0 7 * * 0");
    }

    #[test]
    fn test_monthly_phrase() {
        assert_eq!(normalized("每月1号"), "0 0 1 * *");
        assert_eq!(normalized("每月15号9:30点"), "30 9 15 * *");
    }

    #[test]
    fn test_unknown_text_is_rejected() {
        assert!(matches!(
            normalize_schedule("whenever"),
            Err(ScheduleError::Unrecognised(_))
        ));
        assert!(matches!(
            normalize_schedule("   "),
            Err(ScheduleError::Unrecognised(_))
        ));
    }

    #[test]
    fn test_out_of_range_phrase_is_rejected() {
        assert!(normalize_schedule("每天25点").is_err());
        assert!(normalize_schedule("每月32号").is_err());
    }

    #[test]
    fn test_malformed_cron_is_rejected() {
        assert!(matches!(
            normalize_schedule("61 * * * *"),
            Err(ScheduleError::InvalidField { .. })
        ));
    }
}
