//! Five-field cron expression parser and next-fire computation.
//!
//! Supported syntax per field: `*`, single values, ranges `a-b`, lists
//! `a,b,c`, and steps `*/n` or `a-b/n`. Fields are minute, hour,
//! day-of-month, month, day-of-week (0-6, 7 accepted as Sunday). No seconds
//! field, no names. A time matches only when every field matches.

use chrono::{Datelike, Local, TimeZone, Timelike};

const MINUTE_MS: i64 = 60_000;
/// Give up after five years of minutes; a valid expression fires sooner.
const MAX_SCAN_MINUTES: i64 = 5 * 366 * 24 * 60;

#[derive(Debug, Clone)]
pub struct CronExpr {
    minute: Vec<bool>,
    hour: Vec<bool>,
    dom: Vec<bool>,
    month: Vec<bool>,
    dow: Vec<bool>,
}

impl CronExpr {
    /// Parse a 5-field expression.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "expected 5 fields, got {} in {:?}",
                fields.len(),
                expr
            ));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            dom: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            dow: parse_dow(fields[4])?,
        })
    }

    fn matches_ms(&self, ms: i64) -> bool {
        let Some(t) = Local.timestamp_millis_opt(ms).single() else {
            return false;
        };
        self.minute[t.minute() as usize]
            && self.hour[t.hour() as usize]
            && self.dom[t.day() as usize]
            && self.month[t.month() as usize]
            && self.dow[t.weekday().num_days_from_sunday() as usize]
    }

    /// The least absolute millisecond time strictly greater than `after_ms`
    /// whose fields all satisfy the expression.
    pub fn next_after_ms(&self, after_ms: i64) -> Option<i64> {
        let mut t = (after_ms.div_euclid(MINUTE_MS) + 1) * MINUTE_MS;
        for _ in 0..MAX_SCAN_MINUTES {
            if self.matches_ms(t) {
                return Some(t);
            }
            t += MINUTE_MS;
        }
        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<bool>, String> {
    let mut set = vec![false; (max + 1) as usize];
    for part in field.split(',') {
        let (range, step) = split_step(part)?;
        let (lo, hi) = parse_range(range, min, max)?;
        let mut v = lo;
        while v <= hi {
            set[v as usize] = true;
            v += step;
        }
    }
    Ok(set)
}

fn parse_dow(field: &str) -> Result<Vec<bool>, String> {
    // Accept 0-7 with 7 meaning Sunday, then fold onto 0-6.
    let wide = parse_field(field, 0, 7)?;
    let mut set = wide[..7].to_vec();
    if wide[7] {
        set[0] = true;
    }
    Ok(set)
}

fn split_step(part: &str) -> Result<(&str, u32), String> {
    match part.split_once('/') {
        None => Ok((part, 1)),
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("bad step in {part:?}"))?;
            if step == 0 {
                return Err(format!("step must be positive in {part:?}"));
            }
            Ok((range, step))
        }
    }
}

fn parse_range(range: &str, min: u32, max: u32) -> Result<(u32, u32), String> {
    if range == "*" {
        return Ok((min, max));
    }
    let (lo, hi) = match range.split_once('-') {
        None => {
            let v: u32 = range
                .parse()
                .map_err(|_| format!("bad value {range:?}"))?;
            (v, v)
        }
        Some((a, b)) => {
            let lo: u32 = a.parse().map_err(|_| format!("bad range start {a:?}"))?;
            let hi: u32 = b.parse().map_err(|_| format!("bad range end {b:?}"))?;
            (lo, hi)
        }
    };
    if lo < min || hi > max || lo > hi {
        return Err(format!("range {range:?} out of bounds {min}-{max}"));
    }
    Ok((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn local_ms(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        let naive = NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap();
        Local
            .from_local_datetime(&naive)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "not a cron",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "*/0 * * * *",
            "5-1 * * * *",
            "a * * * *",
        ] {
            assert!(CronExpr::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn accepts_common_forms() {
        for good in [
            "* * * * *",
            "0 9 * * 1-5",
            "*/15 * * * *",
            "0,30 8-18 * * *",
            "0 0 1 1 *",
            "0 12 * * 7",
        ] {
            assert!(CronExpr::parse(good).is_ok(), "{good}");
        }
    }

    #[test]
    fn next_is_strictly_after() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        let at = local_ms(2026, 3, 10, 12, 30);
        assert_eq!(expr.next_after_ms(at), Some(at + 60_000));
        // Mid-minute rounds up to the next minute boundary.
        assert_eq!(expr.next_after_ms(at + 1), Some(at + 60_000));
    }

    #[test]
    fn weekday_morning_schedule() {
        let expr = CronExpr::parse("0 9 * * 1-5").unwrap();
        // 2026-03-13 is a Friday; from Friday 10:00 the next fire is
        // Monday 09:00.
        let friday_ten = local_ms(2026, 3, 13, 10, 0);
        assert_eq!(
            expr.next_after_ms(friday_ten),
            Some(local_ms(2026, 3, 16, 9, 0))
        );
    }

    #[test]
    fn step_schedule() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        let base = local_ms(2026, 3, 10, 12, 3);
        assert_eq!(expr.next_after_ms(base), Some(local_ms(2026, 3, 10, 12, 15)));
        let quarter = local_ms(2026, 3, 10, 12, 15);
        assert_eq!(
            expr.next_after_ms(quarter),
            Some(local_ms(2026, 3, 10, 12, 30))
        );
    }

    #[test]
    fn dow_seven_is_sunday() {
        let on7 = CronExpr::parse("0 12 * * 7").unwrap();
        let on0 = CronExpr::parse("0 12 * * 0").unwrap();
        let saturday = local_ms(2026, 3, 14, 13, 0);
        assert_eq!(on7.next_after_ms(saturday), on0.next_after_ms(saturday));
    }

    #[test]
    fn month_boundary() {
        let expr = CronExpr::parse("0 0 1 * *").unwrap();
        let jan31 = local_ms(2026, 1, 31, 12, 0);
        assert_eq!(expr.next_after_ms(jan31), Some(local_ms(2026, 2, 1, 0, 0)));
    }
}
