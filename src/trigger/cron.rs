use chrono::{DateTime, Datelike, Timelike, Utc};

/// A parsed five-field cron expression: minute, hour, day-of-month, month,
/// day-of-week. Each field is stored as the explicit set of values it
/// matches, so evaluation at a given minute is a handful of set lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
    dom_restricted: bool,
    dow_restricted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    values: Vec<u32>,
}

impl Field {
    fn contains(&self, v: u32) -> bool {
        self.values.contains(&v)
    }
}

impl CronSchedule {
    /// Parse a standard 5-field cron string. Supports `*`, integers, `a-b`,
    /// `a-b/n`, `*/n`, and comma-lists, per spec §6.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(format!(
                "expected 5 fields (minute hour dom month dow), found {}",
                parts.len()
            ));
        }

        let minute = parse_field(parts[0], 0, 59)?;
        let hour = parse_field(parts[1], 0, 23)?;
        let day_of_month = parse_field(parts[2], 1, 31)?;
        let month = parse_field(parts[3], 1, 12)?;
        let day_of_week = parse_field(parts[4], 0, 6)?;

        let dom_restricted = parts[2] != "*";
        let dow_restricted = parts[4] != "*";

        Ok(CronSchedule {
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
            dom_restricted,
            dow_restricted,
        })
    }

    /// True if `at` (truncated to the minute) matches this schedule.
    /// Day-of-month and day-of-week combine with OR semantics when both
    /// are restricted, AND (i.e. both must pass, which for an
    /// unrestricted field is automatic) when only one is restricted.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if !self.minute.contains(at.minute()) {
            return false;
        }
        if !self.hour.contains(at.hour()) {
            return false;
        }
        if !self.month.contains(at.month()) {
            return false;
        }

        let dom_hit = self.day_of_month.contains(at.day());
        // chrono: Sunday = 0 in num_days_from_sunday, matching cron's 0=Sunday.
        let dow_hit = self.day_of_week.contains(at.weekday().num_days_from_sunday());

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_hit || dow_hit,
            (true, false) => dom_hit,
            (false, true) => dow_hit,
            (false, false) => true,
        }
    }
}

fn parse_field(raw: &str, min: u32, max: u32) -> Result<Field, String> {
    let mut values = Vec::new();
    for term in raw.split(',') {
        values.extend(parse_term(term, min, max)?);
    }
    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(format!("empty field `{raw}`"));
    }
    Ok(Field { values })
}

fn parse_term(term: &str, min: u32, max: u32) -> Result<Vec<u32>, String> {
    let (range_part, step) = match term.split_once('/') {
        Some((r, s)) => {
            let step: u32 = s
                .parse()
                .map_err(|_| format!("invalid step `{s}` in `{term}`"))?;
            if step == 0 {
                return Err(format!("step cannot be zero in `{term}`"));
            }
            (r, step)
        }
        None => (term, 1),
    };

    let (lo, hi) = if range_part == "*" {
        (min, max)
    } else if let Some((a, b)) = range_part.split_once('-') {
        let a: u32 = a
            .parse()
            .map_err(|_| format!("invalid range start `{a}` in `{term}`"))?;
        let b: u32 = b
            .parse()
            .map_err(|_| format!("invalid range end `{b}` in `{term}`"))?;
        if a > b {
            return Err(format!("range start > end in `{term}`"));
        }
        (a, b)
    } else {
        let v: u32 = range_part
            .parse()
            .map_err(|_| format!("invalid value `{range_part}` in `{term}`"))?;
        (v, v)
    };

    if lo < min || hi > max {
        return Err(format!(
            "value out of range [{min},{max}] in `{term}`"
        ));
    }

    Ok((lo..=hi).step_by(step as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn every_minute() {
        let s = CronSchedule::parse("* * * * *").unwrap();
        assert!(s.matches(at(2026, 7, 26, 13, 1)));
    }

    #[test]
    fn step_minutes() {
        let s = CronSchedule::parse("*/15 * * * *").unwrap();
        assert!(s.matches(at(2026, 7, 26, 13, 0)));
        assert!(s.matches(at(2026, 7, 26, 13, 15)));
        assert!(!s.matches(at(2026, 7, 26, 13, 20)));
    }

    #[test]
    fn comma_and_range_hour() {
        let s = CronSchedule::parse("0 8-9,17 * * *").unwrap();
        assert!(s.matches(at(2026, 7, 26, 8, 0)));
        assert!(s.matches(at(2026, 7, 26, 9, 0)));
        assert!(s.matches(at(2026, 7, 26, 17, 0)));
        assert!(!s.matches(at(2026, 7, 26, 10, 0)));
    }

    #[test]
    fn dom_and_dow_or_when_both_restricted() {
        // 2026-07-26 is a Sunday (dow=0).
        let s = CronSchedule::parse("0 0 1 * 0").unwrap();
        assert!(s.matches(at(2026, 7, 26, 0, 0))); // dow hits
        assert!(s.matches(at(2026, 8, 1, 0, 0))); // dom hits
        assert!(!s.matches(at(2026, 7, 27, 0, 0))); // neither hits
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CronSchedule::parse("* * * *").is_err());
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(CronSchedule::parse("60 * * * *").is_err());
    }

    #[test]
    fn pure_and_idempotent() {
        let s = CronSchedule::parse("*/5 * * * *").unwrap();
        let t = at(2026, 7, 26, 13, 5);
        assert_eq!(s.matches(t), s.matches(t));
    }
}
