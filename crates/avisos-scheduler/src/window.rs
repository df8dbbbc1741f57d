//! Window matcher: decides whether `now` falls inside a rule's firing window.
//!
//! Pure functions over an injected `now`; no clock reads, no I/O.
//! All calendar arithmetic happens in the tenant's timezone.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;

use avisos_core::model::{Schedule, TimeOfDay};

/// Outcome of evaluating a schedule at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firing {
    /// Outside the window.
    Idle,
    /// Rule-level firing for the local date `today`, covering appointments on `target_date`.
    Daily {
        today: NaiveDate,
        target_date: NaiveDate,
    },
    /// Per-appointment firing: appointments starting on `target_date` are due.
    PerAppointment { target_date: NaiveDate },
}

impl Firing {
    pub fn is_idle(&self) -> bool {
        matches!(self, Firing::Idle)
    }

    /// Local date whose appointments the firing covers.
    pub fn target_date(&self) -> Option<NaiveDate> {
        match self {
            Firing::Idle => None,
            Firing::Daily { target_date, .. } | Firing::PerAppointment { target_date } => {
                Some(*target_date)
            }
        }
    }
}

/// Tenant-local calendar date of an instant.
pub fn local_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// Whether the tenant-local wall clock of `now` sits exactly on `at`.
fn on_minute(at: &TimeOfDay, now: DateTime<Utc>, tz: Tz) -> bool {
    let local = now.with_timezone(&tz);
    local.hour() == at.hour() && local.minute() == at.minute()
}

/// Whether the tenant-local wall clock of `now` is at or past `at`.
fn at_or_after(at: &TimeOfDay, now: DateTime<Utc>, tz: Tz) -> bool {
    let local = now.with_timezone(&tz);
    local.hour() * 60 + local.minute() >= at.minute_of_day()
}

fn weekday_allowed(weekdays: &[u8], date: NaiveDate) -> bool {
    weekdays.is_empty() || weekdays.contains(&(date.weekday().num_days_from_sunday() as u8))
}

/// Local date whose appointments a firing at `now` covers, window gate aside.
pub fn target_date(schedule: &Schedule, now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    let offset = match schedule {
        Schedule::FixedTimeOfDay { look_ahead_days, .. } => *look_ahead_days,
        Schedule::RelativeWindow { day_offset, .. } => day_offset.days(),
        Schedule::DaysBeforeAppointment { days, .. } => *days,
    };
    local_date(now, tz) + Duration::days(offset as i64)
}

/// Evaluate a schedule at `now`.
pub fn evaluate(schedule: &Schedule, now: DateTime<Utc>, tz: Tz) -> Firing {
    let today = local_date(now, tz);
    let open = match schedule {
        Schedule::FixedTimeOfDay { at, weekdays, .. } => {
            on_minute(at, now, tz) && weekday_allowed(weekdays, today)
        }
        Schedule::RelativeWindow { active, .. } => *active,
        Schedule::DaysBeforeAppointment { not_before, .. } => {
            not_before.as_ref().is_none_or(|t| at_or_after(t, now, tz))
        }
    };
    if !open {
        return Firing::Idle;
    }
    let target_date = target_date(schedule, now, tz);
    if schedule.is_daily() {
        Firing::Daily { today, target_date }
    } else {
        Firing::PerAppointment { target_date }
    }
}

/// Whether `now` falls inside the schedule's firing window.
pub fn matches(schedule: &Schedule, now: DateTime<Utc>, tz: Tz) -> bool {
    !evaluate(schedule, now, tz).is_idle()
}

/// Per-appointment gate for `DaysBeforeAppointment(days)`: the appointment is
/// still in the future and its local start date is exactly `days` after today.
pub fn appointment_due(days: u32, start: DateTime<Utc>, now: DateTime<Utc>, tz: Tz) -> bool {
    if start <= now {
        return false;
    }
    let diff = local_date(start, tz)
        .signed_duration_since(local_date(now, tz))
        .num_days();
    diff == days as i64
}

/// UTC bounds `[from, to)` of one tenant-local calendar day.
///
/// DST gaps at midnight resolve to the earliest valid instant.
pub fn day_bounds(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    (start_of_day(date, tz), start_of_day(date + Duration::days(1), tz))
}

fn start_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = date.and_time(chrono::NaiveTime::MIN);
    match midnight.and_local_timezone(tz) {
        chrono::LocalResult::Single(t) => t.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        chrono::LocalResult::None => {
            // Midnight skipped by DST: the day starts one hour later.
            let shifted = midnight + Duration::hours(1);
            shifted
                .and_local_timezone(tz)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| midnight.and_utc())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avisos_core::model::DayOffset;
    use chrono::TimeZone;
    use chrono_tz::America::Argentina::Buenos_Aires as BA;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        BA.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn fixed(at: &str) -> Schedule {
        Schedule::FixedTimeOfDay {
            at: at.parse().unwrap(),
            weekdays: vec![],
            look_ahead_days: 0,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_fixed_time_matches_only_its_minute() {
        let s = fixed("09:00");
        assert!(matches(&s, local(2024, 3, 4, 9, 0), BA));
        assert!(matches(&s, local(2024, 3, 4, 9, 0) + Duration::seconds(59), BA));
        assert!(!matches(&s, local(2024, 3, 4, 8, 59), BA));
        assert!(!matches(&s, local(2024, 3, 4, 9, 1), BA));
    }

    #[test]
    fn test_fixed_time_uses_tenant_zone() {
        // 09:00 in Buenos Aires is 12:00 UTC.
        let s = fixed("09:00");
        let utc_nine = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        assert!(!matches(&s, utc_nine, BA));
        assert!(matches(&s, utc_nine, chrono_tz::UTC));
    }

    #[test]
    fn test_weekday_filter_and_look_ahead() {
        // 2024-03-04 is a Monday.
        let s = Schedule::FixedTimeOfDay {
            at: "18:30".parse().unwrap(),
            weekdays: vec![1, 2, 3, 4, 5],
            look_ahead_days: 1,
        };
        assert_eq!(
            evaluate(&s, local(2024, 3, 4, 18, 30), BA),
            Firing::Daily {
                today: date(2024, 3, 4),
                target_date: date(2024, 3, 5)
            }
        );
        // Sunday
        assert!(evaluate(&s, local(2024, 3, 3, 18, 30), BA).is_idle());
    }

    #[test]
    fn test_relative_window_tomorrow_boundary() {
        let s = Schedule::RelativeWindow {
            day_offset: DayOffset::Tomorrow,
            active: true,
        };
        let before = evaluate(&s, local(2024, 1, 1, 23, 59), BA);
        let after = evaluate(&s, local(2024, 1, 2, 0, 1), BA);
        assert_eq!(before.target_date(), Some(date(2024, 1, 2)));
        assert_eq!(after.target_date(), Some(date(2024, 1, 3)));

        let (from_a, to_a) = day_bounds(date(2024, 1, 2), BA);
        let (from_b, _) = day_bounds(date(2024, 1, 3), BA);
        assert!(to_a <= from_b);
        assert!(from_a < to_a);
    }

    #[test]
    fn test_relative_window_inactive_never_matches() {
        let s = Schedule::RelativeWindow {
            day_offset: DayOffset::Today,
            active: false,
        };
        assert!(!matches(&s, local(2024, 1, 1, 12, 0), BA));
    }

    #[test]
    fn test_days_before_only_on_exact_date() {
        let start = local(2024, 5, 10, 15, 0);
        assert!(appointment_due(1, start, local(2024, 5, 9, 8, 0), BA));
        assert!(appointment_due(1, start, local(2024, 5, 9, 23, 59), BA));
        assert!(!appointment_due(1, start, local(2024, 5, 8, 23, 59), BA));
        assert!(!appointment_due(1, start, local(2024, 5, 10, 8, 0), BA));
        assert!(appointment_due(0, start, local(2024, 5, 10, 8, 0), BA));
        // Already started.
        assert!(!appointment_due(0, start, local(2024, 5, 10, 15, 30), BA));
    }

    #[test]
    fn test_days_before_not_before_gate() {
        let s = Schedule::DaysBeforeAppointment {
            days: 1,
            not_before: Some("10:00".parse().unwrap()),
        };
        assert!(evaluate(&s, local(2024, 5, 9, 9, 59), BA).is_idle());
        assert_eq!(
            evaluate(&s, local(2024, 5, 9, 10, 0), BA),
            Firing::PerAppointment {
                target_date: date(2024, 5, 10)
            }
        );
    }

    #[test]
    fn test_day_bounds_in_utc() {
        let (from, to) = day_bounds(date(2024, 1, 2), BA);
        assert_eq!(from, Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap());
        assert_eq!(to, Utc.with_ymd_and_hms(2024, 1, 3, 3, 0, 0).unwrap());
    }
}
