//! Local-time arithmetic for the daily anchors.
//!
//! Anchors are fixed local times of day (06:00 delivery, 21:30 fallback
//! cutoff) in the configured IANA timezone. They are computed explicitly from
//! the current instant, so DST transitions are handled by `chrono-tz` rather
//! than by a cron expression.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

const DISPATCH_RELAY_TOKEN: &str = "DISPATCH_RELAY_TOKEN";

/// Relay token from the environment, if set.
pub fn get_relay_token() -> Option<String> {
    std::env::var(DISPATCH_RELAY_TOKEN).ok()
}

/// Resolve `date` at local `time` in `tz` to a UTC instant.
///
/// Ambiguous local times (DST fall-back) resolve to the earlier instant;
/// non-existent local times (DST spring-forward gap) are pushed forward by
/// one hour.
pub fn local_to_utc(date: NaiveDate, time: NaiveTime, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
        }
    }
}

/// The first occurrence of local `time` strictly after `now`.
pub fn next_local_occurrence(now: DateTime<Utc>, time: NaiveTime, tz: Tz) -> DateTime<Utc> {
    next_anchor(now, time, tz, Duration::zero())
}

/// The delivery anchor a run at `now` should target.
///
/// Today's anchor is still returned while `now` lies within `catch_up` after
/// it, so a late scheduling run does not skip a whole day.
pub fn next_anchor(now: DateTime<Utc>, time: NaiveTime, tz: Tz, catch_up: Duration) -> DateTime<Utc> {
    let local_today = now.with_timezone(&tz).date_naive();

    let mut date = local_today
        .pred_opt()
        .unwrap_or(local_today);

    loop {
        let candidate = local_to_utc(date, time, tz);
        if candidate + catch_up > now {
            return candidate;
        }
        date = match date.succ_opt() {
            Some(next) => next,
            None => return candidate,
        };
    }
}

/// Local calendar date of `instant` in `tz`.
pub fn local_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// UTC bounds `[start, end)` of the local calendar day `date` in `tz`.
pub fn local_day_bounds(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = local_to_utc(date, NaiveTime::MIN, tz);
    let end = match date.succ_opt() {
        Some(next) => local_to_utc(next, NaiveTime::MIN, tz),
        None => start + Duration::days(1),
    };
    (start, end)
}
