//! Time zone resolution and the date/time shapes the provider speaks

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Resolve an IANA zone name, falling back to UTC for blank or unknown names.
pub fn resolve_time_zone(name: Option<&str>) -> Tz {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .and_then(|n| n.parse::<Tz>().ok())
        .unwrap_or(Tz::UTC)
}

/// The instant a wall-clock time on `date` begins in `zone`.
///
/// Ambiguous times take the earlier instant; times skipped by a DST jump are
/// shifted forward an hour, landing just after the gap.
pub fn local_instant(date: NaiveDate, time: NaiveTime, zone: Tz) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match zone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => zone
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

/// Midnight at the start of `date` in `zone`.
pub fn local_midnight(date: NaiveDate, zone: Tz) -> DateTime<Utc> {
    local_instant(date, NaiveTime::default(), zone)
}

/// Calendar date of an instant as seen in `zone`.
pub fn local_date(instant: DateTime<Utc>, zone: Tz) -> NaiveDate {
    instant.with_timezone(&zone).date_naive()
}
