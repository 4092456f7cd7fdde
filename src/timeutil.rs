//! UTC wall-clock helpers.
//!
//! All durable timestamps in the repository are RFC 3339 UTC strings with
//! millisecond precision (`2026-08-01T12:34:56.789Z`). Formatting and parsing
//! are implemented over `std::time` directly; the civil-date conversion is the
//! standard era-based algorithm.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, now.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Civil-date conversion
// ---------------------------------------------------------------------------

/// Days since 1970-01-01 for a proleptic Gregorian civil date.
const fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (if m > 2 { m - 3 } else { m + 9 }) as i64;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Civil date `(year, month, day)` for days since 1970-01-01.
const fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Format milliseconds since the Unix epoch as RFC 3339 UTC with millisecond
/// precision, e.g. `2026-08-01T12:34:56.789Z`.
#[must_use]
pub fn format_rfc3339_ms(ms: u64) -> String {
    let secs = (ms / 1000) as i64;
    let millis = ms % 1000;
    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    let (hh, mm, ss) = (tod / 3600, (tod % 3600) / 60, tod % 60);
    format!("{year:04}-{month:02}-{day:02}T{hh:02}:{mm:02}:{ss:02}.{millis:03}Z")
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse an RFC 3339 UTC timestamp into milliseconds since the Unix epoch.
///
/// Accepted forms: `YYYY-MM-DD` (midnight UTC), `YYYY-MM-DDTHH:MM:SSZ`,
/// `YYYY-MM-DDTHH:MM:SS.fffZ`. Only the `Z` offset is accepted; fractional
/// seconds beyond milliseconds are truncated.
///
/// # Errors
/// Returns a description of the first malformed component.
pub fn parse_rfc3339(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (date, time) = match s.split_once(['T', 't']) {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };

    let mut date_parts = date.splitn(3, '-');
    let year: i64 = next_num(&mut date_parts, "year")?;
    let month: u32 = next_num(&mut date_parts, "month")?;
    let day: u32 = next_num(&mut date_parts, "day")?;
    if !(1..=12).contains(&month) {
        return Err(format!("month {month} out of range"));
    }
    if !(1..=31).contains(&day) {
        return Err(format!("day {day} out of range"));
    }

    let (hh, mm, ss, millis) = match time {
        None => (0, 0, 0, 0),
        Some(t) => {
            let t = t
                .strip_suffix(['Z', 'z'])
                .ok_or_else(|| "timestamp must end with 'Z' (UTC only)".to_owned())?;
            let (hms, frac) = match t.split_once('.') {
                Some((hms, frac)) => (hms, Some(frac)),
                None => (t, None),
            };
            let mut parts = hms.splitn(3, ':');
            let hh: i64 = next_num(&mut parts, "hour")?;
            let mm: i64 = next_num(&mut parts, "minute")?;
            let ss: i64 = next_num(&mut parts, "second")?;
            if hh > 23 || mm > 59 || ss > 60 {
                return Err(format!("time {hh:02}:{mm:02}:{ss:02} out of range"));
            }
            let millis = match frac {
                None => 0,
                Some(frac) => {
                    let digits: String = frac.chars().take_while(char::is_ascii_digit).collect();
                    if digits.is_empty() || digits.len() != frac.len() {
                        return Err(format!("malformed fractional seconds '{frac}'"));
                    }
                    let padded = format!("{digits:0<3}");
                    padded[..3]
                        .parse::<u64>()
                        .map_err(|e| format!("malformed fractional seconds: {e}"))?
                }
            };
            (hh, mm, ss, millis)
        }
    };

    let days = days_from_civil(year, month, day);
    let secs = days * 86_400 + hh * 3600 + mm * 60 + ss;
    u64::try_from(secs)
        .map(|s| s * 1000 + millis)
        .map_err(|_| "timestamp is before the Unix epoch".to_owned())
}

fn next_num<'a, T: std::str::FromStr>(
    parts: &mut impl Iterator<Item = &'a str>,
    what: &str,
) -> Result<T, String> {
    parts
        .next()
        .ok_or_else(|| format!("missing {what}"))?
        .parse::<T>()
        .map_err(|_| format!("malformed {what}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
