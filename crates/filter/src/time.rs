use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBound {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    Day,
    Minute,
    Second,
    Fraction,
}

/// Parses `YYYY-MM-DD[THH:MM[:SS[.ffffff]]]` into zero-padded ISO text.
///
/// Components the caller left out are filled with their minimum for a start bound and
/// their maximum for an end bound, so `to=2024-05-01` covers the whole day.
pub fn normalize_instant(raw: &str, bound: TimeBound) -> Option<String> {
    let raw = raw.trim();
    let (parsed, precision) = parse(raw)?;

    let out = match (bound, precision) {
        (TimeBound::Start, Precision::Fraction) => {
            parsed.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
        }
        (TimeBound::Start, _) => parsed.format("%Y-%m-%dT%H:%M:%S").to_string(),
        (TimeBound::End, Precision::Day) => {
            format!("{}T23:59:59.999999", parsed.format("%Y-%m-%d"))
        }
        (TimeBound::End, Precision::Minute) => {
            format!("{}:59.999999", parsed.format("%Y-%m-%dT%H:%M"))
        }
        (TimeBound::End, Precision::Second) => {
            format!("{}.999999", parsed.format("%Y-%m-%dT%H:%M:%S"))
        }
        (TimeBound::End, Precision::Fraction) => {
            parsed.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
        }
    };
    Some(out)
}

fn parse(raw: &str) -> Option<(NaiveDateTime, Precision)> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some((date.and_time(NaiveTime::MIN), Precision::Day));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M") {
        return Some((dt, Precision::Minute));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some((dt, Precision::Second));
    }

    // Sub-second part is limited to microseconds.
    let (_, fraction) = raw.rsplit_once('.')?;
    if fraction.is_empty()
        || fraction.len() > 6
        || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| (dt, Precision::Fraction))
}
