use std::time::Duration;

/// Parses `Retry-After`: either an integer number of seconds, or an
/// HTTP-date (IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    parse_http_date_delay(value)
}

/// Parses `RateLimit-Reset`: an integer number of seconds per §6.
pub fn parse_ratelimit_reset(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn parse_http_date_delay(value: &str) -> Option<Duration> {
    let when = chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .or_else(|| chrono::NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
            .ok()
            .map(|naive| naive.and_utc().into()))?;

    let now = chrono::Utc::now();
    let delta = when.with_timezone(&chrono::Utc) - now;
    delta.to_std().ok()
}
