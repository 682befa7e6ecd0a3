//! Small pure functions for SLURM's handful of time-string formats. Kept
//! framework-free so they're trivially unit-testable, the same rationale the
//! teacher applies to its cookie/header rewriting helpers.

/// Accepts `MM:SS`, `HH:MM:SS`, and `D-HH:MM:SS`. Anything else (including
/// `UNLIMITED`) returns `None` — callers decide what the fallback means.
pub fn parse_time_to_seconds(input: &str) -> Option<i64> {
    let (days, rest) = match input.split_once('-') {
        Some((d, rest)) => (d.parse::<i64>().ok()?, rest),
        None => (0, input),
    };

    let fields: Vec<&str> = rest.split(':').collect();
    let (hours, minutes, seconds) = match fields.as_slice() {
        [h, m, s] => (h.parse::<i64>().ok()?, m.parse::<i64>().ok()?, s.parse::<i64>().ok()?),
        [m, s] if days == 0 => (0, m.parse::<i64>().ok()?, s.parse::<i64>().ok()?),
        _ => return None,
    };

    Some(((days * 24 + hours) * 60 + minutes) * 60 + seconds)
}

pub fn format_seconds_as_walltime(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let days = total_seconds / 86_400;
    let remainder = total_seconds % 86_400;
    let hours = remainder / 3_600;
    let minutes = (remainder % 3_600) / 60;
    let seconds = remainder % 60;

    if days > 0 {
        format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

/// SLURM's `MaxTime=UNLIMITED` is capped at this value rather than stored
/// as truly unbounded.
pub const UNLIMITED_MAX_TIME: &str = "14-00:00:00";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mm_ss() {
        assert_eq!(parse_time_to_seconds("05:30"), Some(330));
    }

    #[test]
    fn parses_hh_mm_ss() {
        assert_eq!(parse_time_to_seconds("02:00:00"), Some(7200));
    }

    #[test]
    fn parses_days_hh_mm_ss() {
        assert_eq!(parse_time_to_seconds("1-00:00:00"), Some(86_400));
        assert_eq!(parse_time_to_seconds("14-00:00:00"), Some(14 * 86_400));
    }

    #[test]
    fn rejects_other_forms() {
        assert_eq!(parse_time_to_seconds("UNLIMITED"), None);
        assert_eq!(parse_time_to_seconds("not-a-time"), None);
        assert_eq!(parse_time_to_seconds(""), None);
        assert_eq!(parse_time_to_seconds("1-2-3:4:5"), None);
    }

    #[test]
    fn format_round_trips() {
        assert_eq!(format_seconds_as_walltime(7200), "02:00:00");
        assert_eq!(format_seconds_as_walltime(14 * 86_400), "14-00:00:00");
        assert_eq!(parse_time_to_seconds(&format_seconds_as_walltime(90_061)), Some(90_061));
    }
}
