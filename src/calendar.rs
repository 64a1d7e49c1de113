use chrono::{Datelike, Duration, NaiveDate};

/// Sep 1 .. May 25 window containing `reference_date`. A date in
/// June–August belongs to the year that just ended.
pub fn academic_year_bounds(reference_date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start_year = if reference_date.month() >= 9 {
        reference_date.year()
    } else {
        reference_date.year() - 1
    };
    let start = NaiveDate::from_ymd_opt(start_year, 9, 1).expect("valid date");
    let end = NaiveDate::from_ymd_opt(start_year + 1, 5, 25).expect("valid date");
    (start, end)
}

/// Inclusive week ranges covering [start, end]; the last one may be short.
pub fn week_ranges(start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut out = Vec::new();
    let mut current = start;
    while current <= end {
        let week_end = (current + Duration::days(6)).min(end);
        out.push((current, week_end));
        current = week_end + Duration::days(1);
    }
    out
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn bounds_pivot_on_september() {
        assert_eq!(
            academic_year_bounds(d(2025, 10, 3)),
            (d(2025, 9, 1), d(2026, 5, 25))
        );
        assert_eq!(
            academic_year_bounds(d(2026, 2, 10)),
            (d(2025, 9, 1), d(2026, 5, 25))
        );
        assert_eq!(
            academic_year_bounds(d(2026, 9, 1)),
            (d(2026, 9, 1), d(2027, 5, 25))
        );
    }

    #[test]
    fn week_ranges_cover_year_with_short_tail() {
        let (start, end) = academic_year_bounds(d(2025, 9, 1));
        let weeks = week_ranges(start, end);
        assert_eq!(weeks.first().copied(), Some((d(2025, 9, 1), d(2025, 9, 7))));
        // Every week starts the day after the previous one ends.
        for pair in weeks.windows(2) {
            assert_eq!(pair[1].0, pair[0].1 + Duration::days(1));
        }
        assert_eq!(weeks.last().unwrap().1, end);
    }
}
