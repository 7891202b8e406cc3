//! Date normalization for conversational input.
//!
//! Users write dates the way they speak: "15.03.2025", "i går", sometimes a
//! bare "12.08.". Everything downstream wants ISO 8601, so this module turns
//! the common Norwegian spellings into `YYYY-MM-DD` and refuses anything it
//! cannot interpret rather than guessing.

use chrono::{Datelike, Days, NaiveDate};

/// Normalizes a user-written date to ISO 8601 (`YYYY-MM-DD`).
///
/// Accepts ISO dates as-is (after validation), the Norwegian day-first forms
/// `DD.MM.YYYY` and `DD/MM/YYYY`, a day-and-month form like `12.08.` resolved
/// against `today`'s year, and the relative words "i dag", "i går" and
/// "i morgen" (plus their English counterparts). Returns `None` for anything
/// else, including syntactically valid but impossible dates like `2025-02-30`.
pub fn normalize_date(input: &str, today: NaiveDate) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(date) = relative_date(trimmed, today) {
        return Some(date.format("%Y-%m-%d").to_string());
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date.format("%Y-%m-%d").to_string());
    }
    for format in ["%d.%m.%Y", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }

    // Day-and-month shorthand ("12.08." or "12.08") takes the current year.
    let stem = trimmed.trim_end_matches('.');
    if let Some((day, month)) = stem.split_once('.')
        && let (Ok(day), Ok(month)) = (day.trim().parse::<u32>(), month.trim().parse::<u32>())
        && let Some(date) = NaiveDate::from_ymd_opt(today.year(), month, day)
    {
        return Some(date.format("%Y-%m-%d").to_string());
    }

    None
}

fn relative_date(input: &str, today: NaiveDate) -> Option<NaiveDate> {
    match input.to_lowercase().as_str() {
        "i dag" | "idag" | "today" => Some(today),
        "i går" | "igår" | "yesterday" => today.checked_sub_days(Days::new(1)),
        "i morgen" | "imorgen" | "tomorrow" => today.checked_add_days(Days::new(1)),
        _ => None,
    }
}
