// Utility functions
use chrono::{DateTime, SecondsFormat, Utc};

/// Parses an RFC 3339 string into `DateTime<Utc>`, if possible.
pub fn parse_datetime(date_str: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(date_str)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Fixed-width RFC 3339 form, so stored timestamps compare correctly as text.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Normalizes a currency code to trimmed upper case.
pub fn normalize_currency(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
