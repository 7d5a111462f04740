//! Cursor parsing and limit defaulting for the grouped views.
//!
//! A cursor carries its type in its shape: a calendar date for date-ordered
//! views, a ULID for ID-ordered ones. Anything else non-empty is rejected so
//! a typo never silently restarts pagination.

use chrono::NaiveDate;
use ulid::Ulid;

use crate::error::DomainError;

/// Server-side page size used when the request omits `limit`, passes `0`,
/// or passes a negative value.
pub const DEFAULT_LIMIT: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Empty or unset: from the start (ID views) or from today (date views).
    Unset,
    Id(String),
    Date(NaiveDate),
}

pub fn parse_cursor(raw: Option<&str>) -> Result<Cursor, DomainError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(Cursor::Unset);
    };
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(Cursor::Date(date));
    }
    if let Ok(id) = Ulid::from_string(raw) {
        return Ok(Cursor::Id(id.to_string()));
    }
    Err(DomainError::InvalidCursor)
}

pub fn effective_limit(raw: Option<i64>) -> i64 {
    match raw {
        Some(n) if n > 0 => n,
        _ => DEFAULT_LIMIT,
    }
}
