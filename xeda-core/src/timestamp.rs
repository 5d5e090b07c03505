//! Timestamp formatting shared by backup directory names and persisted
//! result records.

use chrono::{DateTime, Utc};

/// `YYYYMMDD_HHMMSS`, suitable for a `.backup_<timestamp>` suffix.
pub fn now_compact() -> String {
    format(Utc::now())
}

fn format(when: DateTime<Utc>) -> String {
    when.format("%Y%m%d_%H%M%S").to_string()
}

/// RFC 3339, used for the `timestamp` field in `results.json`.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn compact_format_is_sortable_and_fixed_width() {
        let when = Utc.with_ymd_and_hms(2026, 3, 5, 9, 30, 1).unwrap();
        assert_eq!(format(when), "20260305_093001");
    }
}
