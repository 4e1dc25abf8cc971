//! Timestamp utilities

use chrono::Local;

/// REDCap `datetime_seconds_ymd` layout used for pipeline timestamps
pub const REDCAP_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time formatted for a REDCap datetime field
pub fn redcap_timestamp() -> String {
    Local::now().format(REDCAP_DATETIME_FORMAT).to_string()
}
