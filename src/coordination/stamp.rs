use chrono::{DateTime, Local, NaiveDateTime, Timelike};
use std::fmt;
use std::time::SystemTime;

use crate::config::{FILE_SUFFIX_FORMAT, SQL_TIMESTAMP_FORMAT};

/// Wall-clock instant taken once per run, truncated to whole seconds
///
/// The same stamp is written to the ledger, injected into every loaded row and
/// appended to archived file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunStamp(NaiveDateTime);

impl RunStamp {
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    pub fn from_datetime(datetime: NaiveDateTime) -> Self {
        Self(truncate_to_seconds(datetime))
    }

    pub fn as_datetime(&self) -> NaiveDateTime {
        self.0
    }

    /// `YYYY-mm-dd HH:MM:SS`, as stored in the ledger and target tables
    pub fn sql_text(&self) -> String {
        self.0.format(SQL_TIMESTAMP_FORMAT).to_string()
    }

    /// `YYYYmmdd_HHMMSS`, as appended to archived file names
    pub fn file_suffix(&self) -> String {
        self.0.format(FILE_SUFFIX_FORMAT).to_string()
    }
}

impl fmt::Display for RunStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_text())
    }
}

pub(crate) fn truncate_to_seconds(datetime: NaiveDateTime) -> NaiveDateTime {
    datetime.with_nanosecond(0).unwrap_or(datetime)
}

/// Local wall-clock time of a filesystem timestamp, truncated to seconds
pub(crate) fn local_time(time: SystemTime) -> NaiveDateTime {
    truncate_to_seconds(DateTime::<Local>::from(time).naive_local())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_formats() {
        let datetime = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_milli_opt(7, 5, 1, 750)
            .unwrap();
        let stamp = RunStamp::from_datetime(datetime);

        assert_eq!(stamp.sql_text(), "2024-03-09 07:05:01");
        assert_eq!(stamp.file_suffix(), "20240309_070501");
        assert_eq!(stamp.as_datetime().nanosecond(), 0);
    }
}
