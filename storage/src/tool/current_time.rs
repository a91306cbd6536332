use chrono::{DateTime, SecondsFormat, Utc};

/// UTC timestamp as stored in every dialect (RFC 3339 text).
pub struct CurrentTime {
    pub current_time: DateTime<Utc>,
}

impl CurrentTime {
    pub fn new() -> Self {
        Self {
            current_time: Utc::now(),
        }
    }

    /// Text form used in timestamp columns.
    pub fn to_db_string(&self) -> String {
        format_db_time(&self.current_time)
    }
}

impl Default for CurrentTime {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_db_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a timestamp column; unparseable text yields `None`.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
