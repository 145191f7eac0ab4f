use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use std::fmt::Write;
use std::str::FromStr;

use crate::error::{RecorderError, Result};

pub const DEFAULT_TIME_FORMAT: &str = "[%c] <%s> ";

/// strftime-style line prefix, checked once so rendering cannot fail later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeFormat(String);

impl TimeFormat {
    pub fn new(format: impl Into<String>) -> Result<Self> {
        let format = format.into();
        if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
            return Err(RecorderError::InvalidTimeFormat(format));
        }
        Ok(TimeFormat(format))
    }

    /// No prefix at all, used by quick runs.
    pub fn empty() -> Self {
        TimeFormat(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn render(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let mut prefix = String::new();
        // validated in `new`; keep the raw format rather than panic
        if write!(prefix, "{}", Local::now().format(&self.0)).is_err() {
            return self.0.clone();
        }
        prefix
    }
}

impl Default for TimeFormat {
    fn default() -> Self {
        TimeFormat(DEFAULT_TIME_FORMAT.to_string())
    }
}

impl FromStr for TimeFormat {
    type Err = RecorderError;

    fn from_str(s: &str) -> Result<Self> {
        TimeFormat::new(s)
    }
}
