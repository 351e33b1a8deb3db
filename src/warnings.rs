//! Operator-visible warnings ring

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Entries kept before the oldest is dropped
pub const WARNINGS_CAPACITY: usize = 100;

/// Severity of a warning
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    Warning,
    Error,
}

/// One warning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// When it was raised
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: WarningLevel,
    /// Operator-facing text
    pub message: String,
}

/// Bounded, shareable list of recent warnings
#[derive(Debug, Default)]
pub struct Warnings {
    ring: Mutex<VecDeque<Warning>>,
}

impl Warnings {
    /// Empty ring
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, level: WarningLevel, message: String) {
        let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        if ring.len() == WARNINGS_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(Warning {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    /// Record a warning
    pub fn warn(&self, message: impl Into<String>) {
        self.push(WarningLevel::Warning, message.into());
    }

    /// Record an error
    pub fn error(&self, message: impl Into<String>) {
        self.push(WarningLevel::Error, message.into());
    }

    /// Oldest first
    pub fn list(&self) -> Vec<Warning> {
        let ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        ring.iter().cloned().collect()
    }

    /// Drop everything
    pub fn clear(&self) {
        self.ring.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let warnings = Warnings::new();
        for i in 0..(WARNINGS_CAPACITY + 5) {
            warnings.warn(format!("w{i}"));
        }
        let list = warnings.list();
        assert_eq!(list.len(), WARNINGS_CAPACITY);
        assert_eq!(list[0].message, "w5");
        warnings.error("disk");
        assert_eq!(warnings.list().last().map(|w| w.level), Some(WarningLevel::Error));
        warnings.clear();
        assert!(warnings.list().is_empty());
    }
}
