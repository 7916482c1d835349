//! Job priorities.
//!
//! Priorities are small integers in the range `0..=10`; higher values run first
//! among eligible jobs. Each value owns one bucket per status in the job index,
//! so the scheduler walks [`Priority::descending`] to find work in priority
//! order.
//!
//! A handful of named levels are provided for readability:
//!
//! - **critical (10)**: system alerts, security incidents
//! - **high (8)**: user-facing notifications
//! - **normal (5)**: standard application work
//! - **low (2)**: analytics roll-ups, exports
//! - **background (0)**: cleanup and maintenance (the default)

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Job priority in the range `0..=10`.
///
/// # Examples
///
/// ```rust
/// use jobkeeper::Priority;
/// use std::str::FromStr;
///
/// let priority = Priority::new(7).unwrap();
/// assert_eq!(priority.value(), 7);
///
/// assert_eq!(Priority::from_str("high").unwrap(), Priority::HIGH);
/// assert_eq!(Priority::from_str("3").unwrap().value(), 3);
///
/// assert!(Priority::new(11).is_err());
/// assert!(Priority::CRITICAL > Priority::NORMAL);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(try_from = "i64", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const MAX: Priority = Priority(10);

    pub const BACKGROUND: Priority = Priority(0);
    pub const LOW: Priority = Priority(2);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(8);
    pub const CRITICAL: Priority = Priority(10);

    /// Creates a priority, rejecting values outside `0..=10`.
    pub fn new(value: i64) -> Result<Self, PriorityError> {
        if (Self::MIN.0 as i64..=Self::MAX.0 as i64).contains(&value) {
            Ok(Priority(value as u8))
        } else {
            Err(PriorityError::InvalidPriorityValue(value))
        }
    }

    /// Creates a priority, clamping out-of-range values to the nearest bound.
    pub fn clamped(value: i64) -> Self {
        Priority(value.clamp(Self::MIN.0 as i64, Self::MAX.0 as i64) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// All priorities from highest to lowest, the order the scheduler scans
    /// buckets in.
    pub fn descending() -> impl Iterator<Item = Priority> {
        (Self::MIN.0..=Self::MAX.0).rev().map(Priority)
    }

    /// All priorities from lowest to highest.
    pub fn ascending() -> impl Iterator<Item = Priority> {
        (Self::MIN.0..=Self::MAX.0).map(Priority)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Priority {
    type Err = PriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(value) = trimmed.parse::<i64>() {
            return Priority::new(value);
        }
        match trimmed.to_lowercase().as_str() {
            "background" | "bg" => Ok(Priority::BACKGROUND),
            "low" | "l" => Ok(Priority::LOW),
            "normal" | "n" | "default" => Ok(Priority::NORMAL),
            "high" | "h" => Ok(Priority::HIGH),
            "critical" | "crit" | "c" => Ok(Priority::CRITICAL),
            _ => Err(PriorityError::InvalidPriorityString(s.to_string())),
        }
    }
}

impl TryFrom<i64> for Priority {
    type Error = PriorityError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PriorityError {
    #[error("Invalid priority value: {0} (expected 0..=10)")]
    InvalidPriorityValue(i64),

    #[error("Invalid priority string: {0}")]
    InvalidPriorityString(String),
}
