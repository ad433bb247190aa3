//! Reminder domain logic. The due-time calculator lives in [`due`]; the
//! periodic scan loop that drives it is [`crate::core::scheduler`].

pub mod due;

pub use due::{classify, next_due, DueStatus, WarningLevel};
