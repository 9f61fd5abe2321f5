//! Formatting helpers

pub mod time;
