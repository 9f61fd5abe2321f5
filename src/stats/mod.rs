//! Latency statistics

pub mod histogram;
