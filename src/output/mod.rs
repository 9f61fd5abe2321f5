//! Run output: live progress lines, text summary and JSON summary

pub mod json;
pub mod reporter;
pub mod text;
