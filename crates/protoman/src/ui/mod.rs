//! Terminal rendering helpers

pub mod pull_bar;
pub mod spinner;
