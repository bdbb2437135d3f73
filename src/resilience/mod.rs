//! Resilience utilities: retry with exponential backoff.

pub mod retry;
