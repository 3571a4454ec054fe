//! Argos passive scanner
//!
//! Tails the proxy history, runs every enabled passive rule against each
//! recorded transaction on a bounded worker pool, and turns what the rules
//! report into alerts and history tags.

pub mod alerts;
pub mod config;
pub mod error;
pub mod history;
pub mod models;
pub mod proxy;
pub mod pscan;
pub mod report;
pub mod rules;
