//! Report generation

pub mod json;
