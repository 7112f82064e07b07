//! Foundation module - shared utilities used throughout the engine

pub mod logging;
