//! Async command layer over the blocking engine.

pub mod dfu;
pub mod firmware;
pub mod settings;
