//! Field-accurate capture to playout pipeline with timecode passthrough.

pub mod config;
pub mod device;
pub mod pipeline;
pub mod timecode;
pub mod utils;
