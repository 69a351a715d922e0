//! Frame pipeline for fieldburn
//!
//! Separates concerns between:
//! - Control/Coordination: engine state machines and lifecycle
//! - Data Transport: the frame ring and its backpressure
//! - Media Processing: capture, timecode burn-in and playout engines
//!
//! # Architecture
//!
//! The capture engine fills ring slots from the device input and the
//! playout engine drains them to the device output:
//! - Each engine runs on its own named thread
//! - Engines implement the `Engine` trait
//! - `Pipeline` owns the device and ring and manages lifecycle
//! - Health monitoring tracks counters and logs alerts

pub mod burn;
pub mod capture;
pub mod coordinator;
pub mod health;
pub mod playout;
pub mod ring;
pub mod slot;
pub mod stage;
pub mod state;

pub use burn::{FrameProcessor, TimecodeStamp};
pub use capture::{CaptureEngine, RingFullPolicy};
pub use coordinator::{EngineStatus, Pipeline, PipelineStatus};
pub use health::{EngineHealth, HealthAlert, HealthMonitor, HealthSummary};
pub use playout::PlayoutEngine;
pub use ring::{ConsumeLease, FrameRing, ProduceLease, RingOutcome};
pub use slot::{FrameSlot, SlotLayout};
pub use stage::{Engine, join_engine, spawn_engine};
pub use state::{EngineState, StateCell};
