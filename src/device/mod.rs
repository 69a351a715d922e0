//! Capture/playout device binding
//!
//! [`DeviceBinding`] is the narrow surface both engines drive: stream
//! configuration, status polling, timing-pulse waits and the two transfer
//! calls. Each device circulates a small ring of on-board frame buffers per
//! direction; transfers move one buffer (or one field of it) between host
//! memory and the board.

pub mod geometry;
pub mod simulated;
pub mod transfer;

pub use geometry::{FieldId, FrameRate, PixelFormat, RasterGeometry, VideoFormat};
pub use simulated::SimulatedDevice;
pub use transfer::{
    DeviceTransferSession, SegmentedDma, TransferError, TransferGeometry, TransferPlan,
};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::timecode::{CapturedTimecodes, TimecodeMap};

/// Device used by the command line front end.
pub type DefaultDevice = SimulatedDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Capture,
    Playout,
}

impl std::fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamDirection::Capture => write!(f, "capture"),
            StreamDirection::Playout => write!(f, "playout"),
        }
    }
}

/// How video moves between the board and the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Whole frames, one transfer each
    Frame,
    /// Frames circulate on the board; each is moved as two segmented field transfers
    SplitFields,
    /// The board circulates single fields; every transfer and every host slot is one field
    #[default]
    Fields,
}

impl TransferMode {
    pub fn needs_interlaced(&self) -> bool {
        !matches!(self, TransferMode::Frame)
    }

    pub fn circulates_fields(&self) -> bool {
        matches!(self, TransferMode::Fields)
    }

    /// Timing pulses (and device buffers) per video frame.
    pub fn pulses_per_frame(&self) -> u32 {
        if self.circulates_fields() { 2 } else { 1 }
    }
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferMode::Frame => write!(f, "frame"),
            TransferMode::SplitFields => write!(f, "split-field"),
            TransferMode::Fields => write!(f, "field"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {0} not found")]
    NotFound(u32),

    #[error("device is closed")]
    Closed,

    #[error("{0} stream is not configured")]
    NotConfigured(StreamDirection),

    #[error("no input signal or unrecognized input format")]
    NoInputSignal,

    #[error("frame index {index} out of range (device circulates {count} frames)")]
    FrameIndex { index: u16, count: u16 },

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Per-direction stream setup.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub channel: u8,
    pub format: VideoFormat,
    pub pixel_format: PixelFormat,
    pub mode: TransferMode,
    /// On-board buffers to circulate (fields when the mode circulates fields)
    pub frame_count: u16,
    pub with_audio: bool,
    pub with_anc: bool,
    pub with_timecode: bool,
}

/// Snapshot returned by [`DeviceBinding::poll_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStatus {
    pub running: bool,
    /// Frames waiting on the board (captured and not yet transferred, or
    /// transferred and not yet played)
    pub buffer_level: u16,
    pub frame_count: u16,
    pub frames_processed: u64,
    pub frames_dropped: u64,
}

impl StreamStatus {
    pub fn has_available_input_frame(&self) -> bool {
        self.running && self.buffer_level > 0
    }

    /// Room for another frame. Holds before the stream starts so output can be primed.
    pub fn can_accept_output_frame(&self) -> bool {
        self.buffer_level < self.frame_count
    }
}

/// Host side of a capture transfer.
///
/// `target_frame` is `None` to take the next frame the device has ready, or a
/// specific buffer index to read again (second field of a frame).
#[derive(Debug)]
pub struct CaptureRequest<'a> {
    pub target_frame: Option<u16>,
    pub geometry: TransferGeometry,
    pub video: &'a mut [u8],
    pub audio: Option<&'a mut [u8]>,
    pub anc_f1: Option<&'a mut [u8]>,
    pub anc_f2: Option<&'a mut [u8]>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureReport {
    /// Device buffer the data came from
    pub frame_index: u16,
    pub audio_bytes: usize,
    pub anc_bytes: [usize; 2],
    pub timecodes: CapturedTimecodes,
    /// Device frame counter at the time of the transfer
    pub frames_processed: u64,
    /// Field the buffer holds when the device circulates fields
    pub field: Option<FieldId>,
}

/// Host side of a playout transfer. Timecodes are written to every destination in the map.
#[derive(Debug)]
pub struct PlayoutRequest<'a> {
    pub target_frame: Option<u16>,
    pub geometry: TransferGeometry,
    pub video: &'a [u8],
    pub audio: Option<&'a [u8]>,
    pub anc_f1: Option<&'a [u8]>,
    pub anc_f2: Option<&'a [u8]>,
    pub timecodes: &'a TimecodeMap,
    /// Field being sent: the segmented field, or the slot's field when the device circulates fields
    pub field: Option<FieldId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutReport {
    pub frame_index: u16,
}

pub trait DeviceBinding: Send + Sync {
    fn open(index: u32) -> Result<Self, DeviceError>
    where
        Self: Sized;

    fn close(&self);

    /// Format of the signal present at the input.
    fn detect_input_format(&self, channel: u8) -> Result<VideoFormat, DeviceError>;

    fn configure_stream(
        &self,
        direction: StreamDirection,
        config: &StreamConfig,
    ) -> Result<(), DeviceError>;

    fn poll_status(&self, direction: StreamDirection) -> Result<StreamStatus, DeviceError>;

    /// Block until the next vertical interrupt for `direction` or `timeout`.
    /// Returns `false` on timeout.
    fn wait_for_timing_pulse(&self, direction: StreamDirection, timeout: Duration) -> bool;

    fn transfer_in(&self, request: CaptureRequest<'_>) -> Result<CaptureReport, DeviceError>;

    fn transfer_out(&self, request: PlayoutRequest<'_>) -> Result<PlayoutReport, DeviceError>;

    fn start_stream(&self, direction: StreamDirection) -> Result<(), DeviceError>;

    fn stop_stream(&self, direction: StreamDirection) -> Result<(), DeviceError>;
}
