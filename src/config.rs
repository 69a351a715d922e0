use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::device::{PixelFormat, TransferMode};
use crate::pipeline::RingFullPolicy;
use crate::timecode::{Timecode, TimecodeIndex};

/// Everything a pipeline run needs, loadable from a JSON file.
///
/// Missing keys fall back to [`PipelineConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub device_index: u32,
    pub input_channel: u8,
    pub output_channel: u8,
    pub pixel_format: PixelFormat,
    /// Whole frames, split fields or circulated fields; the field modes need an interlaced input
    pub transfer_mode: TransferMode,
    pub with_audio: bool,
    pub with_anc: bool,
    pub with_timecode: bool,
    /// Embedded source to try before the others
    pub timecode_source: Option<TimecodeIndex>,
    /// First synthetic timecode when nothing is embedded
    pub synthetic_start: Timecode,
    /// Host frame slots between capture and playout
    pub ring_capacity: usize,
    /// Buffers queued on the output before it starts
    pub prime_depth: usize,
    /// On-board buffers circulated per direction
    pub device_frames: u16,
    pub pulse_timeout_ms: u64,
    pub ring_full_policy: RingFullPolicy,
    /// Extra output channels that also receive the timecode
    pub mirror_outputs: Vec<u8>,
    /// Seconds between health log lines; zero disables the reporter
    pub status_interval_secs: u64,
    /// Raster line (per field) for the burned-in timecode stamp
    pub burn_line: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            input_channel: 1,
            output_channel: 3,
            pixel_format: PixelFormat::Ycbcr8,
            transfer_mode: TransferMode::Fields,
            with_audio: true,
            with_anc: true,
            with_timecode: true,
            timecode_source: None,
            synthetic_start: Timecode::new(10, 0, 0, 0, false),
            ring_capacity: 7,
            prime_depth: 3,
            device_frames: 7,
            pulse_timeout_ms: 50,
            ring_full_policy: RingFullPolicy::Hold,
            mirror_outputs: Vec::new(),
            status_interval_secs: 5,
            burn_line: None,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0 {
            bail!("ring_capacity must be at least 1");
        }
        if self.device_frames < 2 {
            bail!("device_frames must be at least 2");
        }
        if self.prime_depth > self.ring_capacity {
            bail!(
                "prime_depth ({}) cannot exceed ring_capacity ({})",
                self.prime_depth,
                self.ring_capacity
            );
        }
        if self.prime_depth > usize::from(self.device_frames) {
            bail!(
                "prime_depth ({}) cannot exceed device_frames ({})",
                self.prime_depth,
                self.device_frames
            );
        }
        if self.pulse_timeout_ms == 0 {
            bail!("pulse_timeout_ms must be positive");
        }
        if self.input_channel == self.output_channel {
            bail!("input and output must use different channels");
        }
        if self.mirror_outputs.contains(&self.input_channel) {
            bail!("channel {} cannot mirror timecode onto the input", self.input_channel);
        }
        Ok(())
    }

    pub fn pulse_timeout(&self) -> Duration {
        Duration::from_millis(self.pulse_timeout_ms)
    }

    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
