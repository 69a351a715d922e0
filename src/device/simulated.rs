//! In-memory device
//!
//! Circulates the configured number of frame buffers per direction the way a
//! board does. Each [`SimulatedDevice::tick`] is one vertical interrupt: the
//! input side writes a fresh test frame (overwriting the oldest unread frame
//! when every buffer is full) and the output side plays the oldest queued
//! frame (counting a drop when nothing is queued). When a stream circulates
//! fields, each buffer holds one field and each tick is one field time, first
//! field then second. Ticks come from the test driving them by hand or from
//! [`SimulatedDevice::spawn_clock`].

use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::geometry::{FieldId, RasterGeometry, VideoFormat};
use super::{
    CaptureReport, CaptureRequest, DeviceBinding, DeviceError, PlayoutReport, PlayoutRequest,
    StreamConfig, StreamDirection, StreamStatus,
};
use crate::timecode::{
    CapturedTimecodes, Rp188, Timecode, TimecodeIndex, TimecodeKind, TimecodeMap,
};
use crate::utils::sos::SignalOfStop;

const DEVICE_COUNT: u32 = 4;
const AUDIO_SAMPLE_RATE: usize = 48_000;
const AUDIO_CHANNELS: usize = 16;
const ANC_BYTES_PER_FIELD: usize = 64;
const PLAYED_HISTORY: usize = 64;

/// Frame the output side put on air.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedFrame {
    pub frame_index: u16,
    /// Field the buffer held when the output circulates fields.
    pub field: Option<FieldId>,
    pub video: Vec<u8>,
    pub audio_bytes: usize,
    pub timecodes: TimecodeMap,
}

#[derive(Debug, Clone, Default)]
struct SimFrame {
    field: Option<FieldId>,
    video: Vec<u8>,
    audio: Vec<u8>,
    anc: [Vec<u8>; 2],
    captured_timecodes: CapturedTimecodes,
    timecodes: TimecodeMap,
}

#[derive(Debug)]
struct SimStream {
    config: StreamConfig,
    frames: Vec<SimFrame>,
    running: bool,
    read: usize,
    write: usize,
    level: usize,
    processed: u64,
    dropped: u64,
}

impl SimStream {
    fn new(config: StreamConfig) -> Self {
        let raster = RasterGeometry::new(&config.format, config.pixel_format);
        let buffer_bytes = if config.mode.circulates_fields() {
            raster.field_bytes()
        } else {
            raster.frame_bytes()
        };
        let frames = (0..config.frame_count.max(1))
            .map(|_| SimFrame {
                video: vec![0; buffer_bytes],
                ..SimFrame::default()
            })
            .collect();
        Self {
            config,
            frames,
            running: false,
            read: 0,
            write: 0,
            level: 0,
            processed: 0,
            dropped: 0,
        }
    }

    fn count(&self) -> usize {
        self.frames.len()
    }

    fn status(&self) -> StreamStatus {
        StreamStatus {
            running: self.running,
            buffer_level: self.level as u16,
            frame_count: self.count() as u16,
            frames_processed: self.processed,
            frames_dropped: self.dropped,
        }
    }

    fn frame(&self, index: u16) -> Result<usize, DeviceError> {
        let idx = usize::from(index);
        if idx >= self.count() {
            return Err(DeviceError::FrameIndex {
                index,
                count: self.count() as u16,
            });
        }
        Ok(idx)
    }
}

#[derive(Debug, Default)]
struct SimState {
    closed: bool,
    input_format: Option<VideoFormat>,
    embedded_start: Option<Timecode>,
    input: Option<SimStream>,
    output: Option<SimStream>,
    generated: u64,
    pulses: u64,
    failing_transfers: [u32; 2],
    fail_configure: bool,
    fail_start: [bool; 2],
    played: VecDeque<PlayedFrame>,
}

impl SimState {
    fn stream(&self, direction: StreamDirection) -> Result<&SimStream, DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        match direction {
            StreamDirection::Capture => self.input.as_ref(),
            StreamDirection::Playout => self.output.as_ref(),
        }
        .ok_or(DeviceError::NotConfigured(direction))
    }

    fn stream_mut(&mut self, direction: StreamDirection) -> Result<&mut SimStream, DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        match direction {
            StreamDirection::Capture => self.input.as_mut(),
            StreamDirection::Playout => self.output.as_mut(),
        }
        .ok_or(DeviceError::NotConfigured(direction))
    }

    fn take_injected_failure(&mut self, direction: StreamDirection) -> Result<(), DeviceError> {
        let pending = &mut self.failing_transfers[slot_of(direction)];
        if *pending > 0 {
            *pending -= 1;
            return Err(DeviceError::Rejected(format!(
                "injected {} transfer failure",
                direction
            )));
        }
        Ok(())
    }

    fn tick_input(&mut self) {
        let generated = self.generated;
        let embedded_start = self.embedded_start;
        let Some(input) = self.input.as_mut().filter(|s| s.running) else {
            return;
        };
        self.generated += 1;

        let (sequence, field) = if input.config.mode.circulates_fields() {
            let field = if generated % 2 == 0 {
                FieldId::First
            } else {
                FieldId::Second
            };
            (generated / 2, Some(field))
        } else {
            (generated, None)
        };

        if input.level == input.count() {
            // Board keeps recording into the oldest unread buffer
            input.read = (input.read + 1) % input.count();
            input.dropped += 1;
        } else {
            input.level += 1;
        }
        let write = input.write;
        input.write = (input.write + 1) % input.count();

        let config = input.config.clone();
        let raster = RasterGeometry::new(&config.format, config.pixel_format);
        let frame = &mut input.frames[write];
        frame.field = field;
        let audio_bytes = match field {
            Some(field) => {
                fill_field_test_pattern(&mut frame.video, &raster, field, sequence);
                audio_bytes_per_frame(&config.format) / 2
            }
            None => {
                fill_test_pattern(&mut frame.video, &raster, sequence);
                audio_bytes_per_frame(&config.format)
            }
        };

        frame.audio.clear();
        if config.with_audio {
            frame.audio.resize(audio_bytes, sequence as u8);
        }
        // A circulated field buffer carries its own field's packets in the first slot
        let anc_fields: &[usize] = match field {
            Some(FieldId::First) => &[0],
            Some(FieldId::Second) => &[1],
            None => &[0, 1],
        };
        for anc in frame.anc.iter_mut() {
            anc.clear();
        }
        if config.with_anc {
            for (slot, field_number) in anc_fields.iter().enumerate() {
                frame.anc[slot].resize(
                    ANC_BYTES_PER_FIELD,
                    (sequence as u8).wrapping_add(*field_number as u8),
                );
            }
        }

        frame.captured_timecodes.clear();
        if config.with_timecode {
            let format = config.format.rate.timecode_format();
            let vitc = TimecodeIndex::vitc(config.channel);
            let ltc = TimecodeIndex::new(config.channel, TimecodeKind::Ltc);
            match embedded_start {
                Some(start) => {
                    let raw = Rp188::encode(&start.advanced_by(sequence, format), format);
                    frame.captured_timecodes.insert(vitc, raw);
                    frame.captured_timecodes.insert(ltc, raw);
                }
                None => {
                    frame.captured_timecodes.insert(vitc, Rp188::INVALID);
                }
            }
        }
    }

    fn tick_output(&mut self) {
        let Some(output) = self.output.as_mut().filter(|s| s.running) else {
            return;
        };
        if output.level == 0 {
            // Nothing queued, the board repeats its last frame
            output.dropped += 1;
            return;
        }
        let read = output.read;
        output.read = (output.read + 1) % output.count();
        output.level -= 1;
        output.processed += 1;

        let frame = &output.frames[read];
        let played = PlayedFrame {
            frame_index: read as u16,
            field: frame.field,
            video: frame.video.clone(),
            audio_bytes: frame.audio.len(),
            timecodes: frame.timecodes.clone(),
        };
        if self.played.len() == PLAYED_HISTORY {
            self.played.pop_front();
        }
        self.played.push_back(played);
    }
}

fn slot_of(direction: StreamDirection) -> usize {
    match direction {
        StreamDirection::Capture => 0,
        StreamDirection::Playout => 1,
    }
}

fn audio_bytes_per_frame(format: &VideoFormat) -> usize {
    let (num, den) = format.rate.ratio();
    let samples = (AUDIO_SAMPLE_RATE as u64 * den / num) as usize;
    samples * AUDIO_CHANNELS * 4
}

/// Line `n` starts with `n` as a little-endian u16 followed by the frame
/// sequence as a little-endian u64; the remainder is `sequence + n`.
pub fn fill_test_pattern(video: &mut [u8], raster: &RasterGeometry, sequence: u64) {
    fill_lines(video, raster.bytes_per_line, 0..raster.lines, sequence);
}

/// Packed lines of one field of the test pattern, each numbered by its
/// raster line.
pub fn fill_field_test_pattern(
    video: &mut [u8],
    raster: &RasterGeometry,
    field: FieldId,
    sequence: u64,
) {
    let lines = (field.line_offset()..raster.lines).step_by(2);
    fill_lines(video, raster.bytes_per_line, lines, sequence);
}

fn fill_lines(
    video: &mut [u8],
    bytes_per_line: usize,
    lines: impl Iterator<Item = usize>,
    sequence: u64,
) {
    for (chunk, line) in video.chunks_mut(bytes_per_line).zip(lines) {
        let mut header = [0u8; 10];
        header[..2].copy_from_slice(&(line as u16).to_le_bytes());
        header[2..].copy_from_slice(&sequence.to_le_bytes());
        let fill = (sequence as u8).wrapping_add(line as u8);
        chunk.fill(fill);
        let n = header.len().min(chunk.len());
        chunk[..n].copy_from_slice(&header[..n]);
    }
}

/// Line number and frame sequence read back from a test pattern line.
pub fn read_test_pattern_line(line: &[u8]) -> Option<(u16, u64)> {
    if line.len() < 10 {
        return None;
    }
    let number = u16::from_le_bytes([line[0], line[1]]);
    let mut sequence = [0u8; 8];
    sequence.copy_from_slice(&line[2..10]);
    Some((number, u64::from_le_bytes(sequence)))
}

pub struct SimulatedDevice {
    index: u32,
    state: Mutex<SimState>,
    pulse: Condvar,
}

impl SimulatedDevice {
    /// Device with `input_format` present at its inputs (`None` for no signal).
    pub fn new(index: u32, input_format: Option<VideoFormat>) -> Self {
        Self {
            index,
            state: Mutex::new(SimState {
                input_format,
                ..SimState::default()
            }),
            pulse: Condvar::new(),
        }
    }

    /// Embed RP188 timecode starting at `start` in generated input frames.
    pub fn with_embedded_timecode(self, start: Timecode) -> Self {
        self.state.lock().embedded_start = Some(start);
        self
    }

    pub fn set_input_format(&self, format: Option<VideoFormat>) {
        self.state.lock().input_format = format;
    }

    /// Make the next `count` transfers in `direction` fail.
    pub fn fail_transfers(&self, direction: StreamDirection, count: u32) {
        self.state.lock().failing_transfers[slot_of(direction)] = count;
    }

    pub fn fail_configure(&self, fail: bool) {
        self.state.lock().fail_configure = fail;
    }

    pub fn fail_start(&self, direction: StreamDirection, fail: bool) {
        self.state.lock().fail_start[slot_of(direction)] = fail;
    }

    /// One vertical interrupt on both directions.
    pub fn tick(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.tick_input();
        state.tick_output();
        state.pulses += 1;
        self.pulse.notify_all();
    }

    /// Tick every `period` until `sos` is cancelled.
    pub fn spawn_clock(
        device: &Arc<Self>,
        period: Duration,
        sos: SignalOfStop,
    ) -> std::io::Result<JoinHandle<()>> {
        let device = Arc::clone(device);
        std::thread::Builder::new()
            .name("sim-clock".to_string())
            .spawn(move || {
                let mut next = Instant::now() + period;
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    if sos.wait_timeout(wait) {
                        break;
                    }
                    device.tick();
                    next += period;
                }
                debug!("SimulatedDevice: clock stopped");
            })
    }

    /// Frames played so far, oldest first (bounded history).
    pub fn played_frames(&self) -> Vec<PlayedFrame> {
        self.state.lock().played.iter().cloned().collect()
    }
}

impl DeviceBinding for SimulatedDevice {
    fn open(index: u32) -> Result<Self, DeviceError> {
        if index >= DEVICE_COUNT {
            return Err(DeviceError::NotFound(index));
        }
        info!("SimulatedDevice: opened device {}", index);
        Ok(Self::new(index, Some(VideoFormat::ntsc())))
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.input = None;
            state.output = None;
            info!("SimulatedDevice: closed device {}", self.index);
        }
        self.pulse.notify_all();
    }

    fn detect_input_format(&self, _channel: u8) -> Result<VideoFormat, DeviceError> {
        let state = self.state.lock();
        if state.closed {
            return Err(DeviceError::Closed);
        }
        state.input_format.ok_or(DeviceError::NoInputSignal)
    }

    fn configure_stream(
        &self,
        direction: StreamDirection,
        config: &StreamConfig,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DeviceError::Closed);
        }
        if state.fail_configure {
            return Err(DeviceError::Rejected(format!(
                "{} stream configuration refused",
                direction
            )));
        }
        if config.frame_count == 0 {
            return Err(DeviceError::Rejected("frame count must be positive".into()));
        }
        let stream = SimStream::new(config.clone());
        match direction {
            StreamDirection::Capture => state.input = Some(stream),
            StreamDirection::Playout => state.output = Some(stream),
        }
        debug!(
            "SimulatedDevice: {} configured for {} on channel {} ({} frames)",
            direction, config.format, config.channel, config.frame_count
        );
        Ok(())
    }

    fn poll_status(&self, direction: StreamDirection) -> Result<StreamStatus, DeviceError> {
        Ok(self.state.lock().stream(direction)?.status())
    }

    fn wait_for_timing_pulse(&self, _direction: StreamDirection, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let seen = state.pulses;
        while state.pulses == seen && !state.closed {
            if self.pulse.wait_until(&mut state, deadline).timed_out() {
                return state.pulses != seen;
            }
        }
        state.pulses != seen
    }

    fn transfer_in(&self, request: CaptureRequest<'_>) -> Result<CaptureReport, DeviceError> {
        let mut state = self.state.lock();
        state.stream(StreamDirection::Capture)?;
        state.take_injected_failure(StreamDirection::Capture)?;
        let input = state.stream_mut(StreamDirection::Capture)?;

        let (index, frames_processed) = match request.target_frame {
            Some(target) => (input.frame(target)?, input.processed.saturating_sub(1)),
            None => {
                if input.level == 0 {
                    return Err(DeviceError::Rejected("no captured frame available".into()));
                }
                let index = input.read;
                input.read = (input.read + 1) % input.count();
                input.level -= 1;
                input.processed += 1;
                (index, input.processed - 1)
            }
        };

        let frame = &input.frames[index];
        request
            .geometry
            .gather(&frame.video, request.video)
            .map_err(|e| DeviceError::Rejected(e.to_string()))?;

        let mut report = CaptureReport {
            frame_index: index as u16,
            field: frame.field,
            frames_processed,
            timecodes: frame.captured_timecodes.clone(),
            ..CaptureReport::default()
        };
        if let Some(audio) = request.audio {
            let n = frame.audio.len().min(audio.len());
            audio[..n].copy_from_slice(&frame.audio[..n]);
            report.audio_bytes = n;
        }
        for (field, buffer) in [request.anc_f1, request.anc_f2].into_iter().enumerate() {
            if let Some(buffer) = buffer {
                let source = &frame.anc[field];
                let n = source.len().min(buffer.len());
                buffer[..n].copy_from_slice(&source[..n]);
                report.anc_bytes[field] = n;
            }
        }
        Ok(report)
    }

    fn transfer_out(&self, request: PlayoutRequest<'_>) -> Result<PlayoutReport, DeviceError> {
        let mut state = self.state.lock();
        state.stream(StreamDirection::Playout)?;
        state.take_injected_failure(StreamDirection::Playout)?;
        let output = state.stream_mut(StreamDirection::Playout)?;
        let circulates_fields = output.config.mode.circulates_fields();

        let index = match request.target_frame {
            Some(target) => output.frame(target)?,
            None => {
                if output.level == output.count() {
                    return Err(DeviceError::Rejected("no free output frame".into()));
                }
                let index = output.write;
                output.write = (output.write + 1) % output.count();
                output.level += 1;
                index
            }
        };

        let frame = &mut output.frames[index];
        request
            .geometry
            .scatter(request.video, &mut frame.video)
            .map_err(|e| DeviceError::Rejected(e.to_string()))?;
        if let Some(audio) = request.audio {
            frame.audio.clear();
            frame.audio.extend_from_slice(audio);
        } else if request.target_frame.is_none() {
            frame.audio.clear();
        }
        for (field, data) in [request.anc_f1, request.anc_f2].into_iter().enumerate() {
            if let Some(data) = data {
                frame.anc[field].clear();
                frame.anc[field].extend_from_slice(data);
            }
        }
        if request.target_frame.is_none() {
            frame.timecodes.clear();
            frame.field = if circulates_fields { request.field } else { None };
        }
        frame
            .timecodes
            .extend(request.timecodes.iter().map(|(k, v)| (*k, *v)));

        Ok(PlayoutReport {
            frame_index: index as u16,
        })
    }

    fn start_stream(&self, direction: StreamDirection) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.fail_start[slot_of(direction)] {
            return Err(DeviceError::Rejected(format!("{} stream refused to start", direction)));
        }
        let stream = state.stream_mut(direction)?;
        stream.running = true;
        info!("SimulatedDevice: {} stream started", direction);
        Ok(())
    }

    fn stop_stream(&self, direction: StreamDirection) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let stream = state.stream_mut(direction)?;
        if stream.running {
            stream.running = false;
            info!("SimulatedDevice: {} stream stopped", direction);
        }
        Ok(())
    }
}
