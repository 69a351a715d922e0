//! Pipeline coordinator
//!
//! Owns the device and the ring, and manages the lifecycle of the capture
//! and playout engines: init configures everything and can fail, run starts
//! the input and launches both engine threads, quit stops and joins them.

use anyhow::{Context, Result, bail};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::burn::{FrameProcessor, TimecodeStamp};
use super::capture::CaptureEngine;
use super::health::{EngineHealth, HealthMonitor, HealthSummary};
use super::playout::PlayoutEngine;
use super::ring::FrameRing;
use super::slot::SlotLayout;
use super::stage::{Engine, join_engine, spawn_engine};
use super::state::{EngineState, StateCell};
use crate::config::PipelineConfig;
use crate::device::{
    DeviceBinding, RasterGeometry, StreamConfig, StreamDirection, TransferMode, TransferPlan,
    VideoFormat,
};
use crate::timecode::{Timecode, TimecodeResolver};
use crate::utils::sos::SignalOfStop;

/// Host audio buffer per slot
pub const AUDIO_BUFFER_BYTES: usize = 401 * 1024;
/// Host ancillary buffer per field
pub const ANC_BUFFER_BYTES: usize = 8 * 1024;

/// Point-in-time view of one engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub health: HealthSummary,
}

impl EngineStatus {
    fn new(state: &StateCell, health: &EngineHealth) -> Self {
        Self {
            state: state.get(),
            health: health.summary(),
        }
    }

    pub fn processed(&self) -> u64 {
        self.health.frames_processed
    }

    pub fn dropped(&self) -> u64 {
        self.health.frames_dropped
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatus {
    pub format: Option<VideoFormat>,
    pub capture: EngineStatus,
    pub playout: EngineStatus,
    pub ring_level: usize,
    pub ring_capacity: usize,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "capture {} [{} processed, {} dropped], playout {} [{} processed, {} dropped], ring {}/{}",
            self.capture.state,
            self.capture.processed(),
            self.capture.dropped(),
            self.playout.state,
            self.playout.processed(),
            self.playout.dropped(),
            self.ring_level,
            self.ring_capacity
        )
    }
}

struct RunSetup {
    format: VideoFormat,
    raster: RasterGeometry,
    layout: SlotLayout,
    ring: Arc<FrameRing>,
    capture_plan: TransferPlan,
    playout_plan: TransferPlan,
}

/// Capture → ring → playout on one device.
pub struct Pipeline<D: DeviceBinding + 'static> {
    config: PipelineConfig,
    device: Arc<D>,
    sos: SignalOfStop,
    setup: Option<RunSetup>,
    capture_health: Arc<EngineHealth>,
    playout_health: Arc<EngineHealth>,
    capture_state: StateCell,
    playout_state: StateCell,
    engines: Vec<(&'static str, JoinHandle<Result<()>>)>,
    monitor: Option<JoinHandle<()>>,
    processor: Option<Box<dyn FrameProcessor>>,
    started: bool,
}

impl<D: DeviceBinding + 'static> Pipeline<D> {
    pub fn new(config: PipelineConfig, device: D) -> Self {
        Self {
            config,
            device: Arc::new(device),
            sos: SignalOfStop::new(),
            setup: None,
            capture_health: Arc::new(EngineHealth::new()),
            playout_health: Arc::new(EngineHealth::new()),
            capture_state: StateCell::new("CaptureEngine"),
            playout_state: StateCell::new("PlayoutEngine"),
            engines: Vec::new(),
            monitor: None,
            processor: None,
            started: false,
        }
    }

    /// Open the configured device and wrap it.
    pub fn open(config: PipelineConfig) -> Result<Self> {
        let device = D::open(config.device_index)
            .with_context(|| format!("Failed to open device {}", config.device_index))?;
        Ok(Self::new(config, device))
    }

    /// Run `processor` on every captured frame. Takes precedence over `burn_line`.
    pub fn with_processor(mut self, processor: Box<dyn FrameProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Signal that stops both engines; clones are cheap.
    pub fn stop_signal(&self) -> SignalOfStop {
        self.sos.clone()
    }

    pub fn input_format(&self) -> Option<VideoFormat> {
        self.setup.as_ref().map(|setup| setup.format)
    }

    /// Detect the input, configure both streams and allocate the ring.
    pub fn init(&mut self) -> Result<()> {
        if self.setup.is_some() {
            return Ok(());
        }
        self.config.validate()?;
        let config = &self.config;

        let format = self
            .device
            .detect_input_format(config.input_channel)
            .context("No input signal or unsupported input format")?;
        let mode = config.transfer_mode;
        if mode.needs_interlaced() && !format.interlaced {
            bail!(
                "Input signal {} is progressive, {} transfers need an interlaced input",
                format,
                mode
            );
        }
        let raster = RasterGeometry::new(&format, config.pixel_format);
        if mode.needs_interlaced() && raster.lines % 2 != 0 {
            bail!("Field transfers need an even line count, input has {}", raster.lines);
        }
        let tc_format = format.rate.timecode_format();
        let start = Timecode {
            drop_frame: tc_format.drop_frame,
            ..config.synthetic_start
        };
        if !start.is_consistent(tc_format) {
            bail!(
                "Synthetic start {} is not a valid timecode at {} fps",
                start,
                format.rate
            );
        }

        for (direction, channel) in [
            (StreamDirection::Capture, config.input_channel),
            (StreamDirection::Playout, config.output_channel),
        ] {
            let stream = StreamConfig {
                channel,
                format,
                pixel_format: config.pixel_format,
                mode,
                frame_count: config.device_frames,
                with_audio: config.with_audio,
                with_anc: config.with_anc,
                with_timecode: config.with_timecode,
            };
            self.device
                .configure_stream(direction, &stream)
                .with_context(|| {
                    format!("Failed to configure {} stream on channel {}", direction, channel)
                })?;
        }

        let capture_plan =
            TransferPlan::new(StreamDirection::Capture, raster, mode, config.device_frames);
        let playout_plan =
            TransferPlan::new(StreamDirection::Playout, raster, mode, config.device_frames);
        let layout = SlotLayout {
            video_bytes: capture_plan.host_video_bytes(),
            second_field: mode == TransferMode::SplitFields,
            audio_bytes: config.with_audio.then_some(AUDIO_BUFFER_BYTES),
            anc_bytes: config.with_anc.then_some(ANC_BUFFER_BYTES),
        };
        let ring = Arc::new(FrameRing::new(layout.allocate(config.ring_capacity)));

        info!(
            "Pipeline: {} on device {}, {} transfers, {:?} pixels, {} ring slots",
            format,
            config.device_index,
            mode,
            config.pixel_format,
            config.ring_capacity
        );

        self.setup = Some(RunSetup {
            format,
            raster,
            layout,
            ring,
            capture_plan,
            playout_plan,
        });
        Ok(())
    }

    /// Start the input stream and launch both engines.
    pub fn run(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if self.sos.cancelled() {
            bail!("Pipeline was stopped and cannot be restarted");
        }
        let Some(setup) = self.setup.as_ref() else {
            bail!("Pipeline must be initialized before it runs");
        };
        let config = &self.config;

        self.device
            .start_stream(StreamDirection::Capture)
            .context("Failed to start capture stream")?;

        let resolver = TimecodeResolver::new(setup.format.rate.timecode_format())
            .with_preferred_source(config.timecode_source)
            .with_synthetic_start(config.synthetic_start)
            .with_embedded(config.with_timecode);

        let mut capture = CaptureEngine::new(
            Arc::clone(&self.device),
            Arc::clone(&setup.ring),
            setup.capture_plan,
            resolver,
            self.sos.clone(),
        )
        .with_health(Arc::clone(&self.capture_health))
        .with_state(self.capture_state.clone())
        .with_ring_full_policy(config.ring_full_policy, &setup.layout)
        .with_pulse_timeout(config.pulse_timeout());
        if let Some(processor) = self.processor.take() {
            capture = capture.with_processor(processor);
        } else if let Some(line) = config.burn_line {
            let lines = match config.transfer_mode {
                TransferMode::Frame => setup.raster.lines,
                TransferMode::SplitFields | TransferMode::Fields => setup.raster.field_lines(),
            };
            // Second field a fifth of the picture lower than the first
            let second = (line + (lines / 5).max(1)).min(lines.saturating_sub(1));
            capture = capture.with_processor(Box::new(TimecodeStamp::new(
                line,
                second,
                setup.raster.bytes_per_line,
            )));
        }

        let playout = PlayoutEngine::new(
            Arc::clone(&self.device),
            Arc::clone(&setup.ring),
            setup.playout_plan,
            TimecodeResolver::output_destinations(config.output_channel, &config.mirror_outputs),
            self.sos.clone(),
        )
        .with_prime_depth(config.prime_depth)
        .with_health(Arc::clone(&self.playout_health))
        .with_state(self.playout_state.clone())
        .with_pulse_timeout(config.pulse_timeout());

        let monitor = config.status_interval().map(|interval| {
            HealthMonitor::new()
                .watch(capture.name(), Arc::clone(&self.capture_health))
                .watch(playout.name(), Arc::clone(&self.playout_health))
                .with_check_interval(interval)
        });

        self.started = true;
        if let Err(e) = self.launch(capture, playout, monitor) {
            if let Err(quit_err) = self.quit() {
                warn!("Pipeline: cleanup after failed launch: {:#}", quit_err);
            }
            return Err(e);
        }
        info!("Pipeline: running");
        Ok(())
    }

    fn launch(
        &mut self,
        capture: CaptureEngine<D>,
        playout: PlayoutEngine<D>,
        monitor: Option<HealthMonitor>,
    ) -> Result<()> {
        let name = capture.name();
        self.engines.push((name, spawn_engine(capture)?));
        let name = playout.name();
        self.engines.push((name, spawn_engine(playout)?));

        if let Some(mut monitor) = monitor {
            let sos = self.sos.clone();
            let handle = std::thread::Builder::new()
                .name("HealthMonitor".to_string())
                .spawn(move || monitor.run(&sos))
                .context("Failed to spawn health monitor thread")?;
            self.monitor = Some(handle);
        }
        Ok(())
    }

    /// Stop both engines, join their threads and report the first error either returned.
    pub fn quit(&mut self) -> Result<()> {
        self.sos.cancel();
        if let Some(setup) = &self.setup {
            setup.ring.abort();
        }

        let mut first_error = None;
        for (name, handle) in self.engines.drain(..) {
            if let Err(e) = join_engine(name, handle) {
                first_error.get_or_insert(e);
            }
        }
        if let Some(monitor) = self.monitor.take()
            && monitor.join().is_err()
        {
            warn!("Pipeline: health monitor panicked");
        }

        if self.started {
            self.started = false;
            for direction in [StreamDirection::Capture, StreamDirection::Playout] {
                if let Err(e) = self.device.stop_stream(direction) {
                    debug!("Pipeline: {} stream stop: {}", direction, e);
                }
            }
            info!("Pipeline: stopped, {}", self.status());
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        let (ring_level, ring_capacity) = self
            .setup
            .as_ref()
            .map_or((0, 0), |setup| (setup.ring.level(), setup.ring.capacity()));
        PipelineStatus {
            format: self.input_format(),
            capture: EngineStatus::new(&self.capture_state, &self.capture_health),
            playout: EngineStatus::new(&self.playout_state, &self.playout_health),
            ring_level,
            ring_capacity,
        }
    }
}

impl<D: DeviceBinding + 'static> Drop for Pipeline<D> {
    fn drop(&mut self) {
        if let Err(e) = self.quit() {
            error!("Pipeline: {:#}", e);
        }
        self.device.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::read_test_pattern_line;
    use crate::device::{FieldId, FrameRate, SimulatedDevice};
    use crate::timecode::{TimecodeIndex, TimecodeKind};
    use std::time::{Duration, Instant};

    const INTERLACED: VideoFormat = VideoFormat::new(8, 8, FrameRate::Fps25, true);

    fn test_config(transfer_mode: TransferMode) -> PipelineConfig {
        PipelineConfig {
            transfer_mode,
            ring_capacity: 4,
            prime_depth: 2,
            device_frames: 4,
            pulse_timeout_ms: 5,
            status_interval_secs: 0,
            ..PipelineConfig::default()
        }
    }

    fn run_until_played(pipeline: &mut Pipeline<SimulatedDevice>, frames: usize) {
        pipeline.init().unwrap();
        pipeline.run().unwrap();
        let clock_sos = SignalOfStop::new();
        let clock =
            SimulatedDevice::spawn_clock(pipeline.device(), Duration::from_millis(4), clock_sos.clone())
                .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while pipeline.device().played_frames().len() < frames {
            assert!(Instant::now() < deadline, "timed out waiting for playout");
            std::thread::sleep(Duration::from_millis(5));
        }
        pipeline.quit().unwrap();
        clock_sos.cancel();
        clock.join().unwrap();
    }

    /// Sequence carried by a played frame if every line is intact and in raster order.
    fn intact_sequence(video: &[u8]) -> Option<u64> {
        let lines: Vec<_> = video
            .chunks(16)
            .map(read_test_pattern_line)
            .collect::<Option<_>>()?;
        let sequence = lines.first()?.1;
        lines
            .iter()
            .enumerate()
            .all(|(n, (line, seq))| usize::from(*line) == n && *seq == sequence)
            .then_some(sequence)
    }

    /// Sequence carried by a played field if its lines are the field's raster lines.
    fn intact_field_sequence(video: &[u8], field: FieldId) -> Option<u64> {
        let lines: Vec<_> = video
            .chunks(16)
            .map(read_test_pattern_line)
            .collect::<Option<_>>()?;
        let sequence = lines.first()?.1;
        lines
            .iter()
            .enumerate()
            .all(|(n, (line, seq))| {
                usize::from(*line) == 2 * n + field.line_offset() && *seq == sequence
            })
            .then_some(sequence)
    }

    #[test]
    fn test_field_transfers_need_interlaced_input() {
        for mode in [TransferMode::Fields, TransferMode::SplitFields] {
            let device = SimulatedDevice::new(0, Some(VideoFormat::hd720p5994()));
            let mut pipeline = Pipeline::new(test_config(mode), device);
            let err = pipeline.init().unwrap_err();
            assert!(err.to_string().contains("progressive"));
        }
        let device = SimulatedDevice::new(0, Some(VideoFormat::hd720p5994()));
        let mut pipeline = Pipeline::new(test_config(TransferMode::Frame), device);
        pipeline.init().unwrap();
    }

    #[test]
    fn test_skipped_drop_frame_start_rejected() {
        let ntsc_like = VideoFormat::new(8, 8, FrameRate::Fps2997, true);
        let config = PipelineConfig {
            synthetic_start: Timecode::new(0, 1, 0, 0, true),
            ..test_config(TransferMode::Frame)
        };
        let mut pipeline = Pipeline::new(config.clone(), SimulatedDevice::new(0, Some(ntsc_like)));
        let err = pipeline.init().unwrap_err();
        assert!(err.to_string().contains("Synthetic start"));

        // The first label that survives the drop is fine
        let config = PipelineConfig {
            synthetic_start: Timecode::new(0, 1, 0, 2, true),
            ..config
        };
        let mut pipeline = Pipeline::new(config, SimulatedDevice::new(0, Some(ntsc_like)));
        pipeline.init().unwrap();
    }

    #[test]
    fn test_init_without_signal_fails() {
        let device = SimulatedDevice::new(0, None);
        let mut pipeline = Pipeline::new(test_config(TransferMode::Frame), device);
        let err = pipeline.init().unwrap_err();
        assert!(format!("{:#}", err).contains("No input signal"));
    }

    #[test]
    fn test_configure_failure_is_fatal() {
        let device = SimulatedDevice::new(0, Some(INTERLACED));
        device.fail_configure(true);
        let mut pipeline = Pipeline::new(test_config(TransferMode::Frame), device);
        let err = pipeline.init().unwrap_err();
        assert!(err.to_string().contains("Failed to configure capture stream"));
    }

    #[test]
    fn test_run_requires_init_and_started_input() {
        let device = SimulatedDevice::new(0, Some(INTERLACED));
        device.fail_start(StreamDirection::Capture, true);
        let mut pipeline = Pipeline::new(test_config(TransferMode::Frame), device);
        assert!(pipeline.run().is_err());

        pipeline.init().unwrap();
        let err = pipeline.run().unwrap_err();
        assert!(err.to_string().contains("Failed to start capture stream"));
        assert_eq!(pipeline.status().capture.state, EngineState::Idle);
        pipeline.quit().unwrap();
    }

    #[test]
    fn test_split_fields_end_to_end_with_embedded_timecode() {
        let start = Timecode::new(1, 0, 0, 0, false);
        let device = SimulatedDevice::new(0, Some(INTERLACED)).with_embedded_timecode(start);
        let mut pipeline = Pipeline::new(test_config(TransferMode::SplitFields), device);
        run_until_played(&mut pipeline, 6);

        let format = FrameRate::Fps25.timecode_format();
        let played = pipeline.device().played_frames();
        let mut last = None;
        for frame in &played {
            let sequence = intact_sequence(&frame.video).expect("fields reassembled in order");
            assert!(last.is_none_or(|prev| sequence > prev), "frames out of order");
            last = Some(sequence);
            assert_eq!(
                frame.timecodes.get(&TimecodeIndex::vitc(3)),
                Some(&start.advanced_by(sequence, format))
            );
        }

        let status = pipeline.status();
        assert!(status.capture.processed() >= 6);
        assert!(status.playout.processed() >= 6);
        assert_eq!(status.capture.state, EngineState::Stopped);
        assert_eq!(status.playout.state, EngineState::Stopped);
        assert_eq!(status.format, Some(INTERLACED));
    }

    #[test]
    fn test_circulated_fields_end_to_end() {
        let start = Timecode::new(1, 0, 0, 0, false);
        let device = SimulatedDevice::new(0, Some(INTERLACED)).with_embedded_timecode(start);
        let mut pipeline = Pipeline::new(test_config(TransferMode::Fields), device);
        run_until_played(&mut pipeline, 8);

        let format = FrameRate::Fps25.timecode_format();
        let played = pipeline.device().played_frames();
        let mut last = None;
        let mut fields_seen = [false; 2];
        for field in &played {
            let id = field.field.expect("played buffer knows its field");
            let sequence =
                intact_field_sequence(&field.video, id).expect("field lines intact");
            let position = 2 * sequence + id.line_offset() as u64;
            assert!(last.is_none_or(|prev| position > prev), "fields out of order");
            last = Some(position);
            fields_seen[id.line_offset()] = true;
            assert_eq!(
                field.timecodes.get(&TimecodeIndex::vitc(3)),
                Some(&start.advanced_by(sequence, format))
            );
        }
        assert_eq!(fields_seen, [true, true]);
        assert!(pipeline.status().capture.processed() >= 8);
    }

    #[test]
    fn test_synthetic_timecode_counts_up_from_start() {
        let device = SimulatedDevice::new(0, Some(INTERLACED));
        let config = PipelineConfig {
            mirror_outputs: vec![4],
            ..test_config(TransferMode::Frame)
        };
        let mut pipeline = Pipeline::new(config, device);
        run_until_played(&mut pipeline, 4);

        let format = FrameRate::Fps25.timecode_format();
        let played = pipeline.device().played_frames();
        let labels: Vec<Timecode> = played
            .iter()
            .map(|frame| frame.timecodes[&TimecodeIndex::vitc(3)])
            .collect();
        assert_eq!(labels[0].to_string(), "10:00:00:00");
        for pair in labels.windows(2) {
            assert_eq!(pair[0].advanced_by(1, format), pair[1]);
        }
        // Output and mirror each get LTC and both VITC streams
        assert_eq!(played[0].timecodes.len(), 6);
        assert_eq!(
            played[0].timecodes[&TimecodeIndex::new(4, TimecodeKind::Ltc)],
            labels[0]
        );
    }

    #[test]
    fn test_quit_is_idempotent() {
        let device = SimulatedDevice::new(0, Some(INTERLACED));
        let mut pipeline = Pipeline::new(test_config(TransferMode::Frame), device);
        pipeline.init().unwrap();
        pipeline.run().unwrap();
        pipeline.quit().unwrap();
        pipeline.quit().unwrap();
        assert!(pipeline.run().is_err());
        assert_eq!(pipeline.status().ring_capacity, 4);
    }
}
