//! Playout engine: frame ring → device output
//!
//! Output is primed before it starts: the first `prime_depth` frames are
//! queued on the device while the output stream is still stopped, then the
//! stream is started. From there on every slot taken from the ring is
//! transferred out (both fields when they are split, or the one field a
//! circulated-field slot holds) with its timecode written to every configured
//! destination, and released back to the ring.

use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use super::capture::pass_label;
use super::health::EngineHealth;
use super::ring::{FrameRing, RingOutcome};
use super::slot::FrameSlot;
use super::stage::Engine;
use super::state::{EngineState, StateCell};
use crate::device::{DeviceBinding, StreamDirection, TransferPlan};
use crate::timecode::{TimecodeIndex, TimecodeMap, TimecodeResolver};
use crate::utils::sos::SignalOfStop;

pub struct PlayoutEngine<D: DeviceBinding> {
    device: Arc<D>,
    ring: Arc<FrameRing>,
    plan: TransferPlan,
    destinations: BTreeSet<TimecodeIndex>,
    prime_depth: usize,
    sos: SignalOfStop,
    health: Arc<EngineHealth>,
    state: StateCell,
    pulse_timeout: Duration,
}

impl<D: DeviceBinding> PlayoutEngine<D> {
    pub fn new(
        device: Arc<D>,
        ring: Arc<FrameRing>,
        plan: TransferPlan,
        destinations: BTreeSet<TimecodeIndex>,
        sos: SignalOfStop,
    ) -> Self {
        Self {
            device,
            ring,
            plan,
            destinations,
            prime_depth: 3,
            sos,
            health: Arc::new(EngineHealth::new()),
            state: StateCell::new("PlayoutEngine"),
            pulse_timeout: Duration::from_millis(50),
        }
    }

    pub fn with_prime_depth(mut self, depth: usize) -> Self {
        self.prime_depth = depth;
        self
    }

    pub fn with_health(mut self, health: Arc<EngineHealth>) -> Self {
        self.health = health;
        self
    }

    pub fn with_state(mut self, state: StateCell) -> Self {
        self.state = state;
        self
    }

    pub fn with_pulse_timeout(mut self, timeout: Duration) -> Self {
        self.pulse_timeout = timeout;
        self
    }

    pub fn health(&self) -> Arc<EngineHealth> {
        Arc::clone(&self.health)
    }

    pub fn state(&self) -> StateCell {
        self.state.clone()
    }

    /// Hand one slot to the device. Returns false if any transfer failed.
    fn play_frame(&self, slot: &FrameSlot) -> bool {
        let timecodes = slot
            .timecode
            .map(|tc| TimecodeResolver::destination_map(tc.value, &self.destinations))
            .unwrap_or_default();
        let no_timecodes = TimecodeMap::new();
        let mut target = None;
        let mut bytes = 0;

        for &field in self.plan.passes() {
            let session = self.plan.session(field, target);
            // Timecode goes out with the first transfer of the frame
            let tcs = if target.is_none() {
                &timecodes
            } else {
                &no_timecodes
            };
            match session.playout(&*self.device, slot, tcs) {
                Ok(report) => {
                    target.get_or_insert(report.frame_index);
                    bytes += session.geometry().host_bytes();
                }
                Err(e) => {
                    self.health.record_transfer_failure();
                    warn!("PlayoutEngine: {} transfer failed: {}", pass_label(field), e);
                    return false;
                }
            }
        }
        self.health.record_frame(bytes);
        true
    }

    fn start_output(&self, primed: usize) -> Result<()> {
        self.device
            .start_stream(StreamDirection::Playout)
            .context("Failed to start playout stream")?;
        self.state.set_running();
        info!("PlayoutEngine: output started after priming {} frames", primed);
        Ok(())
    }

    fn drive(&mut self) -> Result<()> {
        let mut primed = 0usize;
        let mut started = false;

        if self.prime_depth == 0 {
            self.start_output(0)?;
            started = true;
        }

        while !self.sos.cancelled() {
            let status = match self.device.poll_status(StreamDirection::Playout) {
                Ok(status) => status,
                Err(e) => {
                    warn!("PlayoutEngine: status poll failed: {}", e);
                    self.sos.wait_timeout(self.pulse_timeout);
                    continue;
                }
            };
            self.health
                .observe_device(status.frames_dropped, status.buffer_level);

            if !status.can_accept_output_frame() {
                self.health.record_device_wait();
                self.device
                    .wait_for_timing_pulse(StreamDirection::Playout, self.pulse_timeout);
                continue;
            }

            let ring = Arc::clone(&self.ring);
            let lease = match ring.start_consume(self.pulse_timeout) {
                RingOutcome::Ready(lease) => lease,
                RingOutcome::Blocked => {
                    self.health.record_backpressure();
                    continue;
                }
                RingOutcome::Aborted => break,
            };
            let sent = self.play_frame(&lease);
            lease.finish();

            if sent && !started {
                primed += 1;
                if primed >= self.prime_depth {
                    self.start_output(primed)?;
                    started = true;
                }
            }
        }
        Ok(())
    }
}

impl<D: DeviceBinding + 'static> Engine for PlayoutEngine<D> {
    fn run(&mut self) -> Result<()> {
        self.state.transition(EngineState::Priming);
        info!(
            "PlayoutEngine: priming {} buffers ({} transfers, {} timecode destinations)",
            self.prime_depth,
            self.plan.mode(),
            self.destinations.len()
        );

        let result = self.drive();

        self.state.transition(EngineState::Draining);
        if let Err(e) = self.device.stop_stream(StreamDirection::Playout) {
            warn!("PlayoutEngine: failed to stop output stream: {}", e);
        }
        self.state.transition(EngineState::Stopped);
        info!("PlayoutEngine: stopped, {}", self.health.summary());
        result
    }

    fn name(&self) -> &'static str {
        "PlayoutEngine"
    }
}
