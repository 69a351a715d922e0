//! Capture engine: device input → frame ring
//!
//! Every iteration polls the input stream. When the device holds a captured
//! frame (or field) and the ring has a free slot, it is transferred (split
//! fields pin the second transfer to the buffer the first came from), its
//! timecode resolved, and the slot committed. A failed transfer is counted
//! and the slot is still committed with whatever arrived.

use anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::burn::FrameProcessor;
use super::health::EngineHealth;
use super::ring::{FrameRing, RingOutcome};
use super::slot::{FrameSlot, SlotLayout};
use super::stage::Engine;
use super::state::{EngineState, StateCell};
use crate::device::{DeviceBinding, FieldId, StreamDirection, TransferPlan};
use crate::timecode::{CapturedTimecodes, TimecodeResolver};
use crate::utils::sos::SignalOfStop;

/// What the capture side does with a waiting device frame while the ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingFullPolicy {
    /// Leave it on the device; the device overwrites its oldest frame and counts a drop
    #[default]
    Hold,
    /// Pull it off the device into a scratch slot and count the discard here
    Discard,
}

pub(crate) fn pass_label(field: Option<FieldId>) -> &'static str {
    match field {
        None => "frame",
        Some(FieldId::First) => "F1",
        Some(FieldId::Second) => "F2",
    }
}

struct FieldTransfers {
    timecodes: CapturedTimecodes,
    frames_processed: Option<u64>,
    bytes: usize,
}

pub struct CaptureEngine<D: DeviceBinding> {
    device: Arc<D>,
    ring: Arc<FrameRing>,
    plan: TransferPlan,
    resolver: TimecodeResolver,
    sos: SignalOfStop,
    health: Arc<EngineHealth>,
    state: StateCell,
    policy: RingFullPolicy,
    scratch: Option<FrameSlot>,
    pulse_timeout: Duration,
    processor: Option<Box<dyn FrameProcessor>>,
    sequence: u64,
    /// Next device buffer count the synthetic timecode may use
    next_count: u64,
}

impl<D: DeviceBinding> CaptureEngine<D> {
    pub fn new(
        device: Arc<D>,
        ring: Arc<FrameRing>,
        plan: TransferPlan,
        resolver: TimecodeResolver,
        sos: SignalOfStop,
    ) -> Self {
        Self {
            device,
            ring,
            plan,
            resolver,
            sos,
            health: Arc::new(EngineHealth::new()),
            state: StateCell::new("CaptureEngine"),
            policy: RingFullPolicy::Hold,
            scratch: None,
            pulse_timeout: Duration::from_millis(50),
            processor: None,
            sequence: 0,
            next_count: 0,
        }
    }

    pub fn with_health(mut self, health: Arc<EngineHealth>) -> Self {
        self.health = health;
        self
    }

    pub fn with_state(mut self, state: StateCell) -> Self {
        self.state = state;
        self
    }

    /// `layout` sizes the scratch slot used by [`RingFullPolicy::Discard`].
    pub fn with_ring_full_policy(mut self, policy: RingFullPolicy, layout: &SlotLayout) -> Self {
        self.policy = policy;
        self.scratch = match policy {
            RingFullPolicy::Hold => None,
            RingFullPolicy::Discard => Some(FrameSlot::allocate(usize::MAX, layout)),
        };
        self
    }

    pub fn with_pulse_timeout(mut self, timeout: Duration) -> Self {
        self.pulse_timeout = timeout;
        self
    }

    pub fn with_processor(mut self, processor: Box<dyn FrameProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn health(&self) -> Arc<EngineHealth> {
        Arc::clone(&self.health)
    }

    pub fn state(&self) -> StateCell {
        self.state.clone()
    }

    fn transfer_fields(&self, slot: &mut FrameSlot) -> FieldTransfers {
        let mut transfers = FieldTransfers {
            timecodes: CapturedTimecodes::new(),
            frames_processed: None,
            bytes: 0,
        };
        let mut target = None;

        for &field in self.plan.passes() {
            let session = self.plan.session(field, target);
            match session.capture(&*self.device, slot) {
                Ok(report) => {
                    if target.is_none() {
                        target = Some(report.frame_index);
                        transfers.frames_processed = Some(report.frames_processed);
                        transfers.timecodes = report.timecodes;
                    }
                    transfers.bytes += session.geometry().host_bytes();
                }
                Err(e) => {
                    self.health.record_transfer_failure();
                    warn!(
                        "CaptureEngine: {} transfer into slot {} failed: {}",
                        pass_label(field),
                        slot.id(),
                        e
                    );
                    break;
                }
            }
        }
        transfers
    }

    fn capture_frame(&mut self, slot: &mut FrameSlot) {
        slot.reset_metadata();
        slot.sequence = self.sequence;
        self.sequence += 1;

        let transfers = self.transfer_fields(slot);

        // A failed transfer takes the next count so labels never repeat or go back
        let count = transfers
            .frames_processed
            .map_or(self.next_count, |n| n.max(self.next_count));
        self.next_count = count + 1;
        let counter = count / u64::from(self.plan.mode().pulses_per_frame());
        slot.timecodes = self.resolver.decode_all(&transfers.timecodes);
        slot.timecode = Some(self.resolver.resolve(&transfers.timecodes, counter));

        if let Some(processor) = self.processor.as_mut() {
            processor.process(slot);
        }
        if transfers.bytes > 0 {
            self.health.record_frame(transfers.bytes);
        }
    }

    fn discard_frame(&mut self) {
        let Some(mut scratch) = self.scratch.take() else {
            return;
        };
        let transfers = self.transfer_fields(&mut scratch);
        if transfers.frames_processed.is_some() {
            self.health.record_discard();
            debug!(
                "CaptureEngine: ring full, discarded device frame {}",
                transfers.frames_processed.unwrap_or_default()
            );
        }
        self.scratch = Some(scratch);
    }
}

impl<D: DeviceBinding + 'static> Engine for CaptureEngine<D> {
    fn run(&mut self) -> Result<()> {
        self.state.set_running();
        info!(
            "CaptureEngine: started ({} transfers, {} ring slots, ring full policy {:?})",
            self.plan.mode(),
            self.ring.capacity(),
            self.policy
        );

        while !self.sos.cancelled() {
            let status = match self.device.poll_status(StreamDirection::Capture) {
                Ok(status) => status,
                Err(e) => {
                    warn!("CaptureEngine: status poll failed: {}", e);
                    self.sos.wait_timeout(self.pulse_timeout);
                    continue;
                }
            };
            self.health
                .observe_device(status.frames_dropped, status.buffer_level);

            if !status.has_available_input_frame() {
                self.health.record_device_wait();
                self.device
                    .wait_for_timing_pulse(StreamDirection::Capture, self.pulse_timeout);
                continue;
            }

            let ring = Arc::clone(&self.ring);
            match ring.start_produce(self.pulse_timeout) {
                RingOutcome::Ready(mut lease) => {
                    self.capture_frame(&mut lease);
                    lease.commit();
                }
                RingOutcome::Blocked => {
                    self.health.record_backpressure();
                    if self.policy == RingFullPolicy::Discard {
                        self.discard_frame();
                    }
                }
                RingOutcome::Aborted => break,
            }
        }

        self.state.transition(EngineState::Draining);
        if let Err(e) = self.device.stop_stream(StreamDirection::Capture) {
            warn!("CaptureEngine: failed to stop input stream: {}", e);
        }
        self.state.transition(EngineState::Stopped);
        info!("CaptureEngine: stopped, {}", self.health.summary());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "CaptureEngine"
    }
}
