//! Host/device transfer geometry and per-call transfer sessions
//!
//! A whole frame, or a single field when the board circulates fields, moves
//! as one contiguous copy. With split fields the device buffer stays
//! interleaved while the host keeps each field packed: the transfer is split
//! into one segment per field line, stepping two lines on the device side and
//! one line on the host side, starting one line in for the second field.

use thiserror::Error;

use super::geometry::{FieldId, RasterGeometry};
use super::{
    CaptureReport, CaptureRequest, DeviceBinding, DeviceError, PlayoutReport, PlayoutRequest,
    StreamDirection, TransferMode,
};
use crate::pipeline::FrameSlot;
use crate::timecode::TimecodeMap;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("frame index {index} out of range (device circulates {count} frames)")]
    FrameIndex { index: u16, count: u16 },

    #[error("host buffer holds {actual} bytes, transfer needs {needed}")]
    BufferSize { needed: usize, actual: usize },

    #[error("session is set up for {0} transfers")]
    Direction(StreamDirection),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Strided copy description for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentedDma {
    pub segment_count: usize,
    pub segment_bytes: usize,
    pub host_pitch: usize,
    pub device_pitch: usize,
    /// Device byte offset of the first segment
    pub device_offset: usize,
}

impl SegmentedDma {
    pub fn for_field(raster: &RasterGeometry, field: FieldId) -> Self {
        Self {
            segment_count: raster.field_lines(),
            segment_bytes: raster.bytes_per_line,
            host_pitch: raster.bytes_per_line,
            device_pitch: raster.bytes_per_line * 2,
            device_offset: field.line_offset() * raster.bytes_per_line,
        }
    }

    /// Device byte offset of every segment, in transfer order.
    pub fn device_offsets(&self) -> impl Iterator<Item = usize> {
        let this = *self;
        (0..this.segment_count).map(move |i| this.device_offset + i * this.device_pitch)
    }

    fn host_offsets(&self) -> impl Iterator<Item = usize> {
        let this = *self;
        (0..this.segment_count).map(move |i| i * this.host_pitch)
    }

    /// Host bytes the transfer touches.
    pub fn host_span(&self) -> usize {
        match self.segment_count {
            0 => 0,
            n => (n - 1) * self.host_pitch + self.segment_bytes,
        }
    }

    /// Device bytes the transfer reaches, counted from offset zero.
    pub fn device_span(&self) -> usize {
        match self.segment_count {
            0 => 0,
            n => self.device_offset + (n - 1) * self.device_pitch + self.segment_bytes,
        }
    }

    /// Copy device segments into the packed host buffer.
    pub fn gather(&self, device: &[u8], host: &mut [u8]) -> Result<(), TransferError> {
        self.check(device.len(), host.len())?;
        for (dev, hst) in self.device_offsets().zip(self.host_offsets()) {
            host[hst..hst + self.segment_bytes]
                .copy_from_slice(&device[dev..dev + self.segment_bytes]);
        }
        Ok(())
    }

    /// Copy the packed host buffer out to device segments.
    pub fn scatter(&self, host: &[u8], device: &mut [u8]) -> Result<(), TransferError> {
        self.check(device.len(), host.len())?;
        for (dev, hst) in self.device_offsets().zip(self.host_offsets()) {
            device[dev..dev + self.segment_bytes]
                .copy_from_slice(&host[hst..hst + self.segment_bytes]);
        }
        Ok(())
    }

    fn check(&self, device_len: usize, host_len: usize) -> Result<(), TransferError> {
        if host_len < self.host_span() {
            return Err(TransferError::BufferSize {
                needed: self.host_span(),
                actual: host_len,
            });
        }
        if device_len < self.device_span() {
            return Err(TransferError::BufferSize {
                needed: self.device_span(),
                actual: device_len,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferGeometry {
    WholeFrame { bytes: usize },
    Segmented(SegmentedDma),
}

impl TransferGeometry {
    pub fn host_bytes(&self) -> usize {
        match self {
            TransferGeometry::WholeFrame { bytes } => *bytes,
            TransferGeometry::Segmented(dma) => dma.host_span(),
        }
    }

    /// Device to host.
    pub fn gather(&self, device: &[u8], host: &mut [u8]) -> Result<(), TransferError> {
        match self {
            TransferGeometry::WholeFrame { bytes } => {
                let bytes = *bytes;
                if host.len() < bytes || device.len() < bytes {
                    return Err(TransferError::BufferSize {
                        needed: bytes,
                        actual: host.len().min(device.len()),
                    });
                }
                host[..bytes].copy_from_slice(&device[..bytes]);
                Ok(())
            }
            TransferGeometry::Segmented(dma) => dma.gather(device, host),
        }
    }

    /// Host to device.
    pub fn scatter(&self, host: &[u8], device: &mut [u8]) -> Result<(), TransferError> {
        match self {
            TransferGeometry::WholeFrame { bytes } => {
                let bytes = *bytes;
                if host.len() < bytes || device.len() < bytes {
                    return Err(TransferError::BufferSize {
                        needed: bytes,
                        actual: host.len().min(device.len()),
                    });
                }
                device[..bytes].copy_from_slice(&host[..bytes]);
                Ok(())
            }
            TransferGeometry::Segmented(dma) => dma.scatter(host, device),
        }
    }
}

/// Transfer layout for one direction, fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    direction: StreamDirection,
    raster: RasterGeometry,
    mode: TransferMode,
    device_frames: u16,
}

const FRAME_PASS: [Option<FieldId>; 1] = [None];
const FIELD_PASSES: [Option<FieldId>; 2] = [Some(FieldId::First), Some(FieldId::Second)];

impl TransferPlan {
    pub fn new(
        direction: StreamDirection,
        raster: RasterGeometry,
        mode: TransferMode,
        device_frames: u16,
    ) -> Self {
        Self {
            direction,
            raster,
            mode,
            device_frames,
        }
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn raster(&self) -> RasterGeometry {
        self.raster
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Transfers per slot: one buffer, or first field then second field when splitting.
    pub fn passes(&self) -> &'static [Option<FieldId>] {
        match self.mode {
            TransferMode::SplitFields => &FIELD_PASSES,
            TransferMode::Frame | TransferMode::Fields => &FRAME_PASS,
        }
    }

    /// Host bytes per video buffer.
    pub fn host_video_bytes(&self) -> usize {
        match self.mode {
            TransferMode::Frame => self.raster.frame_bytes(),
            TransferMode::SplitFields | TransferMode::Fields => self.raster.field_bytes(),
        }
    }

    /// Bytes in one on-board buffer.
    pub fn device_buffer_bytes(&self) -> usize {
        if self.mode.circulates_fields() {
            self.raster.field_bytes()
        } else {
            self.raster.frame_bytes()
        }
    }

    pub fn geometry(&self, field: Option<FieldId>) -> TransferGeometry {
        match field {
            Some(field) => TransferGeometry::Segmented(SegmentedDma::for_field(&self.raster, field)),
            None => TransferGeometry::WholeFrame {
                bytes: self.device_buffer_bytes(),
            },
        }
    }

    pub fn session(&self, field: Option<FieldId>, target_frame: Option<u16>) -> DeviceTransferSession {
        DeviceTransferSession {
            direction: self.direction,
            geometry: self.geometry(field),
            field,
            target_frame,
            device_frames: self.device_frames,
        }
    }
}

/// One transfer call: geometry, which field, and optionally a pinned device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTransferSession {
    direction: StreamDirection,
    geometry: TransferGeometry,
    field: Option<FieldId>,
    target_frame: Option<u16>,
    device_frames: u16,
}

impl DeviceTransferSession {
    pub fn geometry(&self) -> TransferGeometry {
        self.geometry
    }

    pub fn field(&self) -> Option<FieldId> {
        self.field
    }

    pub fn target_frame(&self) -> Option<u16> {
        self.target_frame
    }

    fn check_direction(&self, expected: StreamDirection) -> Result<(), TransferError> {
        if self.direction != expected {
            return Err(TransferError::Direction(self.direction));
        }
        Ok(())
    }

    fn check_target(&self) -> Result<(), TransferError> {
        match self.target_frame {
            Some(index) if index >= self.device_frames => Err(TransferError::FrameIndex {
                index,
                count: self.device_frames,
            }),
            _ => Ok(()),
        }
    }

    fn check_host(&self, actual: usize) -> Result<(), TransferError> {
        let needed = self.geometry.host_bytes();
        if actual < needed {
            return Err(TransferError::BufferSize { needed, actual });
        }
        Ok(())
    }

    /// Move device data into `slot`.
    ///
    /// Whole buffers and first split fields carry audio; ancillary data
    /// follows its field. Captured byte counts, and the field a circulated
    /// field buffer held, are recorded on the slot.
    pub fn capture<D: DeviceBinding + ?Sized>(
        &self,
        device: &D,
        slot: &mut FrameSlot,
    ) -> Result<CaptureReport, TransferError> {
        self.check_direction(StreamDirection::Capture)?;
        self.check_target()?;

        let FrameSlot {
            video,
            video_f2,
            audio,
            anc,
            anc_f2,
            ..
        } = &mut *slot;

        let (video, audio, anc_f1, anc_f2) = match self.field {
            None => (
                &mut video[..],
                audio.as_deref_mut(),
                anc.as_deref_mut(),
                anc_f2.as_deref_mut(),
            ),
            Some(FieldId::First) => (&mut video[..], audio.as_deref_mut(), anc.as_deref_mut(), None),
            Some(FieldId::Second) => {
                let video = video_f2.as_deref_mut().ok_or(TransferError::BufferSize {
                    needed: self.geometry.host_bytes(),
                    actual: 0,
                })?;
                (video, None, None, anc_f2.as_deref_mut())
            }
        };
        self.check_host(video.len())?;

        let report = device.transfer_in(CaptureRequest {
            target_frame: self.target_frame,
            geometry: self.geometry,
            video,
            audio,
            anc_f1,
            anc_f2,
        })?;

        match self.field {
            None => {
                slot.captured_audio_bytes = report.audio_bytes;
                slot.captured_anc_bytes = report.anc_bytes;
                slot.field = report.field;
            }
            Some(FieldId::First) => {
                slot.captured_audio_bytes = report.audio_bytes;
                slot.captured_anc_bytes[0] = report.anc_bytes[0];
            }
            Some(FieldId::Second) => {
                slot.captured_anc_bytes[1] = report.anc_bytes[1];
            }
        }
        Ok(report)
    }

    /// Move `slot` out to the device, writing `timecodes` to their destinations.
    ///
    /// Only the captured audio and ancillary bytes are sent.
    pub fn playout<D: DeviceBinding + ?Sized>(
        &self,
        device: &D,
        slot: &FrameSlot,
        timecodes: &TimecodeMap,
    ) -> Result<PlayoutReport, TransferError> {
        self.check_direction(StreamDirection::Playout)?;
        self.check_target()?;

        let (video, audio, anc_f1, anc_f2) = match self.field {
            None => (
                &slot.video[..],
                slot.captured_audio(),
                slot.captured_anc(FieldId::First),
                slot.captured_anc(FieldId::Second),
            ),
            Some(FieldId::First) => (
                &slot.video[..],
                slot.captured_audio(),
                slot.captured_anc(FieldId::First),
                None,
            ),
            Some(FieldId::Second) => {
                let video = slot.video_f2.as_deref().ok_or(TransferError::BufferSize {
                    needed: self.geometry.host_bytes(),
                    actual: 0,
                })?;
                (video, None, None, slot.captured_anc(FieldId::Second))
            }
        };
        self.check_host(video.len())?;

        let report = device.transfer_out(PlayoutRequest {
            target_frame: self.target_frame,
            geometry: self.geometry,
            video,
            audio,
            anc_f1,
            anc_f2,
            timecodes,
            field: self.field.or(slot.field),
        })?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{PixelFormat, VideoFormat};

    fn raster_8x16() -> RasterGeometry {
        RasterGeometry {
            lines: 8,
            bytes_per_line: 16,
        }
    }

    #[test]
    fn test_field_segment_offsets() {
        let raster = raster_8x16();
        let f1 = SegmentedDma::for_field(&raster, FieldId::First);
        let f2 = SegmentedDma::for_field(&raster, FieldId::Second);

        assert_eq!(f1.segment_count, 4);
        assert_eq!(f1.segment_bytes, 16);
        assert_eq!(f1.host_pitch, 16);
        assert_eq!(f1.device_pitch, 32);
        assert_eq!(f1.device_offsets().collect::<Vec<_>>(), vec![0, 32, 64, 96]);
        assert_eq!(f2.device_offsets().collect::<Vec<_>>(), vec![16, 48, 80, 112]);
        assert_eq!(f1.host_span(), 64);
        assert_eq!(f2.device_span(), 128);
    }

    #[test]
    fn test_fields_interleave_into_frame() {
        let raster = raster_8x16();
        let field1: Vec<u8> = (0..64).map(|i| (i / 16) as u8 * 2).collect();
        let field2: Vec<u8> = (0..64).map(|i| (i / 16) as u8 * 2 + 1).collect();

        let mut device = vec![0xFFu8; raster.frame_bytes()];
        SegmentedDma::for_field(&raster, FieldId::First)
            .scatter(&field1, &mut device)
            .unwrap();
        SegmentedDma::for_field(&raster, FieldId::Second)
            .scatter(&field2, &mut device)
            .unwrap();

        // Each device line now holds its own line number
        for (line, chunk) in device.chunks(16).enumerate() {
            assert!(chunk.iter().all(|b| *b as usize == line), "line {line}");
        }

        let mut back = vec![0u8; 64];
        SegmentedDma::for_field(&raster, FieldId::Second)
            .gather(&device, &mut back)
            .unwrap();
        assert_eq!(back, field2);
    }

    #[test]
    fn test_short_buffers_rejected() {
        let dma = SegmentedDma::for_field(&raster_8x16(), FieldId::Second);
        let device = vec![0u8; 127];
        let mut host = vec![0u8; 64];
        assert!(matches!(
            dma.gather(&device, &mut host),
            Err(TransferError::BufferSize { needed: 128, actual: 127 })
        ));

        let whole = TransferGeometry::WholeFrame { bytes: 128 };
        let mut small = vec![0u8; 100];
        assert!(matches!(
            whole.gather(&[0u8; 128], &mut small),
            Err(TransferError::BufferSize { needed: 128, .. })
        ));
    }

    #[test]
    fn test_plan_sessions() {
        let format = VideoFormat::new(8, 8, crate::device::FrameRate::Fps25, true);
        let raster = RasterGeometry::new(&format, PixelFormat::Ycbcr8);
        let frame_plan =
            TransferPlan::new(StreamDirection::Capture, raster, TransferMode::Frame, 7);
        assert_eq!(frame_plan.passes(), &[None]);
        assert_eq!(frame_plan.host_video_bytes(), 128);
        assert_eq!(
            frame_plan.session(None, None).geometry(),
            TransferGeometry::WholeFrame { bytes: 128 }
        );

        let field_plan =
            TransferPlan::new(StreamDirection::Capture, raster, TransferMode::SplitFields, 7);
        assert_eq!(field_plan.passes().len(), 2);
        assert_eq!(field_plan.host_video_bytes(), 64);
        let f2 = field_plan.session(Some(FieldId::Second), Some(3));
        assert_eq!(f2.target_frame(), Some(3));
        assert!(matches!(
            f2.geometry(),
            TransferGeometry::Segmented(SegmentedDma { device_offset: 16, .. })
        ));
    }

    #[test]
    fn test_circulated_fields_move_as_one_buffer() {
        let format = VideoFormat::new(8, 8, crate::device::FrameRate::Fps25, true);
        let raster = RasterGeometry::new(&format, PixelFormat::Ycbcr8);
        let plan = TransferPlan::new(StreamDirection::Playout, raster, TransferMode::Fields, 7);
        assert_eq!(plan.passes(), &[None]);
        assert_eq!(plan.host_video_bytes(), 64);
        assert_eq!(plan.device_buffer_bytes(), 64);
        assert_eq!(
            plan.session(None, None).geometry(),
            TransferGeometry::WholeFrame { bytes: 64 }
        );
    }
}
