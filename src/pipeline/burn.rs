//! Per-frame processing hook on the capture side

use crate::device::FieldId;
use crate::pipeline::FrameSlot;
use crate::timecode::TimecodeOrigin;

/// Runs on each captured frame after its timecode is resolved and before it
/// is committed to the ring.
pub trait FrameProcessor: Send {
    fn process(&mut self, slot: &mut FrameSlot);

    fn name(&self) -> &'static str {
        "FrameProcessor"
    }
}

/// Writes the resolved timecode into one raster line of every field so the
/// value is visible downstream of the device. The second field is stamped
/// lower in the picture than the first, so the two can be told apart once
/// the fields are interleaved again.
///
/// The line starts with a four-byte marker, then hours, minutes, seconds,
/// frames, a drop-frame flag and a synthetic flag.
pub struct TimecodeStamp {
    /// Lines within the first and second field (a progressive frame uses the first)
    lines: [usize; 2],
    bytes_per_line: usize,
}

pub const STAMP_MARKER: [u8; 4] = *b"TCB1";

impl TimecodeStamp {
    pub fn new(first_line: usize, second_line: usize, bytes_per_line: usize) -> Self {
        Self {
            lines: [first_line, second_line],
            bytes_per_line,
        }
    }

    fn line(&self, field: FieldId) -> usize {
        match field {
            FieldId::First => self.lines[0],
            FieldId::Second => self.lines[1],
        }
    }

    /// Read the stamp of `field` back: the timecode fields and whether it was synthetic.
    pub fn read(&self, video: &[u8], field: FieldId) -> Option<([u8; 4], bool, bool)> {
        let start = self.line(field) * self.bytes_per_line;
        let line = video.get(start..start + self.bytes_per_line)?;
        if line.len() < 10 || line[..4] != STAMP_MARKER {
            return None;
        }
        Some(([line[4], line[5], line[6], line[7]], line[8] != 0, line[9] != 0))
    }

    fn stamp(&self, video: &mut [u8], field: FieldId, payload: &[u8; 10]) {
        let start = self.line(field) * self.bytes_per_line;
        if let Some(line) = video.get_mut(start..start + self.bytes_per_line) {
            let n = payload.len().min(line.len());
            line[..n].copy_from_slice(&payload[..n]);
        }
    }
}

impl FrameProcessor for TimecodeStamp {
    fn process(&mut self, slot: &mut FrameSlot) {
        let Some(resolved) = slot.timecode else {
            return;
        };
        let tc = resolved.value;
        let mut payload = [0u8; 10];
        payload[..4].copy_from_slice(&STAMP_MARKER);
        payload[4..8].copy_from_slice(&[tc.hours, tc.minutes, tc.seconds, tc.frames]);
        payload[8] = u8::from(tc.drop_frame);
        payload[9] = u8::from(resolved.origin == TimecodeOrigin::Synthetic);

        let first = slot.field.unwrap_or(FieldId::First);
        self.stamp(&mut slot.video, first, &payload);
        if let Some(video) = slot.video_f2.as_deref_mut() {
            self.stamp(video, FieldId::Second, &payload);
        }
    }

    fn name(&self) -> &'static str {
        "TimecodeStamp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SlotLayout;
    use crate::timecode::{ResolvedTimecode, Timecode, TimecodeIndex};

    #[test]
    fn test_fields_stamped_at_different_lines() {
        let layout = SlotLayout {
            video_bytes: 64,
            second_field: true,
            audio_bytes: None,
            anc_bytes: None,
        };
        let mut slot = FrameSlot::allocate(0, &layout);
        slot.timecode = Some(ResolvedTimecode {
            value: Timecode::new(10, 0, 1, 2, false),
            origin: TimecodeOrigin::Synthetic,
        });

        let mut stamp = TimecodeStamp::new(1, 3, 16);
        stamp.process(&mut slot);

        let expected = Some(([10, 0, 1, 2], false, true));
        let f2 = slot.video_f2.as_deref().unwrap();
        assert_eq!(stamp.read(&slot.video, FieldId::First), expected);
        assert_eq!(stamp.read(f2, FieldId::Second), expected);
        assert_eq!(stamp.read(&slot.video, FieldId::Second), None);
        assert_eq!(stamp.read(f2, FieldId::First), None);
        // Line zero untouched
        assert!(slot.video[..16].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_circulated_field_stamped_at_its_line() {
        let layout = SlotLayout {
            video_bytes: 64,
            second_field: false,
            audio_bytes: None,
            anc_bytes: None,
        };
        let stamp_tc = |field| {
            let mut slot = FrameSlot::allocate(0, &layout);
            slot.field = Some(field);
            slot.timecode = Some(ResolvedTimecode {
                value: Timecode::new(1, 2, 3, 4, false),
                origin: TimecodeOrigin::Embedded(TimecodeIndex::vitc(1)),
            });
            TimecodeStamp::new(0, 2, 16).process(&mut slot);
            slot
        };
        let stamp = TimecodeStamp::new(0, 2, 16);
        let expected = Some(([1, 2, 3, 4], false, false));

        let first = stamp_tc(FieldId::First);
        assert_eq!(stamp.read(&first.video, FieldId::First), expected);
        assert_eq!(stamp.read(&first.video, FieldId::Second), None);

        let second = stamp_tc(FieldId::Second);
        assert_eq!(stamp.read(&second.video, FieldId::Second), expected);
        assert_eq!(stamp.read(&second.video, FieldId::First), None);
    }

    #[test]
    fn test_no_timecode_leaves_frame_alone() {
        let layout = SlotLayout {
            video_bytes: 32,
            second_field: false,
            audio_bytes: None,
            anc_bytes: None,
        };
        let mut slot = FrameSlot::allocate(0, &layout);
        let mut stamp = TimecodeStamp::new(0, 1, 16);
        stamp.process(&mut slot);
        assert_eq!(stamp.read(&slot.video, FieldId::First), None);
    }
}
