//! Host frame slots
//!
//! Every buffer is allocated once, up front, at the size the transfer
//! geometry needs; slots are then recycled through the ring for the rest of
//! the run.

use bytes::BytesMut;

use crate::device::FieldId;
use crate::timecode::{ResolvedTimecode, TimecodeMap};

/// Buffer sizes for every slot of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    /// Frame bytes, or field bytes when fields are transferred
    pub video_bytes: usize,
    /// Separate buffer for the second field
    pub second_field: bool,
    pub audio_bytes: Option<usize>,
    /// Per field
    pub anc_bytes: Option<usize>,
}

impl SlotLayout {
    pub fn allocate(&self, count: usize) -> Vec<FrameSlot> {
        (0..count).map(|id| FrameSlot::allocate(id, self)).collect()
    }
}

/// One host frame or field: video (one buffer per field when fields are
/// split), optional audio and ancillary buffers, and the metadata captured
/// alongside.
#[derive(Debug)]
pub struct FrameSlot {
    id: usize,
    pub video: BytesMut,
    /// Second field, split-field transfers only
    pub video_f2: Option<BytesMut>,
    pub audio: Option<BytesMut>,
    pub anc: Option<BytesMut>,
    pub anc_f2: Option<BytesMut>,
    pub captured_audio_bytes: usize,
    pub captured_anc_bytes: [usize; 2],
    /// Embedded timecodes that decoded cleanly, by source
    pub timecodes: TimecodeMap,
    /// The one timecode this frame carries downstream
    pub timecode: Option<ResolvedTimecode>,
    /// Field held by a slot that carries a single circulated field
    pub field: Option<FieldId>,
    /// Capture order
    pub sequence: u64,
}

impl FrameSlot {
    pub fn allocate(id: usize, layout: &SlotLayout) -> Self {
        Self {
            id,
            video: BytesMut::zeroed(layout.video_bytes),
            video_f2: layout
                .second_field
                .then(|| BytesMut::zeroed(layout.video_bytes)),
            audio: layout.audio_bytes.map(BytesMut::zeroed),
            anc: layout.anc_bytes.map(BytesMut::zeroed),
            anc_f2: layout.anc_bytes.map(BytesMut::zeroed),
            captured_audio_bytes: 0,
            captured_anc_bytes: [0; 2],
            timecodes: TimecodeMap::new(),
            timecode: None,
            field: None,
            sequence: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Forget the previous frame's metadata. Buffer contents are left as they are.
    pub fn reset_metadata(&mut self) {
        self.captured_audio_bytes = 0;
        self.captured_anc_bytes = [0; 2];
        self.timecodes.clear();
        self.timecode = None;
        self.field = None;
    }

    /// Audio bytes actually captured.
    pub fn captured_audio(&self) -> Option<&[u8]> {
        let audio = self.audio.as_deref()?;
        Some(&audio[..self.captured_audio_bytes.min(audio.len())])
    }

    /// Ancillary bytes actually captured for `field`.
    pub fn captured_anc(&self, field: FieldId) -> Option<&[u8]> {
        let (buffer, count) = match field {
            FieldId::First => (self.anc.as_deref()?, self.captured_anc_bytes[0]),
            FieldId::Second => (self.anc_f2.as_deref()?, self.captured_anc_bytes[1]),
        };
        Some(&buffer[..count.min(buffer.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timecode::{Timecode, TimecodeOrigin};

    fn layout(second_field: bool) -> SlotLayout {
        SlotLayout {
            video_bytes: 64,
            second_field,
            audio_bytes: Some(32),
            anc_bytes: Some(8),
        }
    }

    #[test]
    fn test_split_fields_allocate_second_field() {
        let slots = layout(true).allocate(3);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[2].id(), 2);
        assert_eq!(slots[0].video.len(), 64);
        assert_eq!(slots[0].video_f2.as_ref().map(|v| v.len()), Some(64));

        let frame = FrameSlot::allocate(0, &layout(false));
        assert!(frame.video_f2.is_none());
        assert_eq!(frame.video.len(), 64);
    }

    #[test]
    fn test_captured_views_are_trimmed() {
        let mut slot = FrameSlot::allocate(0, &layout(true));
        assert_eq!(slot.captured_audio().map(<[u8]>::len), Some(0));

        slot.captured_audio_bytes = 20;
        slot.captured_anc_bytes = [3, 100];
        assert_eq!(slot.captured_audio().map(<[u8]>::len), Some(20));
        assert_eq!(slot.captured_anc(FieldId::First).map(<[u8]>::len), Some(3));
        assert_eq!(slot.captured_anc(FieldId::Second).map(<[u8]>::len), Some(8));

        slot.timecode = Some(ResolvedTimecode {
            value: Timecode::new(10, 0, 0, 0, false),
            origin: TimecodeOrigin::Synthetic,
        });
        slot.field = Some(FieldId::Second);
        slot.reset_metadata();
        assert!(slot.timecode.is_none());
        assert!(slot.field.is_none());
        assert_eq!(slot.captured_audio_bytes, 0);
    }

    #[test]
    fn test_missing_buffers() {
        let slot = FrameSlot::allocate(
            0,
            &SlotLayout {
                video_bytes: 16,
                second_field: false,
                audio_bytes: None,
                anc_bytes: None,
            },
        );
        assert!(slot.captured_audio().is_none());
        assert!(slot.captured_anc(FieldId::Second).is_none());
        assert!(slot.video_f2.is_none());
    }
}
