//! RP188 (ancillary timecode) register words
//!
//! Low word: frame units [3:0], frame tens [9:8], drop flag [10], second units
//! [19:16], second tens [26:24]. High word: minute units [3:0], minute tens
//! [10:8], hour units [19:16], hour tens [25:24]. Above 30 fps the frame
//! count is carried halved with the field bit (bit 27) as its low bit; that
//! bit lives in the high word for 50 fps and in the low word otherwise.

use super::{Timecode, TimecodeFormat};

/// DBB bit set when the word pair carries a received timecode.
pub const RP188_DBB_PRESENT: u32 = 1 << 16;

const DROP_FLAG: u32 = 1 << 10;
const FIELD_BIT: u32 = 1 << 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rp188 {
    pub dbb: u32,
    pub low: u32,
    pub high: u32,
}

impl Rp188 {
    /// Sentinel the hardware reports for "no timecode".
    pub const INVALID: Rp188 = Rp188 {
        dbb: u32::MAX,
        low: u32::MAX,
        high: u32::MAX,
    };

    pub const fn new(dbb: u32, low: u32, high: u32) -> Self {
        Self { dbb, low, high }
    }

    pub fn is_sentinel(&self) -> bool {
        self.dbb == u32::MAX
    }

    pub fn is_zero(&self) -> bool {
        self.dbb == 0 && self.low == 0 && self.high == 0
    }

    pub fn encode(tc: &Timecode, format: TimecodeFormat) -> Self {
        let (frame_pair, field) = if format.fps > 30 {
            (u32::from(tc.frames) / 2, u32::from(tc.frames) % 2 == 1)
        } else {
            (u32::from(tc.frames), false)
        };

        let mut low = (frame_pair % 10)
            | ((frame_pair / 10) & 0x3) << 8
            | (u32::from(tc.seconds) % 10) << 16
            | ((u32::from(tc.seconds) / 10) & 0x7) << 24;
        let mut high = (u32::from(tc.minutes) % 10)
            | ((u32::from(tc.minutes) / 10) & 0x7) << 8
            | (u32::from(tc.hours) % 10) << 16
            | ((u32::from(tc.hours) / 10) & 0x3) << 24;

        if tc.drop_frame {
            low |= DROP_FLAG;
        }
        if field {
            if format.fps == 50 {
                high |= FIELD_BIT;
            } else {
                low |= FIELD_BIT;
            }
        }

        Self {
            dbb: RP188_DBB_PRESENT,
            low,
            high,
        }
    }

    /// Decode into a label, rejecting the sentinel, all-zero words, non-BCD
    /// digits and labels inconsistent with `format`.
    pub fn decode(&self, format: TimecodeFormat) -> Option<Timecode> {
        if self.is_sentinel() || self.is_zero() {
            return None;
        }

        let digit = |word: u32, shift: u32, mask: u32| -> Option<u32> {
            let value = (word >> shift) & mask;
            (value <= 9).then_some(value)
        };

        let frame_units = digit(self.low, 0, 0xF)?;
        let frame_tens = digit(self.low, 8, 0x3)?;
        let second_units = digit(self.low, 16, 0xF)?;
        let second_tens = digit(self.low, 24, 0x7)?;
        let minute_units = digit(self.high, 0, 0xF)?;
        let minute_tens = digit(self.high, 8, 0x7)?;
        let hour_units = digit(self.high, 16, 0xF)?;
        let hour_tens = digit(self.high, 24, 0x3)?;

        let mut frames = frame_tens * 10 + frame_units;
        if format.fps > 30 {
            let field_word = if format.fps == 50 { self.high } else { self.low };
            frames = frames * 2 + u32::from(field_word & FIELD_BIT != 0);
        }

        let tc = Timecode {
            hours: (hour_tens * 10 + hour_units) as u8,
            minutes: (minute_tens * 10 + minute_units) as u8,
            seconds: (second_tens * 10 + second_units) as u8,
            frames: u8::try_from(frames).ok()?,
            drop_frame: self.low & DROP_FLAG != 0,
        };
        tc.is_consistent(format).then_some(tc)
    }
}

impl Default for Rp188 {
    fn default() -> Self {
        Self::INVALID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_bcd_layout() {
        let format = TimecodeFormat::new(25, false);
        let rp = Rp188::encode(&Timecode::new(12, 34, 56, 21, false), format);
        assert_eq!(rp.low, 0x0506_0201);
        assert_eq!(rp.high, 0x0102_0304);
        assert_eq!(rp.decode(format), Some(Timecode::new(12, 34, 56, 21, false)));
    }

    #[test]
    fn test_high_frame_rate_uses_field_bit() {
        let p60 = TimecodeFormat::new(60, false);
        let rp = Rp188::encode(&Timecode::new(1, 0, 0, 59, false), p60);
        assert_ne!(rp.low & FIELD_BIT, 0);
        assert_eq!(rp.decode(p60).map(|tc| tc.frames), Some(59));

        let p50 = TimecodeFormat::new(50, false);
        let rp = Rp188::encode(&Timecode::new(1, 0, 0, 49, false), p50);
        assert_ne!(rp.high & FIELD_BIT, 0);
        assert_eq!(rp.low & FIELD_BIT, 0);
        assert_eq!(rp.decode(p50).map(|tc| tc.frames), Some(49));
    }

    #[test]
    fn test_rejects_sentinel_zero_and_garbage() {
        let format = TimecodeFormat::new(30, true);
        assert_eq!(Rp188::INVALID.decode(format), None);
        assert_eq!(Rp188::new(0, 0, 0).decode(format), None);
        // Frame units digit 0xC is not BCD
        assert_eq!(Rp188::new(RP188_DBB_PRESENT, 0x0000_000C, 0x0001_0000).decode(format), None);
        // 00:01:00;00 is a skipped drop-frame label
        let skipped = Rp188::new(RP188_DBB_PRESENT, DROP_FLAG, 0x0000_0001);
        assert_eq!(skipped.decode(format), None);
    }
}
