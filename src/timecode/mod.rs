//! SMPTE timecode model
//!
//! A [`Timecode`] is an hours:minutes:seconds:frames label. Conversions to and
//! from an elapsed frame count follow the drop-frame counting rule when the
//! [`TimecodeFormat`] asks for it: at 30 fps two frame numbers (four at 60 fps)
//! are skipped at the start of every minute except each tenth minute.

pub mod resolver;
pub mod rp188;

pub use resolver::{
    CapturedTimecodes, ResolvedTimecode, TimecodeIndex, TimecodeKind, TimecodeMap,
    TimecodeOrigin, TimecodeResolver,
};
pub use rp188::Rp188;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use thiserror::Error;

/// Counting base for a timecode stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimecodeFormat {
    /// Nominal integer frames per second (24, 25, 30, 48, 50, 60).
    pub fps: u32,
    /// Drop-frame counting (only meaningful for 30 and 60 fps).
    pub drop_frame: bool,
}

impl TimecodeFormat {
    pub const fn new(fps: u32, drop_frame: bool) -> Self {
        Self { fps, drop_frame }
    }

    /// Frame numbers skipped at the top of each non-tenth minute.
    pub fn dropped_per_minute(&self) -> u32 {
        if self.drop_frame { self.fps / 15 } else { 0 }
    }

    fn frames_per_minute(&self) -> u64 {
        u64::from(self.fps) * 60
    }

    /// Actual frame count in a drop minute.
    fn drop_frames_per_minute(&self) -> u64 {
        self.frames_per_minute() - u64::from(self.dropped_per_minute())
    }

    fn frames_per_ten_minutes(&self) -> u64 {
        self.frames_per_minute() + 9 * self.drop_frames_per_minute()
    }

    /// Number of distinct labels in 24 hours.
    pub fn frames_per_day(&self) -> u64 {
        self.frames_per_ten_minutes() * 6 * 24
    }
}

/// Timecode label. Fields are only meaningful relative to a [`TimecodeFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timecode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
    pub drop_frame: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimecodeParseError {
    #[error("expected HH:MM:SS:FF, got '{0}'")]
    Shape(String),

    #[error("invalid number '{0}' in timecode")]
    Number(String),
}

impl Timecode {
    pub const fn new(hours: u8, minutes: u8, seconds: u8, frames: u8, drop_frame: bool) -> Self {
        Self {
            hours,
            minutes,
            seconds,
            frames,
            drop_frame,
        }
    }

    /// Label for `count` frames elapsed since 00:00:00:00, wrapping at 24 hours.
    pub fn from_frame_count(count: u64, format: TimecodeFormat) -> Self {
        let fps = u64::from(format.fps.max(1));
        let frames_per_minute = fps * 60;
        let (h, m, s, f);

        if !format.drop_frame {
            let frames_per_hour = frames_per_minute * 60;
            let mut frame = count % (frames_per_hour * 24);
            h = frame / frames_per_hour;
            frame %= frames_per_hour;
            m = frame / frames_per_minute;
            frame %= frames_per_minute;
            s = frame / fps;
            f = frame % fps;
        } else {
            let dropped = u64::from(format.dropped_per_minute());
            let drop_second = fps - dropped;
            let drop_minute = format.drop_frames_per_minute();
            let ten_minutes = format.frames_per_ten_minutes();
            let per_hour = ten_minutes * 6;

            let mut frame = count % (per_hour * 24);
            h = frame / per_hour;
            frame %= per_hour;

            let mut minutes = 10 * (frame / ten_minutes);
            frame %= ten_minutes;

            // The first minute of each ten is a full minute, the rest are drop minutes
            if frame >= frames_per_minute {
                minutes += 1;
                frame -= frames_per_minute;
                minutes += frame / drop_minute;
                frame %= drop_minute;
            }

            let mut seconds = 0;
            if minutes % 10 == 0 {
                seconds = frame / fps;
                frame %= fps;
            } else if frame >= drop_second {
                seconds = 1;
                frame -= drop_second;
                seconds += frame / fps;
                frame %= fps;
            }

            // Second zero of a drop minute is numbered from `dropped`, not from zero
            if seconds == 0 && minutes % 10 != 0 {
                frame += dropped;
            }

            m = minutes;
            s = seconds;
            f = frame;
        }

        Self {
            hours: h as u8,
            minutes: m as u8,
            seconds: s as u8,
            frames: f as u8,
            drop_frame: format.drop_frame,
        }
    }

    /// Frames elapsed since 00:00:00:00 for this label.
    pub fn to_frame_count(&self, format: TimecodeFormat) -> u64 {
        let fps = u64::from(format.fps);
        let total_minutes = 60 * u64::from(self.hours) + u64::from(self.minutes);
        let nominal = fps * 3600 * u64::from(self.hours)
            + fps * 60 * u64::from(self.minutes)
            + fps * u64::from(self.seconds)
            + u64::from(self.frames);
        if format.drop_frame {
            let dropped = u64::from(format.dropped_per_minute());
            nominal.saturating_sub(dropped * (total_minutes - total_minutes / 10))
        } else {
            nominal
        }
    }

    /// Label `delta` frames later, wrapping at 24 hours.
    pub fn advanced_by(&self, delta: u64, format: TimecodeFormat) -> Self {
        let day = format.frames_per_day().max(1);
        let count = (self.to_frame_count(format) % day + delta % day) % day;
        Self::from_frame_count(count, format)
    }

    /// True when every field is in range for `format` and the label is not a skipped drop-frame number.
    pub fn is_consistent(&self, format: TimecodeFormat) -> bool {
        if self.hours >= 24
            || self.minutes >= 60
            || self.seconds >= 60
            || u32::from(self.frames) >= format.fps
        {
            return false;
        }
        if self.drop_frame != format.drop_frame {
            return false;
        }
        if format.drop_frame
            && self.seconds == 0
            && self.minutes % 10 != 0
            && u32::from(self.frames) < format.dropped_per_minute()
        {
            return false;
        }
        true
    }
}

impl std::fmt::Display for Timecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sep = if self.drop_frame { ';' } else { ':' };
        write!(
            f,
            "{:02}:{:02}:{:02}{}{:02}",
            self.hours, self.minutes, self.seconds, sep, self.frames
        )
    }
}

impl FromStr for Timecode {
    type Err = TimecodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split([':', ';']).collect();
        if parts.len() != 4 {
            return Err(TimecodeParseError::Shape(trimmed.to_string()));
        }
        let mut fields = [0u8; 4];
        for (slot, part) in fields.iter_mut().zip(&parts) {
            *slot = part
                .parse::<u8>()
                .map_err(|_| TimecodeParseError::Number(part.to_string()))?;
        }
        Ok(Timecode::new(
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            trimmed.contains(';'),
        ))
    }
}

impl Serialize for Timecode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timecode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NDF25: TimecodeFormat = TimecodeFormat::new(25, false);
    const DF30: TimecodeFormat = TimecodeFormat::new(30, true);
    const DF60: TimecodeFormat = TimecodeFormat::new(60, true);

    #[test]
    fn test_non_drop_conversion() {
        let tc = Timecode::from_frame_count(25 * 3600 + 25 * 61 + 7, NDF25);
        assert_eq!(tc, Timecode::new(1, 1, 1, 7, false));
        assert_eq!(tc.to_frame_count(NDF25), 25 * 3600 + 25 * 61 + 7);
    }

    #[test]
    fn test_drop_frame_skips_minute_labels() {
        // Last label of minute zero, then the first label of minute one skips ;00 and ;01
        assert_eq!(Timecode::from_frame_count(1799, DF30).to_string(), "00:00:59;29");
        assert_eq!(Timecode::from_frame_count(1800, DF30).to_string(), "00:01:00;02");
        // Tenth minute keeps its ;00
        assert_eq!(Timecode::from_frame_count(17982, DF30).to_string(), "00:10:00;00");
        // One hour of 29.97 is 107892 frames
        assert_eq!(Timecode::from_frame_count(107892, DF30).to_string(), "01:00:00;00");
    }

    #[test]
    fn test_drop_frame_count_inverts() {
        for count in [0u64, 1, 1799, 1800, 1801, 17981, 17982, 53946, 107891, 107892] {
            let tc = Timecode::from_frame_count(count, DF30);
            assert_eq!(tc.to_frame_count(DF30), count, "count {count} -> {tc}");
        }
        let tc = Timecode::from_frame_count(3600, DF60);
        assert_eq!(tc.to_string(), "00:01:00;04");
        assert_eq!(tc.to_frame_count(DF60), 3600);
    }

    #[test]
    fn test_wraps_at_24_hours() {
        let day = NDF25.frames_per_day();
        assert_eq!(Timecode::from_frame_count(day, NDF25), Timecode::default());
        let late = Timecode::new(23, 59, 59, 24, false);
        assert_eq!(late.advanced_by(1, NDF25), Timecode::default());
    }

    #[test]
    fn test_consistency_checks() {
        assert!(Timecode::new(10, 0, 0, 0, false).is_consistent(NDF25));
        assert!(!Timecode::new(10, 0, 0, 25, false).is_consistent(NDF25));
        assert!(!Timecode::new(24, 0, 0, 0, false).is_consistent(NDF25));
        assert!(!Timecode::new(0, 1, 0, 1, true).is_consistent(DF30));
        assert!(Timecode::new(0, 10, 0, 1, true).is_consistent(DF30));
        assert!(!Timecode::new(0, 10, 0, 1, false).is_consistent(DF30));
    }

    #[test]
    fn test_parse_and_display() {
        let tc: Timecode = "10:00:00:00".parse().unwrap();
        assert_eq!(tc, Timecode::new(10, 0, 0, 0, false));
        let df: Timecode = "01:02:03;04".parse().unwrap();
        assert!(df.drop_frame);
        assert_eq!(df.to_string(), "01:02:03;04");
        assert!(matches!(
            "10:00:00".parse::<Timecode>(),
            Err(TimecodeParseError::Shape(_))
        ));
        assert!(matches!(
            "10:xx:00:00".parse::<Timecode>(),
            Err(TimecodeParseError::Number(_))
        ));
    }
}
