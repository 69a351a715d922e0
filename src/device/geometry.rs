//! Video format and raster geometry

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::timecode::TimecodeFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameRate {
    #[serde(rename = "23.98")]
    Fps2398,
    #[serde(rename = "24")]
    Fps24,
    #[serde(rename = "25")]
    Fps25,
    #[serde(rename = "29.97")]
    Fps2997,
    #[serde(rename = "30")]
    Fps30,
    #[serde(rename = "47.95")]
    Fps4795,
    #[serde(rename = "48")]
    Fps48,
    #[serde(rename = "50")]
    Fps50,
    #[serde(rename = "59.94")]
    Fps5994,
    #[serde(rename = "60")]
    Fps60,
}

impl FrameRate {
    /// Exact rate as a (numerator, denominator) pair.
    pub fn ratio(&self) -> (u64, u64) {
        match self {
            FrameRate::Fps2398 => (24000, 1001),
            FrameRate::Fps24 => (24, 1),
            FrameRate::Fps25 => (25, 1),
            FrameRate::Fps2997 => (30000, 1001),
            FrameRate::Fps30 => (30, 1),
            FrameRate::Fps4795 => (48000, 1001),
            FrameRate::Fps48 => (48, 1),
            FrameRate::Fps50 => (50, 1),
            FrameRate::Fps5994 => (60000, 1001),
            FrameRate::Fps60 => (60, 1),
        }
    }

    /// Duration of one frame.
    pub fn frame_period(&self) -> Duration {
        let (num, den) = self.ratio();
        Duration::from_nanos(1_000_000_000 * den / num)
    }

    /// Timecode counting base; the fractional NTSC rates at 30 and 60 count drop-frame.
    pub fn timecode_format(&self) -> TimecodeFormat {
        match self {
            FrameRate::Fps2398 | FrameRate::Fps24 => TimecodeFormat::new(24, false),
            FrameRate::Fps25 => TimecodeFormat::new(25, false),
            FrameRate::Fps2997 => TimecodeFormat::new(30, true),
            FrameRate::Fps30 => TimecodeFormat::new(30, false),
            FrameRate::Fps4795 | FrameRate::Fps48 => TimecodeFormat::new(48, false),
            FrameRate::Fps50 => TimecodeFormat::new(50, false),
            FrameRate::Fps5994 => TimecodeFormat::new(60, true),
            FrameRate::Fps60 => TimecodeFormat::new(60, false),
        }
    }
}

impl std::fmt::Display for FrameRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (num, den) = self.ratio();
        if den == 1 {
            write!(f, "{}", num)
        } else {
            write!(f, "{:.2}", num as f64 / den as f64)
        }
    }
}

/// Frame buffer pixel packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit 4:2:2 YCbCr, 2 bytes per pixel
    #[default]
    Ycbcr8,
    /// 10-bit 4:2:2 YCbCr (v210), 128 bytes per 48-pixel group
    Ycbcr10,
    /// 8-bit RGBA
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_line(&self, width: u32) -> usize {
        let width = width as usize;
        match self {
            PixelFormat::Ycbcr8 => width * 2,
            PixelFormat::Ycbcr10 => width.div_ceil(48) * 128,
            PixelFormat::Rgba8 => width * 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    /// Active lines per frame
    pub lines: u32,
    pub rate: FrameRate,
    pub interlaced: bool,
}

impl VideoFormat {
    pub const fn new(width: u32, lines: u32, rate: FrameRate, interlaced: bool) -> Self {
        Self {
            width,
            lines,
            rate,
            interlaced,
        }
    }

    pub const fn ntsc() -> Self {
        Self::new(720, 486, FrameRate::Fps2997, true)
    }

    pub const fn pal() -> Self {
        Self::new(720, 576, FrameRate::Fps25, true)
    }

    pub const fn hd1080i50() -> Self {
        Self::new(1920, 1080, FrameRate::Fps25, true)
    }

    pub const fn hd1080i5994() -> Self {
        Self::new(1920, 1080, FrameRate::Fps2997, true)
    }

    pub const fn hd720p5994() -> Self {
        Self::new(1280, 720, FrameRate::Fps5994, false)
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scan = if self.interlaced { 'i' } else { 'p' };
        write!(f, "{}x{}{}{}", self.width, self.lines, scan, self.rate)
    }
}

/// Which half of an interlaced frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldId {
    /// Even raster lines (0, 2, 4, ...)
    First,
    /// Odd raster lines (1, 3, 5, ...)
    Second,
}

impl FieldId {
    /// First raster line of this field.
    pub fn line_offset(&self) -> usize {
        match self {
            FieldId::First => 0,
            FieldId::Second => 1,
        }
    }
}

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldId::First => write!(f, "F1"),
            FieldId::Second => write!(f, "F2"),
        }
    }
}

/// Byte layout of one device frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterGeometry {
    pub lines: usize,
    pub bytes_per_line: usize,
}

impl RasterGeometry {
    pub fn new(format: &VideoFormat, pixel_format: PixelFormat) -> Self {
        Self {
            lines: format.lines as usize,
            bytes_per_line: pixel_format.bytes_per_line(format.width),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.lines * self.bytes_per_line
    }

    pub fn field_lines(&self) -> usize {
        self.lines / 2
    }

    pub fn field_bytes(&self) -> usize {
        self.field_lines() * self.bytes_per_line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_line() {
        assert_eq!(PixelFormat::Ycbcr8.bytes_per_line(1920), 3840);
        assert_eq!(PixelFormat::Ycbcr10.bytes_per_line(1920), 5120);
        assert_eq!(PixelFormat::Ycbcr10.bytes_per_line(720), 1920);
        assert_eq!(PixelFormat::Rgba8.bytes_per_line(720), 2880);
    }

    #[test]
    fn test_raster_field_split() {
        let raster = RasterGeometry::new(&VideoFormat::ntsc(), PixelFormat::Ycbcr8);
        assert_eq!(raster.bytes_per_line, 1440);
        assert_eq!(raster.field_lines(), 243);
        assert_eq!(raster.field_bytes() * 2, raster.frame_bytes());
    }

    #[test]
    fn test_frame_rate_timecode_mapping() {
        assert_eq!(FrameRate::Fps2997.timecode_format(), TimecodeFormat::new(30, true));
        assert_eq!(FrameRate::Fps2398.timecode_format(), TimecodeFormat::new(24, false));
        assert_eq!(FrameRate::Fps5994.timecode_format(), TimecodeFormat::new(60, true));
        assert_eq!(FrameRate::Fps25.frame_period(), Duration::from_millis(40));
        assert_eq!(FrameRate::Fps2997.to_string(), "29.97");
        assert_eq!(VideoFormat::pal().to_string(), "720x576i25");
    }
}
