//! Timecode selection for captured frames and destination fan-out for playout

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{Rp188, Timecode, TimecodeFormat};

/// Which timecode stream on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimecodeKind {
    /// Field-1 vertical interval timecode
    Vitc1,
    /// Field-2 vertical interval timecode
    Vitc2,
    /// Longitudinal timecode
    Ltc,
}

/// Logical timecode source (capture side) or destination (playout side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimecodeIndex {
    pub channel: u8,
    pub kind: TimecodeKind,
}

impl TimecodeIndex {
    pub const fn new(channel: u8, kind: TimecodeKind) -> Self {
        Self { channel, kind }
    }

    pub const fn vitc(channel: u8) -> Self {
        Self::new(channel, TimecodeKind::Vitc1)
    }
}

impl std::fmt::Display for TimecodeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            TimecodeKind::Vitc1 => "VITC",
            TimecodeKind::Vitc2 => "VITC2",
            TimecodeKind::Ltc => "LTC",
        };
        write!(f, "SDI{}-{}", self.channel, kind)
    }
}

/// Decoded timecodes keyed by source or destination.
pub type TimecodeMap = BTreeMap<TimecodeIndex, Timecode>;

/// Raw timecode words as reported by a capture transfer.
pub type CapturedTimecodes = BTreeMap<TimecodeIndex, Rp188>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimecodeOrigin {
    Embedded(TimecodeIndex),
    /// Invented from the frame counter
    Synthetic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTimecode {
    pub value: Timecode,
    pub origin: TimecodeOrigin,
}

impl ResolvedTimecode {
    pub fn is_synthetic(&self) -> bool {
        self.origin == TimecodeOrigin::Synthetic
    }
}

/// Picks one timecode per captured frame.
///
/// An embedded value wins when it decodes cleanly; the configured preferred
/// source is tried first, then every source in index order. Without one the
/// frame gets `synthetic_start + frame_counter`.
#[derive(Debug, Clone)]
pub struct TimecodeResolver {
    format: TimecodeFormat,
    preferred: Option<TimecodeIndex>,
    synthetic_start: Timecode,
    use_embedded: bool,
}

impl TimecodeResolver {
    pub fn new(format: TimecodeFormat) -> Self {
        Self {
            format,
            preferred: None,
            synthetic_start: Timecode::new(10, 0, 0, 0, format.drop_frame),
            use_embedded: true,
        }
    }

    pub fn with_preferred_source(mut self, source: Option<TimecodeIndex>) -> Self {
        self.preferred = source;
        self
    }

    pub fn with_synthetic_start(mut self, start: Timecode) -> Self {
        self.synthetic_start = Timecode {
            drop_frame: self.format.drop_frame,
            ..start
        };
        self
    }

    /// Ignore embedded timecode entirely.
    pub fn with_embedded(mut self, enabled: bool) -> Self {
        self.use_embedded = enabled;
        self
    }

    pub fn format(&self) -> TimecodeFormat {
        self.format
    }

    /// Every embedded value that decodes cleanly.
    pub fn decode_all(&self, captured: &CapturedTimecodes) -> TimecodeMap {
        captured
            .iter()
            .filter_map(|(index, raw)| raw.decode(self.format).map(|tc| (*index, tc)))
            .collect()
    }

    pub fn resolve(&self, captured: &CapturedTimecodes, frame_counter: u64) -> ResolvedTimecode {
        if self.use_embedded {
            let preferred = self
                .preferred
                .and_then(|index| captured.get(&index).map(|raw| (index, raw)));
            let candidates = preferred.into_iter().chain(captured.iter().map(|(i, r)| (*i, r)));
            for (index, raw) in candidates {
                if let Some(value) = raw.decode(self.format) {
                    return ResolvedTimecode {
                        value,
                        origin: TimecodeOrigin::Embedded(index),
                    };
                }
            }
        }

        ResolvedTimecode {
            value: self.synthesize(frame_counter),
            origin: TimecodeOrigin::Synthetic,
        }
    }

    pub fn synthesize(&self, frame_counter: u64) -> Timecode {
        self.synthetic_start.advanced_by(frame_counter, self.format)
    }

    /// Playout destinations: LTC, VITC and VITC2 on the output channel and on
    /// every mirrored channel.
    pub fn output_destinations(output_channel: u8, mirrors: &[u8]) -> BTreeSet<TimecodeIndex> {
        std::iter::once(output_channel)
            .chain(mirrors.iter().copied())
            .flat_map(|channel| {
                [TimecodeKind::Ltc, TimecodeKind::Vitc1, TimecodeKind::Vitc2]
                    .map(|kind| TimecodeIndex::new(channel, kind))
            })
            .collect()
    }

    /// Same value for every destination.
    pub fn destination_map(value: Timecode, destinations: &BTreeSet<TimecodeIndex>) -> TimecodeMap {
        destinations.iter().map(|index| (*index, value)).collect()
    }
}
