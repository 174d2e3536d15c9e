//! 16-bit to 32-bit sequence number extension
//!
//! The upper 16 bits (the epoch) advance when the wire counter wraps. A wire
//! value far behind a freshly wrapped counter is attributed to the previous
//! epoch instead, so late packets from before the wrap are recognised as
//! stale rather than as a jump forward.

/// Low half at or above this means "late in the epoch"
const LATE: u32 = 0x7fff;
/// Low half below this means "early in the epoch"
const EARLY: u32 = 0x4000;

/// Extended sequence counter of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceState {
    extended: u32,
}

impl SequenceState {
    pub fn new(extended: u32) -> Self {
        Self { extended }
    }

    pub fn extended(&self) -> u32 {
        self.extended
    }

    /// Extended value `wire` maps to, without changing the state
    pub fn reconstruct(&self, wire: u16) -> u32 {
        let prev_low = self.extended & 0xffff;
        let prev_high = self.extended >> 16;
        let wire = wire as u32;

        let epoch = if prev_high > 0 && prev_low < EARLY && wire > LATE {
            prev_high - 1
        } else if prev_low > LATE && wire < EARLY {
            prev_high.wrapping_add(1)
        } else {
            prev_high
        };

        (epoch << 16) | wire
    }

    /// Reconstruct `wire` and store it if it moves the counter forward.
    ///
    /// Returns the reconstructed value either way; duplicates and stale
    /// packets leave the state untouched.
    pub fn update(&mut self, wire: u16) -> u32 {
        let candidate = self.reconstruct(wire);
        if candidate > self.extended {
            self.extended = candidate;
        }
        candidate
    }
}
