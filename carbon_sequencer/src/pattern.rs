//! Pattern bank: 32 reusable 8-bytes-per-pattern step-enable bitmasks,
//! shared by every track, plus the special "as recorded" pattern that
//! defers to whatever step events a track actually has.
//!
//! Ground truth: `pattern.c`. Each pattern is 8 bytes (one per row of 8
//! steps, row = `step >> 3`, column = `step & 7`), giving 64 steps of
//! resolution; `Song` tracks only ever look at the first `SEQUENCE_MAX_STEPS`
//! of that range. The 32 ROM patterns are the literal bitmaps the original
//! firmware ships and falls back to whenever the config store reports a
//! blank/invalid pattern bank.

use defmt::Format;

pub const NUM_PATTERNS: usize = 32;
pub const PATTERN_NUM_ROWS: usize = 8;
pub const PATTERN_AS_RECORDED: usize = 31;

/// The 32 hand-drawn ROM pattern defaults, each 8 bytes (one bit per step,
/// MSB = step 0 of the row). Order and names match `pattern_rom` exactly.
pub const PATTERN_ROM: [[u8; PATTERN_NUM_ROWS]; NUM_PATTERNS] = [
    [0x28, 0x24, 0x14, 0x0e, 0x0e, 0x54, 0x24, 0x08], // Kilpatrick
    [0x3c, 0x3c, 0xc3, 0xdb, 0xdb, 0xc3, 0x3c, 0x3c], // Centre Squares
    [0x18, 0x18, 0x18, 0xe7, 0xe7, 0x18, 0x18, 0x18], // Fan
    [0x6c, 0x6c, 0x6c, 0xe7, 0xe7, 0x36, 0x36, 0x36], // Widget
    [0x3c, 0x3c, 0x3c, 0xe7, 0xe7, 0x3c, 0x3c, 0x3c], // Second Aid
    [0xff, 0x99, 0x99, 0xff, 0xff, 0x99, 0x99, 0xff], // Four Square
    [0xff, 0xff, 0x99, 0xff, 0xff, 0xbd, 0xc3, 0xff], // Smiley
    [0x11, 0x33, 0x66, 0xcc, 0xcc, 0x66, 0x33, 0x11], // Shift Right
    [0x1f, 0x3e, 0x7c, 0xf8, 0xf8, 0x7c, 0x3e, 0x1f], // Arrow
    [0xff, 0xfe, 0xfc, 0xf8, 0xf0, 0xe0, 0xc0, 0x80], // Slope 2
    [0x81, 0xc3, 0xe7, 0xff, 0xff, 0xe7, 0xc3, 0x81], // Black Tie Event
    [0xff, 0x81, 0xbd, 0xa5, 0xa5, 0xbd, 0x81, 0xff], // Target Practice
    [0x55, 0xaa, 0xaa, 0x55, 0x66, 0x99, 0x66, 0x99], // Layout
    [0x99, 0x3c, 0x66, 0xdb, 0xdb, 0x66, 0x3c, 0x99], // Bomb
    [0xff, 0x22, 0xff, 0x44, 0xff, 0x22, 0xff, 0x44], // Stackup
    [0x99, 0xff, 0x99, 0xbd, 0x42, 0x5a, 0x42, 0xbd], // Plan View
    [0xa5, 0x5a, 0xa5, 0x5a, 0x5a, 0xa5, 0x5a, 0xa5], // Sakura
    [0xff, 0x00, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff], // One Two Three
    [0xff, 0xff, 0x00, 0xff, 0x00, 0x00, 0xff, 0x00], // Pancake
    [0xff, 0x80, 0xfe, 0x02, 0xbe, 0xa0, 0xbd, 0x85], // Maze
    [0xc7, 0xe3, 0x71, 0x38, 0x1c, 0x8e, 0xc7, 0xe3], // Caution
    [0xc3, 0xe7, 0x7e, 0x3c, 0x3c, 0x7e, 0xe7, 0xc3], // EX
    [0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99], // Vertical Lines
    [0x33, 0x33, 0x33, 0x33, 0x33, 0x33, 0x33, 0x33], // Vertical Lines 2
    [0xdd, 0xdd, 0xdd, 0xdd, 0xdd, 0xdd, 0xdd, 0xdd], // Vertical Lines 3
    [0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55], // Vertical Lines 4
    [0xd5, 0xd5, 0xd5, 0xd5, 0xab, 0xab, 0xab, 0xab], // Alternating
    [0x0f, 0x0f, 0x0f, 0x0f, 0xf0, 0xf0, 0xf0, 0xf0], // Feeling Square
    [0x55, 0xaa, 0x55, 0xaa, 0x55, 0xaa, 0x55, 0xaa], // Checkers 2
    [0x18, 0x3c, 0x7e, 0xdb, 0xff, 0x24, 0x5a, 0xa5], // Invaders
    [0x00, 0x66, 0xff, 0xff, 0x7e, 0x3c, 0x18, 0x00], // LOVE
    [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff], // Everything
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Format)]
pub enum PatternError {
    InvalidPattern,
    ReadOnlyPattern,
}

/// Holds the mutable (non-ROM) copy of the pattern bank. `PATTERN_AS_RECORDED`
/// (index 31 when read as a scene/track pattern selector) is not stored
/// here at all — callers resolve it by asking the song for recorded step
/// events instead, exactly as `pattern_get_step_enable` special-cases it.
pub struct PatternBank {
    patterns: [[u8; PATTERN_NUM_ROWS]; NUM_PATTERNS],
}

impl PatternBank {
    /// Builds a bank pre-loaded with the ROM defaults, as if the config
    /// store reported `SCE_CONFIG_CLEARED`.
    pub fn with_rom_defaults() -> PatternBank {
        PatternBank {
            patterns: PATTERN_ROM,
        }
    }

    /// Rebuilds the bank from 32*8 persisted bytes, e.g. read back from
    /// the config store on `SCE_CONFIG_LOADED`. Caller is responsible for
    /// having already checked the magic token and falling back to
    /// [`Self::with_rom_defaults`] if it didn't match.
    pub fn from_bytes(bytes: &[u8; NUM_PATTERNS * PATTERN_NUM_ROWS]) -> PatternBank {
        let mut patterns = [[0u8; PATTERN_NUM_ROWS]; NUM_PATTERNS];
        for (pattern, chunk) in patterns.iter_mut().zip(bytes.chunks_exact(PATTERN_NUM_ROWS)) {
            pattern.copy_from_slice(chunk);
        }
        PatternBank { patterns }
    }

    pub fn to_bytes(&self) -> [u8; NUM_PATTERNS * PATTERN_NUM_ROWS] {
        let mut out = [0u8; NUM_PATTERNS * PATTERN_NUM_ROWS];
        for (pattern, chunk) in self
            .patterns
            .iter()
            .zip(out.chunks_exact_mut(PATTERN_NUM_ROWS))
        {
            chunk.copy_from_slice(pattern);
        }
        out
    }

    pub fn restore_rom_default(&mut self, pattern: usize) -> Result<(), PatternError> {
        if pattern >= NUM_PATTERNS {
            return Err(PatternError::InvalidPattern);
        }
        self.patterns[pattern] = PATTERN_ROM[pattern];
        Ok(())
    }

    /// Whether `step` (0-based, `0..64`) is enabled in `pattern`.
    /// `PATTERN_AS_RECORDED` always returns `false` here — resolve it via
    /// the track's recorded step events instead, as the original delegates
    /// to `song_get_num_step_events`.
    pub fn step_enable(&self, pattern: usize, step: u8) -> Result<bool, PatternError> {
        if pattern >= NUM_PATTERNS {
            return Err(PatternError::InvalidPattern);
        }
        if pattern == PATTERN_AS_RECORDED {
            return Ok(false);
        }
        let row = (step >> 3) & 0x07;
        let col = step & 0x07;
        Ok((self.patterns[pattern][row as usize] >> col) & 0x01 != 0)
    }

    pub fn set_step_enable(
        &mut self,
        pattern: usize,
        step: u8,
        enable: bool,
    ) -> Result<(), PatternError> {
        if pattern == PATTERN_AS_RECORDED {
            return Err(PatternError::ReadOnlyPattern);
        }
        if pattern >= NUM_PATTERNS {
            return Err(PatternError::InvalidPattern);
        }
        let row = (step >> 3) & 0x07;
        let col = step & 0x07;
        self.patterns[pattern][row as usize] &= !(0x01 << col);
        if enable {
            self.patterns[pattern][row as usize] |= 0x01 << col;
        }
        Ok(())
    }
}

impl Default for PatternBank {
    fn default() -> Self {
        Self::with_rom_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rom_defaults_match_the_source_bitmap() {
        let bank = PatternBank::with_rom_defaults();
        assert_eq!(
            bank.step_enable(0, 1).unwrap(),
            (PATTERN_ROM[0][0] >> 1) & 1 != 0
        );
    }

    /// Pattern 31 ("Everything", all steps set) is also `PATTERN_AS_RECORDED`,
    /// so `step_enable` can never reach its ROM bitmap — it always takes the
    /// recorded-steps branch instead. This mirrors the original firmware,
    /// where `pattern_rom[31]` is likewise unreachable through
    /// `pattern_get_step_enable`. `to_bytes` still round-trips the raw byte.
    #[test]
    fn pattern_31_rom_bitmap_is_unreachable_via_step_enable() {
        let bank = PatternBank::with_rom_defaults();
        assert_eq!(bank.step_enable(PATTERN_AS_RECORDED, 0), Ok(false));
        let bytes = bank.to_bytes();
        let last_row_start = PATTERN_AS_RECORDED * PATTERN_NUM_ROWS;
        assert_eq!(
            &bytes[last_row_start..last_row_start + PATTERN_NUM_ROWS],
            &PATTERN_ROM[PATTERN_AS_RECORDED]
        );
    }

    #[test]
    fn as_recorded_is_always_disabled_and_read_only() {
        let mut bank = PatternBank::with_rom_defaults();
        assert_eq!(bank.step_enable(PATTERN_AS_RECORDED, 3), Ok(false));
        assert_eq!(
            bank.set_step_enable(PATTERN_AS_RECORDED, 3, true),
            Err(PatternError::ReadOnlyPattern)
        );
    }

    #[test]
    fn set_step_enable_round_trips() {
        let mut bank = PatternBank::with_rom_defaults();
        bank.set_step_enable(0, 5, true).unwrap();
        assert_eq!(bank.step_enable(0, 5), Ok(true));
        bank.set_step_enable(0, 5, false).unwrap();
        assert_eq!(bank.step_enable(0, 5), Ok(false));
    }

    #[test]
    fn to_bytes_from_bytes_round_trips() {
        let mut bank = PatternBank::with_rom_defaults();
        bank.set_step_enable(2, 10, true).unwrap();
        let bytes = bank.to_bytes();
        let restored = PatternBank::from_bytes(&bytes);
        assert_eq!(restored.step_enable(2, 10), Ok(true));
    }

    #[test]
    fn out_of_range_pattern_is_err() {
        let bank = PatternBank::with_rom_defaults();
        assert_eq!(
            bank.step_enable(NUM_PATTERNS, 0),
            Err(PatternError::InvalidPattern)
        );
    }
}
