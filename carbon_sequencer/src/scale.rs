//! Scale quantization tables.
//!
//! Ground truth: `scale.c` + `tables/scale_tables.h`. Each scale is a set
//! of semitone degrees within one octave; `quantize` snaps a MIDI note
//! down to the nearest degree at or below it, preserving the octave.
//! `Chromatic` (degree `0..12` identity) is not in the original tables
//! file — it's the implicit no-op case the original's `switch` falls
//! through to when `scale == SCALE_CHROMATIC` — so it's represented here
//! with a `[0..12)` degree array rather than omitted.

use defmt::Format;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Format)]
pub enum Scale {
    Chromatic,
    Major,
    NatMinor,
    HarMinor,
    Dorian,
    Whole,
    Pent,
    Dim,
    Phrygian,
    Lydian,
    Mixolydian,
    Locrian,
    PentMinor,
    Blues,
    HalfDim,
    SevenChord,
}

pub const SCALE_COUNT: usize = 16;

impl Scale {
    pub fn name(&self) -> &'static str {
        match self {
            Scale::Chromatic => "Chromatic",
            Scale::Major => "Major",
            Scale::NatMinor => "Nat Minor",
            Scale::HarMinor => "Har Minor",
            Scale::Dorian => "Dorian",
            Scale::Whole => "Whole",
            Scale::Pent => "Pentatonic",
            Scale::Dim => "Diminished",
            Scale::Phrygian => "Phrygian",
            Scale::Lydian => "Lydian",
            Scale::Mixolydian => "Mixolydian",
            Scale::Locrian => "Locrian",
            Scale::PentMinor => "Min Pent",
            Scale::Blues => "Blues",
            Scale::HalfDim => "Half Dim",
            Scale::SevenChord => "Seven Chord",
        }
    }

    fn degrees(&self) -> &'static [u8] {
        match self {
            Scale::Chromatic => &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11],
            Scale::Major => &[0, 2, 4, 5, 7, 9, 11],
            Scale::HarMinor => &[0, 2, 3, 5, 7, 8, 11],
            Scale::NatMinor => &[0, 2, 3, 5, 7, 8, 10],
            Scale::Dorian => &[0, 2, 3, 5, 7, 9, 10],
            Scale::Whole => &[0, 2, 4, 6, 8, 10],
            Scale::Pent => &[0, 2, 4, 7, 9],
            Scale::Dim => &[0, 2, 3, 5, 6, 8, 9, 11],
            Scale::Phrygian => &[0, 1, 3, 5, 7, 8, 10],
            Scale::Lydian => &[0, 2, 4, 6, 7, 9, 11],
            Scale::Mixolydian => &[0, 2, 4, 5, 7, 9, 10],
            Scale::Locrian => &[0, 1, 3, 5, 6, 8, 10],
            Scale::PentMinor => &[0, 3, 5, 7, 10],
            Scale::Blues => &[0, 3, 5, 6, 7, 10],
            Scale::HalfDim => &[0, 2, 3, 5, 6, 8, 10],
            Scale::SevenChord => &[0, 4, 7, 11],
        }
    }

    pub fn from_index(index: u8) -> Option<Scale> {
        Some(match index {
            0 => Scale::Chromatic,
            1 => Scale::Major,
            2 => Scale::NatMinor,
            3 => Scale::HarMinor,
            4 => Scale::Dorian,
            5 => Scale::Whole,
            6 => Scale::Pent,
            7 => Scale::Dim,
            8 => Scale::Phrygian,
            9 => Scale::Lydian,
            10 => Scale::Mixolydian,
            11 => Scale::Locrian,
            12 => Scale::PentMinor,
            13 => Scale::Blues,
            14 => Scale::HalfDim,
            15 => Scale::SevenChord,
            _ => return None,
        })
    }

    /// Snap `note` (a MIDI note number, `0..=127`) down to the highest
    /// scale degree at or below it within the same octave. If `note`'s
    /// position within the octave falls below every degree (impossible
    /// while the scale always contains `0`, but checked because the
    /// original loop can fall through without assigning `nt` in
    /// principle) the note is returned unchanged.
    pub fn quantize(&self, note: u8) -> u8 {
        let shift = (note / 12) * 12;
        let nt = note - shift;
        let degrees = self.degrees();
        for &degree in degrees.iter().rev() {
            if degree <= nt {
                return shift + degree;
            }
        }
        note
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chromatic_is_identity() {
        for note in 0..=127u8 {
            assert_eq!(Scale::Chromatic.quantize(note), note);
        }
    }

    #[test]
    fn major_snaps_down_within_octave() {
        // C major: C C# -> C, D D# -> D, preserving octave.
        assert_eq!(Scale::Major.quantize(60), 60); // C4
        assert_eq!(Scale::Major.quantize(61), 60); // C#4 -> C4
        assert_eq!(Scale::Major.quantize(63), 62); // D#4 -> D4
        assert_eq!(Scale::Major.quantize(72), 72); // C5
    }

    #[test]
    fn seven_chord_has_four_degrees() {
        assert_eq!(Scale::SevenChord.degrees().len(), 4);
        assert_eq!(Scale::SevenChord.quantize(62), 60); // D -> C (root)
        assert_eq!(Scale::SevenChord.quantize(65), 64); // F -> E (third)
    }

    #[test]
    fn from_index_round_trips_through_all_sixteen() {
        for i in 0..SCALE_COUNT as u8 {
            assert!(Scale::from_index(i).is_some());
        }
        assert!(Scale::from_index(SCALE_COUNT as u8).is_none());
    }
}
