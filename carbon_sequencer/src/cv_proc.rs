//! CV/gate output processing.
//!
//! Ground truth: `cvproc.c` + `cvproc.h`. Converts MIDI note/velocity/CC
//! messages routed to the "CV out" port into analog note/gate pairs
//! across up to four outputs (A-D), grouped into mono or poly voice
//! pairs according to [`CvPairing`]. A poly group steals voices
//! round-robin; a mono group keeps a small history so releasing the
//! most recent note falls back to the next-most-recent still held
//! (matching the original's `mono_voice_prio` ring). Pitch bend and
//! note CV are both resolved through a per-output 128-entry scale table
//! built from the output's calibration and V/octave scaling.
//!
//! The poly voice-stealing policy here (oldest-voice-first) is a
//! simplification of the original's bitmask voice allocator; see
//! `DESIGN.md` for the Open Question this resolves.

use midi_types::MidiMessage;

pub const NUM_OUTPUTS: usize = 4;
pub const NUM_PAIRS: usize = 4;
pub const POLY_VOICE_COUNT: usize = 4;
pub const MONO_DEPTH: usize = 8;
const MONO_DEPTH_MASK: usize = MONO_DEPTH - 1;

pub const MODE_VELO: i8 = -2;
pub const MODE_NOTE: i8 = -1;
pub const MODE_MAX: i8 = 120;

const BEND_RANGE_MIN: u8 = 1;
const BEND_RANGE_MAX: u8 = 12;
const CVCAL_MIN: i16 = -100;
const CVCAL_MAX: i16 = 100;
const SEMI_SIZE_1VOCT: i32 = 575;
const SEMI_SIZE_1P2VOCT: i32 = 690;
const SCALE_NUM_NOTES: usize = 128;
const DEFAULT_NOTE: u8 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum CvPairing {
    Abcd,
    Aabc,
    Aabb,
    Aaaa,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum CvScaling {
    OneVOct,
    OnePoint2VOct,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum CvProcError {
    InvalidPair,
    InvalidOutput,
    InvalidMode,
    InvalidRange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    Off,
    On,
}

/// One physical CV + gate pair: the DAC code and gate state the caller
/// is expected to drive out.
#[derive(Clone, Copy, Debug, Default)]
pub struct CvGateOutput {
    pub cv: u16,
    pub gate: bool,
}

pub struct CvProcessor {
    pairs: CvPairing,
    pair_mode: [i8; NUM_PAIRS],
    cvcal: [i16; NUM_OUTPUTS],
    output_scaling: [CvScaling; NUM_OUTPUTS],
    bend_range: u8,

    damper: [bool; NUM_PAIRS],
    out_offset: [usize; NUM_PAIRS],
    poly_num_voices: [usize; NUM_PAIRS],

    mono_voice_prio: [[i16; MONO_DEPTH]; NUM_PAIRS],
    mono_voice_pos: [usize; NUM_PAIRS],
    poly_voice_alloc: [[i16; POLY_VOICE_COUNT]; NUM_PAIRS],

    out_note: [u8; NUM_OUTPUTS],
    out_bend: [i32; NUM_OUTPUTS],
    scale: [[u16; SCALE_NUM_NOTES]; NUM_OUTPUTS],
    outputs: [CvGateOutput; NUM_OUTPUTS],
}

impl CvProcessor {
    pub fn new() -> CvProcessor {
        let mut p = CvProcessor {
            pairs: CvPairing::Abcd,
            pair_mode: [MODE_NOTE; NUM_PAIRS],
            cvcal: [0; NUM_OUTPUTS],
            output_scaling: [CvScaling::OneVOct; NUM_OUTPUTS],
            bend_range: 2,
            damper: [false; NUM_PAIRS],
            out_offset: [0, 1, 2, 3],
            poly_num_voices: [1; NUM_PAIRS],
            mono_voice_prio: [[-1; MONO_DEPTH]; NUM_PAIRS],
            mono_voice_pos: [0; NUM_PAIRS],
            poly_voice_alloc: [[-1; POLY_VOICE_COUNT]; NUM_PAIRS],
            out_note: [DEFAULT_NOTE; NUM_OUTPUTS],
            out_bend: [0; NUM_OUTPUTS],
            scale: [[0; SCALE_NUM_NOTES]; NUM_OUTPUTS],
            outputs: [CvGateOutput::default(); NUM_OUTPUTS],
        };
        for out in 0..NUM_OUTPUTS {
            p.build_scale(out);
        }
        p.set_pairs(CvPairing::Abcd);
        p
    }

    pub fn outputs(&self) -> &[CvGateOutput; NUM_OUTPUTS] {
        &self.outputs
    }

    pub fn set_pairs(&mut self, pairs: CvPairing) {
        self.poly_num_voices = [1; NUM_PAIRS];
        self.pairs = pairs;
        match pairs {
            CvPairing::Abcd => {
                self.out_offset = [0, 1, 2, 3];
            }
            CvPairing::Aabc => {
                self.poly_num_voices[0] = 2;
                self.out_offset = [0, 2, 3, 3];
            }
            CvPairing::Aabb => {
                self.poly_num_voices[0] = 2;
                self.poly_num_voices[1] = 2;
                self.out_offset = [0, 2, 0, 0];
            }
            CvPairing::Aaaa => {
                self.poly_num_voices[0] = POLY_VOICE_COUNT;
                self.out_offset = [0, 0, 0, 0];
            }
        }
        self.reset_state();
    }

    fn reset_state(&mut self) {
        for pair in 0..NUM_PAIRS {
            self.reset_pair(pair);
        }
        for out in 0..NUM_OUTPUTS {
            self.set_note(out, DEFAULT_NOTE, Gate::Off);
            self.set_bend_raw(out, 0);
        }
    }

    fn reset_pair(&mut self, pair: usize) {
        self.mono_voice_prio[pair] = [-1; MONO_DEPTH];
        self.mono_voice_pos[pair] = 0;
        self.poly_voice_alloc[pair] = [-1; POLY_VOICE_COUNT];
        self.damper[pair] = false;
    }

    pub fn set_pair_mode(&mut self, pair: usize, mode: i8) -> Result<(), CvProcError> {
        if pair >= NUM_PAIRS {
            return Err(CvProcError::InvalidPair);
        }
        if mode < MODE_VELO || mode > MODE_MAX {
            return Err(CvProcError::InvalidMode);
        }
        self.pair_mode[pair] = mode;
        self.reset_pair(pair);
        Ok(())
    }

    pub fn set_bend_range(&mut self, range: u8) -> Result<(), CvProcError> {
        if !(BEND_RANGE_MIN..=BEND_RANGE_MAX).contains(&range) {
            return Err(CvProcError::InvalidRange);
        }
        self.bend_range = range;
        Ok(())
    }

    pub fn set_output_scaling(&mut self, out: usize, mode: CvScaling) -> Result<(), CvProcError> {
        if out >= NUM_OUTPUTS {
            return Err(CvProcError::InvalidOutput);
        }
        self.output_scaling[out] = mode;
        self.build_scale(out);
        Ok(())
    }

    pub fn set_cvcal(&mut self, out: usize, cal: i16) -> Result<(), CvProcError> {
        if out >= NUM_OUTPUTS {
            return Err(CvProcError::InvalidOutput);
        }
        if !(CVCAL_MIN..=CVCAL_MAX).contains(&cal) {
            return Err(CvProcError::InvalidRange);
        }
        self.cvcal[out] = cal;
        self.build_scale(out);
        Ok(())
    }

    fn build_scale(&mut self, out: usize) {
        let step_size = match self.output_scaling[out] {
            CvScaling::OnePoint2VOct => self.cvcal[out] as i32 + SEMI_SIZE_1P2VOCT,
            CvScaling::OneVOct => self.cvcal[out] as i32 + SEMI_SIZE_1VOCT,
        };

        let mut val = 0x800i32 << 4;
        for i in 60..SCALE_NUM_NOTES {
            let temp = val >> 4;
            self.scale[out][i] = if temp > 0xfff { 0xfff } else { temp.max(0) as u16 };
            val += step_size;
        }

        let mut val = (0x800i32 << 4) - step_size;
        for i in (0..60).rev() {
            let temp = val >> 4;
            self.scale[out][i] = if temp < 0 { 0 } else { temp as u16 };
            val -= step_size;
        }
    }

    fn set_note(&mut self, out: usize, note: u8, gate: Gate) {
        if out >= NUM_OUTPUTS || note as usize >= SCALE_NUM_NOTES {
            return;
        }
        let cv = self.scale[out][note as usize] as i32 + self.out_bend[out];
        self.outputs[out].cv = cv.clamp(0, 0xfff) as u16;
        self.outputs[out].gate = gate == Gate::On;
        self.out_note[out] = note;
    }

    fn set_velo(&mut self, out: usize, velo: u8, gate: Gate) {
        if out >= NUM_OUTPUTS || velo >= 0x7f {
            return;
        }
        if gate == Gate::On {
            self.outputs[out].cv = (velo as u16) << 5;
        }
        self.outputs[out].gate = gate == Gate::On;
    }

    fn set_bend_raw(&mut self, out: usize, bend: i32) {
        if out >= NUM_OUTPUTS || !(-8192..=8191).contains(&bend) {
            return;
        }
        let note = self.out_note[out] as usize;
        let range = self.bend_range as usize;
        self.out_bend[out] = if bend >= 0 {
            let hi = self.scale[out].get(note + range).copied().unwrap_or(0xfff) as i32;
            let lo = self.scale[out][note] as i32;
            ((hi - lo) * bend) >> 13
        } else {
            let lo = self.scale[out][note] as i32;
            let below = note.saturating_sub(range);
            let below_val = self.scale[out][below] as i32;
            ((lo - below_val) * bend) >> 13
        };
        let cv = self.scale[out][note] as i32 + self.out_bend[out];
        self.outputs[out].cv = cv.clamp(0, 0xfff) as u16;
    }

    /// Route one message arriving on the CV-out port. `pair` is the
    /// message's MIDI channel, mapped by `pairs` to a mono or poly
    /// voice group.
    pub fn handle_message(&mut self, pair: usize, msg: MidiMessage) {
        if pair >= NUM_PAIRS {
            return;
        }
        let is_poly = match self.pairs {
            CvPairing::Abcd => false,
            CvPairing::Aabc => pair == 0,
            CvPairing::Aabb => pair == 0 || pair == 1,
            CvPairing::Aaaa => pair == 0,
        };
        let mode = self.pair_mode[pair];
        if mode == MODE_NOTE || mode == MODE_VELO {
            if is_poly {
                self.poly_handler(pair, msg);
            } else {
                self.mono_handler(pair, msg);
            }
        } else {
            self.cc_handler(pair, msg);
        }
    }

    fn mono_handler(&mut self, pair: usize, msg: MidiMessage) {
        let note_min = BEND_RANGE_MAX as i16;
        let note_max = 127 - BEND_RANGE_MAX as i16;
        let mode = self.pair_mode[pair];
        let out = self.out_offset[pair];

        match msg {
            MidiMessage::NoteOff(_, note, _) => {
                let note: u8 = note.into();
                if (note as i16) < note_min || (note as i16) > note_max {
                    return;
                }
                for slot in self.mono_voice_prio[pair].iter_mut() {
                    if *slot == note as i16 {
                        *slot = -1;
                    }
                }
                if self.mono_voice_prio[pair][self.mono_voice_pos[pair]] != -1 {
                    return;
                }
                let start = self.mono_voice_pos[pair];
                let mut i = (start + MONO_DEPTH_MASK) & MONO_DEPTH_MASK;
                while i != start {
                    if self.mono_voice_prio[pair][i] != -1 {
                        if mode == MODE_NOTE {
                            let held = self.mono_voice_prio[pair][i] as u8;
                            self.set_note(out, held, Gate::On);
                        }
                        self.mono_voice_pos[pair] = i;
                        return;
                    }
                    i = (i + MONO_DEPTH_MASK) & MONO_DEPTH_MASK;
                }
                if !self.damper[pair] {
                    if mode == MODE_NOTE {
                        self.set_note(out, note, Gate::Off);
                    }
                }
            }
            MidiMessage::NoteOn(_, note, velocity) => {
                let note: u8 = note.into();
                let velocity: u8 = velocity.into();
                if (note as i16) < note_min || (note as i16) > note_max {
                    return;
                }
                let mut held = false;
                for slot in self.mono_voice_prio[pair].iter_mut() {
                    if *slot == note as i16 {
                        *slot = -1;
                    }
                    if *slot != -1 {
                        held = true;
                    }
                }
                self.mono_voice_pos[pair] = (self.mono_voice_pos[pair] + 1) & MONO_DEPTH_MASK;
                self.mono_voice_prio[pair][self.mono_voice_pos[pair]] = note as i16;
                if mode == MODE_NOTE {
                    self.set_note(out, note, Gate::On);
                } else if mode == MODE_VELO && !held {
                    self.set_velo(out, velocity, Gate::On);
                }
            }
            MidiMessage::ControlChange(_, controller, value) => {
                let controller: u8 = controller.into();
                let value: u8 = value.into();
                if controller == 64 {
                    if value == 0x7f {
                        self.damper[pair] = true;
                    } else if value == 0 {
                        self.damper[pair] = false;
                        if self.mono_voice_prio[pair].iter().any(|v| *v != -1) {
                            return;
                        }
                        if mode == MODE_NOTE {
                            let note = self.out_note[out];
                            self.set_note(out, note, Gate::Off);
                        } else if mode == MODE_VELO {
                            self.set_velo(out, value, Gate::Off);
                        }
                    }
                }
            }
            MidiMessage::PitchBendChange(_, bend) => {
                let raw: u16 = bend.into();
                self.set_bend_raw(out, raw as i32 - 8192);
            }
            _ => {}
        }
    }

    fn poly_handler(&mut self, pair: usize, msg: MidiMessage) {
        let voices = self.poly_num_voices[pair];
        if voices == 0 {
            return;
        }
        let mode = self.pair_mode[pair];
        let base = self.out_offset[pair];

        match msg {
            MidiMessage::NoteOff(_, note, _) => {
                let note: u8 = note.into();
                if let Some(slot) =
                    (0..voices).find(|&i| self.poly_voice_alloc[pair][i] == note as i16)
                {
                    self.poly_voice_alloc[pair][slot] = -1;
                    if mode == MODE_NOTE {
                        self.set_note(base + slot, note, Gate::Off);
                    } else if mode == MODE_VELO {
                        self.set_velo(base + slot, 0, Gate::Off);
                    }
                }
            }
            MidiMessage::NoteOn(_, note, velocity) => {
                let note: u8 = note.into();
                let velocity: u8 = velocity.into();
                let slot = (0..voices)
                    .find(|&i| self.poly_voice_alloc[pair][i] == -1)
                    .unwrap_or(0);
                self.poly_voice_alloc[pair][slot] = note as i16;
                if mode == MODE_NOTE {
                    self.set_note(base + slot, note, Gate::On);
                } else if mode == MODE_VELO {
                    self.set_velo(base + slot, velocity, Gate::On);
                }
            }
            MidiMessage::PitchBendChange(_, bend) => {
                let raw: u16 = bend.into();
                for i in 0..voices {
                    self.set_bend_raw(base + i, raw as i32 - 8192);
                }
            }
            _ => {}
        }
    }

    fn cc_handler(&mut self, pair: usize, msg: MidiMessage) {
        if let MidiMessage::ControlChange(_, controller, value) = msg {
            let controller: u8 = controller.into();
            let value: u8 = value.into();
            if controller as i8 == self.pair_mode[pair] {
                let out = self.out_offset[pair];
                if out < NUM_OUTPUTS {
                    self.outputs[out].cv = (value as u16) << 5;
                }
            }
        }
    }
}

impl Default for CvProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midi_types::Value7;

    fn note_on(ch: u8, note: u8, velo: u8) -> MidiMessage {
        MidiMessage::NoteOn(ch.into(), note.into(), velo.into())
    }

    fn note_off(ch: u8, note: u8) -> MidiMessage {
        MidiMessage::NoteOff(ch.into(), note.into(), Value7::from(0))
    }

    #[test]
    fn middle_c_maps_to_half_scale_dac_code() {
        let proc = CvProcessor::new();
        assert_eq!(proc.scale[0][60], 0x800);
    }

    #[test]
    fn abcd_mono_note_on_sets_gate_and_cv() {
        let mut proc = CvProcessor::new();
        proc.handle_message(0, note_on(0, 60, 100));
        assert!(proc.outputs()[0].gate);
        assert_eq!(proc.outputs()[0].cv, 0x800);
    }

    #[test]
    fn mono_note_off_falls_back_to_previously_held_note() {
        let mut proc = CvProcessor::new();
        proc.handle_message(0, note_on(0, 60, 100));
        proc.handle_message(0, note_on(0, 64, 100));
        proc.handle_message(0, note_off(0, 64));
        assert!(proc.outputs()[0].gate);
        assert_eq!(proc.out_note[0], 60);
    }

    #[test]
    fn mono_releasing_last_note_without_damper_turns_gate_off() {
        let mut proc = CvProcessor::new();
        proc.handle_message(0, note_on(0, 60, 100));
        proc.handle_message(0, note_off(0, 60));
        assert!(!proc.outputs()[0].gate);
    }

    #[test]
    fn damper_holds_gate_after_note_off() {
        let mut proc = CvProcessor::new();
        proc.handle_message(
            0,
            MidiMessage::ControlChange(0.into(), 64.into(), 0x7f.into()),
        );
        proc.handle_message(0, note_on(0, 60, 100));
        proc.handle_message(0, note_off(0, 60));
        assert!(proc.outputs()[0].gate);
    }

    #[test]
    fn aabb_poly_allocates_two_voices_independently() {
        let mut proc = CvProcessor::new();
        proc.set_pairs(CvPairing::Aabb);
        proc.handle_message(0, note_on(0, 60, 100));
        proc.handle_message(0, note_on(0, 64, 100));
        assert!(proc.outputs()[0].gate);
        assert!(proc.outputs()[1].gate);
        assert_eq!(proc.out_note[0], 60);
        assert_eq!(proc.out_note[1], 64);
    }

    #[test]
    fn note_out_of_bend_safe_range_is_ignored() {
        let mut proc = CvProcessor::new();
        proc.handle_message(0, note_on(0, 0, 100));
        assert!(!proc.outputs()[0].gate);
    }

    #[test]
    fn set_cvcal_out_of_range_rejected() {
        let mut proc = CvProcessor::new();
        assert_eq!(proc.set_cvcal(0, 150), Err(CvProcError::InvalidRange));
        assert!(proc.set_cvcal(0, 50).is_ok());
    }

    #[test]
    fn bend_range_bounds() {
        let mut proc = CvProcessor::new();
        assert!(proc.set_bend_range(1).is_ok());
        assert!(proc.set_bend_range(12).is_ok());
        assert_eq!(proc.set_bend_range(0), Err(CvProcError::InvalidRange));
        assert_eq!(proc.set_bend_range(13), Err(CvProcError::InvalidRange));
    }
}
