//! Arpeggiator.
//!
//! Held notes on a track are tracked here and replayed in an order chosen
//! by [`ArpType`], one per arp step, at the rate given by the track's
//! `arp_speed` (a clock-tick time division, same units as a track's step
//! time division). There is no upstream C source for this module in the
//! retrieved original sources — the per-track fields it serves
//! (`arp_type`, `arp_speed`, `arp_gate_time`, `arp_enable`) come from
//! `seq_ctrl.h`, but the ordering logic itself is original to this crate.

use heapless::Vec;
use midi_types::Note;

pub const ARP_MAX_HELD_NOTES: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum ArpType {
    Up,
    Down,
    UpDown,
    Random,
    AsPlayed,
}

impl ArpType {
    pub fn from_index(index: u8) -> Option<ArpType> {
        Some(match index {
            0 => ArpType::Up,
            1 => ArpType::Down,
            2 => ArpType::UpDown,
            3 => ArpType::Random,
            4 => ArpType::AsPlayed,
            _ => return None,
        })
    }
}

/// Tracks which notes are currently held (e.g. via incoming note-on/off
/// from a keyboard split) and produces the next note to sound each time
/// `advance` is called.
pub struct Arpeggiator {
    held: Vec<Note, ARP_MAX_HELD_NOTES>,
    arp_type: ArpType,
    position: usize,
    going_up: bool,
}

impl Arpeggiator {
    pub fn new(arp_type: ArpType) -> Arpeggiator {
        Arpeggiator {
            held: Vec::new(),
            arp_type,
            position: 0,
            going_up: true,
        }
    }

    pub fn set_type(&mut self, arp_type: ArpType) {
        self.arp_type = arp_type;
        self.position = 0;
        self.going_up = true;
    }

    pub fn note_on(&mut self, note: Note) {
        let note_num: u8 = note.into();
        if self
            .held
            .iter()
            .any(|n| <Note as Into<u8>>::into(*n) == note_num)
        {
            return;
        }
        if self.held.push(note).is_err() {
            // table full: drop the oldest held note to make room, the
            // same "steal the earliest voice" behavior a hardware
            // arpeggiator falls back to when its hold buffer is full.
            self.held.remove(0);
            let _ = self.held.push(note);
        }
        if !matches!(self.arp_type, ArpType::AsPlayed) {
            self.held.sort_unstable_by_key(|n| {
                let v: u8 = (*n).into();
                v
            });
        }
    }

    pub fn note_off(&mut self, note: Note) {
        let note_num: u8 = note.into();
        if let Some(idx) = self
            .held
            .iter()
            .position(|n| <Note as Into<u8>>::into(*n) == note_num)
        {
            self.held.remove(idx);
            if self.position >= self.held.len() && !self.held.is_empty() {
                self.position = self.position % self.held.len();
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn held_notes(&self) -> &[Note] {
        &self.held
    }

    /// Produce the next note to sound, advancing internal position. Returns
    /// `None` if nothing is held.
    pub fn advance(&mut self, rng_u8: impl FnOnce() -> u8) -> Option<Note> {
        if self.held.is_empty() {
            return None;
        }
        let len = self.held.len();
        let note = match self.arp_type {
            ArpType::Up | ArpType::AsPlayed => {
                let n = self.held[self.position % len];
                self.position = (self.position + 1) % len;
                n
            }
            ArpType::Down => {
                let idx = len - 1 - (self.position % len);
                self.position = (self.position + 1) % len;
                self.held[idx]
            }
            ArpType::UpDown => {
                if len == 1 {
                    self.held[0]
                } else {
                    let span = len * 2 - 2;
                    let pos = self.position % span;
                    let idx = if pos < len { pos } else { span - pos };
                    self.position = (self.position + 1) % span;
                    self.held[idx]
                }
            }
            ArpType::Random => {
                let idx = (rng_u8() as usize) % len;
                self.held[idx]
            }
        };
        Some(note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(n: u8) -> Note {
        n.into()
    }

    #[test]
    fn up_cycles_in_ascending_order_regardless_of_press_order() {
        let mut arp = Arpeggiator::new(ArpType::Up);
        arp.note_on(note(67));
        arp.note_on(note(60));
        arp.note_on(note(64));
        let seq: heapless::Vec<u8, 6> = (0..6)
            .map(|_| arp.advance(|| 0).unwrap().into())
            .collect();
        assert_eq!(seq.as_slice(), &[60, 64, 67, 60, 64, 67]);
    }

    #[test]
    fn down_cycles_in_descending_order() {
        let mut arp = Arpeggiator::new(ArpType::Down);
        arp.note_on(note(60));
        arp.note_on(note(64));
        arp.note_on(note(67));
        let seq: heapless::Vec<u8, 3> = (0..3)
            .map(|_| arp.advance(|| 0).unwrap().into())
            .collect();
        assert_eq!(seq.as_slice(), &[67, 64, 60]);
    }

    #[test]
    fn note_off_removes_from_rotation() {
        let mut arp = Arpeggiator::new(ArpType::Up);
        arp.note_on(note(60));
        arp.note_on(note(64));
        arp.note_off(note(60));
        assert_eq!(arp.advance(|| 0), Some(note(64)));
    }

    #[test]
    fn empty_arp_advances_to_none() {
        let mut arp = Arpeggiator::new(ArpType::Up);
        assert_eq!(arp.advance(|| 0), None);
    }

    #[test]
    fn up_down_does_not_repeat_the_endpoints() {
        let mut arp = Arpeggiator::new(ArpType::UpDown);
        arp.note_on(note(60));
        arp.note_on(note(64));
        arp.note_on(note(67));
        let seq: heapless::Vec<u8, 4> = (0..4)
            .map(|_| arp.advance(|| 0).unwrap().into())
            .collect();
        assert_eq!(seq.as_slice(), &[60, 64, 67, 64]);
    }
}
