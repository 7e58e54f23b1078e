//! Output processor: the last stage before a note leaves the box. Applies
//! scale quantization and transpose, fans a track's notes out to its
//! mapped output port/channel pairs, and tracks which notes are currently
//! sounding so a mid-note scale or transpose change can re-render them
//! without leaving a stuck note behind.
//!
//! Ground truth: `outproc.c`. `OUTPROC_MAX_NOTES` active notes are tracked
//! per track (an original hardware/firmware limit, kept here); `deliver_msg`
//! mirrors `outproc_deliver_msg`'s per-message-type switch, and
//! `transpose_changed`/`tonality_changed` mirror the original's two
//! re-render passes (turn off at the old pitch, then either re-sound at the
//! new pitch or drop the note if the new pitch leaves MIDI's 0-127 range).

use crate::scale::Scale;
use heapless::Vec;
use midi_types::{Channel, MidiMessage, Note, Value7};

pub const MAX_NOTES_PER_TRACK: usize = 16;
pub const MAX_TRACKS: usize = 16;
pub const MAX_OUTPUTS_PER_TRACK: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deliver {
    A,
    B,
    Both,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Process {
    /// Apply quantize/transpose and track the note in the active-note
    /// table (used for sequencer-generated notes).
    Processed,
    /// Send through unmodified (used for re-render turn-off/turn-on
    /// passes, which already carry the correct already-quantized pitch).
    Raw,
}

/// Where a track's output goes for one of its (up to two) output slots.
#[derive(Clone, Copy, Debug)]
pub struct PortMap {
    pub port: Option<u8>,
    pub channel: Channel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum OutprocError {
    InvalidTrack,
    NoFreeSlot,
}

#[derive(Clone, Copy)]
struct ActiveNote {
    port: u8,
    channel: Channel,
    /// The raw, pre-quantize note-on pitch — NOT the rendered pitch that
    /// was transmitted. Keeping the raw value lets a later scale or
    /// transpose change re-render this note from scratch.
    raw_note: Note,
    velocity: Value7,
}

pub struct OutputProcessor {
    output_notes: [Vec<ActiveNote, MAX_NOTES_PER_TRACK>; MAX_TRACKS],
    current_transpose: [i8; MAX_TRACKS],
    current_tonality: [Scale; MAX_TRACKS],
}

impl OutputProcessor {
    pub fn new() -> OutputProcessor {
        OutputProcessor {
            output_notes: Default::default(),
            current_transpose: [0; MAX_TRACKS],
            current_tonality: [Scale::Chromatic; MAX_TRACKS],
        }
    }

    pub fn num_notes(&self, track: usize) -> usize {
        self.output_notes[track].len()
    }

    /// Re-render held notes for a transpose change on `track`, returning
    /// the raw (port, message) pairs to send: a note-off at the old
    /// transpose followed by a note-on at the new one, per held note. A
    /// note whose new pitch would fall outside `0..=127` is dropped
    /// (turned off, not re-sounded).
    pub fn transpose_changed(
        &mut self,
        track: usize,
        new_transpose: i8,
    ) -> Result<Vec<(u8, MidiMessage), { MAX_NOTES_PER_TRACK * 2 }>, OutprocError> {
        let mut out = Vec::new();
        if track >= MAX_TRACKS {
            return Err(OutprocError::InvalidTrack);
        }
        if self.output_notes[track].is_empty() {
            self.current_transpose[track] = new_transpose;
            return Ok(out);
        }
        if new_transpose == self.current_transpose[track] {
            return Ok(out);
        }

        let old_transpose = self.current_transpose[track];
        let mut keep: Vec<ActiveNote, MAX_NOTES_PER_TRACK> = Vec::new();
        for active in self.output_notes[track].iter() {
            let raw: u8 = active.raw_note.into();
            let quantized = self.current_tonality[track].quantize(raw) as i16;

            let off_note = (quantized + old_transpose as i16).clamp(0, 127) as u8;
            let _ = out.push((
                active.port,
                MidiMessage::NoteOff(active.channel, off_note.into(), 0.into()),
            ));

            let new_pitch = quantized + new_transpose as i16;
            if !(0..=127).contains(&new_pitch) {
                continue; // note becomes invalid, dropped
            }
            let _ = out.push((
                active.port,
                MidiMessage::NoteOn(active.channel, (new_pitch as u8).into(), active.velocity),
            ));
            let _ = keep.push(*active);
        }
        self.output_notes[track] = keep;
        self.current_transpose[track] = new_transpose;
        Ok(out)
    }

    /// Re-render held notes for a scale change on `track`: a note-off at
    /// the old scale+transpose followed by a note-on at the new scale's
    /// re-quantized pitch, per held note. A note whose new pitch would
    /// fall outside `0..=127` is dropped (turned off, not re-sounded).
    pub fn tonality_changed(
        &mut self,
        track: usize,
        new_tonality: Scale,
    ) -> Result<Vec<(u8, MidiMessage), { MAX_NOTES_PER_TRACK * 2 }>, OutprocError> {
        let mut out = Vec::new();
        if track >= MAX_TRACKS {
            return Err(OutprocError::InvalidTrack);
        }
        if self.output_notes[track].is_empty() {
            self.current_tonality[track] = new_tonality;
            return Ok(out);
        }
        if new_tonality == self.current_tonality[track] {
            return Ok(out);
        }

        let transpose = self.current_transpose[track];
        let mut keep: Vec<ActiveNote, MAX_NOTES_PER_TRACK> = Vec::new();
        for active in self.output_notes[track].iter() {
            let raw: u8 = active.raw_note.into();

            let old_quantized = self.current_tonality[track].quantize(raw) as i16;
            let off_note = (old_quantized + transpose as i16).clamp(0, 127) as u8;
            let _ = out.push((
                active.port,
                MidiMessage::NoteOff(active.channel, off_note.into(), 0.into()),
            ));

            let new_quantized = new_tonality.quantize(raw) as i16;
            let new_pitch = new_quantized + transpose as i16;
            if !(0..=127).contains(&new_pitch) {
                continue; // note becomes invalid, dropped
            }
            let _ = out.push((
                active.port,
                MidiMessage::NoteOn(active.channel, (new_pitch as u8).into(), active.velocity),
            ));
            let _ = keep.push(*active);
        }
        self.output_notes[track] = keep;
        self.current_tonality[track] = new_tonality;
        Ok(out)
    }

    /// Route one message to every mapped output for `track`, applying
    /// quantize+transpose and active-note tracking when `process` is
    /// [`Process::Processed`].
    pub fn deliver_msg(
        &mut self,
        track: usize,
        outputs: &[PortMap; MAX_OUTPUTS_PER_TRACK],
        msg: MidiMessage,
        deliver: Deliver,
        process: Process,
    ) -> Result<Vec<(u8, MidiMessage), MAX_OUTPUTS_PER_TRACK>, OutprocError> {
        if track >= MAX_TRACKS {
            return Err(OutprocError::InvalidTrack);
        }
        let mut sent = Vec::new();
        for (out_idx, out_map) in outputs.iter().enumerate() {
            if (deliver == Deliver::A && out_idx == 1) || (deliver == Deliver::B && out_idx == 0) {
                continue;
            }
            let Some(port) = out_map.port else {
                continue;
            };
            let channel = out_map.channel;

            let routed = match msg {
                MidiMessage::NoteOff(_, note, velocity) => {
                    if process == Process::Processed {
                        self.dequeue_note(track, port, channel, note);
                    }
                    let note = self.process_note_if_needed(track, note, process);
                    MidiMessage::NoteOff(channel, note, velocity)
                }
                MidiMessage::NoteOn(_, note, velocity) => {
                    let processed_note = self.process_note_if_needed(track, note, process);
                    if process == Process::Processed
                        && self
                            .enqueue_note(track, port, channel, note, velocity)
                            .is_err()
                    {
                        return Ok(sent); // no free slots: drop silently, as the original does
                    }
                    MidiMessage::NoteOn(channel, processed_note, velocity)
                }
                MidiMessage::KeyPressure(_, note, pressure) => {
                    let note = self.process_note_if_needed(track, note, process);
                    MidiMessage::KeyPressure(channel, note, pressure)
                }
                MidiMessage::ControlChange(_, controller, value) => {
                    MidiMessage::ControlChange(channel, controller, value)
                }
                MidiMessage::ProgramChange(_, program) => MidiMessage::ProgramChange(channel, program),
                MidiMessage::ChannelPressure(_, pressure) => {
                    MidiMessage::ChannelPressure(channel, pressure)
                }
                MidiMessage::PitchBendChange(_, bend) => MidiMessage::PitchBendChange(channel, bend),
                other => other,
            };
            let _ = sent.push((port, routed));
        }
        Ok(sent)
    }

    pub fn stop_all_notes(&mut self, track: usize) -> Result<Vec<(u8, MidiMessage), MAX_NOTES_PER_TRACK>, OutprocError> {
        if track >= MAX_TRACKS {
            return Err(OutprocError::InvalidTrack);
        }
        let mut out = Vec::new();
        for active in self.output_notes[track].iter() {
            let raw: u8 = active.raw_note.into();
            let quantized = self.current_tonality[track].quantize(raw) as i16;
            let rendered = (quantized + self.current_transpose[track] as i16).clamp(0, 127) as u8;
            let _ = out.push((
                active.port,
                MidiMessage::NoteOff(active.channel, rendered.into(), 0.into()),
            ));
        }
        self.output_notes[track].clear();
        Ok(out)
    }

    fn process_note_if_needed(&self, track: usize, note: Note, process: Process) -> Note {
        if process != Process::Processed {
            return note;
        }
        let note_num: u8 = note.into();
        let quantized = self.current_tonality[track].quantize(note_num);
        let transposed =
            (quantized as i16 + self.current_transpose[track] as i16).clamp(0, 127) as u8;
        transposed.into()
    }

    fn enqueue_note(
        &mut self,
        track: usize,
        port: u8,
        channel: Channel,
        raw_note: Note,
        velocity: Value7,
    ) -> Result<(), OutprocError> {
        self.output_notes[track]
            .push(ActiveNote {
                port,
                channel,
                raw_note,
                velocity,
            })
            .map_err(|_| OutprocError::NoFreeSlot)
    }

    fn dequeue_note(&mut self, track: usize, port: u8, channel: Channel, note: Note) {
        let note_num: u8 = note.into();
        if let Some(idx) = self.output_notes[track].iter().position(|n| {
            n.port == port
                && n.channel == channel
                && <Note as Into<u8>>::into(n.raw_note) == note_num
        }) {
            self.output_notes[track].remove(idx);
        }
    }
}

impl Default for OutputProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(port: u8, channel: u8) -> [PortMap; MAX_OUTPUTS_PER_TRACK] {
        [
            PortMap {
                port: Some(port),
                channel: channel.into(),
            },
            PortMap {
                port: None,
                channel: 0.into(),
            },
        ]
    }

    #[test]
    fn note_on_is_tracked_and_note_off_clears_it() {
        let mut op = OutputProcessor::new();
        let outs = outputs(0, 0);
        op.deliver_msg(
            0,
            &outs,
            MidiMessage::NoteOn(0.into(), 60.into(), 100.into()),
            Deliver::Both,
            Process::Processed,
        )
        .unwrap();
        assert_eq!(op.num_notes(0), 1);
        op.deliver_msg(
            0,
            &outs,
            MidiMessage::NoteOff(0.into(), 60.into(), 0.into()),
            Deliver::Both,
            Process::Processed,
        )
        .unwrap();
        assert_eq!(op.num_notes(0), 0);
    }

    #[test]
    fn transpose_change_rerenders_held_notes() {
        let mut op = OutputProcessor::new();
        let outs = outputs(0, 0);
        op.deliver_msg(
            0,
            &outs,
            MidiMessage::NoteOn(0.into(), 60.into(), 100.into()),
            Deliver::Both,
            Process::Processed,
        )
        .unwrap();

        let msgs = op.transpose_changed(0, 12).unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0].1, MidiMessage::NoteOff(_, n, _) if <Note as Into<u8>>::into(n) == 60));
        assert!(matches!(msgs[1].1, MidiMessage::NoteOn(_, n, _) if <Note as Into<u8>>::into(n) == 72));
    }

    #[test]
    fn transpose_dropping_note_out_of_range_does_not_resound() {
        let mut op = OutputProcessor::new();
        let outs = outputs(0, 0);
        op.deliver_msg(
            0,
            &outs,
            MidiMessage::NoteOn(0.into(), 120.into(), 100.into()),
            Deliver::Both,
            Process::Processed,
        )
        .unwrap();

        let msgs = op.transpose_changed(0, 20).unwrap();
        // only the turn-off, the turn-on would be out of range (140)
        assert_eq!(msgs.len(), 1);
        assert_eq!(op.num_notes(0), 0);
    }

    #[test]
    fn tonality_change_turns_off_then_resounds_requantized() {
        let mut op = OutputProcessor::new();
        let outs = outputs(0, 0);
        for note in [60u8, 64, 67] {
            op.deliver_msg(
                0,
                &outs,
                MidiMessage::NoteOn(0.into(), note.into(), 100.into()),
                Deliver::Both,
                Process::Processed,
            )
            .unwrap();
        }

        let msgs = op.tonality_changed(0, Scale::Whole).unwrap();
        assert_eq!(msgs.len(), 6);
        for (i, &off) in [60u8, 64, 67].iter().enumerate() {
            assert!(
                matches!(msgs[i].1, MidiMessage::NoteOff(_, n, _) if <Note as Into<u8>>::into(n) == off)
            );
        }
        for (i, &on) in [60u8, 64, 66].iter().enumerate() {
            assert!(
                matches!(msgs[3 + i].1, MidiMessage::NoteOn(_, n, _) if <Note as Into<u8>>::into(n) == on)
            );
        }
        assert_eq!(op.num_notes(0), 3);
    }

    #[test]
    fn tonality_change_dropping_note_out_of_range_does_not_resound() {
        let mut op = OutputProcessor::new();
        let outs = outputs(0, 0);
        op.deliver_msg(
            0,
            &outs,
            MidiMessage::NoteOn(0.into(), 5.into(), 100.into()),
            Deliver::Both,
            Process::Processed,
        )
        .unwrap();
        // chromatic quantize(5) = 5; at transpose -5 the rendered pitch is 0, still in range.
        op.transpose_changed(0, -5).unwrap();

        // whole-tone quantize(5) = 4 (5 mod 12 = 5, highest whole-tone degree <= 5 is 4);
        // at transpose -5 the re-rendered pitch would be -1, out of range, so it's dropped
        // rather than resounded.
        let msgs = op.tonality_changed(0, Scale::Whole).unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0].1, MidiMessage::NoteOff(..)));
        assert_eq!(op.num_notes(0), 0);
    }

    #[test]
    fn full_note_table_drops_additional_notes() {
        let mut op = OutputProcessor::new();
        let outs = outputs(0, 0);
        for n in 0..MAX_NOTES_PER_TRACK as u8 {
            op.deliver_msg(
                0,
                &outs,
                MidiMessage::NoteOn(0.into(), (40 + n).into(), 100.into()),
                Deliver::Both,
                Process::Processed,
            )
            .unwrap();
        }
        assert_eq!(op.num_notes(0), MAX_NOTES_PER_TRACK);
        let result = op
            .deliver_msg(
                0,
                &outs,
                MidiMessage::NoteOn(0.into(), 100.into(), 100.into()),
                Deliver::Both,
                Process::Processed,
            )
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(op.num_notes(0), MAX_NOTES_PER_TRACK);
    }
}
