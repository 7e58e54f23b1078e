//! Routes decoded MIDI to/from the sequencer core. This crate only owns
//! the DIN1 UART transport concretely; the remaining ports (`DIN2_OUT`,
//! `USB_HOST_*`, `USB_DEV_*`) are out-of-scope transport drivers and are
//! represented here only as the port index `carbon_sequencer` tags
//! outgoing messages with.

use defmt::{debug, trace};
use midi_types::MidiMessage;

use carbon_sequencer::clock::Clock;
use carbon_sequencer::controller::Controller;
use carbon_sequencer::engine::Engine;
use carbon_sequencer::event_bus::EventBus;
use carbon_sequencer::song::Song;

pub const PORT_DIN1: u8 = 0;
pub const PORT_DIN2: u8 = 1;
pub const PORT_USB_HOST: u8 = 2;

/// Dispatch one message received on `DIN1_IN`. Realtime bytes drive the
/// clock; channel voice messages feed live input/record, matching
/// `seq_ctrl`'s routing of incoming MIDI.
pub fn handle_din1_rx(
    message: MidiMessage,
    tick: u32,
    clock: &mut Clock,
    engine: &mut Engine,
    controller: &mut Controller,
    song: &mut Song,
    bus: &mut EventBus,
) {
    match message {
        MidiMessage::TimingClock => {
            trace!("[midi] din1 clock");
            clock.midi_rx_tick();
        }
        MidiMessage::Start => {
            debug!("[midi] din1 start");
            clock.midi_rx_start(bus);
        }
        MidiMessage::Continue => {
            debug!("[midi] din1 continue");
            clock.midi_rx_continue();
        }
        MidiMessage::Stop => {
            debug!("[midi] din1 stop");
            clock.midi_rx_stop(bus);
        }
        MidiMessage::NoteOn(_, note, velocity) => {
            let note: u8 = note.into();
            let velocity: u8 = velocity.into();
            if velocity == 0 {
                let _ = engine.note_off_input(song, note);
            } else {
                let _ = engine.note_on_input(song, bus, tick, note, velocity);
            }
        }
        MidiMessage::NoteOff(_, note, _) => {
            let note: u8 = note.into();
            let _ = engine.note_off_input(song, note);
        }
        _ => {
            let _ = controller;
            trace!("[midi] din1 unhandled channel voice message");
        }
    }
}

pub fn log_outgoing(port: u8, message: &MidiMessage) {
    match message {
        MidiMessage::NoteOn(channel, note, velocity) => {
            let channel: u8 = (*channel).into();
            let note: u8 = (*note).into();
            let velocity: u8 = (*velocity).into();
            trace!(
                "[midi_out] port={} note on ch={} note={} vel={}",
                port, channel, note, velocity
            );
        }
        MidiMessage::NoteOff(channel, note, _) => {
            let channel: u8 = (*channel).into();
            let note: u8 = (*note).into();
            trace!("[midi_out] port={} note off ch={} note={}", port, channel, note);
        }
        _ => trace!("[midi_out] port={} other", port),
    }
}
