//! Sequencer engine: the per-tick playback state machine.
//!
//! Ground truth: `seq_ctrl.c`'s `seq_ctrl_clock_tick` and the per-track
//! scheduling helpers it calls. Driven once per generated tick by
//! [`crate::clock::Clock::tick_task`], this module walks all six tracks,
//! decides which steps cross a boundary, applies pattern masks, ratchet
//! and start-delay, and forwards the resulting note/CC traffic through
//! [`crate::outproc::OutputProcessor`] (and, for the first four tracks,
//! [`crate::cv_proc::CvProcessor`]). It also owns live input routing
//! (KB-trans, arp feed), step/real-time recording, song-list advance and
//! the metronome.
//!
//! CV wiring: each of the four CV/gate pairs tracks a fixed track by
//! position (pair *i* mirrors track *i*'s MIDI output); tracks 4 and 5
//! have no analog counterpart. See `DESIGN.md` for the reasoning behind
//! this fixed mapping rather than a per-song configurable one.

use heapless::Vec;
use midi_types::MidiMessage;

use crate::arp::{ArpType, Arpeggiator};
use crate::cv_proc::CvProcessor;
use crate::event_bus::{Event, EventBus};
use crate::outproc::{Deliver, OutprocError, OutputProcessor, PortMap, Process};
use crate::pattern::{PatternBank, PATTERN_AS_RECORDED};
use crate::scale::Scale;
use crate::song::{EventKind, Song, SongError, TrackParams, TRACK_COUNT};

/// Worst-case messages produced by a single tick: 6 tracks, up to 6
/// polyphonic slots each emitting a ratcheted on/off, plus transpose/
/// tonality re-renders and the metronome. Generous rather than exact.
pub const MAX_MESSAGES_PER_TICK: usize = 128;
const PENDING_CAP: usize = 128;
const CV_TRACK_COUNT: usize = 4;
const METRONOME_TRACK: usize = 5;
const METRONOME_NOTE: u8 = 60;
const CENTRE_NOTE: i16 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum LiveMode {
    Off,
    Live,
    Kbtrans,
}

impl LiveMode {
    pub fn code(self) -> u8 {
        match self {
            LiveMode::Off => 0,
            LiveMode::Live => 1,
            LiveMode::Kbtrans => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum RecordMode {
    Idle,
    Arm,
    Step,
    Rt,
}

impl RecordMode {
    pub fn code(self) -> u8 {
        match self {
            RecordMode::Idle => 0,
            RecordMode::Arm => 1,
            RecordMode::Step => 2,
            RecordMode::Rt => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum EngineError {
    InvalidTrack,
}

impl From<SongError> for EngineError {
    fn from(_: SongError) -> Self {
        EngineError::InvalidTrack
    }
}

impl From<OutprocError> for EngineError {
    fn from(_: OutprocError) -> Self {
        EngineError::InvalidTrack
    }
}

#[derive(Clone, Copy)]
enum PendingKind {
    NoteOn { raw_note: u8, velocity: u8, len: u32 },
    NoteOff { raw_note: u8 },
}

#[derive(Clone, Copy)]
struct Pending {
    due_tick: u32,
    track: usize,
    kind: PendingKind,
}

/// Per-track playback state that doesn't live in the persisted [`Song`].
#[derive(Clone, Copy, Default)]
struct TrackRuntime {
    /// The last transpose value handed to the output processor, so we only
    /// call `transpose_changed` when the effective value actually moves.
    transpose: i8,
    tonality_valid: bool,
    tonality: Scale,
    /// Raw pitch of the last note this track sounded; feeds `bias_track`
    /// on other tracks.
    last_root: Option<u8>,
}

pub struct Engine {
    runtime: [TrackRuntime; TRACK_COUNT],
    arps: [Arpeggiator; TRACK_COUNT],
    pending: Vec<Pending, PENDING_CAP>,

    live_mode: LiveMode,
    kbtrans: i8,

    record_mode: RecordMode,
    record_arm_target: RecordMode,
    record_track: usize,
    record_step: usize,

    song_mode: bool,
    song_list_pos: usize,
    song_list_progress: u16,
    current_scene: usize,
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            runtime: [TrackRuntime::default(); TRACK_COUNT],
            arps: [
                Arpeggiator::new(ArpType::Up),
                Arpeggiator::new(ArpType::Up),
                Arpeggiator::new(ArpType::Up),
                Arpeggiator::new(ArpType::Up),
                Arpeggiator::new(ArpType::Up),
                Arpeggiator::new(ArpType::Up),
            ],
            pending: Vec::new(),
            live_mode: LiveMode::Off,
            kbtrans: 0,
            record_mode: RecordMode::Idle,
            record_arm_target: RecordMode::Step,
            record_track: 0,
            record_step: 0,
            song_mode: false,
            song_list_pos: 0,
            song_list_progress: 0,
            current_scene: 0,
        }
    }

    pub fn current_scene(&self) -> usize {
        self.current_scene
    }

    pub fn record_mode(&self) -> RecordMode {
        self.record_mode
    }

    pub fn live_mode(&self) -> LiveMode {
        self.live_mode
    }

    pub fn set_live_mode(&mut self, mode: LiveMode, bus: &mut EventBus) {
        self.live_mode = mode;
        if mode != LiveMode::Kbtrans {
            self.kbtrans = 0;
        }
        bus.fire(Event::CtrlLiveMode {
            live_mode: mode.code(),
        });
    }

    /// Enter `ARM`: the next recorded note-on picks `target` (step or
    /// real-time) as the active mode, matching `IDLE -> ARM -> STEP|RT`.
    pub fn arm_record(&mut self, track: usize, target: RecordMode, bus: &mut EventBus) {
        self.record_mode = RecordMode::Arm;
        self.record_arm_target = target;
        self.record_track = track;
        bus.fire(Event::CtrlRecordMode {
            record_mode: self.record_mode.code(),
        });
    }

    pub fn stop_record(&mut self, bus: &mut EventBus) {
        self.record_mode = RecordMode::Idle;
        bus.fire(Event::CtrlRecordMode {
            record_mode: self.record_mode.code(),
        });
    }

    pub fn enable_song_mode(&mut self, enable: bool, song: &Song, bus: &mut EventBus) {
        self.song_mode = enable;
        if enable {
            self.song_list_pos = 0;
            self.song_list_progress = 0;
            if let Ok(entry) = song.song_list_entry(0) {
                if let Some(scene) = entry.scene {
                    self.current_scene = scene as usize;
                    bus.fire(Event::EngCurrentScene { scene });
                }
            }
        }
        bus.fire(Event::CtrlSongMode { song_mode: enable });
    }

    /// Manually select the playing/editing scene, outside of song-list
    /// advance. Used by the Controller's `set_scene`.
    pub fn set_scene(&mut self, scene: usize, bus: &mut EventBus) -> Result<(), EngineError> {
        if scene >= crate::song::SCENE_COUNT {
            return Err(EngineError::InvalidTrack);
        }
        self.current_scene = scene;
        bus.fire(Event::EngCurrentScene { scene: scene as u8 });
        Ok(())
    }

    /// Directly set the keyboard-transpose value, independent of live
    /// mode. MIDI-remote control uses this; panel `KBTRANS` input instead
    /// derives it from incoming note-ons in `note_on_input`.
    pub fn set_kbtrans(&mut self, kbtrans: i8, bus: &mut EventBus) {
        self.kbtrans = kbtrans;
        bus.fire(Event::EngKbtrans { trans: kbtrans });
    }

    /// Live/keyboard input: routes to KB-trans, the arp of every
    /// arp-enabled unmuted track, and step/real-time recording, depending
    /// on current mode.
    pub fn note_on_input(
        &mut self,
        song: &mut Song,
        bus: &mut EventBus,
        tick: u32,
        note: u8,
        velocity: u8,
    ) -> Result<(), EngineError> {
        if self.live_mode == LiveMode::Kbtrans {
            self.kbtrans = note as i16 as i8 - (CENTRE_NOTE as i8);
            bus.fire(Event::EngKbtrans { trans: self.kbtrans });
        }

        for track in 0..TRACK_COUNT {
            let params = song.scene_track_params(self.current_scene, track)?;
            if params.arp_enable {
                self.arps[track].note_on(note.into());
            }
        }

        if self.record_mode == RecordMode::Arm {
            self.record_mode = self.record_arm_target;
            self.record_step = song
                .scene_track_params(self.current_scene, self.record_track)?
                .motion_start as usize;
            bus.fire(Event::CtrlRecordMode {
                record_mode: self.record_mode.code(),
            });
        }

        match self.record_mode {
            RecordMode::Step => {
                let step = self.record_step;
                song.add_step_event(
                    self.current_scene,
                    self.record_track,
                    step,
                    EventKind::Note,
                    note,
                    velocity,
                    20,
                    bus,
                )?;
                let params = song.scene_track_params(self.current_scene, self.record_track)?;
                let window = params.motion_length.max(1) as usize;
                let start = params.motion_start as usize;
                let offset = (step + 1 - start) % window;
                self.record_step = start + offset;
            }
            RecordMode::Rt => {
                let step = self.track_step_index(song, self.record_track, tick)?;
                song.add_step_event(
                    self.current_scene,
                    self.record_track,
                    step,
                    EventKind::Note,
                    note,
                    velocity,
                    20,
                    bus,
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn note_off_input(&mut self, song: &Song, note: u8) -> Result<(), EngineError> {
        for track in 0..TRACK_COUNT {
            let params = song.scene_track_params(self.current_scene, track)?;
            if params.arp_enable {
                self.arps[track].note_off(note.into());
            }
        }
        Ok(())
    }

    fn track_step_index(&self, song: &Song, track: usize, tick: u32) -> Result<usize, EngineError> {
        let params = song.scene_track_params(self.current_scene, track)?;
        Ok(step_index_for_tick(tick, params.step_len.ticks(), params.motion_start, params.motion_length, params.dir_reverse))
    }

    /// True when track 0 is about to re-enter its motion window at `motion_start`.
    fn track_zero_at_loop_start(&self, tick: u32, song: &Song) -> bool {
        let Ok(params) = song.scene_track_params(self.current_scene, 0) else {
            return true;
        };
        let step_ticks = params.step_len.ticks() as u32;
        if step_ticks == 0 {
            return true;
        }
        tick % step_ticks == 0
            && self.track_step_index(song, 0, tick).unwrap_or(0) == params.motion_start as usize
    }

    /// Advance by one generated tick. Returns every `(port, message)` pair
    /// to transmit this tick, in the order they were produced.
    pub fn tick(
        &mut self,
        tick: u32,
        running: bool,
        song: &mut Song,
        patterns: &PatternBank,
        outproc: &mut OutputProcessor,
        cv: &mut CvProcessor,
        bus: &mut EventBus,
        mut rng_u8: impl FnMut() -> u8,
    ) -> Result<Vec<(u8, MidiMessage), MAX_MESSAGES_PER_TICK>, EngineError> {
        let mut out: Vec<(u8, MidiMessage), MAX_MESSAGES_PER_TICK> = Vec::new();

        self.flush_due_pending(tick, song, outproc, cv, &mut out)?;

        if !running {
            return Ok(out);
        }

        if tick % crate::clock::PPQ == 0 {
            self.on_beat(tick, song, bus);
            if song.metronome_mode != 0 {
                self.schedule_metronome(tick, song, outproc, &mut out);
            }
        }

        for track in 0..TRACK_COUNT {
            self.apply_transpose_and_tonality(track, song, outproc, &mut out)?;
            self.run_track(track, tick, song, patterns, outproc, cv, bus, &mut rng_u8, &mut out)?;
        }

        Ok(out)
    }

    fn on_beat(&mut self, tick: u32, song: &Song, bus: &mut EventBus) {
        bus.fire(Event::CtrlClockBeat);
        if !self.song_mode {
            return;
        }
        let Ok(entry) = song.song_list_entry(self.song_list_pos) else {
            return;
        };
        self.song_list_progress += 1;
        if self.song_list_progress < entry.length_beats {
            return;
        }
        if !song.scene_sync_beat && !self.track_zero_at_loop_start(tick, song) {
            // Hold at the beat boundary until track 0's pattern wraps, so the
            // scene change lands on its loop start instead of mid-pattern.
            return;
        }
        self.song_list_progress = 0;
        self.song_list_pos += 1;
        match song.song_list_entry(self.song_list_pos) {
            Ok(next) => match next.scene {
                Some(scene) => {
                    self.current_scene = scene as usize;
                    self.kbtrans = next.kbtrans;
                    bus.fire(Event::EngCurrentScene { scene });
                }
                None => {
                    self.song_mode = false;
                    bus.fire(Event::CtrlRunState {
                        state: crate::event_bus::RunState::Stopped,
                    });
                    bus.fire(Event::EngSongModeStatus);
                }
            },
            Err(_) => {
                self.song_mode = false;
                bus.fire(Event::CtrlRunState {
                    state: crate::event_bus::RunState::Stopped,
                });
            }
        }
    }

    fn apply_transpose_and_tonality(
        &mut self,
        track: usize,
        song: &Song,
        outproc: &mut OutputProcessor,
        out: &mut Vec<(u8, MidiMessage), MAX_MESSAGES_PER_TICK>,
    ) -> Result<(), EngineError> {
        let params = song.scene_track_params(self.current_scene, track)?;

        let bias_delta = match params.bias_track {
            Some(bt) if bt as usize != track => self.runtime[bt as usize]
                .last_root
                .map(|n| n as i16 - CENTRE_NOTE)
                .unwrap_or(0),
            _ => 0,
        };
        let kbtrans_delta = if self.live_mode == LiveMode::Kbtrans {
            self.kbtrans as i16
        } else {
            0
        };
        let effective = (params.transpose as i16 + bias_delta + kbtrans_delta).clamp(-127, 127) as i8;

        if effective != self.runtime[track].transpose {
            if let Ok(msgs) = outproc.transpose_changed(track, effective) {
                for m in msgs {
                    let _ = out.push(m);
                }
            }
            self.runtime[track].transpose = effective;
        }

        if !self.runtime[track].tonality_valid || params.tonality != self.runtime[track].tonality {
            if let Ok(msgs) = outproc.tonality_changed(track, params.tonality) {
                for m in msgs {
                    let _ = out.push(m);
                }
            }
            self.runtime[track].tonality = params.tonality;
            self.runtime[track].tonality_valid = true;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_track(
        &mut self,
        track: usize,
        tick: u32,
        song: &mut Song,
        patterns: &PatternBank,
        outproc: &mut OutputProcessor,
        cv: &mut CvProcessor,
        bus: &mut EventBus,
        rng_u8: &mut impl FnMut() -> u8,
        out: &mut Vec<(u8, MidiMessage), MAX_MESSAGES_PER_TICK>,
    ) -> Result<(), EngineError> {
        let params = *song.scene_track_params(self.current_scene, track)?;
        if params.mute {
            return Ok(());
        }

        let step_ticks = params.step_len.ticks() as u32;
        if step_ticks == 0 || tick % step_ticks != 0 {
            return self.run_arp(track, tick, song, outproc, out, rng_u8);
        }

        let step_idx = step_index_for_tick(
            tick,
            params.step_len.ticks(),
            params.motion_start,
            params.motion_length,
            params.dir_reverse,
        );
        bus.fire(Event::EngActiveStep {
            track: track as u8,
            step: step_idx as u8,
        });

        let enabled = if params.pattern_type as usize == PATTERN_AS_RECORDED {
            song.step(self.current_scene, track, step_idx)?.has_any_event()
        } else {
            patterns
                .step_enable(params.pattern_type as usize, step_idx as u8)
                .unwrap_or(false)
        };

        if enabled {
            let step = *song.step(self.current_scene, track, step_idx)?;
            for event in step.events.iter() {
                if event.kind != EventKind::Note {
                    continue;
                }
                if params.arp_enable {
                    self.arps[track].note_on(event.data0.into());
                    continue;
                }
                self.schedule_ratcheted_note(
                    track,
                    tick,
                    step_ticks,
                    step.start_delay as u32,
                    step.ratchet.max(1) as u32,
                    params.gate_time,
                    event.data0,
                    event.data1,
                    event.length_ticks,
                    song,
                    outproc,
                    cv,
                    out,
                )?;
            }
        }

        self.run_arp(track, tick, song, outproc, out, rng_u8)
    }

    fn run_arp(
        &mut self,
        track: usize,
        tick: u32,
        song: &Song,
        outproc: &mut OutputProcessor,
        out: &mut Vec<(u8, MidiMessage), MAX_MESSAGES_PER_TICK>,
        rng_u8: &mut impl FnMut() -> u8,
    ) -> Result<(), EngineError> {
        let params = song.scene_track_params(self.current_scene, track)?;
        if !params.arp_enable || self.arps[track].is_empty() {
            return Ok(());
        }
        let arp_ticks = params.arp_speed.ticks() as u32;
        if arp_ticks == 0 || tick % arp_ticks != 0 {
            return Ok(());
        }
        let Some(note) = self.arps[track].advance(|| rng_u8()) else {
            return Ok(());
        };
        let raw_note: u8 = note.into();
        let len = ((arp_ticks * params.arp_gate_time as u32) / 128).max(1).min(arp_ticks.saturating_sub(1).max(1));
        self.emit_note_on(track, raw_note, 100, song, outproc, out)?;
        self.runtime[track].last_root = Some(raw_note);
        let _ = self.pending.push(Pending {
            due_tick: tick + len,
            track,
            kind: PendingKind::NoteOff { raw_note },
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_ratcheted_note(
        &mut self,
        track: usize,
        tick: u32,
        step_ticks: u32,
        start_delay: u32,
        ratchet: u32,
        gate_time: u8,
        data0: u8,
        data1: u8,
        length_ticks: u16,
        song: &Song,
        outproc: &mut OutputProcessor,
        cv: &mut CvProcessor,
        out: &mut Vec<(u8, MidiMessage), MAX_MESSAGES_PER_TICK>,
    ) -> Result<(), EngineError> {
        let spacing = step_ticks.saturating_sub(start_delay).max(ratchet) / ratchet;
        let spacing = spacing.max(1);
        for i in 0..ratchet {
            let on_tick = tick + start_delay + i * spacing;
            let len = ((length_ticks as u32 * gate_time as u32) / 128)
                .max(1)
                .min(spacing.saturating_sub(1).max(1));
            if on_tick == tick {
                self.emit_note_on(track, data0, data1, song, outproc, out)?;
                self.runtime[track].last_root = Some(data0);
                self.emit_cv(track, MidiMessage::NoteOn(0.into(), data0.into(), data1.into()), cv);
                let _ = self.pending.push(Pending {
                    due_tick: tick + len,
                    track,
                    kind: PendingKind::NoteOff { raw_note: data0 },
                });
            } else {
                let _ = self.pending.push(Pending {
                    due_tick: on_tick,
                    track,
                    kind: PendingKind::NoteOn {
                        raw_note: data0,
                        velocity: data1,
                        len,
                    },
                });
            }
        }
        Ok(())
    }

    fn emit_note_on(
        &mut self,
        track: usize,
        raw_note: u8,
        velocity: u8,
        song: &Song,
        outproc: &mut OutputProcessor,
        out: &mut Vec<(u8, MidiMessage), MAX_MESSAGES_PER_TICK>,
    ) -> Result<(), EngineError> {
        let tp = song.track_params(track)?;
        let outputs = port_maps(tp);
        let msg = MidiMessage::NoteOn(0.into(), raw_note.into(), velocity.into());
        if let Ok(sent) = outproc.deliver_msg(track, &outputs, msg, Deliver::Both, Process::Processed) {
            for (port, m) in sent {
                let _ = out.push((port, m));
            }
        }
        Ok(())
    }

    fn emit_note_off(
        &mut self,
        track: usize,
        raw_note: u8,
        song: &Song,
        outproc: &mut OutputProcessor,
        out: &mut Vec<(u8, MidiMessage), MAX_MESSAGES_PER_TICK>,
    ) -> Result<(), EngineError> {
        let tp = song.track_params(track)?;
        let outputs = port_maps(tp);
        let msg = MidiMessage::NoteOff(0.into(), raw_note.into(), 0.into());
        if let Ok(sent) = outproc.deliver_msg(track, &outputs, msg, Deliver::Both, Process::Processed) {
            for (port, m) in sent {
                let _ = out.push((port, m));
            }
        }
        Ok(())
    }

    /// Tracks 0..4 also mirror their note traffic to a CV/gate pair of the
    /// same index (see module docs). Returns whether anything was sent.
    fn emit_cv(&mut self, track: usize, msg: MidiMessage, cv: &mut CvProcessor) -> bool {
        if track >= CV_TRACK_COUNT {
            return false;
        }
        cv.handle_message(track, msg);
        true
    }

    fn schedule_metronome(
        &mut self,
        tick: u32,
        song: &Song,
        outproc: &mut OutputProcessor,
        out: &mut Vec<(u8, MidiMessage), MAX_MESSAGES_PER_TICK>,
    ) {
        let Ok(()) = self.emit_note_on(METRONOME_TRACK, METRONOME_NOTE, 100, song, outproc, out) else {
            return;
        };
        let len = (song.metronome_sound_len as u32).max(1);
        let _ = self.pending.push(Pending {
            due_tick: tick + len,
            track: METRONOME_TRACK,
            kind: PendingKind::NoteOff {
                raw_note: METRONOME_NOTE,
            },
        });
    }

    fn flush_due_pending(
        &mut self,
        tick: u32,
        song: &Song,
        outproc: &mut OutputProcessor,
        cv: &mut CvProcessor,
        out: &mut Vec<(u8, MidiMessage), MAX_MESSAGES_PER_TICK>,
    ) -> Result<(), EngineError> {
        let mut due: Vec<Pending, PENDING_CAP> = Vec::new();
        let mut remain: Vec<Pending, PENDING_CAP> = Vec::new();
        for p in self.pending.iter() {
            if p.due_tick <= tick {
                let _ = due.push(*p);
            } else {
                let _ = remain.push(*p);
            }
        }
        self.pending = remain;

        for p in due {
            match p.kind {
                PendingKind::NoteOn { raw_note, velocity, len } => {
                    self.emit_note_on(p.track, raw_note, velocity, song, outproc, out)?;
                    self.runtime[p.track].last_root = Some(raw_note);
                    self.emit_cv(
                        p.track,
                        MidiMessage::NoteOn(0.into(), raw_note.into(), velocity.into()),
                        cv,
                    );
                    let _ = self.pending.push(Pending {
                        due_tick: tick + len,
                        track: p.track,
                        kind: PendingKind::NoteOff { raw_note },
                    });
                }
                PendingKind::NoteOff { raw_note } => {
                    self.emit_note_off(p.track, raw_note, song, outproc, out)?;
                    self.emit_cv(p.track, MidiMessage::NoteOff(0.into(), raw_note.into(), 0.into()), cv);
                }
            }
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn port_maps(tp: &TrackParams) -> [PortMap; 2] {
    [
        PortMap {
            port: tp.midi_output_port[0],
            channel: tp.midi_output_chan[0].into(),
        },
        PortMap {
            port: tp.midi_output_port[1],
            channel: tp.midi_output_chan[1].into(),
        },
    ]
}

/// Step index for `tick` within a track's motion window, honoring
/// `dir_reverse`. `motion_length` is clamped to at least 1 (the song
/// setter already enforces `1..=64`, this just guards the arithmetic).
fn step_index_for_tick(
    tick: u32,
    step_len_ticks: u16,
    motion_start: u8,
    motion_length: u8,
    reverse: bool,
) -> usize {
    let step_ticks = step_len_ticks.max(1) as u32;
    let window = motion_length.max(1) as u32;
    let raw_index = tick / step_ticks;
    let offset = raw_index % window;
    let offset = if reverse { window - 1 - offset } else { offset };
    ((motion_start as u32 + offset) % crate::song::STEPS_PER_TRACK as u32) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::StepLen;

    fn setup() -> (Song, EventBus, PatternBank, OutputProcessor, CvProcessor, Engine) {
        let song = Song::clear();
        let bus = EventBus::new();
        let patterns = PatternBank::with_rom_defaults();
        let outproc = OutputProcessor::new();
        let cv = CvProcessor::new();
        let engine = Engine::new();
        (song, bus, patterns, outproc, cv, engine)
    }

    fn route_track(song: &mut Song, track: usize, port: u8, channel: u8, bus: &mut EventBus) {
        song.set_midi_port_map(track, 0, Some(port), bus).unwrap();
        song.set_midi_channel_map(track, 0, channel, bus).unwrap();
    }

    #[test]
    fn step_index_wraps_through_motion_window() {
        // step_len = 96 ticks (Quarter), window [2, 4): steps 2,3,2,3,...
        assert_eq!(step_index_for_tick(0, 96, 2, 2, false), 2);
        assert_eq!(step_index_for_tick(96, 96, 2, 2, false), 3);
        assert_eq!(step_index_for_tick(192, 96, 2, 2, false), 2);
    }

    #[test]
    fn step_index_reverses_direction() {
        assert_eq!(step_index_for_tick(0, 96, 0, 4, true), 3);
        assert_eq!(step_index_for_tick(96, 96, 0, 4, true), 2);
    }

    #[test]
    fn internal_seed_scenario_emits_eight_note_pairs() {
        // Default C-major seed, motion window 0..7, as-recorded pattern.
        // Track 1 (index 0) should fire an on/off pair for each of the 8
        // seeded steps, in order.
        let (mut song, mut bus, patterns, mut outproc, mut cv, mut engine) = setup();
        route_track(&mut song, 0, 0, 0, &mut bus);
        song.set_motion_length(0, 0, 8, &mut bus).unwrap();

        let step_ticks = song.scene_track_params(0, 0).unwrap().step_len.ticks() as u32;
        let mut notes_on = heapless::Vec::<u8, 8>::new();
        for tick in 0..(step_ticks * 8) {
            let msgs = engine
                .tick(tick, true, &mut song, &patterns, &mut outproc, &mut cv, &mut bus, || 0)
                .unwrap();
            for (_, m) in msgs {
                if let MidiMessage::NoteOn(_, n, _) = m {
                    let _ = notes_on.push(n.into());
                }
            }
        }
        assert_eq!(notes_on.as_slice(), &[60, 62, 64, 65, 67, 69, 71, 72]);
    }

    #[test]
    fn muted_track_produces_no_output() {
        let (mut song, mut bus, patterns, mut outproc, mut cv, mut engine) = setup();
        route_track(&mut song, 0, 0, 0, &mut bus);
        song.set_mute(0, 0, true, &mut bus).unwrap();
        let step_ticks = song.scene_track_params(0, 0).unwrap().step_len.ticks() as u32;
        let msgs = engine
            .tick(0, true, &mut song, &patterns, &mut outproc, &mut cv, &mut bus, || 0)
            .unwrap();
        assert!(msgs.iter().all(|(_, m)| !matches!(m, MidiMessage::NoteOn(..))));
        let _ = step_ticks;
    }

    #[test]
    fn ratchet_and_start_delay_produce_four_pairs() {
        // One note with ratchet=4, start_delay=12: four evenly spaced pairs.
        let (mut song, mut bus, patterns, mut outproc, mut cv, mut engine) = setup();
        route_track(&mut song, 0, 0, 0, &mut bus);
        song.set_step_len(0, 0, StepLen::Whole, &mut bus).unwrap(); // 576 ticks/step
        song.clear_step(0, 0, 0, &mut bus).unwrap();
        song.add_step_event(0, 0, 0, EventKind::Note, 60, 100, 20, &mut bus)
            .unwrap();
        song.set_start_delay(0, 0, 0, 12, &mut bus).unwrap();
        song.set_ratchet(0, 0, 0, 4, &mut bus).unwrap();
        song.set_motion_length(0, 0, 1, &mut bus).unwrap();

        let mut on_ticks: heapless::Vec<u32, 8> = heapless::Vec::new();
        for tick in 0..576u32 {
            let msgs = engine
                .tick(tick, true, &mut song, &patterns, &mut outproc, &mut cv, &mut bus, || 0)
                .unwrap();
            if msgs.iter().any(|(_, m)| matches!(m, MidiMessage::NoteOn(..))) {
                let _ = on_ticks.push(tick);
            }
        }
        assert_eq!(on_ticks.len(), 4);
        assert_eq!(on_ticks[0], 12);
        let spacing = on_ticks[1] - on_ticks[0];
        assert_eq!(spacing, (576 - 12) / 4);
    }

    #[test]
    fn song_list_advances_scene_on_beat_sync() {
        // Two song-list entries of 1 beat each, then stop.
        let (mut song, mut bus, patterns, mut outproc, mut cv, mut engine) = setup();
        song.set_song_list_scene(0, Some(0), &mut bus).unwrap();
        song.set_song_list_length(0, 1, &mut bus).unwrap();
        song.set_song_list_scene(1, Some(1), &mut bus).unwrap();
        song.set_song_list_length(1, 1, &mut bus).unwrap();
        song.set_song_list_scene(2, None, &mut bus).unwrap();

        engine.enable_song_mode(true, &song, &mut bus);
        assert_eq!(engine.current_scene(), 0);

        for tick in 0..96u32 {
            let _ = engine
                .tick(tick, true, &mut song, &patterns, &mut outproc, &mut cv, &mut bus, || 0)
                .unwrap();
        }
        assert_eq!(engine.current_scene(), 1);

        for tick in 96..192u32 {
            let _ = engine
                .tick(tick, true, &mut song, &patterns, &mut outproc, &mut cv, &mut bus, || 0)
                .unwrap();
        }
        assert!(!engine.song_mode);
    }

    #[test]
    fn song_list_holds_for_track_zero_loop_when_beat_sync_disabled() {
        // With scene_sync_beat off, a due scene change waits for track 0's
        // pattern to wrap instead of cutting in on the next beat.
        let (mut song, mut bus, patterns, mut outproc, mut cv, mut engine) = setup();
        song.scene_sync_beat = false;
        song.set_step_len(0, 0, StepLen::QuarterDotted, &mut bus).unwrap(); // 144 ticks/step
        song.set_motion_length(0, 0, 1, &mut bus).unwrap();
        song.set_song_list_scene(0, Some(0), &mut bus).unwrap();
        song.set_song_list_length(0, 1, &mut bus).unwrap(); // due after 1 beat (96 ticks)
        song.set_song_list_scene(1, Some(1), &mut bus).unwrap();
        song.set_song_list_length(1, 1, &mut bus).unwrap();
        song.set_song_list_scene(2, None, &mut bus).unwrap();

        engine.enable_song_mode(true, &song, &mut bus);

        for tick in 0..192u32 {
            let _ = engine
                .tick(tick, true, &mut song, &patterns, &mut outproc, &mut cv, &mut bus, || 0)
                .unwrap();
            // Due at tick 96, but track 0's 144-tick loop hasn't wrapped yet.
            assert_eq!(engine.current_scene(), 0);
        }
        for tick in 192..289u32 {
            let _ = engine
                .tick(tick, true, &mut song, &patterns, &mut outproc, &mut cv, &mut bus, || 0)
                .unwrap();
        }
        assert_eq!(engine.current_scene(), 1);
    }

    #[test]
    fn kbtrans_live_mode_sets_transpose_from_incoming_note() {
        let (mut song, mut bus, _patterns, _outproc, _cv, mut engine) = setup();
        engine.set_live_mode(LiveMode::Kbtrans, &mut bus);
        engine.note_on_input(&mut song, &mut bus, 0, 72, 100).unwrap();
        assert_eq!(engine.kbtrans, 12);
    }

    #[test]
    fn step_record_writes_event_and_advances() {
        let (mut song, mut bus, _patterns, _outproc, _cv, mut engine) = setup();
        engine.arm_record(0, RecordMode::Step, &mut bus);
        engine.note_on_input(&mut song, &mut bus, 0, 50, 90).unwrap();
        assert_eq!(engine.record_mode(), RecordMode::Step);
        let ev = song.get_step_event(0, 0, 0, 0).unwrap();
        // reuses slot 0 only if it matched; seeded song already has a Note
        // event at data0=60 in slot 0, so this lands in the next free slot
        assert!(ev.kind == EventKind::Note);
    }

}
