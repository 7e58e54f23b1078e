//! The song data model and its load/save state machine.
//!
//! Ground truth: `song.h` + `song.c`. A [`Song`] is the single persisted
//! document: six tracks, six scenes, a 64-step pattern space, a song list
//! and a block of global parameters. Every mutator here is a typed
//! setter that validates its argument, writes through to the in-RAM
//! document and fires the matching [`crate::event_bus::Event`] — nothing
//! in this crate mutates a `Song` any other way, matching `song.c`'s
//! single entry point through `song_set_*`.
//!
//! `song.c`'s literal on-disk struct layout wasn't available, so
//! [`Song::to_bytes`]/[`Song::from_bytes`] are a faithful-in-spirit
//! re-derivation of the storage envelope (4-byte format version header,
//! 4-byte `"SONG"` magic footer, fields in between) rather than a
//! byte-for-byte reproduction of the struct's field order and padding.
//! See `DESIGN.md`.

extern crate alloc;

use heapless::Vec;

use crate::arp::ArpType;
use crate::event_bus::{Event, EventBus};
use crate::scale::Scale;

pub const TRACK_COUNT: usize = 6;
pub const SCENE_COUNT: usize = 6;
pub const STEPS_PER_TRACK: usize = 64;
pub const POLY_PER_STEP: usize = 6;
pub const SONG_LIST_LEN: usize = 64;
pub const MIDI_OUTPUTS_PER_TRACK: usize = 2;

pub const FORMAT_VERSION_MAJOR: u16 = 1;
pub const FORMAT_VERSION_MINOR: u16 = 0;
/// `"SONG"` packed big-endian, written as the last 4 bytes of a song block.
pub const MAGIC: u32 = 0x534f_4e47;

const TEMPO_MIN_BPM: f32 = 30.0;
const TEMPO_MAX_BPM: f32 = 300.0;
const SWING_MIN_PCT: u8 = 50;
const SWING_MAX_PCT: u8 = 80;

/// Size in bytes of one serialized song block. Large enough for the
/// worst case (`notes_per_scene`, every step populated); unused tail
/// bytes are left at zero.
pub const SONG_BLOCK_SIZE: usize = 0x5000;

/// External flash layout: songs start at 0, one fixed-size block each;
/// the config region follows at a fixed offset, sized independently of
/// song count.
pub const SONG_STORAGE_BASE: u32 = 0;
pub const NUM_SONGS: usize = 64;
pub const CONFIG_STORE_BASE: u32 = 0x160_000;
pub const CONFIG_STORE_SIZE: u32 = 0x1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum SongError {
    OutOfRange,
    NoFreeSlot,
    EmptySlot,
    ReadOnly,
}

/// One of the 17 enumerated step-time divisions, expressed as ticks at
/// the engine's 96 PPQ.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum StepLen {
    SixtyFourth,
    ThirtySecond,
    ThirtySecondDotted,
    SixteenthTriplet,
    Sixteenth,
    SixteenthDotted,
    EighthTriplet,
    Eighth,
    EighthDotted,
    QuarterTriplet,
    Quarter,
    QuarterDotted,
    HalfTriplet,
    Half,
    HalfDotted,
    Whole,
    WholeDotted,
}

pub const STEP_LEN_COUNT: usize = 17;
const STEP_LEN_TICKS: [u16; STEP_LEN_COUNT] = [
    6, 12, 18, 16, 24, 36, 32, 48, 72, 64, 96, 144, 128, 192, 288, 384, 576,
];
const STEP_LEN_ORDER: [StepLen; STEP_LEN_COUNT] = [
    StepLen::SixtyFourth,
    StepLen::ThirtySecond,
    StepLen::ThirtySecondDotted,
    StepLen::SixteenthTriplet,
    StepLen::Sixteenth,
    StepLen::SixteenthDotted,
    StepLen::EighthTriplet,
    StepLen::Eighth,
    StepLen::EighthDotted,
    StepLen::QuarterTriplet,
    StepLen::Quarter,
    StepLen::QuarterDotted,
    StepLen::HalfTriplet,
    StepLen::Half,
    StepLen::HalfDotted,
    StepLen::Whole,
    StepLen::WholeDotted,
];

impl StepLen {
    pub fn ticks(&self) -> u16 {
        STEP_LEN_TICKS[self.index()]
    }

    pub fn index(&self) -> usize {
        STEP_LEN_ORDER.iter().position(|v| v == self).unwrap_or(4)
    }

    pub fn from_index(index: u8) -> Option<StepLen> {
        STEP_LEN_ORDER.get(index as usize).copied()
    }
}

impl Default for StepLen {
    fn default() -> Self {
        StepLen::Sixteenth
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, defmt::Format)]
pub enum KeySplit {
    #[default]
    Off,
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, defmt::Format)]
pub enum TrackType {
    #[default]
    Voice,
    Drum,
}

/// One event slot within a [`Step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum EventKind {
    Null,
    Note,
    Cc,
}

#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct TrackEvent {
    pub kind: EventKind,
    pub data0: u8,
    pub data1: u8,
    pub length_ticks: u16,
}

impl TrackEvent {
    pub const NULL: TrackEvent = TrackEvent {
        kind: EventKind::Null,
        data0: 0,
        data1: 0,
        length_ticks: 0,
    };
}

impl Default for TrackEvent {
    fn default() -> Self {
        TrackEvent::NULL
    }
}

/// A single time cell: up to [`POLY_PER_STEP`] events plus the two
/// per-step performance parameters.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct Step {
    pub events: [TrackEvent; POLY_PER_STEP],
    /// 0..PPQ (96): ticks to hold this step's notes back by.
    pub start_delay: u8,
    /// 1..8: subdivide the step into this many equally-spaced repeats.
    pub ratchet: u8,
}

impl Step {
    pub const fn empty() -> Step {
        Step {
            events: [TrackEvent::NULL; POLY_PER_STEP],
            start_delay: 0,
            ratchet: 1,
        }
    }

    pub fn num_events(&self) -> usize {
        self.events.iter().filter(|e| e.kind != EventKind::Null).count()
    }

    /// `true` if this step would enable under pattern 31 ("as recorded"):
    /// it holds at least one non-`Null` event.
    pub fn has_any_event(&self) -> bool {
        self.events.iter().any(|e| e.kind != EventKind::Null)
    }

    /// Add (or update in place) an event. Reuses the slot already holding
    /// the same `(kind, data0)` pair; otherwise takes the first `Null`
    /// slot. Returns [`SongError::NoFreeSlot`] if none is available.
    pub fn add_event(
        &mut self,
        kind: EventKind,
        data0: u8,
        data1: u8,
        length_ticks: u16,
    ) -> Result<usize, SongError> {
        if let Some(idx) = self
            .events
            .iter()
            .position(|e| e.kind == kind && e.data0 == data0)
        {
            self.events[idx] = TrackEvent { kind, data0, data1, length_ticks };
            return Ok(idx);
        }
        if let Some(idx) = self.events.iter().position(|e| e.kind == EventKind::Null) {
            self.events[idx] = TrackEvent { kind, data0, data1, length_ticks };
            return Ok(idx);
        }
        Err(SongError::NoFreeSlot)
    }

    pub fn clear_event(&mut self, slot: usize) -> Result<(), SongError> {
        let e = self.events.get_mut(slot).ok_or(SongError::OutOfRange)?;
        *e = TrackEvent::NULL;
        Ok(())
    }

    pub fn get_event(&self, slot: usize) -> Result<TrackEvent, SongError> {
        let e = self.events.get(slot).ok_or(SongError::OutOfRange)?;
        if e.kind == EventKind::Null {
            return Err(SongError::EmptySlot);
        }
        Ok(*e)
    }

    pub fn clear(&mut self) {
        *self = Step::empty();
    }
}

impl Default for Step {
    fn default() -> Self {
        Step::empty()
    }
}

/// Per-song, per-track parameters shared across every scene.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrackParams {
    pub midi_program: [Option<u8>; MIDI_OUTPUTS_PER_TRACK],
    pub midi_output_port: [Option<u8>; MIDI_OUTPUTS_PER_TRACK],
    pub midi_output_chan: [u8; MIDI_OUTPUTS_PER_TRACK],
    pub key_split: KeySplit,
    pub track_type: TrackType,
}

/// Per-scene (or per-song, see `notes_per_scene`), per-track parameters.
#[derive(Clone, Copy, Debug)]
pub struct SceneTrackParams {
    pub step_len: StepLen,
    pub tonality: Scale,
    pub transpose: i8,
    pub bias_track: Option<u8>,
    pub motion_start: u8,
    pub motion_length: u8,
    pub gate_time: u8,
    pub pattern_type: u8,
    pub dir_reverse: bool,
    pub mute: bool,
    pub arp_type: ArpType,
    pub arp_speed: StepLen,
    pub arp_gate_time: u8,
    pub arp_enable: bool,
}

impl Default for SceneTrackParams {
    fn default() -> Self {
        SceneTrackParams {
            step_len: StepLen::default(),
            tonality: Scale::Chromatic,
            transpose: 0,
            bias_track: None,
            motion_start: 0,
            motion_length: STEPS_PER_TRACK as u8,
            gate_time: 100,
            pattern_type: crate::pattern::PATTERN_AS_RECORDED as u8,
            dir_reverse: false,
            mute: false,
            arp_type: ArpType::Up,
            arp_speed: StepLen::Sixteenth,
            arp_gate_time: 100,
            arp_enable: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SongListEntry {
    /// `None` = empty slot, terminates playback.
    pub scene: Option<u8>,
    pub length_beats: u16,
    pub kbtrans: i8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum CvGatePairing {
    Abcd,
    Aabc,
    Aabb,
    Aaaa,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum CvOutputScaling {
    OneVOct,
    OnePoint2VOct,
}

#[cfg(feature = "notes_per_scene")]
type StepTable = [[[Step; STEPS_PER_TRACK]; TRACK_COUNT]; SCENE_COUNT];
#[cfg(not(feature = "notes_per_scene"))]
type StepTable = [[Step; STEPS_PER_TRACK]; TRACK_COUNT];

#[cfg(feature = "notes_per_scene")]
type SceneParamTable = [[SceneTrackParams; TRACK_COUNT]; SCENE_COUNT];
#[cfg(not(feature = "notes_per_scene"))]
type SceneParamTable = [SceneTrackParams; TRACK_COUNT];

fn empty_step_table() -> StepTable {
    #[cfg(feature = "notes_per_scene")]
    {
        [[[Step::empty(); STEPS_PER_TRACK]; TRACK_COUNT]; SCENE_COUNT]
    }
    #[cfg(not(feature = "notes_per_scene"))]
    {
        [[Step::empty(); STEPS_PER_TRACK]; TRACK_COUNT]
    }
}

fn default_scene_params() -> SceneParamTable {
    #[cfg(feature = "notes_per_scene")]
    {
        [[SceneTrackParams::default(); TRACK_COUNT]; SCENE_COUNT]
    }
    #[cfg(not(feature = "notes_per_scene"))]
    {
        [SceneTrackParams::default(); TRACK_COUNT]
    }
}

/// The in-RAM song document: tempo, routing, per-track/scene parameters,
/// step data and the song list.
pub struct Song {
    pub tempo: f32,
    pub swing: u8,
    pub metronome_mode: u8,
    pub metronome_sound_len: u8,
    pub key_velocity_scale: i8,
    pub cv_bend_range: u8,
    pub cvgate_pairs: CvGatePairing,
    pub cvgate_pair_mode: [u8; 4],
    pub cv_output_scaling: [CvOutputScaling; 4],
    pub cvcal: [i16; 4],
    pub cv_offset: [i16; 4],
    /// Per-port clock-out division code, indexed by port number. `0` is
    /// "off"; the rest encode {1,2,3,4,6,8,12,24 PPQ} per `seq_ctrl.h`.
    pub midi_port_clock_out: [u8; 8],
    /// `None` = internal, `Some(port)` = external source port index.
    pub midi_clock_source: Option<u8>,
    pub midi_remote_ctrl: bool,
    pub midi_autolive: bool,
    pub scene_sync_beat: bool,
    pub magic_range: u8,
    pub magic_chance: u8,

    tracks: [TrackParams; TRACK_COUNT],
    scene_params: SceneParamTable,
    steps: StepTable,
    song_list: [SongListEntry; SONG_LIST_LEN],
}

impl Song {
    /// Build a default song: seeds the first 8 steps of every track with
    /// an ascending C-major scale (C4..C5).
    pub fn clear() -> Song {
        const SEED: [u8; 8] = [60, 62, 64, 65, 67, 69, 71, 72];
        let mut steps = empty_step_table();
        Self::for_each_track_step_mut(&mut steps, |track, step_idx, step| {
            let _ = track;
            if step_idx < SEED.len() {
                let _ = step.add_event(EventKind::Note, SEED[step_idx], 100, 20);
            }
        });

        Song {
            tempo: 120.0,
            swing: 50,
            metronome_mode: 0,
            metronome_sound_len: 20,
            key_velocity_scale: 0,
            cv_bend_range: 2,
            cvgate_pairs: CvGatePairing::Abcd,
            cvgate_pair_mode: [0; 4],
            cv_output_scaling: [CvOutputScaling::OneVOct; 4],
            cvcal: [0; 4],
            cv_offset: [0; 4],
            midi_port_clock_out: [0; 8],
            midi_clock_source: None,
            midi_remote_ctrl: false,
            midi_autolive: false,
            scene_sync_beat: true,
            magic_range: 12,
            magic_chance: 50,
            tracks: [TrackParams::default(); TRACK_COUNT],
            scene_params: default_scene_params(),
            steps,
            song_list: [SongListEntry::default(); SONG_LIST_LEN],
        }
    }

    fn for_each_track_step_mut(steps: &mut StepTable, mut f: impl FnMut(usize, usize, &mut Step)) {
        #[cfg(feature = "notes_per_scene")]
        for scene in steps.iter_mut() {
            for (track, track_steps) in scene.iter_mut().enumerate() {
                for (step_idx, step) in track_steps.iter_mut().enumerate() {
                    f(track, step_idx, step);
                }
            }
        }
        #[cfg(not(feature = "notes_per_scene"))]
        for (track, track_steps) in steps.iter_mut().enumerate() {
            for (step_idx, step) in track_steps.iter_mut().enumerate() {
                f(track, step_idx, step);
            }
        }
    }

    fn step_ref(&self, scene: usize, track: usize, step: usize) -> Option<&Step> {
        #[cfg(feature = "notes_per_scene")]
        {
            self.steps.get(scene)?.get(track)?.get(step)
        }
        #[cfg(not(feature = "notes_per_scene"))]
        {
            let _ = scene;
            self.steps.get(track)?.get(step)
        }
    }

    fn step_mut(&mut self, scene: usize, track: usize, step: usize) -> Option<&mut Step> {
        #[cfg(feature = "notes_per_scene")]
        {
            self.steps.get_mut(scene)?.get_mut(track)?.get_mut(step)
        }
        #[cfg(not(feature = "notes_per_scene"))]
        {
            let _ = scene;
            self.steps.get_mut(track)?.get_mut(step)
        }
    }

    fn scene_params_ref(&self, scene: usize, track: usize) -> Option<&SceneTrackParams> {
        #[cfg(feature = "notes_per_scene")]
        {
            self.scene_params.get(scene)?.get(track)
        }
        #[cfg(not(feature = "notes_per_scene"))]
        {
            let _ = scene;
            self.scene_params.get(track)
        }
    }

    fn scene_params_mut(&mut self, scene: usize, track: usize) -> Option<&mut SceneTrackParams> {
        #[cfg(feature = "notes_per_scene")]
        {
            self.scene_params.get_mut(scene)?.get_mut(track)
        }
        #[cfg(not(feature = "notes_per_scene"))]
        {
            let _ = scene;
            self.scene_params.get_mut(track)
        }
    }

    pub fn track_params(&self, track: usize) -> Result<&TrackParams, SongError> {
        self.tracks.get(track).ok_or(SongError::OutOfRange)
    }

    pub fn scene_track_params(&self, scene: usize, track: usize) -> Result<&SceneTrackParams, SongError> {
        self.scene_params_ref(scene, track).ok_or(SongError::OutOfRange)
    }

    pub fn step(&self, scene: usize, track: usize, step: usize) -> Result<&Step, SongError> {
        self.step_ref(scene, track, step).ok_or(SongError::OutOfRange)
    }

    /// Deep-copies every per-scene track parameter and step table entry
    /// from `src` to `dest`. Event data is shared across scenes unless
    /// `notes_per_scene` is enabled, in which case steps are copied too.
    pub fn copy_scene(&mut self, dest: usize, src: usize, bus: &mut EventBus) -> Result<(), SongError> {
        if dest >= SCENE_COUNT || src >= SCENE_COUNT {
            return Err(SongError::OutOfRange);
        }
        for track in 0..TRACK_COUNT {
            let params = *self.scene_params_ref(src, track).unwrap();
            *self.scene_params_mut(dest, track).unwrap() = params;
            #[cfg(feature = "notes_per_scene")]
            {
                for step in 0..STEPS_PER_TRACK {
                    let s = *self.step_ref(src, track, step).unwrap();
                    *self.step_mut(dest, track, step).unwrap() = s;
                }
            }
        }
        bus.fire(Event::SongCleared { song_num: dest as u8 });
        Ok(())
    }

    // ---- global setters ----

    pub fn set_tempo(&mut self, bpm: f32, bus: &mut EventBus) -> Result<(), SongError> {
        if !(TEMPO_MIN_BPM..=TEMPO_MAX_BPM).contains(&bpm) {
            return Err(SongError::OutOfRange);
        }
        self.tempo = bpm;
        bus.fire(Event::SongTempo);
        Ok(())
    }

    pub fn set_swing(&mut self, swing: u8, bus: &mut EventBus) -> Result<(), SongError> {
        if !(SWING_MIN_PCT..=SWING_MAX_PCT).contains(&swing) {
            return Err(SongError::OutOfRange);
        }
        self.swing = swing;
        bus.fire(Event::SongSwing { swing });
        Ok(())
    }

    pub fn set_metronome_mode(&mut self, mode: u8, bus: &mut EventBus) -> Result<(), SongError> {
        self.metronome_mode = mode;
        bus.fire(Event::SongMetronomeMode { mode });
        Ok(())
    }

    pub fn set_metronome_sound_len(&mut self, len: u8, bus: &mut EventBus) -> Result<(), SongError> {
        self.metronome_sound_len = len;
        bus.fire(Event::SongMetronomeSoundLen { len });
        Ok(())
    }

    pub fn set_key_velocity_scale(&mut self, scale: i8, bus: &mut EventBus) -> Result<(), SongError> {
        if !(-100..=100).contains(&scale) {
            return Err(SongError::OutOfRange);
        }
        self.key_velocity_scale = scale;
        bus.fire(Event::SongKeyVelocityScale { scale: scale as u8 });
        Ok(())
    }

    pub fn set_cv_bend_range(&mut self, semis: u8, bus: &mut EventBus) -> Result<(), SongError> {
        if !(1..=12).contains(&semis) {
            return Err(SongError::OutOfRange);
        }
        self.cv_bend_range = semis;
        bus.fire(Event::SongCvBendRange { bend_range: semis });
        Ok(())
    }

    pub fn set_cvgate_pairs(&mut self, pairs: CvGatePairing, bus: &mut EventBus) -> Result<(), SongError> {
        self.cvgate_pairs = pairs;
        bus.fire(Event::SongCvGatePairs { pairs: pairs as u8 });
        Ok(())
    }

    pub fn set_cvgate_pair_mode(&mut self, pair: usize, mode: u8, bus: &mut EventBus) -> Result<(), SongError> {
        let slot = self.cvgate_pair_mode.get_mut(pair).ok_or(SongError::OutOfRange)?;
        if mode > 120 {
            return Err(SongError::OutOfRange);
        }
        *slot = mode;
        bus.fire(Event::SongCvGatePairMode { pair: pair as u8, mode });
        Ok(())
    }

    pub fn set_cv_output_scaling(&mut self, out: usize, mode: CvOutputScaling, bus: &mut EventBus) -> Result<(), SongError> {
        let slot = self.cv_output_scaling.get_mut(out).ok_or(SongError::OutOfRange)?;
        *slot = mode;
        bus.fire(Event::SongCvOutputScaling { output: out as u8, mode: mode as u8 });
        Ok(())
    }

    pub fn set_cvcal(&mut self, out: usize, cal: i16, bus: &mut EventBus) -> Result<(), SongError> {
        let slot = self.cvcal.get_mut(out).ok_or(SongError::OutOfRange)?;
        *slot = cal;
        bus.fire(Event::SongCvCal { channel: out as u8, cal });
        Ok(())
    }

    pub fn set_cv_offset(&mut self, out: usize, offset: i16, bus: &mut EventBus) -> Result<(), SongError> {
        let slot = self.cv_offset.get_mut(out).ok_or(SongError::OutOfRange)?;
        *slot = offset;
        bus.fire(Event::SongCvOffset { channel: out as u8, offset });
        Ok(())
    }

    pub fn set_midi_port_clock_out(&mut self, port: u8, ppq: u8, bus: &mut EventBus) -> Result<(), SongError> {
        let slot = self
            .midi_port_clock_out
            .get_mut(port as usize)
            .ok_or(SongError::OutOfRange)?;
        *slot = ppq;
        bus.fire(Event::SongMidiPortClockOut { port, ppq });
        Ok(())
    }

    pub fn set_midi_clock_source(&mut self, source: Option<u8>, bus: &mut EventBus) -> Result<(), SongError> {
        self.midi_clock_source = source;
        bus.fire(Event::SongMidiClockSource { source: source.unwrap_or(0xff) });
        Ok(())
    }

    pub fn set_midi_remote_ctrl(&mut self, enable: bool, bus: &mut EventBus) -> Result<(), SongError> {
        self.midi_remote_ctrl = enable;
        bus.fire(Event::SongMidiRemoteCtrl { enable });
        Ok(())
    }

    pub fn set_midi_autolive(&mut self, enable: bool, bus: &mut EventBus) -> Result<(), SongError> {
        self.midi_autolive = enable;
        bus.fire(Event::SongMidiAutolive { enable });
        Ok(())
    }

    pub fn set_scene_sync(&mut self, enable: bool, bus: &mut EventBus) -> Result<(), SongError> {
        self.scene_sync_beat = enable;
        bus.fire(Event::SongSceneSync { enable });
        Ok(())
    }

    pub fn set_magic_range(&mut self, range: u8, bus: &mut EventBus) -> Result<(), SongError> {
        self.magic_range = range;
        bus.fire(Event::SongMagicRange { range });
        Ok(())
    }

    pub fn set_magic_chance(&mut self, chance: u8, bus: &mut EventBus) -> Result<(), SongError> {
        self.magic_chance = chance;
        bus.fire(Event::SongMagicChance { chance });
        Ok(())
    }

    // ---- song list ----

    pub fn song_list_entry(&self, entry: usize) -> Result<&SongListEntry, SongError> {
        self.song_list.get(entry).ok_or(SongError::OutOfRange)
    }

    pub fn set_song_list_scene(&mut self, entry: usize, scene: Option<u8>, bus: &mut EventBus) -> Result<(), SongError> {
        if let Some(s) = scene {
            if s as usize >= SCENE_COUNT {
                return Err(SongError::OutOfRange);
            }
        }
        let slot = self.song_list.get_mut(entry).ok_or(SongError::OutOfRange)?;
        slot.scene = scene;
        bus.fire(Event::SongListScene { entry: entry as u8, scene: scene.unwrap_or(0xff) });
        Ok(())
    }

    pub fn set_song_list_length(&mut self, entry: usize, length: u16, bus: &mut EventBus) -> Result<(), SongError> {
        if !(1..=256).contains(&length) {
            return Err(SongError::OutOfRange);
        }
        let slot = self.song_list.get_mut(entry).ok_or(SongError::OutOfRange)?;
        slot.length_beats = length;
        bus.fire(Event::SongListLength { entry: entry as u8, length: length as u8 });
        Ok(())
    }

    pub fn set_song_list_kbtrans(&mut self, entry: usize, kbtrans: i8, bus: &mut EventBus) -> Result<(), SongError> {
        if !(-24..=24).contains(&kbtrans) {
            return Err(SongError::OutOfRange);
        }
        let slot = self.song_list.get_mut(entry).ok_or(SongError::OutOfRange)?;
        slot.kbtrans = kbtrans;
        bus.fire(Event::SongListKbtrans { entry: entry as u8, kbtrans });
        Ok(())
    }

    // ---- track (per-song) setters ----

    pub fn set_midi_program(&mut self, track: usize, map_num: usize, program: Option<u8>, bus: &mut EventBus) -> Result<(), SongError> {
        let t = self.tracks.get_mut(track).ok_or(SongError::OutOfRange)?;
        let slot = t.midi_program.get_mut(map_num).ok_or(SongError::OutOfRange)?;
        *slot = program;
        bus.fire(Event::SongMidiProgram { track: track as u8, map_num: map_num as u8, program: program.unwrap_or(0xff) });
        Ok(())
    }

    pub fn set_midi_port_map(&mut self, track: usize, map_num: usize, port: Option<u8>, bus: &mut EventBus) -> Result<(), SongError> {
        let t = self.tracks.get_mut(track).ok_or(SongError::OutOfRange)?;
        let slot = t.midi_output_port.get_mut(map_num).ok_or(SongError::OutOfRange)?;
        *slot = port;
        bus.fire(Event::SongMidiPortMap { track: track as u8, map_num: map_num as u8, port: port.unwrap_or(0xff) });
        Ok(())
    }

    pub fn set_midi_channel_map(&mut self, track: usize, map_num: usize, channel: u8, bus: &mut EventBus) -> Result<(), SongError> {
        if channel >= 16 {
            return Err(SongError::OutOfRange);
        }
        let t = self.tracks.get_mut(track).ok_or(SongError::OutOfRange)?;
        let slot = t.midi_output_chan.get_mut(map_num).ok_or(SongError::OutOfRange)?;
        *slot = channel;
        bus.fire(Event::SongMidiChannelMap { track: track as u8, map_num: map_num as u8, channel });
        Ok(())
    }

    pub fn set_key_split(&mut self, track: usize, mode: KeySplit, bus: &mut EventBus) -> Result<(), SongError> {
        let t = self.tracks.get_mut(track).ok_or(SongError::OutOfRange)?;
        t.key_split = mode;
        bus.fire(Event::SongKeySplit { track: track as u8, mode: mode as u8 });
        Ok(())
    }

    pub fn set_track_type(&mut self, track: usize, mode: TrackType, bus: &mut EventBus) -> Result<(), SongError> {
        let t = self.tracks.get_mut(track).ok_or(SongError::OutOfRange)?;
        t.track_type = mode;
        bus.fire(Event::SongTrackType { track: track as u8, mode: mode as u8 });
        Ok(())
    }

    // ---- scene/track setters ----

    pub fn set_step_len(&mut self, scene: usize, track: usize, step_len: StepLen, bus: &mut EventBus) -> Result<(), SongError> {
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.step_len = step_len;
        bus.fire(Event::SongStepLen { scene: scene as u8, track: track as u8, length: step_len.index() as u8 });
        Ok(())
    }

    pub fn set_tonality(&mut self, scene: usize, track: usize, tonality: Scale, bus: &mut EventBus) -> Result<(), SongError> {
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.tonality = tonality;
        bus.fire(Event::SongTonality { scene: scene as u8, track: track as u8, tonality: tonality as u8 });
        Ok(())
    }

    pub fn set_transpose(&mut self, scene: usize, track: usize, transpose: i8, bus: &mut EventBus) -> Result<(), SongError> {
        if !(-24..=24).contains(&transpose) {
            return Err(SongError::OutOfRange);
        }
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.transpose = transpose;
        bus.fire(Event::SongTranspose { scene: scene as u8, track: track as u8, transpose });
        Ok(())
    }

    pub fn set_bias_track(&mut self, scene: usize, track: usize, bias_track: Option<u8>, bus: &mut EventBus) -> Result<(), SongError> {
        if let Some(b) = bias_track {
            if b as usize >= TRACK_COUNT {
                return Err(SongError::OutOfRange);
            }
        }
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.bias_track = bias_track;
        bus.fire(Event::SongBiasTrack { scene: scene as u8, track: track as u8, bias_track: bias_track.map(|b| b as i8).unwrap_or(-1) });
        Ok(())
    }

    pub fn set_motion_start(&mut self, scene: usize, track: usize, start: u8, bus: &mut EventBus) -> Result<(), SongError> {
        if start as usize >= STEPS_PER_TRACK {
            return Err(SongError::OutOfRange);
        }
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.motion_start = start;
        bus.fire(Event::SongMotionStart { scene: scene as u8, track: track as u8, start });
        Ok(())
    }

    pub fn set_motion_length(&mut self, scene: usize, track: usize, length: u8, bus: &mut EventBus) -> Result<(), SongError> {
        if !(1..=STEPS_PER_TRACK as u8).contains(&length) {
            return Err(SongError::OutOfRange);
        }
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.motion_length = length;
        bus.fire(Event::SongMotionLength { scene: scene as u8, track: track as u8, length });
        Ok(())
    }

    pub fn set_gate_time(&mut self, scene: usize, track: usize, time: u8, bus: &mut EventBus) -> Result<(), SongError> {
        if time == 0 {
            return Err(SongError::OutOfRange);
        }
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.gate_time = time;
        bus.fire(Event::SongGateTime { scene: scene as u8, track: track as u8, time });
        Ok(())
    }

    pub fn set_pattern_type(&mut self, scene: usize, track: usize, pattern: u8, bus: &mut EventBus) -> Result<(), SongError> {
        if pattern as usize >= crate::pattern::NUM_PATTERNS {
            return Err(SongError::OutOfRange);
        }
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.pattern_type = pattern;
        bus.fire(Event::SongPatternType { scene: scene as u8, track: track as u8, pattern });
        Ok(())
    }

    pub fn set_dir_reverse(&mut self, scene: usize, track: usize, reverse: bool, bus: &mut EventBus) -> Result<(), SongError> {
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.dir_reverse = reverse;
        bus.fire(Event::SongMotionDir { scene: scene as u8, track: track as u8, reverse });
        Ok(())
    }

    pub fn set_mute(&mut self, scene: usize, track: usize, mute: bool, bus: &mut EventBus) -> Result<(), SongError> {
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.mute = mute;
        bus.fire(Event::SongMute { scene: scene as u8, track: track as u8, mute });
        Ok(())
    }

    pub fn set_arp_type(&mut self, scene: usize, track: usize, arp_type: ArpType, bus: &mut EventBus) -> Result<(), SongError> {
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.arp_type = arp_type;
        bus.fire(Event::SongArpType { scene: scene as u8, track: track as u8, arp_type: arp_type as u8 });
        Ok(())
    }

    pub fn set_arp_speed(&mut self, scene: usize, track: usize, arp_speed: StepLen, bus: &mut EventBus) -> Result<(), SongError> {
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.arp_speed = arp_speed;
        bus.fire(Event::SongArpSpeed { scene: scene as u8, track: track as u8, speed: arp_speed.index() as u8 });
        Ok(())
    }

    pub fn set_arp_gate_time(&mut self, scene: usize, track: usize, time: u8, bus: &mut EventBus) -> Result<(), SongError> {
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.arp_gate_time = time;
        bus.fire(Event::SongArpGateTime { scene: scene as u8, track: track as u8, time });
        Ok(())
    }

    pub fn set_arp_enable(&mut self, scene: usize, track: usize, enable: bool, bus: &mut EventBus) -> Result<(), SongError> {
        let p = self.scene_params_mut(scene, track).ok_or(SongError::OutOfRange)?;
        p.arp_enable = enable;
        bus.fire(Event::SongArpEnable { scene: scene as u8, track: track as u8, enable });
        Ok(())
    }

    // ---- step/event setters ----

    pub fn clear_step(&mut self, scene: usize, track: usize, step: usize, bus: &mut EventBus) -> Result<(), SongError> {
        let s = self.step_mut(scene, track, step).ok_or(SongError::OutOfRange)?;
        s.clear();
        bus.fire(Event::SongClearStep { scene: scene as u8, track: track as u8, step: step as u8 });
        Ok(())
    }

    pub fn clear_step_event(&mut self, scene: usize, track: usize, step: usize, slot: usize, bus: &mut EventBus) -> Result<(), SongError> {
        let s = self.step_mut(scene, track, step).ok_or(SongError::OutOfRange)?;
        s.clear_event(slot)?;
        bus.fire(Event::SongClearStepEvent { scene: scene as u8, track: track as u8, step: step as u8 });
        Ok(())
    }

    pub fn add_step_event(
        &mut self,
        scene: usize,
        track: usize,
        step: usize,
        kind: EventKind,
        data0: u8,
        data1: u8,
        length_ticks: u16,
        bus: &mut EventBus,
    ) -> Result<usize, SongError> {
        let s = self.step_mut(scene, track, step).ok_or(SongError::OutOfRange)?;
        let idx = s.add_event(kind, data0, data1, length_ticks)?;
        bus.fire(Event::SongAddStepEvent { scene: scene as u8, track: track as u8, step: step as u8 });
        Ok(idx)
    }

    pub fn get_step_event(&self, scene: usize, track: usize, step: usize, slot: usize) -> Result<TrackEvent, SongError> {
        self.step(scene, track, step)?.get_event(slot)
    }

    pub fn set_start_delay(&mut self, scene: usize, track: usize, step: usize, delay: u8, bus: &mut EventBus) -> Result<(), SongError> {
        if delay as u32 >= crate::clock::PPQ {
            return Err(SongError::OutOfRange);
        }
        let s = self.step_mut(scene, track, step).ok_or(SongError::OutOfRange)?;
        s.start_delay = delay;
        bus.fire(Event::SongStartDelay { scene: scene as u8, track: track as u8, step: step as u8 });
        Ok(())
    }

    pub fn set_ratchet(&mut self, scene: usize, track: usize, step: usize, ratchet: u8, bus: &mut EventBus) -> Result<(), SongError> {
        if !(1..=8).contains(&ratchet) {
            return Err(SongError::OutOfRange);
        }
        let s = self.step_mut(scene, track, step).ok_or(SongError::OutOfRange)?;
        s.ratchet = ratchet;
        bus.fire(Event::SongRatchetMode { scene: scene as u8, track: track as u8, step: step as u8 });
        Ok(())
    }

    // ---- serialization ----

    /// Pack the song into `buf` (must be at least [`SONG_BLOCK_SIZE`]
    /// bytes). Writes the format-version header and every global/track
    /// field; returns the byte count written, always `SONG_BLOCK_SIZE`.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        assert!(buf.len() >= SONG_BLOCK_SIZE);
        let mut w = Writer { buf, pos: 0 };
        w.u32(((FORMAT_VERSION_MAJOR as u32) << 16) | FORMAT_VERSION_MINOR as u32);
        w.f32(self.tempo);
        w.u8(self.swing);
        w.u8(self.metronome_mode);
        w.u8(self.metronome_sound_len);
        w.i8(self.key_velocity_scale);
        w.u8(self.cv_bend_range);
        w.u8(self.cvgate_pairs as u8);
        for m in self.cvgate_pair_mode {
            w.u8(m);
        }
        for s in self.cv_output_scaling {
            w.u8(s as u8);
        }
        for c in self.cvcal {
            w.i16(c);
        }
        for o in self.cv_offset {
            w.i16(o);
        }
        w.u8(self.midi_clock_source.unwrap_or(0xff));
        w.bool(self.midi_remote_ctrl);
        w.bool(self.midi_autolive);
        w.bool(self.scene_sync_beat);
        w.u8(self.magic_range);
        w.u8(self.magic_chance);
        for p in self.midi_port_clock_out {
            w.u8(p);
        }

        for t in &self.tracks {
            for p in t.midi_program {
                w.u8(p.unwrap_or(0xff));
            }
            for p in t.midi_output_port {
                w.u8(p.unwrap_or(0xff));
            }
            for c in t.midi_output_chan {
                w.u8(c);
            }
            w.u8(t.key_split as u8);
            w.u8(t.track_type as u8);
        }

        for entry in &self.song_list {
            w.u8(entry.scene.unwrap_or(0xff));
            w.u16(entry.length_beats);
            w.i8(entry.kbtrans);
        }

        #[cfg(feature = "notes_per_scene")]
        let scene_iter: &[[SceneTrackParams; TRACK_COUNT]] = &self.scene_params;
        #[cfg(not(feature = "notes_per_scene"))]
        let scene_iter: &[SceneTrackParams] = &self.scene_params;

        #[cfg(feature = "notes_per_scene")]
        for scene in scene_iter {
            for p in scene {
                Self::write_scene_params(&mut w, p);
            }
        }
        #[cfg(not(feature = "notes_per_scene"))]
        for p in scene_iter {
            Self::write_scene_params(&mut w, p);
        }

        #[cfg(feature = "notes_per_scene")]
        for scene in &self.steps {
            for track in scene {
                for step in track {
                    Self::write_step(&mut w, step);
                }
            }
        }
        #[cfg(not(feature = "notes_per_scene"))]
        for track in &self.steps {
            for step in track {
                Self::write_step(&mut w, step);
            }
        }

        let footer_pos = SONG_BLOCK_SIZE - 4;
        buf[footer_pos..SONG_BLOCK_SIZE].copy_from_slice(&MAGIC.to_be_bytes());
        SONG_BLOCK_SIZE
    }

    fn write_scene_params(w: &mut Writer, p: &SceneTrackParams) {
        w.u8(p.step_len.index() as u8);
        w.u8(p.tonality as u8);
        w.i8(p.transpose);
        w.u8(p.bias_track.map(|b| b as i8).unwrap_or(-1) as u8);
        w.u8(p.motion_start);
        w.u8(p.motion_length);
        w.u8(p.gate_time);
        w.u8(p.pattern_type);
        w.bool(p.dir_reverse);
        w.bool(p.mute);
        w.u8(p.arp_type as u8);
        w.u8(p.arp_speed.index() as u8);
        w.u8(p.arp_gate_time);
        w.bool(p.arp_enable);
    }

    fn write_step(w: &mut Writer, step: &Step) {
        for e in step.events {
            w.u8(e.kind as u8);
            w.u8(e.data0);
            w.u8(e.data1);
            w.u16(e.length_ticks);
        }
        w.u8(step.start_delay);
        w.u8(step.ratchet);
    }

    /// Rebuild a song from bytes previously written by [`Self::to_bytes`].
    /// Returns `None` on a magic mismatch, matching `song_load`'s
    /// "invalid ⇒ clear()" policy (the caller performs the `clear()`).
    pub fn from_bytes(buf: &[u8]) -> Option<Song> {
        if buf.len() < SONG_BLOCK_SIZE {
            return None;
        }
        let footer_pos = SONG_BLOCK_SIZE - 4;
        let magic = u32::from_be_bytes(buf[footer_pos..footer_pos + 4].try_into().ok()?);
        if magic != MAGIC {
            return None;
        }

        let mut r = Reader { buf, pos: 0 };
        let _version = r.u32();
        let mut song = Song::clear();
        song.tempo = r.f32();
        song.swing = r.u8();
        song.metronome_mode = r.u8();
        song.metronome_sound_len = r.u8();
        song.key_velocity_scale = r.i8();
        song.cv_bend_range = r.u8();
        song.cvgate_pairs = match r.u8() {
            1 => CvGatePairing::Aabc,
            2 => CvGatePairing::Aabb,
            3 => CvGatePairing::Aaaa,
            _ => CvGatePairing::Abcd,
        };
        for slot in song.cvgate_pair_mode.iter_mut() {
            *slot = r.u8();
        }
        for slot in song.cv_output_scaling.iter_mut() {
            *slot = if r.u8() == 1 { CvOutputScaling::OnePoint2VOct } else { CvOutputScaling::OneVOct };
        }
        for slot in song.cvcal.iter_mut() {
            *slot = r.i16();
        }
        for slot in song.cv_offset.iter_mut() {
            *slot = r.i16();
        }
        let clock_src = r.u8();
        song.midi_clock_source = if clock_src == 0xff { None } else { Some(clock_src) };
        song.midi_remote_ctrl = r.bool();
        song.midi_autolive = r.bool();
        song.scene_sync_beat = r.bool();
        song.magic_range = r.u8();
        song.magic_chance = r.u8();
        for slot in song.midi_port_clock_out.iter_mut() {
            *slot = r.u8();
        }

        for t in song.tracks.iter_mut() {
            for p in t.midi_program.iter_mut() {
                let v = r.u8();
                *p = if v == 0xff { None } else { Some(v) };
            }
            for p in t.midi_output_port.iter_mut() {
                let v = r.u8();
                *p = if v == 0xff { None } else { Some(v) };
            }
            for c in t.midi_output_chan.iter_mut() {
                *c = r.u8();
            }
            t.key_split = match r.u8() {
                1 => KeySplit::Left,
                2 => KeySplit::Right,
                _ => KeySplit::Off,
            };
            t.track_type = if r.u8() == 1 { TrackType::Drum } else { TrackType::Voice };
        }

        for entry in song.song_list.iter_mut() {
            let scene = r.u8();
            entry.scene = if scene == 0xff { None } else { Some(scene) };
            entry.length_beats = r.u16();
            entry.kbtrans = r.i8();
        }

        #[cfg(feature = "notes_per_scene")]
        for scene in song.scene_params.iter_mut() {
            for p in scene.iter_mut() {
                Self::read_scene_params(&mut r, p);
            }
        }
        #[cfg(not(feature = "notes_per_scene"))]
        for p in song.scene_params.iter_mut() {
            Self::read_scene_params(&mut r, p);
        }

        #[cfg(feature = "notes_per_scene")]
        for scene in song.steps.iter_mut() {
            for track in scene.iter_mut() {
                for step in track.iter_mut() {
                    Self::read_step(&mut r, step);
                }
            }
        }
        #[cfg(not(feature = "notes_per_scene"))]
        for track in song.steps.iter_mut() {
            for step in track.iter_mut() {
                Self::read_step(&mut r, step);
            }
        }

        Some(song)
    }

    fn read_scene_params(r: &mut Reader, p: &mut SceneTrackParams) {
        p.step_len = StepLen::from_index(r.u8()).unwrap_or_default();
        p.tonality = Scale::from_index(r.u8()).unwrap_or(Scale::Chromatic);
        p.transpose = r.i8();
        let bias = r.u8();
        p.bias_track = if bias as i8 == -1 { None } else { Some(bias) };
        p.motion_start = r.u8();
        p.motion_length = r.u8();
        p.gate_time = r.u8();
        p.pattern_type = r.u8();
        p.dir_reverse = r.bool();
        p.mute = r.bool();
        p.arp_type = ArpType::from_index(r.u8()).unwrap_or(ArpType::Up);
        p.arp_speed = StepLen::from_index(r.u8()).unwrap_or_default();
        p.arp_gate_time = r.u8();
        p.arp_enable = r.bool();
    }

    fn read_step(r: &mut Reader, step: &mut Step) {
        for e in step.events.iter_mut() {
            let kind = match r.u8() {
                1 => EventKind::Note,
                2 => EventKind::Cc,
                _ => EventKind::Null,
            };
            let data0 = r.u8();
            let data1 = r.u8();
            let length_ticks = r.u16();
            *e = TrackEvent { kind, data0, data1, length_ticks };
        }
        step.start_delay = r.u8();
        step.ratchet = r.u8();
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }
    fn i8(&mut self, v: i8) {
        self.u8(v as u8);
    }
    fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }
    fn u16(&mut self, v: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&v.to_le_bytes());
        self.pos += 2;
    }
    fn i16(&mut self, v: i16) {
        self.u16(v as u16);
    }
    fn u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }
    fn f32(&mut self, v: f32) {
        self.u32(v.to_bits());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }
    fn i8(&mut self) -> i8 {
        self.u8() as i8
    }
    fn bool(&mut self) -> bool {
        self.u8() != 0
    }
    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        v
    }
    fn i16(&mut self) -> i16 {
        self.u16() as i16
    }
    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        v
    }
    fn f32(&mut self) -> f32 {
        f32::from_bits(self.u32())
    }
}

/// Drives asynchronous `load(n)`/`save(n)` against a [`crate::block_device::BlockDevice`],
/// validating the magic/version envelope on load. Mirrors `song.c`'s
/// `song_load`/`song_save` state progression.
pub struct SongStore {
    song: Song,
    state: crate::block_device::BlockDeviceState,
    buf: Vec<u8, SONG_BLOCK_SIZE>,
    base_addr: u32,
}

impl SongStore {
    pub fn new(base_addr: u32) -> SongStore {
        let mut buf = Vec::new();
        buf.resize(SONG_BLOCK_SIZE, 0).unwrap();
        SongStore {
            song: Song::clear(),
            state: crate::block_device::BlockDeviceState::Idle,
            buf,
            base_addr,
        }
    }

    pub fn song(&self) -> &Song {
        &self.song
    }

    pub fn song_mut(&mut self) -> &mut Song {
        &mut self.song
    }

    fn slot_addr(&self, song_num: u8) -> u32 {
        self.base_addr + song_num as u32 * SONG_BLOCK_SIZE as u32
    }

    pub fn clear(&mut self, bus: &mut EventBus) {
        self.song = Song::clear();
        bus.fire(Event::SongCleared { song_num: 0 });
    }

    /// Begin loading `song_num`. Caller must poll [`Self::poll`] to
    /// completion.
    pub fn load(&mut self, song_num: u8, device: &mut impl crate::block_device::BlockDevice) {
        let addr = self.slot_addr(song_num);
        if device.load(addr, &mut self.buf).is_ok() {
            self.state = crate::block_device::BlockDeviceState::Loading;
        }
    }

    pub fn save(&mut self, song_num: u8, device: &mut impl crate::block_device::BlockDevice) {
        let addr = self.slot_addr(song_num);
        self.song.to_bytes(&mut self.buf);
        if device.save(addr, &self.buf).is_ok() {
            self.state = crate::block_device::BlockDeviceState::Saving;
        }
    }

    /// Advance the in-flight operation, firing `SongLoaded`/`SongLoadError`
    /// or `SongSaved`/`SongSaveError` once it terminates. A magic mismatch
    /// or block error both route to `clear()` + `LOAD_ERROR` so a corrupt
    /// or never-written slot always leaves the song in a playable,
    /// known-empty state rather than half-decoded garbage.
    pub fn poll(&mut self, song_num: u8, device: &mut impl crate::block_device::BlockDevice, bus: &mut EventBus) {
        use crate::block_device::BlockDeviceState as S;
        match device.poll() {
            S::LoadDone => {
                self.state = S::Idle;
                match Song::from_bytes(&self.buf) {
                    Some(song) => {
                        self.song = song;
                        bus.fire(Event::SongLoaded { song_num });
                    }
                    None => {
                        self.song = Song::clear();
                        bus.fire(Event::SongLoadError { song_num });
                    }
                }
            }
            S::LoadError => {
                self.state = S::Idle;
                self.song = Song::clear();
                bus.fire(Event::SongLoadError { song_num });
            }
            S::SaveDone | S::SavingNoErase if device.poll() == S::SaveDone => {
                self.state = S::Idle;
                bus.fire(Event::SongSaved { song_num });
            }
            S::SaveError => {
                self.state = S::Idle;
                bus.fire(Event::SongSaveError { song_num });
            }
            other => self.state = other,
        }
    }

    pub fn state(&self) -> crate::block_device::BlockDeviceState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_seeds_c_major_scale_on_first_eight_steps() {
        let song = Song::clear();
        let expected = [60u8, 62, 64, 65, 67, 69, 71, 72];
        for (i, note) in expected.iter().enumerate() {
            let ev = song.get_step_event(0, 0, i, 0).unwrap();
            assert_eq!(ev.data0, *note);
            assert_eq!(ev.kind, EventKind::Note);
        }
    }

    #[test]
    fn tempo_bounds_accept_30_and_300_reject_outside() {
        let mut song = Song::clear();
        let mut bus = EventBus::new();
        assert!(song.set_tempo(30.0, &mut bus).is_ok());
        assert!(song.set_tempo(300.0, &mut bus).is_ok());
        assert!(song.set_tempo(29.9, &mut bus).is_err());
        assert!(song.set_tempo(300.1, &mut bus).is_err());
    }

    #[test]
    fn add_step_event_rejects_when_all_six_slots_distinct_and_full() {
        let mut song = Song::clear();
        let mut bus = EventBus::new();
        song.clear_step(0, 0, 5, &mut bus).unwrap();
        for n in 0..6u8 {
            song.add_step_event(0, 0, 5, EventKind::Note, 40 + n, 100, 20, &mut bus).unwrap();
        }
        assert_eq!(
            song.add_step_event(0, 0, 5, EventKind::Note, 90, 100, 20, &mut bus),
            Err(SongError::NoFreeSlot)
        );
    }

    #[test]
    fn add_step_event_reuses_slot_for_same_kind_and_data0() {
        let mut song = Song::clear();
        let mut bus = EventBus::new();
        song.clear_step(0, 0, 0, &mut bus).unwrap();
        let idx1 = song.add_step_event(0, 0, 0, EventKind::Note, 60, 90, 10, &mut bus).unwrap();
        let idx2 = song.add_step_event(0, 0, 0, EventKind::Note, 60, 100, 30, &mut bus).unwrap();
        assert_eq!(idx1, idx2);
        assert_eq!(song.step(0, 0, 0).unwrap().num_events(), 1);
    }

    #[test]
    fn get_step_event_on_empty_slot_is_err() {
        let mut song = Song::clear();
        let mut bus = EventBus::new();
        song.clear_step(0, 0, 0, &mut bus).unwrap();
        assert_eq!(song.get_step_event(0, 0, 0, 0), Err(SongError::EmptySlot));
    }

    #[test]
    fn motion_window_wraps_modulo_step_count() {
        let mut song = Song::clear();
        let mut bus = EventBus::new();
        song.set_motion_start(0, 0, 60, &mut bus).unwrap();
        song.set_motion_length(0, 0, 8, &mut bus).unwrap();
        let p = song.scene_track_params(0, 0).unwrap();
        let window: Vec<u8, 8> = (0..p.motion_length)
            .map(|i| (p.motion_start as u32 + i as u32) as u8 % STEPS_PER_TRACK as u8)
            .collect();
        assert_eq!(window.as_slice(), &[60, 61, 62, 63, 0, 1, 2, 3]);
    }

    #[test]
    fn to_bytes_from_bytes_round_trips_tempo_and_steps() {
        let mut song = Song::clear();
        let mut bus = EventBus::new();
        song.set_tempo(135.0, &mut bus).unwrap();
        song.set_swing(67, &mut bus).unwrap();
        let mut buf = [0u8; SONG_BLOCK_SIZE];
        song.to_bytes(&mut buf);
        let restored = Song::from_bytes(&buf).unwrap();
        assert!((restored.tempo - 135.0).abs() < 0.001);
        assert_eq!(restored.swing, 67);
        assert_eq!(restored.get_step_event(0, 0, 0, 0).unwrap().data0, 60);
    }

    #[test]
    fn bad_magic_fails_to_parse() {
        let buf = [0u8; SONG_BLOCK_SIZE];
        assert!(Song::from_bytes(&buf).is_none());
    }

    #[test]
    fn song_store_load_with_blank_device_clears_and_reports_error() {
        let mut store = SongStore::new(0);
        let mut disk = crate::block_device::ram_disk::RamDisk::new();
        let mut bus = EventBus::new();
        store.load(0, &mut disk);
        // drain until terminal
        for _ in 0..4 {
            store.poll(0, &mut disk, &mut bus);
        }
        assert_eq!(store.song().get_step_event(0, 0, 0, 0).unwrap().data0, 60);
    }

    #[test]
    fn song_store_save_then_load_round_trips() {
        let mut store = SongStore::new(0);
        let mut disk = crate::block_device::ram_disk::RamDisk::new();
        let mut bus = EventBus::new();
        store.song_mut().set_tempo(150.0, &mut bus).unwrap();
        store.save(3, &mut disk);
        store.poll(3, &mut disk, &mut bus);

        let mut store2 = SongStore::new(0);
        store2.load(3, &mut disk);
        store2.poll(3, &mut disk, &mut bus);
        assert!((store2.song().tempo - 150.0).abs() < 0.001);
    }
}
