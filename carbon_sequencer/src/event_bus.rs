//! Synchronous publish/subscribe event bus.
//!
//! Every other module in this crate reports state changes by firing an
//! [`Event`] rather than calling into its neighbours directly. Handlers
//! register for a whole [`EventClass`] (song/control/engine/config/power)
//! and are invoked synchronously, in registration order, from inside
//! `fire`. There is no queueing: firing an event runs every matching
//! handler to completion before `fire` returns, matching the original
//! firmware's single-threaded cooperative model (see [`crate::engine`]).

extern crate alloc;

use alloc::boxed::Box;
use heapless::Vec;

const MAX_SUBSCRIBERS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum EventClass {
    Song,
    Ctrl,
    Eng,
    Config,
    Power,
}

/// Run-state broadcast on [`Event::CtrlRunState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum RunState {
    Stopped,
    Running,
    Paused,
}

/// Every state change the sequencer core can report. Field names mirror the
/// `arg0`/`arg1`/`arg2` documentation of the original event table: `scene`
/// and `track` always come before the value that changed.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub enum Event {
    // song events
    SongCleared { song_num: u8 },
    SongLoaded { song_num: u8 },
    SongLoadError { song_num: u8 },
    SongSaved { song_num: u8 },
    SongSaveError { song_num: u8 },
    SongTempo,
    SongSwing { swing: u8 },
    SongMetronomeMode { mode: u8 },
    SongMetronomeSoundLen { len: u8 },
    SongKeyVelocityScale { scale: u8 },
    SongCvBendRange { bend_range: u8 },
    SongCvGatePairs { pairs: u8 },
    SongCvGatePairMode { pair: u8, mode: u8 },
    SongCvOutputScaling { output: u8, mode: u8 },
    SongCvCal { channel: u8, cal: i16 },
    SongCvOffset { channel: u8, offset: i16 },
    SongMidiPortClockOut { port: u8, ppq: u8 },
    SongMidiClockSource { source: u8 },
    SongMidiRemoteCtrl { enable: bool },
    SongMidiAutolive { enable: bool },
    SongListScene { entry: u8, scene: u8 },
    SongListLength { entry: u8, length: u8 },
    SongListKbtrans { entry: u8, kbtrans: i8 },
    SongMidiProgram { track: u8, map_num: u8, program: u8 },
    SongMidiPortMap { track: u8, map_num: u8, port: u8 },
    SongMidiChannelMap { track: u8, map_num: u8, channel: u8 },
    SongKeySplit { track: u8, mode: u8 },
    SongTrackType { track: u8, mode: u8 },
    SongStepLen { scene: u8, track: u8, length: u8 },
    SongTonality { scene: u8, track: u8, tonality: u8 },
    SongTranspose { scene: u8, track: u8, transpose: i8 },
    SongBiasTrack { scene: u8, track: u8, bias_track: i8 },
    SongMotionStart { scene: u8, track: u8, start: u8 },
    SongMotionLength { scene: u8, track: u8, length: u8 },
    SongGateTime { scene: u8, track: u8, time: u8 },
    SongPatternType { scene: u8, track: u8, pattern: u8 },
    SongMotionDir { scene: u8, track: u8, reverse: bool },
    SongMute { scene: u8, track: u8, mute: bool },
    SongArpType { scene: u8, track: u8, arp_type: u8 },
    SongArpSpeed { scene: u8, track: u8, speed: u8 },
    SongArpGateTime { scene: u8, track: u8, time: u8 },
    SongArpEnable { scene: u8, track: u8, enable: bool },
    SongClearStep { scene: u8, track: u8, step: u8 },
    SongClearStepEvent { scene: u8, track: u8, step: u8 },
    SongAddStepEvent { scene: u8, track: u8, step: u8 },
    SongSetStepEvent { scene: u8, track: u8, step: u8 },
    SongStartDelay { scene: u8, track: u8, step: u8 },
    SongRatchetMode { scene: u8, track: u8, step: u8 },
    SongSceneSync { enable: bool },
    SongMagicRange { range: u8 },
    SongMagicChance { chance: u8 },

    // control events
    CtrlRunState { state: RunState },
    CtrlTrackSelect { track: u8, select: bool },
    CtrlFirstTrack { track: u8 },
    CtrlSongMode { song_mode: bool },
    CtrlLiveMode { live_mode: u8 },
    CtrlRecordMode { record_mode: u8 },
    CtrlClockBeat,
    CtrlExtTempo,
    CtrlExtSync { ext_synced: bool },

    // engine events
    EngCurrentScene { scene: u8 },
    EngActiveStep { track: u8, step: u8 },
    EngSongModeStatus,
    EngKbtrans { trans: i8 },

    // config events
    ConfigLoaded,
    ConfigCleared,

    // power events
    PowerState { state: u8 },
}

impl Event {
    pub fn class(&self) -> EventClass {
        match self {
            Event::SongCleared { .. }
            | Event::SongLoaded { .. }
            | Event::SongLoadError { .. }
            | Event::SongSaved { .. }
            | Event::SongSaveError { .. }
            | Event::SongTempo
            | Event::SongSwing { .. }
            | Event::SongMetronomeMode { .. }
            | Event::SongMetronomeSoundLen { .. }
            | Event::SongKeyVelocityScale { .. }
            | Event::SongCvBendRange { .. }
            | Event::SongCvGatePairs { .. }
            | Event::SongCvGatePairMode { .. }
            | Event::SongCvOutputScaling { .. }
            | Event::SongCvCal { .. }
            | Event::SongCvOffset { .. }
            | Event::SongMidiPortClockOut { .. }
            | Event::SongMidiClockSource { .. }
            | Event::SongMidiRemoteCtrl { .. }
            | Event::SongMidiAutolive { .. }
            | Event::SongListScene { .. }
            | Event::SongListLength { .. }
            | Event::SongListKbtrans { .. }
            | Event::SongMidiProgram { .. }
            | Event::SongMidiPortMap { .. }
            | Event::SongMidiChannelMap { .. }
            | Event::SongKeySplit { .. }
            | Event::SongTrackType { .. }
            | Event::SongStepLen { .. }
            | Event::SongTonality { .. }
            | Event::SongTranspose { .. }
            | Event::SongBiasTrack { .. }
            | Event::SongMotionStart { .. }
            | Event::SongMotionLength { .. }
            | Event::SongGateTime { .. }
            | Event::SongPatternType { .. }
            | Event::SongMotionDir { .. }
            | Event::SongMute { .. }
            | Event::SongArpType { .. }
            | Event::SongArpSpeed { .. }
            | Event::SongArpGateTime { .. }
            | Event::SongArpEnable { .. }
            | Event::SongClearStep { .. }
            | Event::SongClearStepEvent { .. }
            | Event::SongAddStepEvent { .. }
            | Event::SongSetStepEvent { .. }
            | Event::SongStartDelay { .. }
            | Event::SongRatchetMode { .. }
            | Event::SongSceneSync { .. }
            | Event::SongMagicRange { .. }
            | Event::SongMagicChance { .. } => EventClass::Song,

            Event::CtrlRunState { .. }
            | Event::CtrlTrackSelect { .. }
            | Event::CtrlFirstTrack { .. }
            | Event::CtrlSongMode { .. }
            | Event::CtrlLiveMode { .. }
            | Event::CtrlRecordMode { .. }
            | Event::CtrlClockBeat
            | Event::CtrlExtTempo
            | Event::CtrlExtSync { .. } => EventClass::Ctrl,

            Event::EngCurrentScene { .. }
            | Event::EngActiveStep { .. }
            | Event::EngSongModeStatus
            | Event::EngKbtrans { .. } => EventClass::Eng,

            Event::ConfigLoaded | Event::ConfigCleared => EventClass::Config,

            Event::PowerState { .. } => EventClass::Power,
        }
    }
}

#[derive(Debug, defmt::Format)]
pub enum EventBusError {
    TooManySubscribers,
}

/// A subscriber is invoked for every event in its registered class, in the
/// order it was fired. Handlers must not re-enter `fire` (no module in this
/// crate does; the bus doesn't defend against it because the original
/// firmware never needed to).
type Handler = Box<dyn FnMut(&Event) + Send>;

pub struct EventBus {
    subscribers: Vec<(EventClass, Handler), MAX_SUBSCRIBERS>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus {
            subscribers: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        class: EventClass,
        handler: impl FnMut(&Event) + Send + 'static,
    ) -> Result<(), EventBusError> {
        self.subscribers
            .push((class, Box::new(handler)))
            .map_err(|_| EventBusError::TooManySubscribers)
    }

    pub fn fire(&mut self, event: Event) {
        let class = event.class();
        for (sub_class, handler) in self.subscribers.iter_mut() {
            if *sub_class == class {
                handler(&event);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fires_only_to_matching_class() {
        let song_hits = Arc::new(AtomicU32::new(0));
        let ctrl_hits = Arc::new(AtomicU32::new(0));

        let mut bus = EventBus::new();
        let song_hits_clone = song_hits.clone();
        bus.register(EventClass::Song, move |_e| {
            song_hits_clone.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        let ctrl_hits_clone = ctrl_hits.clone();
        bus.register(EventClass::Ctrl, move |_e| {
            ctrl_hits_clone.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        bus.fire(Event::SongTempo);
        bus.fire(Event::SongTempo);
        bus.fire(Event::CtrlClockBeat);

        assert_eq!(song_hits.load(Ordering::Relaxed), 2);
        assert_eq!(ctrl_hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn rejects_subscribers_past_capacity() {
        let mut bus = EventBus::new();
        for _ in 0..MAX_SUBSCRIBERS {
            bus.register(EventClass::Song, |_e| {}).unwrap();
        }
        assert!(matches!(
            bus.register(EventClass::Song, |_e| {}),
            Err(EventBusError::TooManySubscribers)
        ));
    }
}
