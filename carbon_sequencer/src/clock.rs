//! Clock core: generates the 96-pulse-per-quarter-note (PPQN) tick stream
//! that drives [`crate::engine`], either from a free-running internal
//! tempo or recovered from incoming MIDI clock. Also handles tap tempo and
//! swing.
//!
//! Ground truth: `clock.c`. The original is driven by a 1ms timer task;
//! this port keeps the same shape (`tick_task` called once per
//! `TASK_INTERVAL_US`) but expresses state transitions as plain method
//! calls instead of a single monolithic function, and fires
//! [`crate::event_bus::Event`] instead of `state_change_fire*`.
//!
//! Swing: the original's `swing[][]` lookup table lives in
//! `tables/swing_table.h`, which was not present in the sources this crate
//! was ported from. [`build_swing_table`] regenerates an equivalent table
//! from the documented swing range (50-80%) and the invariant the original
//! table satisfies — each 24-tick sixteenth-note window's pulse counts sum
//! to exactly 24, so every beat always emits exactly `PPQ` ticks regardless
//! of swing. See `DESIGN.md` for the derivation.

use crate::event_bus::{Event, EventBus};
use defmt::Format;
use heapless::HistoryBuffer;

pub const PPQ: u32 = 96;
pub const TASK_INTERVAL_US: u64 = 1_000;

pub const TEMPO_MIN_BPM: f32 = 30.0;
pub const TEMPO_MAX_BPM: f32 = 300.0;
pub const DEFAULT_TEMPO_BPM: f32 = 60.0;

pub const SWING_MIN_PCT: u8 = 50;
pub const SWING_MAX_PCT: u8 = 80;
pub const SWING_LEVELS: usize = (SWING_MAX_PCT - SWING_MIN_PCT + 1) as usize; // 31

const MIDI_UPSAMPLE: u32 = PPQ / 24; // 4: one incoming MIDI tick = 4 internal ticks
const EXTERNAL_HIST_LEN: usize = 8;
const TAP_HIST_LEN: usize = 4;
const EXTERNAL_TIMEOUT_US: u64 = 200_000;
const TAP_TIMEOUT_US: u64 = 2_000_000;
const LOCK_ADJUST_US: i64 = 500;

fn us_per_tick_for_bpm(bpm: f32) -> u64 {
    (60_000_000.0 / (bpm * PPQ as f32)) as u64
}

fn clamp_us_per_tick(v: u64) -> u64 {
    let us_per_tick_min = us_per_tick_for_bpm(TEMPO_MAX_BPM);
    let us_per_tick_max = us_per_tick_for_bpm(TEMPO_MIN_BPM);
    if v < us_per_tick_min {
        us_per_tick_min
    } else if v > us_per_tick_max {
        us_per_tick_max
    } else {
        v
    }
}

/// `table[swing_level][tick % PPQ]` gives the number of sequencer pulses
/// (0, 1, or a short burst) to emit for that tick position. Built once at
/// startup; see module docs for the derivation.
pub fn build_swing_table() -> [[u8; PPQ as usize]; SWING_LEVELS] {
    let mut table = [[1u8; PPQ as usize]; SWING_LEVELS];
    for level in 0..SWING_LEVELS {
        let swing_pct = SWING_MIN_PCT as i32 + level as i32;
        // delay_ticks in 0..=11: how far into the off-beat window the
        // pulse is held back.
        let delay_ticks = (((swing_pct - 50) * 12) / 30).clamp(0, 11) as usize;
        let row = &mut table[level];
        for window in 0..4 {
            let base = window * 24;
            if window % 2 == 1 {
                for t in 0..delay_ticks {
                    row[base + t] = 0;
                }
                row[base + delay_ticks] = 1 + delay_ticks as u8;
                // remaining ticks in the window stay at the default weight of 1
            }
        }
    }
    table
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Format)]
pub enum ClockSource {
    Internal,
    External,
}

pub struct Clock {
    swing_table: [[u8; PPQ as usize]; SWING_LEVELS],
    source: ClockSource,
    desired_run_state: bool,
    run_state: bool,
    current_swing: usize,
    next_swing: usize,

    time_count: u64,
    next_tick_time: u64,

    run_tick_count: u32,
    stop_tick_count: u32,
    int_us_per_tick: u64,

    ext_us_per_tick: u64,
    ext_generate_tick_count: u32,
    ext_generate_run_tick_pos: u32,
    ext_tick_pending: bool,
    ext_continue_pending: bool,

    ext_recover_last_tick: u64,
    ext_recover_run_tick_pos: u32,
    ext_recover_tick_count: u32,
    ext_recover_hist_pos: u32,
    ext_recover_hist: HistoryBuffer<u64, EXTERNAL_HIST_LEN>,

    tap_pending: bool,
    tap_last_tap: u64,
    tap_hist_count: u32,
    tap_hist: HistoryBuffer<u64, TAP_HIST_LEN>,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            swing_table: build_swing_table(),
            source: ClockSource::Internal,
            desired_run_state: false,
            run_state: false,
            current_swing: 0,
            next_swing: 0,
            time_count: 0,
            next_tick_time: 0,
            run_tick_count: 0,
            stop_tick_count: 0,
            int_us_per_tick: us_per_tick_for_bpm(DEFAULT_TEMPO_BPM),
            ext_us_per_tick: us_per_tick_for_bpm(DEFAULT_TEMPO_BPM),
            ext_generate_tick_count: 0,
            ext_generate_run_tick_pos: 0,
            ext_tick_pending: false,
            ext_continue_pending: false,
            ext_recover_last_tick: 0,
            ext_recover_run_tick_pos: 0,
            ext_recover_tick_count: 0,
            ext_recover_hist_pos: 0,
            ext_recover_hist: HistoryBuffer::new(),
            tap_pending: false,
            tap_last_tap: 0,
            tap_hist_count: 0,
            tap_hist: HistoryBuffer::new(),
        }
    }

    pub fn source(&self) -> ClockSource {
        self.source
    }

    pub fn running(&self) -> bool {
        self.run_state
    }

    pub fn tick_pos(&self) -> u32 {
        if self.run_state {
            self.run_tick_count
        } else {
            self.stop_tick_count
        }
    }

    pub fn tempo_bpm(&self) -> f32 {
        60_000_000.0 / (PPQ as f32) / (self.int_us_per_tick as f32)
    }

    pub fn set_tempo_bpm(&mut self, bpm: f32) {
        self.int_us_per_tick = us_per_tick_for_bpm(bpm.clamp(TEMPO_MIN_BPM, TEMPO_MAX_BPM));
    }

    /// `swing` is 50-80 (percent); clamps to range.
    pub fn set_swing(&mut self, swing: u8) {
        self.next_swing = swing.clamp(SWING_MIN_PCT, SWING_MAX_PCT) as usize - SWING_MIN_PCT as usize;
    }

    pub fn set_running(&mut self, running: bool) {
        match self.source {
            ClockSource::Internal => self.desired_run_state = running,
            ClockSource::External => {
                if !running {
                    self.run_state = false;
                    self.ext_generate_tick_count = self.ext_recover_tick_count;
                }
            }
        }
    }

    pub fn reset_pos(&mut self) {
        self.run_tick_count = 0;
        self.stop_tick_count = 0;
        self.ext_generate_run_tick_pos = 0;
        self.ext_recover_run_tick_pos = 0;
    }

    pub fn tap_tempo(&mut self) {
        self.tap_pending = true;
    }

    // external clock inputs

    pub fn midi_rx_tick(&mut self) {
        self.ext_tick_pending = true;
    }

    pub fn midi_rx_start(&mut self, bus: &mut EventBus) {
        self.run_state = true;
        self.reset_pos();
        bus.fire(Event::CtrlRunState {
            state: crate::event_bus::RunState::Running,
        });
    }

    pub fn midi_rx_continue(&mut self) {
        self.ext_continue_pending = true;
    }

    pub fn midi_rx_stop(&mut self, bus: &mut EventBus) {
        self.run_state = false;
        self.ext_generate_tick_count = self.ext_recover_tick_count;
        bus.fire(Event::CtrlRunState {
            state: crate::event_bus::RunState::Stopped,
        });
    }

    fn set_source(&mut self, source: ClockSource) {
        self.source = source;
    }

    /// Advance by one `TASK_INTERVAL_US` step. `on_tick(tick_count)` is
    /// invoked once per generated sequencer pulse, in order, exactly like
    /// the original's calls to `seq_ctrl_clock_tick`.
    pub fn tick_task(&mut self, bus: &mut EventBus, mut on_tick: impl FnMut(u32)) {
        self.time_count += TASK_INTERVAL_US;

        match self.source {
            ClockSource::Internal => self.run_internal(bus, &mut on_tick),
            ClockSource::External => self.run_external(bus, &mut on_tick),
        }

        self.recover_external_clock(bus);
        self.recover_tap_tempo();
    }

    fn run_internal(&mut self, bus: &mut EventBus, on_tick: &mut impl FnMut(u32)) {
        if self.time_count <= self.next_tick_time {
            return;
        }
        if self.run_state != self.desired_run_state {
            self.run_state = self.desired_run_state;
            if !self.run_state {
                self.stop_tick_count = self.run_tick_count;
            }
        }
        let mut tick_count = if self.run_state {
            self.run_tick_count
        } else {
            self.stop_tick_count
        };

        if tick_count % PPQ == 0 {
            if self.current_swing != self.next_swing {
                self.current_swing = self.next_swing;
            }
            bus.fire(Event::CtrlClockBeat);
        }

        let pulses = self.swing_table[self.current_swing][(tick_count % PPQ) as usize];
        for _ in 0..pulses {
            on_tick(tick_count);
        }
        tick_count += 1;
        self.next_tick_time += self.int_us_per_tick;

        if self.run_state {
            self.run_tick_count = tick_count;
        } else {
            self.stop_tick_count = tick_count;
        }
    }

    fn run_external(&mut self, bus: &mut EventBus, on_tick: &mut impl FnMut(u32)) {
        if self.time_count <= self.next_tick_time {
            return;
        }
        let pulses =
            self.swing_table[self.current_swing][(self.ext_generate_run_tick_pos % PPQ) as usize];
        for _ in 0..pulses {
            if self.run_state {
                on_tick(self.ext_generate_run_tick_pos);
            } else {
                on_tick(self.ext_generate_tick_count);
            }
        }

        let error: i64 = if self.run_state {
            if self.ext_generate_run_tick_pos % PPQ == 0 {
                if self.current_swing != self.next_swing {
                    self.current_swing = self.next_swing;
                }
                bus.fire(Event::CtrlClockBeat);
            }
            self.ext_generate_run_tick_pos += 1;
            self.ext_recover_run_tick_pos as i64 - self.ext_generate_run_tick_pos as i64
        } else {
            self.ext_generate_tick_count += 1;
            self.ext_recover_tick_count as i64 - self.ext_generate_tick_count as i64
        };

        let base = self.ext_us_per_tick as i64;
        self.next_tick_time = (self.next_tick_time as i64
            + match error.cmp(&0) {
                core::cmp::Ordering::Greater => base - LOCK_ADJUST_US,
                core::cmp::Ordering::Less => base + LOCK_ADJUST_US,
                core::cmp::Ordering::Equal => base,
            }) as u64;
    }

    fn recover_external_clock(&mut self, bus: &mut EventBus) {
        if self.ext_tick_pending {
            self.ext_tick_pending = false;
            let period = self.time_count - self.ext_recover_last_tick;
            self.ext_recover_hist.write(period);
            self.ext_recover_last_tick = self.time_count;
            self.ext_recover_hist_pos += 1;
            self.ext_recover_tick_count += MIDI_UPSAMPLE;

            if self.ext_recover_hist_pos as usize > EXTERNAL_HIST_LEN {
                let avg = self.ext_recover_hist.as_slice().iter().sum::<u64>()
                    / self.ext_recover_hist.len() as u64
                    / MIDI_UPSAMPLE as u64;
                self.ext_us_per_tick = clamp_us_per_tick(avg);

                if self.source == ClockSource::Internal {
                    self.set_source(ClockSource::External);
                    self.next_tick_time = self.time_count;
                    self.ext_generate_tick_count = self.ext_recover_tick_count;
                    self.ext_generate_run_tick_pos = 0;
                    self.ext_recover_run_tick_pos = 0;
                }
            }

            if self.ext_continue_pending {
                self.ext_continue_pending = false;
                self.run_state = true;
                bus.fire(Event::CtrlRunState {
                    state: crate::event_bus::RunState::Running,
                });
            } else if self.run_state {
                self.ext_recover_run_tick_pos += MIDI_UPSAMPLE;
            }
        }

        if self.source == ClockSource::External
            && (self.time_count - self.ext_recover_last_tick) > EXTERNAL_TIMEOUT_US
        {
            self.set_source(ClockSource::Internal);
            self.run_state = false;
            bus.fire(Event::CtrlRunState {
                state: crate::event_bus::RunState::Stopped,
            });
        }
    }

    fn recover_tap_tempo(&mut self) {
        if self.tap_pending && self.source == ClockSource::Internal {
            self.tap_pending = false;
            let period = self.time_count - self.tap_last_tap;
            self.tap_hist.write(period);
            self.tap_last_tap = self.time_count;
            self.tap_hist_count += 1;

            if self.tap_hist_count as usize > TAP_HIST_LEN {
                let avg_period =
                    self.tap_hist.as_slice().iter().sum::<u64>() / self.tap_hist.len() as u64;
                let per_tick = avg_period / PPQ as u64;
                self.int_us_per_tick = clamp_us_per_tick(per_tick);
            }
        }
        if self.tap_hist_count > 0 && (self.time_count - self.tap_last_tap) > TAP_TIMEOUT_US {
            self.tap_hist_count = 0;
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swing_table_rows_sum_to_one_pulse_per_tick_per_window() {
        let table = build_swing_table();
        for row in table.iter() {
            for window in 0..4 {
                let sum: u32 = row[window * 24..window * 24 + 24].iter().map(|&v| v as u32).sum();
                assert_eq!(sum, 24, "window {} should always total 24 pulses", window);
            }
            let total: u32 = row.iter().map(|&v| v as u32).sum();
            assert_eq!(total, PPQ);
        }
    }

    #[test]
    fn zero_swing_is_flat() {
        let table = build_swing_table();
        assert!(table[0].iter().all(|&v| v == 1));
    }

    #[test]
    fn internal_clock_generates_ticks_and_fires_beat_at_zero() {
        let mut clock = Clock::new();
        let mut bus = EventBus::new();
        clock.set_running(true);
        clock.set_tempo_bpm(120.0);

        let mut ticks = heapless::Vec::<u32, 512>::new();
        for _ in 0..20_000 {
            clock.tick_task(&mut bus, |t| {
                let _ = ticks.push(t);
            });
        }
        assert!(!ticks.is_empty());
        assert_eq!(ticks[0], 0);
    }

    #[test]
    fn tempo_set_and_get_round_trip_approximately() {
        let mut clock = Clock::new();
        clock.set_tempo_bpm(120.0);
        assert!((clock.tempo_bpm() - 120.0).abs() < 1.0);
    }

    #[test]
    fn external_clock_timeout_falls_back_to_internal() {
        let mut clock = Clock::new();
        let mut bus = EventBus::new();
        // feed enough ticks to switch to external
        for _ in 0..(EXTERNAL_HIST_LEN + 2) {
            clock.midi_rx_tick();
            clock.tick_task(&mut bus, |_| {});
            clock.time_count += 20_000;
        }
        assert_eq!(clock.source(), ClockSource::External);

        // let it go quiet past the timeout
        clock.time_count += EXTERNAL_TIMEOUT_US + 1;
        clock.tick_task(&mut bus, |_| {});
        assert_eq!(clock.source(), ClockSource::Internal);
    }
}
