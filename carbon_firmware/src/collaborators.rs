//! Trait boundaries for the external collaborators this crate puts out of
//! scope: panel LED/keypad scanning, LCD graphics rendering, SPI flash
//! block I/O (besides the [`carbon_sequencer::block_device::BlockDevice`]
//! contract the core already defines) and power control. This crate wires
//! `carbon_sequencer` to concrete RP2040 peripherals for MIDI and timing
//! (the pieces the core genuinely needs to exist), and to these traits for
//! everything else — a board bring-up can satisfy them with the `No*`
//! stand-ins below until a real panel/LCD/power driver lands.

/// One observed panel input since the last scan: a button edge or an
/// encoder detent. `id` is a panel-specific index; this crate does not
/// interpret it, it only routes callers to `Controller`.
#[derive(Clone, Copy, Debug, defmt::Format)]
pub enum PanelEvent {
    Button { id: u8, pressed: bool },
    Encoder { id: u8, delta: i8 },
}

/// Row/column keypad and encoder scanning. The out-of-scope panel driver
/// collaborator.
pub trait PanelInput {
    /// Poll once per panel-scan tick; returns every edge seen since the
    /// last call, oldest first.
    fn poll(&mut self) -> heapless::Vec<PanelEvent, 8>;

    /// Drive the step/mute LED matrix. No drawing algorithm lives here —
    /// callers pass the already-computed on/off bits.
    fn set_leds(&mut self, bits: &[u8]);
}

/// LCD presentation boundary. No graphics primitives are defined here;
/// a menu/UI module outside this crate owns pixel layout and would hand
/// this trait a finished frame buffer to push out over FSMC/SPI.
pub trait Lcd {
    fn present(&mut self, frame: &[u8]);
}

/// One CV+gate output pair, addressed the same way
/// [`carbon_sequencer::cv_proc::CvProcessor`] addresses its outputs.
pub trait CvDacWriter {
    /// Write a 12-bit DAC code (0..=0xfff) to `channel`.
    fn write_cv(&mut self, channel: u8, code: u16);
    fn set_gate(&mut self, channel: u8, high: bool);
}

/// Supply rail monitoring, backing the controller's "Power" error class.
pub trait PowerMonitor {
    fn dc_millivolts(&self) -> u16;
    fn cut_analog_power(&mut self);
}

pub const POWER_CUTOFF_MV: u16 = 8_000;

pub struct NoPanel;
impl PanelInput for NoPanel {
    fn poll(&mut self) -> heapless::Vec<PanelEvent, 8> {
        heapless::Vec::new()
    }
    fn set_leds(&mut self, _bits: &[u8]) {}
}

pub struct NoLcd;
impl Lcd for NoLcd {
    fn present(&mut self, _frame: &[u8]) {}
}

pub struct NoCvDac;
impl CvDacWriter for NoCvDac {
    fn write_cv(&mut self, _channel: u8, _code: u16) {}
    fn set_gate(&mut self, _channel: u8, _high: bool) {}
}

pub struct NoPowerMonitor;
impl PowerMonitor for NoPowerMonitor {
    fn dc_millivolts(&self) -> u16 {
        u16::MAX
    }
    fn cut_analog_power(&mut self) {}
}
