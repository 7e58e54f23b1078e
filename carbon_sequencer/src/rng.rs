//! Source of randomness for magic/randomize (`Controller::make_magic`) and
//! the arpeggiator's `Random` ordering (`Arpeggiator::advance`). Neither
//! caller wants a dependency on a concrete RNG — both take a `FnMut() -> u8`
//! closure — so this module only exists to give `carbon_firmware` (and
//! host tests that want something other than a fixed sequence) one
//! concrete source to close over.
//!
//! `target_release` draws noise from the RP2040's ring oscillator, which
//! is free-running and unrelated to the scheduling clock; `host_testing`
//! falls back to `rand`'s thread RNG so `cargo test` runs without a board
//! attached.

#[cfg(feature = "target_release")]
use rand_core::RngCore;
#[cfg(feature = "target_release")]
use rp2040_hal::rosc::{Enabled, RingOscillator};

pub struct SequencerRng {
    #[cfg(feature = "target_release")]
    rosc: RingOscillator<Enabled>,
}

impl SequencerRng {
    #[cfg(feature = "target_release")]
    pub fn new(rosc: RingOscillator<Enabled>) -> SequencerRng {
        SequencerRng { rosc }
    }

    #[cfg(feature = "host_testing")]
    pub fn new() -> SequencerRng {
        SequencerRng {}
    }

    #[cfg(feature = "target_release")]
    pub fn next_u8(&mut self) -> u8 {
        self.rosc.next_u32() as u8
    }

    #[cfg(feature = "host_testing")]
    pub fn next_u8(&mut self) -> u8 {
        rand::random()
    }
}
