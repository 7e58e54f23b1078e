#![cfg_attr(not(test), no_std)]

//! The hardware-independent core of a CARBON-style step sequencer: the
//! song data model, its flash-backed persistence, the playback engine,
//! CV/gate and MIDI output processing, and the controller surface that
//! mediates panel and MIDI-remote edits. `carbon_firmware` wires these
//! modules to a particular board; everything in this crate is plain
//! Rust and runs equally well under `cargo test` on the host.

extern crate alloc;

pub mod arp;
pub mod block_device;
pub mod clock;
pub mod config_store;
pub mod controller;
pub mod cv_proc;
pub mod engine;
pub mod event_bus;
pub mod outproc;
pub mod pattern;
pub mod rng;
pub mod scale;
pub mod song;
pub mod sysex;
