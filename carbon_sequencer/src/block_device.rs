//! Abstract boundary for external flash storage.
//!
//! [`SongStore`](crate::song::SongStore) and [`ConfigStore`](crate::config_store::ConfigStore)
//! both persist through a [`BlockDevice`] rather than talking to SPI flash
//! directly. A concrete driver (SPI NOR flash, a host-side file, a RAM disk
//! for tests) lives outside this crate and is wired in by the firmware
//! binary; this module only defines the contract and the async state
//! machine both stores poll against it, mirroring the original firmware's
//! `ext_flash` job queue.

use defmt::Format;

/// One outstanding load or save. `BlockDevice` implementations drive this
/// to completion across repeated calls to `poll`; callers re-poll until a
/// terminal state (`Idle`, `LoadError`, `SaveError`) is observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Format)]
pub enum BlockDeviceState {
    Idle,
    Loading,
    LoadError,
    LoadDone,
    Saving,
    SavingNoErase,
    SaveError,
    SaveDone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Format)]
pub enum BlockDeviceError {
    /// Another operation is already in flight.
    Busy,
    /// `addr + len` runs past the end of the device.
    OutOfRange,
}

/// A single erase-and-program region of external storage, addressed in
/// bytes. Implementations are expected to be non-blocking: `load`/`save`
/// start the operation and return immediately, `poll` advances it and
/// returns the current state, and `read_into`/write happen between `poll`
/// calls however the concrete driver likes (DMA, SPI bit-banging, a
/// `std::fs` file when under `host_testing`).
pub trait BlockDevice {
    /// Total addressable size of the device, in bytes.
    fn capacity(&self) -> u32;

    /// Smallest unit that can be erased independently.
    fn sector_size(&self) -> u32;

    /// Begin loading `buf.len()` bytes starting at `addr` into `buf`.
    /// Returns `Busy` if an operation is already in flight.
    fn load(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BlockDeviceError>;

    /// Begin saving `buf` to `addr`, erasing the covering sector(s) first.
    fn save(&mut self, addr: u32, buf: &[u8]) -> Result<(), BlockDeviceError>;

    /// Begin saving `buf` to `addr` without erasing first. Used for
    /// appending a new wear-leveling revision into a sector that is known
    /// to already be erased.
    fn save_noerase(&mut self, addr: u32, buf: &[u8]) -> Result<(), BlockDeviceError>;

    /// Erase one sector starting at `addr` (which must be sector-aligned).
    fn erase_sector(&mut self, addr: u32) -> Result<(), BlockDeviceError>;

    /// Advance the in-flight operation, if any, and report its state.
    /// Implementations that complete synchronously (e.g. a RAM-backed
    /// device used in host tests) may jump straight to `LoadDone`/
    /// `SaveDone` on the first poll after `load`/`save`.
    fn poll(&mut self) -> BlockDeviceState;
}

#[cfg(test)]
pub(crate) mod ram_disk {
    //! A synchronous, in-memory [`BlockDevice`] used by the store tests in
    //! this crate. Never compiled outside `cfg(test)`.
    use super::*;
    use heapless::Vec;

    pub const RAM_DISK_SIZE: usize = 64 * 1024;
    pub const RAM_DISK_SECTOR_SIZE: u32 = 4096;

    pub struct RamDisk {
        data: Vec<u8, RAM_DISK_SIZE>,
        pending: Option<(PendingOp, u32, usize)>,
        state: BlockDeviceState,
    }

    enum PendingOp {
        Load,
        Save,
    }

    impl RamDisk {
        pub fn new() -> RamDisk {
            let mut data = Vec::new();
            data.resize(RAM_DISK_SIZE, 0xff).unwrap();
            RamDisk {
                data,
                pending: None,
                state: BlockDeviceState::Idle,
            }
        }
    }

    impl BlockDevice for RamDisk {
        fn capacity(&self) -> u32 {
            RAM_DISK_SIZE as u32
        }

        fn sector_size(&self) -> u32 {
            RAM_DISK_SECTOR_SIZE
        }

        fn load(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BlockDeviceError> {
            if self.pending.is_some() {
                return Err(BlockDeviceError::Busy);
            }
            if addr as usize + buf.len() > self.data.len() {
                return Err(BlockDeviceError::OutOfRange);
            }
            buf.copy_from_slice(&self.data[addr as usize..addr as usize + buf.len()]);
            self.pending = Some((PendingOp::Load, addr, buf.len()));
            self.state = BlockDeviceState::Loading;
            Ok(())
        }

        fn save(&mut self, addr: u32, buf: &[u8]) -> Result<(), BlockDeviceError> {
            self.erase_sector(addr & !(RAM_DISK_SECTOR_SIZE - 1))?;
            self.save_noerase(addr, buf)
        }

        fn save_noerase(&mut self, addr: u32, buf: &[u8]) -> Result<(), BlockDeviceError> {
            if self.pending.is_some() {
                return Err(BlockDeviceError::Busy);
            }
            if addr as usize + buf.len() > self.data.len() {
                return Err(BlockDeviceError::OutOfRange);
            }
            self.data[addr as usize..addr as usize + buf.len()].copy_from_slice(buf);
            self.pending = Some((PendingOp::Save, addr, buf.len()));
            self.state = BlockDeviceState::Saving;
            Ok(())
        }

        fn erase_sector(&mut self, addr: u32) -> Result<(), BlockDeviceError> {
            let start = addr as usize;
            let end = start + RAM_DISK_SECTOR_SIZE as usize;
            if end > self.data.len() {
                return Err(BlockDeviceError::OutOfRange);
            }
            for b in &mut self.data[start..end] {
                *b = 0xff;
            }
            Ok(())
        }

        fn poll(&mut self) -> BlockDeviceState {
            if let Some((op, _, _)) = self.pending.take() {
                self.state = match op {
                    PendingOp::Load => BlockDeviceState::LoadDone,
                    PendingOp::Save => BlockDeviceState::SaveDone,
                };
            }
            self.state
        }
    }
}
