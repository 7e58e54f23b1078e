//! Stand-in for the external SPI NOR flash driver: out of scope here, so
//! this always-fails implementation lets `SongStore` and `ConfigStore`
//! run their full state machine on hardware that has no flash wired up
//! yet, exercising the `LOAD_ERROR`/`clear()` recovery path rather than
//! silently skipping flash I/O.

use carbon_sequencer::block_device::{BlockDevice, BlockDeviceError, BlockDeviceState};

pub struct NullFlash {
    capacity: u32,
    sector_size: u32,
    pending_error: bool,
}

impl NullFlash {
    pub fn new(capacity: u32, sector_size: u32) -> NullFlash {
        NullFlash {
            capacity,
            sector_size,
            pending_error: false,
        }
    }
}

impl BlockDevice for NullFlash {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn load(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BlockDeviceError> {
        if addr + buf.len() as u32 > self.capacity {
            return Err(BlockDeviceError::OutOfRange);
        }
        self.pending_error = true;
        Ok(())
    }

    fn save(&mut self, addr: u32, buf: &[u8]) -> Result<(), BlockDeviceError> {
        if addr + buf.len() as u32 > self.capacity {
            return Err(BlockDeviceError::OutOfRange);
        }
        self.pending_error = true;
        Ok(())
    }

    fn save_noerase(&mut self, addr: u32, buf: &[u8]) -> Result<(), BlockDeviceError> {
        self.save(addr, buf)
    }

    fn erase_sector(&mut self, _addr: u32) -> Result<(), BlockDeviceError> {
        Ok(())
    }

    fn poll(&mut self) -> BlockDeviceState {
        if self.pending_error {
            self.pending_error = false;
            BlockDeviceState::LoadError
        } else {
            BlockDeviceState::Idle
        }
    }
}
