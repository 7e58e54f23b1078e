//! Bit-exact SYSEX remote-control protocol.
//!
//! Ground truth: `seq/sysex.c`. A manufacturer-prefixed command set lets a
//! host read/write the external flash directly and query/restart the
//! device; nibble-packed addresses and payload bytes are the original's
//! wire format and are reproduced unchanged here. This module only builds
//! and parses the message bytes and drives `ConfigStore`/a raw
//! [`BlockDevice`] region through them — it owns no transport of its own,
//! matching the port-tagged, transport-agnostic way the rest of this crate
//! treats MIDI I/O.

use heapless::Vec;

use crate::block_device::{BlockDevice, BlockDeviceState};
use crate::config_store::ConfigStore;

pub const MMA_ID: [u8; 3] = [0x00, 0x01, 0x72];
pub const DEV_TYPE: u8 = 0x49;

const CMD_ERROR: u8 = 0x01;
const CMD_WIPE_CONFIG_STORE: u8 = 0x6f;
const CMD_READ_EXT_FLASH: u8 = 0x70;
const CMD_READBACK_EXT_FLASH: u8 = 0x71;
const CMD_WRITE_EXT_FLASH_BUF: u8 = 0x72;
const CMD_WRITE_EXT_FLASH_COMMIT: u8 = 0x73;
const CMD_DEV_TYPE_QUERY: u8 = 0x7c;
const CMD_DEV_TYPE_RESPONSE: u8 = 0x7d;
const CMD_RESTART: u8 = 0x7e;

const ERROR_OK: u8 = 0x01;
const ERROR_BAD_ADDRESS: u8 = 0x02;
const ERROR_BAD_LENGTH: u8 = 0x03;
const ERROR_MALFORMED_MSG: u8 = 0x04;
const ERROR_EXT_FLASH_ERROR: u8 = 0x05;

const SYSEX_START: u8 = 0xf0;
const SYSEX_END: u8 = 0xf7;

pub const MAX_READ_LEN: usize = 64;
/// Longest reply this module ever assembles: header (6) + addr (6 nibbles)
/// + len (1) + up to 64 bytes as 2 nibbles each + end (1).
pub const MAX_REPLY_LEN: usize = 6 + 6 + 1 + MAX_READ_LEN * 2 + 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum SysexError {
    Malformed,
    BadAddress,
    BadLength,
    FlashError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum SysexOutcome {
    /// Command handled synchronously; a reply is ready in the buffer
    /// returned by the call that produced this outcome.
    Replied,
    /// A flash read is in flight; call [`SysexHandler::poll_read`] each
    /// tick until it resolves.
    ReadPending,
    /// Restart was requested. The firmware binary should reset the MCU;
    /// the core never does this itself.
    RestartRequested,
}

/// Parses and dispatches one complete SYSEX message (`F0 .. F7` inclusive)
/// against the config store and a raw flash region, matching
/// `sysex_process`/`sysex_handle_msg` in `sysex.c`. This handler is
/// transport-agnostic: callers feed it fully reassembled messages.
pub struct SysexHandler {
    pending_read: Option<PendingRead>,
    write_buf: [u8; EXT_FLASH_SECTOR_SIZE],
}

struct PendingRead {
    addr: u32,
    len: usize,
    buf: [u8; MAX_READ_LEN],
}

/// Size of the staging buffer for a write-then-commit sequence. Matches
/// the original's `io_buf[EXT_FLASH_SECTOR_SIZE]` staging area.
pub const EXT_FLASH_SECTOR_SIZE: usize = 4096;

impl SysexHandler {
    pub fn new() -> SysexHandler {
        SysexHandler {
            pending_read: None,
            write_buf: [0u8; EXT_FLASH_SECTOR_SIZE],
        }
    }

    pub fn read_pending(&self) -> bool {
        self.pending_read.is_some()
    }

    /// Process one complete SYSEX message. `config_store` and `flash` are
    /// the two things a message can target. A reply, if any, is appended
    /// to `reply`.
    pub fn handle_message(
        &mut self,
        msg: &[u8],
        config_store: &mut ConfigStore,
        flash: &mut impl BlockDevice,
        reply: &mut Vec<u8, MAX_REPLY_LEN>,
    ) -> Result<Option<SysexOutcome>, SysexError> {
        if msg.len() < 6 || msg[0] != SYSEX_START || *msg.last().unwrap() != SYSEX_END {
            return Err(SysexError::Malformed);
        }
        if msg[1..4] != MMA_ID {
            return Err(SysexError::Malformed);
        }

        match msg[4] {
            CMD_DEV_TYPE_QUERY => {
                if msg.len() != 6 {
                    self.push_error(reply, CMD_DEV_TYPE_QUERY, ERROR_MALFORMED_MSG);
                    return Ok(Some(SysexOutcome::Replied));
                }
                self.push_devtype_response(reply);
                Ok(Some(SysexOutcome::Replied))
            }
            CMD_RESTART => {
                if msg.len() != 11
                    || msg[5] != DEV_TYPE
                    || &msg[6..10] != b"KILL"
                {
                    return Ok(None);
                }
                Ok(Some(SysexOutcome::RestartRequested))
            }
            d if d == DEV_TYPE => {
                if msg.len() < 7 {
                    self.push_error(reply, msg.get(5).copied().unwrap_or(0), ERROR_MALFORMED_MSG);
                    return Ok(Some(SysexOutcome::Replied));
                }
                self.handle_device_command(msg, config_store, flash, reply)
            }
            _ => Ok(None),
        }
    }

    fn handle_device_command(
        &mut self,
        msg: &[u8],
        config_store: &mut ConfigStore,
        flash: &mut impl BlockDevice,
        reply: &mut Vec<u8, MAX_REPLY_LEN>,
    ) -> Result<Option<SysexOutcome>, SysexError> {
        let cmd = msg[5];
        match cmd {
            CMD_WIPE_CONFIG_STORE => {
                if msg.len() != 7 {
                    self.push_error(reply, cmd, ERROR_MALFORMED_MSG);
                    return Ok(Some(SysexOutcome::Replied));
                }
                config_store.wipe();
                self.push_error(reply, cmd, ERROR_OK);
                Ok(Some(SysexOutcome::Replied))
            }
            CMD_READ_EXT_FLASH => {
                if msg.len() != 14 {
                    self.push_error(reply, cmd, ERROR_MALFORMED_MSG);
                    return Ok(Some(SysexOutcome::Replied));
                }
                let addr = nibbles_to_addr(&msg[6..12]);
                let len = msg[12] as usize;
                if len == 0 || len > MAX_READ_LEN {
                    self.push_error(reply, cmd, ERROR_BAD_LENGTH);
                    return Ok(Some(SysexOutcome::Replied));
                }
                if addr + len as u32 > flash.capacity() {
                    self.push_error(reply, cmd, ERROR_BAD_ADDRESS);
                    return Ok(Some(SysexOutcome::Replied));
                }
                let mut buf = [0u8; MAX_READ_LEN];
                if flash.load(addr, &mut buf[..len]).is_err() {
                    self.push_error(reply, cmd, ERROR_EXT_FLASH_ERROR);
                    return Ok(Some(SysexOutcome::Replied));
                }
                self.pending_read = Some(PendingRead { addr, len, buf });
                Ok(Some(SysexOutcome::ReadPending))
            }
            CMD_WRITE_EXT_FLASH_BUF => {
                if msg.len() < 16 {
                    self.push_error(reply, cmd, ERROR_MALFORMED_MSG);
                    return Ok(Some(SysexOutcome::Replied));
                }
                let offset = nibbles_to_addr(&msg[6..12]) as usize;
                let len = msg[12] as usize;
                if offset + len > EXT_FLASH_SECTOR_SIZE {
                    self.push_error(reply, cmd, ERROR_BAD_LENGTH);
                    return Ok(Some(SysexOutcome::Replied));
                }
                let payload = &msg[13..13 + len * 2];
                for (i, pair) in payload.chunks_exact(2).enumerate() {
                    self.write_buf[offset + i] = (pair[0] << 4) | (pair[1] & 0x0f);
                }
                self.push_error(reply, cmd, ERROR_OK);
                Ok(Some(SysexOutcome::Replied))
            }
            CMD_WRITE_EXT_FLASH_COMMIT => {
                if msg.len() != 17 {
                    self.push_error(reply, cmd, ERROR_MALFORMED_MSG);
                    return Ok(Some(SysexOutcome::Replied));
                }
                let addr = nibbles_to_addr(&msg[6..12]);
                let len = ((msg[12] as usize & 0x0f) << 12)
                    | ((msg[13] as usize & 0x0f) << 8)
                    | ((msg[14] as usize & 0x0f) << 4)
                    | (msg[15] as usize & 0x0f);
                if len > EXT_FLASH_SECTOR_SIZE || addr + len as u32 > flash.capacity() {
                    self.push_error(reply, cmd, ERROR_BAD_ADDRESS);
                    return Ok(Some(SysexOutcome::Replied));
                }
                if flash.save(addr, &self.write_buf[..len]).is_err() {
                    self.push_error(reply, cmd, ERROR_EXT_FLASH_ERROR);
                    return Ok(Some(SysexOutcome::Replied));
                }
                while matches!(
                    flash.poll(),
                    BlockDeviceState::Saving | BlockDeviceState::SavingNoErase
                ) {}
                self.push_error(reply, cmd, ERROR_OK);
                Ok(Some(SysexOutcome::Replied))
            }
            _ => Ok(None),
        }
    }

    /// Call after a `ReadPending` outcome, once per tick, until it returns
    /// `Some`. On completion appends the `0x71` readback message to `reply`.
    pub fn poll_read(
        &mut self,
        flash: &mut impl BlockDevice,
        reply: &mut Vec<u8, MAX_REPLY_LEN>,
    ) -> Option<Result<(), SysexError>> {
        let state = flash.poll();
        match state {
            BlockDeviceState::Loading => None,
            BlockDeviceState::LoadDone => {
                let read = self.pending_read.take().expect("poll_read with no pending read");
                reply.push(SYSEX_START).ok();
                reply.extend_from_slice(&MMA_ID).ok();
                reply.push(DEV_TYPE).ok();
                reply.push(CMD_READBACK_EXT_FLASH).ok();
                addr_to_nibbles(read.addr, reply);
                reply.push(read.len as u8).ok();
                for &b in &read.buf[..read.len] {
                    reply.push(b >> 4).ok();
                    reply.push(b & 0x0f).ok();
                }
                reply.push(SYSEX_END).ok();
                Some(Ok(()))
            }
            _ => {
                self.pending_read = None;
                Some(Err(SysexError::FlashError))
            }
        }
    }

    fn push_error(&self, reply: &mut Vec<u8, MAX_REPLY_LEN>, cmd: u8, code: u8) {
        reply.push(SYSEX_START).ok();
        reply.extend_from_slice(&MMA_ID).ok();
        reply.push(DEV_TYPE).ok();
        reply.push(CMD_ERROR).ok();
        reply.push(cmd).ok();
        reply.push(code).ok();
        reply.push(SYSEX_END).ok();
    }

    fn push_devtype_response(&self, reply: &mut Vec<u8, MAX_REPLY_LEN>) {
        reply.push(SYSEX_START).ok();
        reply.extend_from_slice(&MMA_ID).ok();
        reply.push(DEV_TYPE).ok();
        reply.push(CMD_DEV_TYPE_RESPONSE).ok();
        reply.push(DEV_TYPE).ok();
        reply.push(SYSEX_END).ok();
    }
}

impl Default for SysexHandler {
    fn default() -> SysexHandler {
        SysexHandler::new()
    }
}

fn nibbles_to_addr(nibbles: &[u8]) -> u32 {
    let mut addr: u32 = 0;
    for &n in nibbles {
        addr = (addr << 4) | (n as u32 & 0x0f);
    }
    addr
}

fn addr_to_nibbles(addr: u32, reply: &mut Vec<u8, MAX_REPLY_LEN>) {
    for shift in (0..6).rev() {
        reply.push(((addr >> (shift * 4)) & 0x0f) as u8).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::ram_disk::RamDisk;

    fn new_store() -> ConfigStore {
        let mut disk = RamDisk::new();
        let mut store = ConfigStore::new(0, 4096, 4);
        store.start_load(&mut disk);
        store
    }

    #[test]
    fn dev_type_query_replies() {
        let mut handler = SysexHandler::new();
        let mut store = new_store();
        let mut flash = RamDisk::new();
        let mut reply = Vec::new();
        let msg = [0xf0, 0x00, 0x01, 0x72, 0x7c, 0xf7];
        let outcome = handler
            .handle_message(&msg, &mut store, &mut flash, &mut reply)
            .unwrap();
        assert_eq!(outcome, Some(SysexOutcome::Replied));
        assert_eq!(
            reply.as_slice(),
            &[0xf0, 0x00, 0x01, 0x72, 0x49, 0x7d, 0x49, 0xf7]
        );
    }

    #[test]
    fn wipe_config_store_clears_values() {
        let mut handler = SysexHandler::new();
        let mut store = new_store();
        store.set_val(3, 99).unwrap();
        let mut flash = RamDisk::new();
        let mut reply = Vec::new();
        let msg = [0xf0, 0x00, 0x01, 0x72, 0x49, 0x6f, 0xf7];
        let outcome = handler
            .handle_message(&msg, &mut store, &mut flash, &mut reply)
            .unwrap();
        assert_eq!(outcome, Some(SysexOutcome::Replied));
        assert_eq!(store.get_val(3).unwrap(), 0);
        assert_eq!(reply[5], ERROR_OK);
    }

    #[test]
    fn read_ext_flash_bad_length_is_rejected() {
        let mut handler = SysexHandler::new();
        let mut store = new_store();
        let mut flash = RamDisk::new();
        let mut reply = Vec::new();
        // addr nibbles all zero, length byte = 0 (invalid).
        let msg = [
            0xf0, 0x00, 0x01, 0x72, 0x49, CMD_READ_EXT_FLASH, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x00,
            0xf7,
        ];
        let outcome = handler
            .handle_message(&msg, &mut store, &mut flash, &mut reply)
            .unwrap();
        assert_eq!(outcome, Some(SysexOutcome::Replied));
        assert_eq!(reply[5], ERROR_BAD_LENGTH);
    }

    #[test]
    fn write_then_commit_round_trips_through_flash() {
        let mut handler = SysexHandler::new();
        let mut store = new_store();
        let mut flash = RamDisk::new();
        let mut reply = Vec::new();

        // write 2 bytes (0xAB, 0xCD) at offset 0.
        let write_msg = [
            0xf0,
            0x00,
            0x01,
            0x72,
            0x49,
            CMD_WRITE_EXT_FLASH_BUF,
            0x0,
            0x0,
            0x0,
            0x0,
            0x0,
            0x0,
            0x02,
            0x0a,
            0x0b,
            0x0c,
            0x0d,
            0xf7,
        ];
        let outcome = handler
            .handle_message(&write_msg, &mut store, &mut flash, &mut reply)
            .unwrap();
        assert_eq!(outcome, Some(SysexOutcome::Replied));
        assert_eq!(reply[5], ERROR_OK);

        reply.clear();
        let commit_msg = [
            0xf0,
            0x00,
            0x01,
            0x72,
            0x49,
            CMD_WRITE_EXT_FLASH_COMMIT,
            0x0,
            0x0,
            0x0,
            0x0,
            0x0,
            0x0,
            0x0,
            0x0,
            0x0,
            0x02,
            0xf7,
        ];
        let outcome = handler
            .handle_message(&commit_msg, &mut store, &mut flash, &mut reply)
            .unwrap();
        assert_eq!(outcome, Some(SysexOutcome::Replied));
        assert_eq!(reply[5], ERROR_OK);

        let mut check = [0u8; 2];
        flash.load(0, &mut check).unwrap();
        while flash.poll() == BlockDeviceState::Loading {}
        assert_eq!(check, [0xab, 0xcd]);
    }

    #[test]
    fn restart_requires_exact_kill_sequence() {
        let mut handler = SysexHandler::new();
        let mut store = new_store();
        let mut flash = RamDisk::new();
        let mut reply = Vec::new();
        let msg = [
            0xf0, 0x00, 0x01, 0x72, CMD_RESTART, DEV_TYPE, b'K', b'I', b'L', b'L', 0xf7,
        ];
        let outcome = handler
            .handle_message(&msg, &mut store, &mut flash, &mut reply)
            .unwrap();
        assert_eq!(outcome, Some(SysexOutcome::RestartRequested));
    }

    #[test]
    fn unknown_mma_id_is_ignored() {
        let mut handler = SysexHandler::new();
        let mut store = new_store();
        let mut flash = RamDisk::new();
        let mut reply = Vec::new();
        let msg = [0xf0, 0x00, 0x01, 0x00, 0x7c, 0xf7];
        let outcome = handler
            .handle_message(&msg, &mut store, &mut flash, &mut reply)
            .unwrap();
        assert_eq!(outcome, None);
    }
}
