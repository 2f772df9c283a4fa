//! Bit-exact on-storage record of a [`BootConfig`].
//!
//! ```text
//! off  size field
//! 0    4    magic
//! 4    1    version
//! 5    1    num_slots
//! 6    1    active_slot
//! 7    1    revert_slot (0xff = none)
//! 8    4    flags
//! 12   4    seq
//! 16   4    swap phase, a, b, t (0xff = none)
//! 20   192  MAX_SLOTS slot records of SLOT_SIZE bytes
//! 212  4    CRC-32 over bytes 0..212
//! ```
//!
//! All integers are little endian.

use crate::{
    Error,
    device::{DEVICE_NAME_LEN, DeviceName},
    engine::CRC32,
    state::{
        BootConfig, BootFlags, MAX_SLOTS, Slot, SlotConfig, SlotFlags, SlotIndex, SlotState,
        SwapState,
    },
};

pub const CONFIG_MAGIC: u32 = 0x4742_4F4D;
pub const CONFIG_VERSION: u8 = 1;

pub const HEADER_SIZE: usize = 20;
pub const SLOT_SIZE: usize = 48;
const CRC_OFFSET: usize = HEADER_SIZE + MAX_SLOTS * SLOT_SIZE;
pub const RECORD_SIZE: usize = CRC_OFFSET + 4;

const NONE: u8 = 0xff;

/// Slot state flag: `app_crc32` holds a recorded checksum.
const STATE_HAS_CRC: u32 = 1 << 0;

/// Persisted tag of a [`SwapState`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SwapPhase {
    Idle = 0,
    Init = 1,
    CopyAT = 2,
    CopyBA = 3,
    CopyTB = 4,
    Commit = 5,
}

impl SwapPhase {
    pub const fn of(swap: &SwapState) -> Self {
        match swap {
            SwapState::Idle => SwapPhase::Idle,
            SwapState::Init { .. } => SwapPhase::Init,
            SwapState::CopyAT { .. } => SwapPhase::CopyAT,
            SwapState::CopyBA { .. } => SwapPhase::CopyBA,
            SwapState::CopyTB { .. } => SwapPhase::CopyTB,
            SwapState::Commit { .. } => SwapPhase::Commit,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => SwapPhase::Idle,
            1 => SwapPhase::Init,
            2 => SwapPhase::CopyAT,
            3 => SwapPhase::CopyBA,
            4 => SwapPhase::CopyTB,
            5 => SwapPhase::Commit,
            _ => return None,
        })
    }
}

struct Writer<'a> {
    buf: &'a mut [u8; RECORD_SIZE],
    pos: usize,
}

impl Writer<'_> {
    fn bytes(&mut self, data: &[u8]) {
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }

    fn u8(&mut self, value: u8) {
        self.bytes(&[value]);
    }

    fn u32(&mut self, value: u32) {
        self.bytes(&value.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8; RECORD_SIZE],
    pos: usize,
}

impl Reader<'_> {
    fn array<const L: usize>(&mut self) -> [u8; L] {
        let mut res = [0u8; L];
        res.copy_from_slice(&self.buf[self.pos..self.pos + L]);
        self.pos += L;
        res
    }

    fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }
}

fn index_code(index: Option<SlotIndex>) -> u8 {
    index.map_or(NONE, |index| index.0)
}

fn index_from_code(code: u8) -> Option<SlotIndex> {
    (code != NONE).then_some(SlotIndex(code))
}

/// Serialize `config` as generation `seq`.
pub fn encode(config: &BootConfig, seq: u32) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    let mut w = Writer {
        buf: &mut buf,
        pos: 0,
    };

    w.u32(CONFIG_MAGIC);
    w.u8(CONFIG_VERSION);
    w.u8(config.num_slots);
    w.u8(config.active_slot.0);
    w.u8(index_code(config.revert_slot));
    w.u32(config.flags.bits());
    w.u32(seq);

    let [a, b, t] = config.swap.slots();
    w.u8(SwapPhase::of(&config.swap) as u8);
    w.u8(index_code(a));
    w.u8(index_code(b));
    w.u8(index_code(t));

    for slot in config.slots.iter() {
        w.bytes(slot.config.app_dev.as_bytes());
        w.bytes(slot.config.fs_dev.as_bytes());
        w.u32(slot.config.flags.bits());
        w.u32(slot.config.app_map_addr);
        w.u32(slot.state.app_org);
        w.u32(slot.state.app_len);
        w.u32(slot.state.app_crc32.unwrap_or(0));
        w.u32(slot.state.app_flags);
        w.u32(slot.state.err_count);
        w.u32(if slot.state.app_crc32.is_some() {
            STATE_HAS_CRC
        } else {
            0
        });
    }

    let crc = CRC32.checksum(&buf[..CRC_OFFSET]);
    buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Deserialize a record, returning the configuration and its generation.
///
/// Anything that does not pass the magic, version, CRC and range checks is
/// [`Error::CorruptConfig`].
pub fn decode(buf: &[u8; RECORD_SIZE]) -> Result<(BootConfig, u32), Error> {
    let stored_crc = u32::from_le_bytes([
        buf[CRC_OFFSET],
        buf[CRC_OFFSET + 1],
        buf[CRC_OFFSET + 2],
        buf[CRC_OFFSET + 3],
    ]);

    let mut r = Reader { buf, pos: 0 };
    if r.u32() != CONFIG_MAGIC || r.u8() != CONFIG_VERSION {
        return Err(Error::CorruptConfig);
    }
    if CRC32.checksum(&buf[..CRC_OFFSET]) != stored_crc {
        return Err(Error::CorruptConfig);
    }

    let num_slots = r.u8();
    if num_slots == 0 || num_slots as usize > MAX_SLOTS {
        return Err(Error::CorruptConfig);
    }

    let active_slot = SlotIndex(r.u8());
    let revert_slot = index_from_code(r.u8());
    let flags = BootFlags::from_bits(r.u32()).ok_or(Error::CorruptConfig)?;
    let seq = r.u32();

    let phase = SwapPhase::from_code(r.u8()).ok_or(Error::CorruptConfig)?;
    let a = index_from_code(r.u8());
    let b = index_from_code(r.u8());
    let t = index_from_code(r.u8());
    let swap = match (phase, a, b, t) {
        (SwapPhase::Idle, None, None, None) => SwapState::Idle,
        (SwapPhase::Init, Some(a), Some(b), None) => SwapState::Init { a, b },
        (SwapPhase::CopyAT, Some(a), Some(b), Some(t)) => SwapState::CopyAT { a, b, t },
        (SwapPhase::CopyBA, Some(a), Some(b), Some(t)) => SwapState::CopyBA { a, b, t },
        (SwapPhase::CopyTB, Some(a), Some(b), Some(t)) => SwapState::CopyTB { a, b, t },
        (SwapPhase::Commit, Some(a), Some(b), Some(t)) => SwapState::Commit { a, b, t },
        _ => return Err(Error::CorruptConfig),
    };

    let mut slots = [Slot::default(); MAX_SLOTS];
    for slot in slots.iter_mut() {
        let app_dev = DeviceName::from_bytes(r.array::<DEVICE_NAME_LEN>())
            .map_err(|_| Error::CorruptConfig)?;
        let fs_dev = DeviceName::from_bytes(r.array::<DEVICE_NAME_LEN>())
            .map_err(|_| Error::CorruptConfig)?;
        let flags = SlotFlags::from_bits(r.u32()).ok_or(Error::CorruptConfig)?;
        let app_map_addr = r.u32();
        let app_org = r.u32();
        let app_len = r.u32();
        let app_crc32 = r.u32();
        let app_flags = r.u32();
        let err_count = r.u32();
        let state_flags = r.u32();

        *slot = Slot {
            config: SlotConfig::new(app_dev, fs_dev, flags, app_map_addr),
            state: SlotState {
                app_org,
                app_len,
                app_crc32: (state_flags & STATE_HAS_CRC != 0).then_some(app_crc32),
                app_flags,
                err_count,
            },
        };
    }

    let config = BootConfig {
        num_slots,
        slots,
        active_slot,
        revert_slot,
        flags,
        swap,
    };
    config.validate()?;

    Ok((config, seq))
}

/// Whether generation `a` is newer than `b`, allowing for wrap-around.
pub const fn is_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
