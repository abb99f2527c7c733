//! FF-A v1.1 memory transaction and message descriptors (DEN0077A).
//!
//! Descriptors travel through partition mailboxes as little-endian byte
//! images. Parsing never trusts an offset or count: every field is read
//! through a bounds-checked accessor and any inconsistency is reported as
//! `InvalidParameters`.
//!
//! Layout summary (byte offsets):
//!
//! ```text
//! transaction header (48)  sender@0 attributes@2 flags@4 handle@8 tag@16
//!                          access_desc_size@24 receiver_count@28
//!                          receivers_offset@32
//! access descriptor (16)   receiver@0 permissions@2 flags@3 composite_offset@4
//! composite header (16)    total_page_count@0 range_count@4
//! constituent (16)         address@0 page_count@8
//! ```

use heapless::Vec;

use crate::error::{Error, Result};
use crate::ffa::region_index::{Mode, PageRange};
use crate::ffa::PartitionId;
use crate::platform::{MAX_CONSTITUENTS, MAX_RECEIVERS, PAGE_SIZE};

pub const MEM_TRANSACTION_HEADER_SIZE: usize = 48;
pub const MEM_ACCESS_DESC_SIZE: usize = 16;
pub const COMPOSITE_HEADER_SIZE: usize = 16;
pub const CONSTITUENT_SIZE: usize = 16;
pub const PARTITION_INFO_SIZE: usize = 24;
pub const MSG_HEADER_SIZE: usize = 24;
pub const RELINQUISH_HEADER_SIZE: usize = 16;

// ── Byte accessors ───────────────────────────────────────────────────

fn read_u8(buf: &[u8], off: usize) -> Result<u8> {
    buf.get(off).copied().ok_or(Error::InvalidParameters)
}

fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
    let b = buf.get(off..off + 2).ok_or(Error::InvalidParameters)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
    let b = buf.get(off..off + 4).ok_or(Error::InvalidParameters)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(buf: &[u8], off: usize) -> Result<u64> {
    let lo = read_u32(buf, off)? as u64;
    let hi = read_u32(buf, off + 4)? as u64;
    Ok(lo | (hi << 32))
}

fn write_bytes(buf: &mut [u8], off: usize, bytes: &[u8]) -> Result<()> {
    buf.get_mut(off..off + bytes.len())
        .ok_or(Error::InvalidParameters)?
        .copy_from_slice(bytes);
    Ok(())
}

// ── Attributes and permissions ───────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MemoryType {
    #[default]
    NotSpecified,
    Device,
    Normal,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Shareability {
    #[default]
    NonShareable,
    Outer,
    Inner,
}

/// Memory region attributes (DEN0077A Table 10.18).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemAttributes {
    pub memory_type: MemoryType,
    /// Bits 3:2. Cacheability for normal memory, device ordering otherwise.
    pub cacheability: u8,
    pub shareability: Shareability,
}

impl MemAttributes {
    pub const NORMAL_WB_INNER: MemAttributes = MemAttributes {
        memory_type: MemoryType::Normal,
        cacheability: 3,
        shareability: Shareability::Inner,
    };

    pub fn from_bits(bits: u16) -> Result<Self> {
        if bits & !0x3f != 0 {
            return Err(Error::InvalidParameters);
        }
        let memory_type = match (bits >> 4) & 0x3 {
            0 => MemoryType::NotSpecified,
            1 => MemoryType::Device,
            2 => MemoryType::Normal,
            _ => return Err(Error::InvalidParameters),
        };
        let cacheability = ((bits >> 2) & 0x3) as u8;
        if memory_type == MemoryType::Normal && cacheability != 1 && cacheability != 3 {
            return Err(Error::InvalidParameters);
        }
        let shareability = match bits & 0x3 {
            0 => Shareability::NonShareable,
            2 => Shareability::Outer,
            3 => Shareability::Inner,
            _ => return Err(Error::InvalidParameters),
        };
        Ok(Self {
            memory_type,
            cacheability,
            shareability,
        })
    }

    pub fn bits(&self) -> u16 {
        let ty = match self.memory_type {
            MemoryType::NotSpecified => 0,
            MemoryType::Device => 1,
            MemoryType::Normal => 2,
        };
        let sh = match self.shareability {
            Shareability::NonShareable => 0,
            Shareability::Outer => 2,
            Shareability::Inner => 3,
        };
        (ty << 4) | (((self.cacheability & 0x3) as u16) << 2) | sh
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DataAccess {
    #[default]
    NotSpecified,
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InstructionAccess {
    #[default]
    NotSpecified,
    NotExecutable,
    Executable,
}

/// Memory access permissions (DEN0077A Table 10.15).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Permissions {
    pub data: DataAccess,
    pub instruction: InstructionAccess,
}

impl Permissions {
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !0x0f != 0 {
            return Err(Error::InvalidParameters);
        }
        let data = match bits & 0x3 {
            0 => DataAccess::NotSpecified,
            1 => DataAccess::ReadOnly,
            2 => DataAccess::ReadWrite,
            _ => return Err(Error::InvalidParameters),
        };
        let instruction = match (bits >> 2) & 0x3 {
            0 => InstructionAccess::NotSpecified,
            1 => InstructionAccess::NotExecutable,
            2 => InstructionAccess::Executable,
            _ => return Err(Error::InvalidParameters),
        };
        Ok(Self { data, instruction })
    }

    pub fn bits(&self) -> u8 {
        let d = match self.data {
            DataAccess::NotSpecified => 0,
            DataAccess::ReadOnly => 1,
            DataAccess::ReadWrite => 2,
        };
        let i = match self.instruction {
            InstructionAccess::NotSpecified => 0,
            InstructionAccess::NotExecutable => 1,
            InstructionAccess::Executable => 2,
        };
        d | (i << 2)
    }

    /// Access rights these permissions request.
    pub fn to_mode(&self) -> Mode {
        let mut mode = match self.data {
            DataAccess::NotSpecified => Mode::empty(),
            DataAccess::ReadOnly => Mode::R,
            DataAccess::ReadWrite => Mode::R | Mode::W,
        };
        if self.instruction == InstructionAccess::Executable {
            mode |= Mode::X;
        }
        mode
    }

    pub fn from_mode(mode: Mode) -> Self {
        let data = if mode.contains(Mode::W) {
            DataAccess::ReadWrite
        } else if mode.contains(Mode::R) {
            DataAccess::ReadOnly
        } else {
            DataAccess::NotSpecified
        };
        let instruction = if mode.contains(Mode::X) {
            InstructionAccess::Executable
        } else {
            InstructionAccess::NotExecutable
        };
        Self { data, instruction }
    }
}

// ── Memory transaction descriptor ────────────────────────────────────

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReceiverDesc {
    pub id: PartitionId,
    pub permissions: Permissions,
    pub flags: u8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Constituent {
    pub address: u64,
    pub page_count: u32,
}

impl Constituent {
    /// Page range covered, `None` if misaligned, empty or overflowing.
    pub fn range(&self) -> Option<PageRange> {
        if self.address % PAGE_SIZE != 0 || self.page_count == 0 {
            return None;
        }
        PageRange::from_pages(self.address, self.page_count as u64)
    }
}

/// Decoded memory transaction descriptor (used for send, retrieve request
/// and retrieve response alike).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemTransaction {
    pub sender: PartitionId,
    pub attributes: MemAttributes,
    pub flags: u32,
    pub handle: u64,
    pub tag: u64,
    pub receivers: Vec<ReceiverDesc, MAX_RECEIVERS>,
    /// Declared total; checked against the constituents on parse.
    pub total_page_count: u32,
    pub constituents: Vec<Constituent, MAX_CONSTITUENTS>,
}

impl MemTransaction {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let sender = read_u16(buf, 0)?;
        let attributes = MemAttributes::from_bits(read_u16(buf, 2)?)?;
        let flags = read_u32(buf, 4)?;
        let handle = read_u64(buf, 8)?;
        let tag = read_u64(buf, 16)?;
        let access_size = read_u32(buf, 24)? as usize;
        let receiver_count = read_u32(buf, 28)? as usize;
        let receivers_offset = read_u32(buf, 32)? as usize;

        if access_size != MEM_ACCESS_DESC_SIZE
            || receiver_count == 0
            || receiver_count > MAX_RECEIVERS
            || receivers_offset < MEM_TRANSACTION_HEADER_SIZE
        {
            return Err(Error::InvalidParameters);
        }

        let mut receivers = Vec::new();
        let mut composite_offset = None;
        for i in 0..receiver_count {
            let off = receivers_offset + i * MEM_ACCESS_DESC_SIZE;
            let desc = ReceiverDesc {
                id: read_u16(buf, off)?,
                permissions: Permissions::from_bits(read_u8(buf, off + 2)?)?,
                flags: read_u8(buf, off + 3)?,
            };
            let composite = read_u32(buf, off + 4)? as usize;
            // Every receiver must describe the same composite.
            match composite_offset {
                None => composite_offset = Some(composite),
                Some(c) if c != composite => return Err(Error::InvalidParameters),
                Some(_) => {}
            }
            receivers
                .push(desc)
                .map_err(|_| Error::InvalidParameters)?;
        }

        let mut tx = MemTransaction {
            sender,
            attributes,
            flags,
            handle,
            tag,
            receivers,
            total_page_count: 0,
            constituents: Vec::new(),
        };

        // Retrieve requests may omit the composite.
        let composite = match composite_offset {
            Some(0) | None => return Ok(tx),
            Some(c) => c,
        };
        let receivers_end = receivers_offset + receiver_count * MEM_ACCESS_DESC_SIZE;
        if composite < receivers_end {
            return Err(Error::InvalidParameters);
        }
        tx.total_page_count = read_u32(buf, composite)?;
        let range_count = read_u32(buf, composite + 4)? as usize;
        if range_count > MAX_CONSTITUENTS {
            return Err(Error::NoMemory);
        }
        let mut sum: u64 = 0;
        for i in 0..range_count {
            let off = composite + COMPOSITE_HEADER_SIZE + i * CONSTITUENT_SIZE;
            let c = Constituent {
                address: read_u64(buf, off)?,
                page_count: read_u32(buf, off + 8)?,
            };
            sum += c.page_count as u64;
            tx.constituents
                .push(c)
                .map_err(|_| Error::NoMemory)?;
        }
        if sum != tx.total_page_count as u64 {
            return Err(Error::InvalidParameters);
        }
        Ok(tx)
    }

    /// Bytes [`encode`](Self::encode) will write.
    pub fn encoded_len(&self) -> usize {
        let composite = MEM_TRANSACTION_HEADER_SIZE + self.receivers.len() * MEM_ACCESS_DESC_SIZE;
        if self.constituents.is_empty() {
            return composite;
        }
        composite + COMPOSITE_HEADER_SIZE + self.constituents.len() * CONSTITUENT_SIZE
    }

    /// Serialize into `buf`. Returns the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(Error::NoMemory);
        }
        buf[..len].fill(0);
        let composite = if self.constituents.is_empty() {
            0
        } else {
            MEM_TRANSACTION_HEADER_SIZE + self.receivers.len() * MEM_ACCESS_DESC_SIZE
        };

        write_bytes(buf, 0, &self.sender.to_le_bytes())?;
        write_bytes(buf, 2, &self.attributes.bits().to_le_bytes())?;
        write_bytes(buf, 4, &self.flags.to_le_bytes())?;
        write_bytes(buf, 8, &self.handle.to_le_bytes())?;
        write_bytes(buf, 16, &self.tag.to_le_bytes())?;
        write_bytes(buf, 24, &(MEM_ACCESS_DESC_SIZE as u32).to_le_bytes())?;
        write_bytes(buf, 28, &(self.receivers.len() as u32).to_le_bytes())?;
        write_bytes(buf, 32, &(MEM_TRANSACTION_HEADER_SIZE as u32).to_le_bytes())?;

        for (i, r) in self.receivers.iter().enumerate() {
            let off = MEM_TRANSACTION_HEADER_SIZE + i * MEM_ACCESS_DESC_SIZE;
            write_bytes(buf, off, &r.id.to_le_bytes())?;
            write_bytes(buf, off + 2, &[r.permissions.bits(), r.flags])?;
            write_bytes(buf, off + 4, &(composite as u32).to_le_bytes())?;
        }

        if composite != 0 {
            let total: u32 = self.constituents.iter().map(|c| c.page_count).sum();
            write_bytes(buf, composite, &total.to_le_bytes())?;
            write_bytes(
                buf,
                composite + 4,
                &(self.constituents.len() as u32).to_le_bytes(),
            )?;
            for (i, c) in self.constituents.iter().enumerate() {
                let off = composite + COMPOSITE_HEADER_SIZE + i * CONSTITUENT_SIZE;
                write_bytes(buf, off, &c.address.to_le_bytes())?;
                write_bytes(buf, off + 8, &c.page_count.to_le_bytes())?;
            }
        }
        Ok(len)
    }
}

// ── Relinquish descriptor ────────────────────────────────────────────

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelinquishDesc {
    pub handle: u64,
    pub flags: u32,
    pub endpoints: Vec<PartitionId, MAX_RECEIVERS>,
}

impl RelinquishDesc {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let handle = read_u64(buf, 0)?;
        let flags = read_u32(buf, 8)?;
        let count = read_u32(buf, 12)? as usize;
        if count == 0 || count > MAX_RECEIVERS {
            return Err(Error::InvalidParameters);
        }
        let mut endpoints = Vec::new();
        for i in 0..count {
            let id = read_u16(buf, RELINQUISH_HEADER_SIZE + i * 2)?;
            endpoints.push(id).map_err(|_| Error::InvalidParameters)?;
        }
        Ok(Self {
            handle,
            flags,
            endpoints,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        write_bytes(buf, 0, &self.handle.to_le_bytes())?;
        write_bytes(buf, 8, &self.flags.to_le_bytes())?;
        write_bytes(buf, 12, &(self.endpoints.len() as u32).to_le_bytes())?;
        for (i, id) in self.endpoints.iter().enumerate() {
            write_bytes(buf, RELINQUISH_HEADER_SIZE + i * 2, &id.to_le_bytes())?;
        }
        Ok(RELINQUISH_HEADER_SIZE + self.endpoints.len() * 2)
    }
}

// ── Partition info descriptor ────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PartitionInfoDesc {
    pub id: PartitionId,
    pub exec_ctx_count: u16,
    pub properties: u32,
    pub uuid: [u32; 4],
}

impl PartitionInfoDesc {
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        write_bytes(buf, 0, &self.id.to_le_bytes())?;
        write_bytes(buf, 2, &self.exec_ctx_count.to_le_bytes())?;
        write_bytes(buf, 4, &self.properties.to_le_bytes())?;
        for (i, word) in self.uuid.iter().enumerate() {
            write_bytes(buf, 8 + i * 4, &word.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut uuid = [0u32; 4];
        for (i, word) in uuid.iter_mut().enumerate() {
            *word = read_u32(buf, 8 + i * 4)?;
        }
        Ok(Self {
            id: read_u16(buf, 0)?,
            exec_ctx_count: read_u16(buf, 2)?,
            properties: read_u32(buf, 4)?,
            uuid,
        })
    }
}

// ── Indirect message header ──────────────────────────────────────────

/// Partition message header preceding an `FFA_MSG_SEND2` payload.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MsgHeader {
    pub flags: u32,
    pub offset: u32,
    pub sender: PartitionId,
    pub receiver: PartitionId,
    pub size: u32,
}

impl MsgHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let endpoints = read_u32(buf, 12)?;
        Ok(Self {
            flags: read_u32(buf, 0)?,
            offset: read_u32(buf, 8)?,
            sender: (endpoints >> 16) as PartitionId,
            receiver: (endpoints & 0xFFFF) as PartitionId,
            size: read_u32(buf, 16)?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let endpoints = ((self.sender as u32) << 16) | self.receiver as u32;
        write_bytes(buf, 0, &self.flags.to_le_bytes())?;
        write_bytes(buf, 4, &0u32.to_le_bytes())?;
        write_bytes(buf, 8, &self.offset.to_le_bytes())?;
        write_bytes(buf, 12, &endpoints.to_le_bytes())?;
        write_bytes(buf, 16, &self.size.to_le_bytes())?;
        write_bytes(buf, 20, &0u32.to_le_bytes())?;
        Ok(())
    }
}
