//! FF-A RX/TX mailbox management and indirect messaging.
//!
//! Each partition registers one TX page (partition writes, manager reads)
//! and one RX page (manager writes, partition reads) with `FFA_RXTX_MAP`.
//! The manager keeps its own copy of both pages; the addresses the partition
//! registered are validated against the partition's own memory and stay
//! reserved to it until unmapped.

use crate::arch::traits::{InterruptController, MemoryTranslator};
use crate::error::{Error, Result};
use crate::ffa::descriptors::{MsgHeader, PartitionInfoDesc, MSG_HEADER_SIZE, PARTITION_INFO_SIZE};
use crate::ffa::notifications::FRAMEWORK_RX_FULL;
use crate::ffa::region_index::{Mode, PageRange};
use crate::ffa::PartitionId;
use crate::mem_safe::copy_bounded;
use crate::platform::{MAILBOX_SIZE, NOTIFICATION_PENDING_INTID, PAGE_SIZE};
use crate::registry::PartitionProperties;
use crate::spm::Spm;
use crate::vcpu::VcpuRef;

/// `FFA_PARTITION_INFO_GET` flag: return the count only.
pub const PARTITION_INFO_COUNT_ONLY: u32 = 1 << 0;

/// RX buffer ownership.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RxState {
    /// Manager owns RX and may write to it.
    Empty,
    /// Partition owns RX until it calls `FFA_RX_RELEASE`.
    Full { sender: PartitionId, size: usize },
}

/// Per-partition RXTX buffer state.
pub struct Mailbox {
    tx_addr: u64,
    rx_addr: u64,
    mapped: bool,
    rx: RxState,
    send: [u8; MAILBOX_SIZE],
    recv: [u8; MAILBOX_SIZE],
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub const fn new() -> Self {
        Self {
            tx_addr: 0,
            rx_addr: 0,
            mapped: false,
            rx: RxState::Empty,
            send: [0; MAILBOX_SIZE],
            recv: [0; MAILBOX_SIZE],
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn addresses(&self) -> Option<(u64, u64)> {
        self.mapped.then_some((self.tx_addr, self.rx_addr))
    }

    /// The registered TX and RX pages. They cannot be transferred while
    /// mapped.
    pub fn pages(&self) -> impl Iterator<Item = PageRange> {
        self.addresses()
            .into_iter()
            .flat_map(|(tx, rx)| [tx, rx])
            .filter_map(|addr| PageRange::from_pages(addr, MAILBOX_SIZE as u64 / PAGE_SIZE))
    }

    pub fn rx_state(&self) -> RxState {
        self.rx
    }

    /// Contents of the TX buffer.
    pub fn send_buf(&self) -> &[u8] {
        &self.send
    }

    /// The partition's view of its TX buffer.
    pub fn send_buf_mut(&mut self) -> &mut [u8] {
        &mut self.send
    }

    /// The partition's view of its RX buffer.
    pub fn recv_buf(&self) -> &[u8] {
        &self.recv
    }

    fn map(&mut self, tx: u64, rx: u64) -> Result<()> {
        if self.mapped {
            return Err(Error::Denied);
        }
        self.tx_addr = tx;
        self.rx_addr = rx;
        self.mapped = true;
        self.rx = RxState::Empty;
        Ok(())
    }

    fn unmap(&mut self) -> Result<()> {
        if !self.mapped {
            return Err(Error::InvalidParameters);
        }
        *self = Self::new();
        Ok(())
    }

    /// Produce a message into RX with `fill`, which returns the size written.
    pub fn write_rx(
        &mut self,
        sender: PartitionId,
        fill: impl FnOnce(&mut [u8]) -> Result<usize>,
    ) -> Result<usize> {
        if !self.mapped {
            return Err(Error::Denied);
        }
        if self.rx != RxState::Empty {
            return Err(Error::Busy);
        }
        let size = fill(&mut self.recv)?;
        self.rx = RxState::Full { sender, size };
        Ok(size)
    }

    fn release(&mut self) -> Result<()> {
        match self.rx {
            RxState::Full { .. } => {
                self.rx = RxState::Empty;
                Ok(())
            }
            RxState::Empty => Err(Error::Denied),
        }
    }
}

impl<T: MemoryTranslator, I: InterruptController> Spm<T, I> {
    /// `FFA_RXTX_MAP`: register the caller's TX/RX pages.
    pub fn rxtx_map(&self, caller: VcpuRef, tx: u64, rx: u64, page_count: u32) -> Result<()> {
        if page_count as u64 * PAGE_SIZE != MAILBOX_SIZE as u64
            || tx % PAGE_SIZE != 0
            || rx % PAGE_SIZE != 0
            || tx == rx
        {
            return Err(Error::InvalidParameters);
        }
        let tx_range = PageRange::from_pages(tx, page_count as u64).ok_or(Error::InvalidParameters)?;
        let rx_range = PageRange::from_pages(rx, page_count as u64).ok_or(Error::InvalidParameters)?;

        let mut state = self.registry().lock(caller.partition);
        for range in [tx_range, rx_range] {
            let mode = state.regions.mode_of(&range).ok_or(Error::InvalidParameters)?;
            if mode.intersects(Mode::UNOWNED | Mode::SHARED) || !mode.contains(Mode::R | Mode::W) {
                return Err(Error::InvalidParameters);
            }
        }
        state.mailbox.map(tx, rx)?;
        log::debug!(
            "mailbox: {:#x} mapped tx={:#x} rx={:#x}",
            self.registry().partition(caller.partition).id(),
            tx,
            rx
        );
        Ok(())
    }

    pub fn rxtx_unmap(&self, caller: VcpuRef) -> Result<()> {
        self.registry().lock(caller.partition).mailbox.unmap()
    }

    /// `FFA_RX_RELEASE`: hand RX ownership back to the manager.
    pub fn rx_release(&self, caller: VcpuRef) -> Result<()> {
        let mut state = self.registry().lock(caller.partition);
        state.mailbox.release()?;
        state.notifications.framework_clear(FRAMEWORK_RX_FULL);
        Ok(())
    }

    /// `FFA_PARTITION_INFO_GET`. A nil UUID selects every partition.
    /// Returns the number of matching partitions.
    pub fn partition_info_get(&self, caller: VcpuRef, uuid: [u32; 4], flags: u32) -> Result<usize> {
        let registry = self.registry();
        let matches = |idx: &usize| uuid == [0; 4] || registry.partition(*idx).uuid() == uuid;
        let count = (0..registry.len()).filter(matches).count();
        if count == 0 {
            return Err(Error::InvalidParameters);
        }
        if flags & PARTITION_INFO_COUNT_ONLY != 0 {
            return Ok(count);
        }

        let mut state = registry.lock(caller.partition);
        state.mailbox.write_rx(SPMC_SENDER, |rx| {
            let mut off = 0;
            for idx in (0..registry.len()).filter(matches) {
                let p = registry.partition(idx);
                let desc = PartitionInfoDesc {
                    id: p.id(),
                    exec_ctx_count: p.vcpu_count(),
                    properties: p.properties().bits(),
                    uuid: p.uuid(),
                };
                let slot = rx
                    .get_mut(off..off + PARTITION_INFO_SIZE)
                    .ok_or(Error::NoMemory)?;
                desc.encode(slot)?;
                off += PARTITION_INFO_SIZE;
            }
            Ok(off)
        })?;
        Ok(count)
    }

    /// `FFA_MSG_SEND2`: copy the message in the caller's TX into the
    /// receiver's RX and raise the RX-full framework notification.
    pub fn msg_send2(&self, caller: VcpuRef) -> Result<()> {
        let sender_id = self.registry().partition(caller.partition).id();

        // Snapshot the message so the sender's lock is not held while the
        // receiver's is taken.
        let mut message = [0u8; MAILBOX_SIZE];
        let (header, total) = {
            let state = self.registry().lock(caller.partition);
            if !state.mailbox.is_mapped() {
                return Err(Error::Denied);
            }
            let header = MsgHeader::parse(state.mailbox.send_buf())?;
            let offset = header.offset as usize;
            let total = offset
                .checked_add(header.size as usize)
                .ok_or(Error::InvalidParameters)?;
            if offset < MSG_HEADER_SIZE || total > MAILBOX_SIZE {
                return Err(Error::InvalidParameters);
            }
            copy_bounded(&mut message, &state.mailbox.send_buf()[..total]);
            (header, total)
        };

        if header.sender != sender_id {
            return Err(Error::InvalidParameters);
        }
        let idx = self
            .registry()
            .index_of(header.receiver)
            .ok_or(Error::InvalidParameters)?;
        if idx == caller.partition {
            return Err(Error::InvalidParameters);
        }
        if !self
            .registry()
            .partition(idx)
            .properties()
            .contains(PartitionProperties::INDIRECT_MSG)
        {
            return Err(Error::Denied);
        }

        let mut state = self.registry().lock(idx);
        if !state.mailbox.is_mapped() {
            return Err(Error::Busy);
        }
        state.mailbox.write_rx(sender_id, |rx| {
            copy_bounded(rx, &message[..total]);
            Ok(total)
        })?;
        state.notifications.raise_framework(FRAMEWORK_RX_FULL);
        if let Some(vcpu) = state.vcpus.get_mut(0) {
            vcpu.interrupts.inject(NOTIFICATION_PENDING_INTID);
        }
        log::debug!(
            "mailbox: indirect message {:#x} -> {:#x}, {} bytes",
            sender_id,
            header.receiver,
            header.size
        );
        Ok(())
    }
}

/// Sender recorded for RX contents the manager itself produced.
const SPMC_SENDER: PartitionId = crate::ffa::SPMC_ID;
