//! Memory sharing state machine (`FFA_MEM_SHARE`, `FFA_MEM_LEND`,
//! `FFA_MEM_DONATE` and the calls that follow them).
//!
//! Every transfer gets a slot in the [`ShareTable`]; the slot index is the
//! low part of the handle returned to the owner. A slot moves through
//!
//! ```text
//! Invalid -> Proposed(kind) -> Active -> RelinquishRequested -> Reclaimed
//!                                    \-> DonatedComplete
//! ```
//!
//! and goes back to `Invalid` only through [`Spm::collect_retired_handles`].
//!
//! Ownership is decided from the per-partition region indexes, under the
//! locks of the owner and every receiver. The index update is made before
//! any lock is dropped, so a second transfer of the same pages is refused
//! even while the translator calls for the first are still in flight. A
//! translator failure undoes the index update and the pages go back to
//! their previous state.

use heapless::Vec;

use crate::arch::traits::{InterruptController, MemoryTranslator};
use crate::error::{Error, Result};
use crate::ffa::descriptors::{InstructionAccess, MemTransaction, MemoryType, RelinquishDesc};
use crate::ffa::region_index::{IndexError, Mode, PageRange, RegionIndex};
use crate::ffa::{FfaValue, FuncId, PartitionId, SPMC_ID};
use crate::mem_safe::copy_bounded;
use crate::platform::{
    FRAGMENT_BUFFER_SIZE, MAILBOX_SIZE, MAX_CONSTITUENTS, MAX_DEVICE_INTERRUPTS, MAX_DEVICE_REGIONS,
    MAX_RECEIVERS, MAX_SHARES,
};
use crate::registry::{DeviceRegion, LockedSet};
use crate::spm::Spm;
use crate::sync::{SpinLock, SpinLockGuard};
use crate::vcpu::VcpuRef;

/// Set in every handle this manager allocates.
pub const HANDLE_ALLOCATOR_SPMC: u64 = 1 << 63;

const MAX_MOVED_INTERRUPTS: usize = MAX_DEVICE_REGIONS * MAX_DEVICE_INTERRUPTS;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferKind {
    /// Owner keeps access.
    Share,
    /// Owner loses access until it reclaims.
    Lend,
    /// Ownership moves for good.
    Donate,
}

impl TransferKind {
    pub fn from_func(func: FuncId) -> Option<Self> {
        match func {
            FuncId::MemShare32 | FuncId::MemShare64 => Some(TransferKind::Share),
            FuncId::MemLend32 | FuncId::MemLend64 => Some(TransferKind::Lend),
            FuncId::MemDonate32 | FuncId::MemDonate64 => Some(TransferKind::Donate),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShareState {
    Invalid,
    Proposed(TransferKind),
    Active,
    /// Every grantee has relinquished; the owner may reclaim.
    RelinquishRequested,
    Reclaimed,
    DonatedComplete,
}

impl ShareState {
    fn is_retired(self) -> bool {
        matches!(self, ShareState::Reclaimed | ShareState::DonatedComplete)
    }
}

/// Access held by one receiver under a handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Grant {
    pub partition: usize,
    pub id: PartitionId,
    /// Mode recorded in the receiver's region index.
    pub mode: Mode,
    pub relinquished: bool,
}

#[derive(Clone, Debug)]
pub struct ShareRecord {
    handle: u64,
    state: ShareState,
    kind: TransferKind,
    owner: usize,
    owner_id: PartitionId,
    /// Owner's mode before the transfer, restored on reclaim.
    owner_mode: Mode,
    grants: Vec<Grant, MAX_RECEIVERS>,
    transaction: MemTransaction,
    /// Device interrupts that followed the pages to the receiver.
    interrupts: Vec<u32, MAX_MOVED_INTERRUPTS>,
}

impl ShareRecord {
    fn empty() -> Self {
        Self {
            handle: 0,
            state: ShareState::Invalid,
            kind: TransferKind::Share,
            owner: 0,
            owner_id: 0,
            owner_mode: Mode::empty(),
            grants: Vec::new(),
            transaction: MemTransaction::default(),
            interrupts: Vec::new(),
        }
    }

    pub fn state(&self) -> ShareState {
        self.state
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }
}

/// Fixed table of share slots, each behind its own lock.
pub struct ShareTable {
    slots: [SpinLock<ShareRecord>; MAX_SHARES],
}

impl Default for ShareTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShareTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| SpinLock::new(ShareRecord::empty())),
        }
    }

    /// Claim a free slot for a new transfer.
    pub(crate) fn reserve(&self, kind: TransferKind, owner: usize, owner_id: PartitionId) -> Result<u64> {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut r = slot.lock();
            if r.state == ShareState::Invalid {
                *r = ShareRecord::empty();
                r.handle = HANDLE_ALLOCATOR_SPMC | i as u64;
                r.state = ShareState::Proposed(kind);
                r.kind = kind;
                r.owner = owner;
                r.owner_id = owner_id;
                return Ok(r.handle);
            }
        }
        log::warn!("memory: share table full");
        Err(Error::NoMemory)
    }

    /// Lock the slot holding `handle`.
    pub(crate) fn lookup(&self, handle: u64) -> Result<SpinLockGuard<'_, ShareRecord>> {
        if handle & HANDLE_ALLOCATOR_SPMC == 0 {
            return Err(Error::InvalidParameters);
        }
        let idx = usize::try_from(handle & !HANDLE_ALLOCATOR_SPMC).map_err(|_| Error::InvalidParameters)?;
        let r = self.slots.get(idx).ok_or(Error::InvalidParameters)?.lock();
        if r.state == ShareState::Invalid || r.handle != handle {
            return Err(Error::InvalidParameters);
        }
        Ok(r)
    }

    /// Free a slot that never became active.
    pub(crate) fn release(&self, handle: u64) {
        if let Ok(mut r) = self.lookup(handle) {
            *r = ShareRecord::empty();
        }
    }

    pub fn state(&self, handle: u64) -> Option<ShareState> {
        self.lookup(handle).ok().map(|r| r.state)
    }

    fn collect_retired(&self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter() {
            let mut r = slot.lock();
            if r.state.is_retired() {
                *r = ShareRecord::empty();
                freed += 1;
            }
        }
        freed
    }

    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.lock().state != ShareState::Invalid)
            .count()
    }
}

/// Receivers of a validated transaction, with the rights each asked for.
struct Plan {
    receivers: Vec<(usize, PartitionId, Mode), MAX_RECEIVERS>,
}

fn ranges(tx: &MemTransaction) -> impl Iterator<Item = PageRange> + '_ {
    tx.constituents.iter().filter_map(|c| c.range())
}

fn touches(range: &PageRange, tx: &MemTransaction) -> bool {
    ranges(tx).any(|r| r.overlaps(range))
}

fn receiver_mode(kind: TransferKind, rights: Mode, owner_mode: Mode, multiple: bool) -> Mode {
    match kind {
        TransferKind::Donate if rights.is_empty() => owner_mode.access(),
        TransferKind::Donate => rights,
        TransferKind::Share => rights | Mode::UNOWNED | Mode::SHARED,
        TransferKind::Lend if multiple => rights | Mode::UNOWNED | Mode::SHARED,
        TransferKind::Lend => rights | Mode::UNOWNED,
    }
}

fn owner_mode_after(kind: TransferKind, owner_mode: Mode) -> Option<Mode> {
    match kind {
        TransferKind::Share => Some(owner_mode | Mode::SHARED),
        TransferKind::Lend => Some(Mode::SHARED),
        TransferKind::Donate => None,
    }
}

/// An index update that was checked under the same locks cannot fail
/// afterwards unless the index itself is corrupt.
fn must(result: core::result::Result<(), IndexError>, what: &str) {
    if let Err(e) = result {
        panic!("memory: region index corrupt during {}: {:?}", what, e);
    }
}

fn apply_indexes(
    set: &mut LockedSet<'_>,
    kind: TransferKind,
    owner: usize,
    owner_mode: Mode,
    grants: &[Grant],
    tx: &MemTransaction,
) -> core::result::Result<(), IndexError> {
    for range in ranges(tx) {
        let o = set.get(owner);
        match owner_mode_after(kind, owner_mode) {
            Some(mode) => o.regions.set_mode(&range, mode)?,
            None => o.regions.remove(&range)?,
        }
        for g in grants {
            set.get(g.partition).regions.insert(range, g.mode)?;
        }
    }
    Ok(())
}

impl<T: MemoryTranslator, I: InterruptController> Spm<T, I> {
    /// `FFA_MEM_{SHARE,LEND,DONATE}`: the descriptor is in the caller's TX.
    /// `total_len` larger than `frag_len` opens a fragmented transfer.
    pub fn mem_send(
        &self,
        kind: TransferKind,
        caller: VcpuRef,
        total_len: u32,
        frag_len: u32,
    ) -> Result<FfaValue> {
        let (total, frag) = (total_len as usize, frag_len as usize);
        if frag == 0 || frag > total || frag > MAILBOX_SIZE {
            return Err(Error::InvalidParameters);
        }
        if total > FRAGMENT_BUFFER_SIZE {
            return Err(Error::NoMemory);
        }
        let owner_id = self.registry().partition(caller.partition).id();
        let mut buf = [0u8; MAILBOX_SIZE];
        {
            let state = self.registry().lock(caller.partition);
            if !state.mailbox.is_mapped() {
                return Err(Error::Denied);
            }
            buf[..frag].copy_from_slice(&state.mailbox.send_buf()[..frag]);
        }

        if frag < total {
            let handle = self.shares().reserve(kind, caller.partition, owner_id)?;
            if let Err(e) = self
                .fragments()
                .open(handle, caller.partition, kind, total, &buf[..frag])
            {
                self.shares().release(handle);
                return Err(e);
            }
            return Ok(FfaValue {
                arg1: handle & 0xFFFF_FFFF,
                arg2: handle >> 32,
                arg3: frag_len as u64,
                ..FfaValue::new(FuncId::MemFragRx)
            });
        }

        let tx = MemTransaction::parse(&buf[..frag])?;
        let handle = self.shares().reserve(kind, caller.partition, owner_id)?;
        match self.commit_transfer(kind, caller, handle, &tx) {
            Ok(()) => Ok(FfaValue::success_handle(handle)),
            Err(e) => {
                self.shares().release(handle);
                Err(e)
            }
        }
    }

    fn validate_transaction(
        &self,
        kind: TransferKind,
        owner_id: PartitionId,
        tx: &MemTransaction,
    ) -> Result<Plan> {
        if tx.sender != owner_id || tx.handle != 0 {
            return Err(Error::InvalidParameters);
        }
        if kind == TransferKind::Donate && tx.receivers.len() != 1 {
            return Err(Error::InvalidParameters);
        }
        if kind == TransferKind::Share && tx.attributes.memory_type == MemoryType::NotSpecified {
            return Err(Error::InvalidParameters);
        }

        let mut plan = Plan {
            receivers: Vec::new(),
        };
        for (i, r) in tx.receivers.iter().enumerate() {
            if r.id == owner_id || tx.receivers[..i].iter().any(|o| o.id == r.id) {
                return Err(Error::InvalidParameters);
            }
            let idx = self
                .registry()
                .index_of(r.id)
                .ok_or(Error::InvalidParameters)?;
            let rights = r.permissions.to_mode();
            let permitted = match kind {
                TransferKind::Share => {
                    !rights.is_empty() && r.permissions.instruction != InstructionAccess::Executable
                }
                TransferKind::Lend => !rights.is_empty(),
                TransferKind::Donate => true,
            };
            if !permitted {
                return Err(Error::InvalidParameters);
            }
            plan.receivers
                .push((idx, r.id, rights))
                .map_err(|_| Error::InvalidParameters)?;
        }

        if tx.constituents.is_empty() {
            return Err(Error::InvalidParameters);
        }
        for (i, c) in tx.constituents.iter().enumerate() {
            let range = c.range().ok_or(Error::InvalidParameters)?;
            let clash = tx.constituents[..i]
                .iter()
                .filter_map(|o| o.range())
                .any(|o| o.overlaps(&range));
            if clash {
                return Err(Error::InvalidParameters);
            }
        }
        Ok(plan)
    }

    /// Validate and apply a fully received transaction for the slot
    /// `handle`, which must be in `Proposed`. On error the caller frees
    /// the slot.
    pub(crate) fn commit_transfer(
        &self,
        kind: TransferKind,
        caller: VcpuRef,
        handle: u64,
        tx: &MemTransaction,
    ) -> Result<()> {
        let owner = caller.partition;
        let owner_id = self.registry().partition(owner).id();
        let plan = self.validate_transaction(kind, owner_id, tx)?;
        let multiple = plan.receivers.len() > 1;

        let mut involved: Vec<usize, { MAX_RECEIVERS + 1 }> = Vec::new();
        let _ = involved.push(owner);
        for (idx, _, _) in plan.receivers.iter() {
            let _ = involved.push(*idx);
        }

        let mut set = self.registry().lock_set(&involved);

        // The pages must be plainly owned, in one mode, by the sender.
        let mut owner_mode = None;
        for range in ranges(tx) {
            let mode = set.get(owner).regions.mode_of(&range).ok_or(Error::Denied)?;
            if mode.intersects(Mode::UNOWNED | Mode::SHARED) || mode.access().is_empty() {
                return Err(Error::Denied);
            }
            match owner_mode {
                None => owner_mode = Some(mode),
                Some(m) if m != mode => return Err(Error::Denied),
                Some(_) => {}
            }
        }
        let owner_mode = owner_mode.ok_or(Error::InvalidParameters)?;
        if set.get(owner).mailbox.pages().any(|page| touches(&page, tx)) {
            log::debug!("memory: {:#x} tried to give away its mailbox", owner_id);
            return Err(Error::Denied);
        }

        let mut grants: Vec<Grant, MAX_RECEIVERS> = Vec::new();
        for &(idx, id, rights) in plan.receivers.iter() {
            if !owner_mode.access().contains(rights) {
                return Err(Error::Denied);
            }
            if ranges(tx).any(|range| set.get(idx).regions.overlaps(&range)) {
                return Err(Error::Denied);
            }
            let _ = grants.push(Grant {
                partition: idx,
                id,
                mode: receiver_mode(kind, rights, owner_mode, multiple),
                relinquished: false,
            });
        }

        let mut backups: Vec<(usize, RegionIndex), { MAX_RECEIVERS + 1 }> = Vec::new();
        for &idx in involved.iter() {
            let _ = backups.push((idx, set.get(idx).regions.clone()));
        }
        if let Err(e) = apply_indexes(&mut set, kind, owner, owner_mode, &grants, tx) {
            for (idx, index) in backups {
                set.get(idx).regions = index;
            }
            log::warn!("memory: region index update failed: {:?}", e);
            return Err(Error::NoMemory);
        }
        drop(backups);

        // Interrupts of device regions follow lent or donated pages.
        let mut moved: Vec<u32, MAX_MOVED_INTERRUPTS> = Vec::new();
        if kind != TransferKind::Share && grants.len() == 1 {
            let receiver = grants[0].partition;
            let mut devices: Vec<DeviceRegion, MAX_DEVICE_REGIONS> = Vec::new();
            for dev in set.get(owner).device_regions.iter() {
                if touches(&dev.range, tx) {
                    let _ = devices.push(dev.clone());
                }
            }
            if kind == TransferKind::Donate {
                set.get(owner).device_regions.retain(|d| !touches(&d.range, tx));
            }
            for dev in devices {
                for &id in dev.interrupts.iter() {
                    let _ = moved.push(id);
                    if let Some(v) = set.get(owner).vcpu_mut(0) {
                        v.interrupts.set_enabled(id, false);
                    }
                    if let Some(v) = set.get(receiver).vcpu_mut(0) {
                        v.interrupts.set_enabled(id, true);
                    }
                }
                if kind == TransferKind::Donate {
                    if let Err(dev) = set.get(receiver).device_regions.push(dev) {
                        log::warn!("memory: receiver has no room for device region {:?}", dev.range);
                    }
                }
            }
        }

        if kind != TransferKind::Donate {
            set.get(owner).add_handle(handle);
            for g in grants.iter() {
                set.get(g.partition).add_handle(handle);
            }
        }
        {
            let mut r = self.shares().lookup(handle)?;
            r.owner_mode = owner_mode;
            r.grants = grants.clone();
            r.transaction = tx.clone();
            r.transaction.handle = handle;
            r.interrupts = moved.clone();
        }
        drop(set);

        if let Err(e) = self.translate_transfer(kind, owner_id, owner_mode, &grants, tx) {
            log::warn!("memory: translator failed for {:#x}: {:?}", handle, e);
            self.revert_transfer(kind, owner, owner_mode, &grants, handle, tx, &moved);
            return Err(Error::NoMemory);
        }

        for &id in moved.iter() {
            self.move_interrupt(id, grants[0].partition);
        }

        let mut r = self.shares().lookup(handle)?;
        r.state = match kind {
            TransferKind::Donate => ShareState::DonatedComplete,
            _ => ShareState::Active,
        };
        log::info!(
            "memory: {:?} {:#x} from {:#x} to {} receiver(s)",
            kind,
            handle,
            owner_id,
            grants.len()
        );
        Ok(())
    }

    /// Apply a transfer to the address spaces; undo every completed step if
    /// one fails.
    fn translate_transfer(
        &self,
        kind: TransferKind,
        owner_id: PartitionId,
        owner_mode: Mode,
        grants: &[Grant],
        tx: &MemTransaction,
    ) -> core::result::Result<(), crate::arch::traits::TranslationError> {
        let steps_per_range = grants.len() + 1;
        let step = |range: PageRange, j: usize| match j {
            0 => match kind {
                TransferKind::Share => Ok(()),
                TransferKind::Lend => self.translator().protect(owner_id, range, Mode::empty()),
                TransferKind::Donate => self.translator().unmap(owner_id, range),
            },
            j => self
                .translator()
                .map(grants[j - 1].id, range, grants[j - 1].mode.access()),
        };
        let undo = |range: PageRange, j: usize| {
            let result = match j {
                0 => match kind {
                    TransferKind::Share => Ok(()),
                    TransferKind::Lend => self.translator().protect(owner_id, range, owner_mode.access()),
                    TransferKind::Donate => self.translator().map(owner_id, range, owner_mode.access()),
                },
                j => self.translator().unmap(grants[j - 1].id, range),
            };
            if result.is_err() {
                log::error!("memory: rollback of {:#x}..{:#x} failed", range.begin, range.end);
            }
        };

        let all: Vec<PageRange, MAX_CONSTITUENTS> = {
            let mut v = Vec::new();
            for r in ranges(tx) {
                let _ = v.push(r);
            }
            v
        };
        for (i, range) in all.iter().enumerate() {
            for j in 0..steps_per_range {
                if let Err(e) = step(*range, j) {
                    for jj in (0..j).rev() {
                        undo(*range, jj);
                    }
                    for prev in all[..i].iter().rev() {
                        for jj in (0..steps_per_range).rev() {
                            undo(*prev, jj);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Put the region indexes back the way they were before
    /// `commit_transfer` claimed the pages.
    fn revert_transfer(
        &self,
        kind: TransferKind,
        owner: usize,
        owner_mode: Mode,
        grants: &[Grant],
        handle: u64,
        tx: &MemTransaction,
        moved: &[u32],
    ) {
        let mut involved: Vec<usize, { MAX_RECEIVERS + 1 }> = Vec::new();
        let _ = involved.push(owner);
        for g in grants {
            let _ = involved.push(g.partition);
        }
        let mut set = self.registry().lock_set(&involved);
        for range in ranges(tx) {
            for g in grants {
                must(set.get(g.partition).regions.remove(&range), "revert");
            }
            let o = set.get(owner);
            match kind {
                TransferKind::Donate => must(o.regions.insert(range, owner_mode), "revert"),
                _ => must(o.regions.set_mode(&range, owner_mode), "revert"),
            }
        }
        for g in grants {
            set.get(g.partition).drop_handle(handle);
        }
        set.get(owner).drop_handle(handle);

        if kind == TransferKind::Donate && grants.len() == 1 {
            let receiver = grants[0].partition;
            let mut devices: Vec<DeviceRegion, MAX_DEVICE_REGIONS> = Vec::new();
            for dev in set.get(receiver).device_regions.iter() {
                if touches(&dev.range, tx) {
                    let _ = devices.push(dev.clone());
                }
            }
            set.get(receiver).device_regions.retain(|d| !touches(&d.range, tx));
            for dev in devices {
                let _ = set.get(owner).device_regions.push(dev);
            }
        }
        if let Some(g) = grants.first().filter(|_| !moved.is_empty()) {
            for &id in moved {
                if let Some(v) = set.get(g.partition).vcpu_mut(0) {
                    v.interrupts.set_enabled(id, false);
                }
                if let Some(v) = set.get(owner).vcpu_mut(0) {
                    v.interrupts.set_enabled(id, true);
                }
            }
        }
    }

    /// `FFA_MEM_RELINQUISH`: the caller gives up its grant. The relinquish
    /// descriptor is in the caller's TX.
    pub fn mem_relinquish(&self, caller: VcpuRef) -> Result<()> {
        let caller_id = self.registry().partition(caller.partition).id();
        let desc = {
            let state = self.registry().lock(caller.partition);
            if !state.mailbox.is_mapped() {
                return Err(Error::Denied);
            }
            RelinquishDesc::parse(state.mailbox.send_buf())?
        };
        if desc.flags != 0 || desc.endpoints.as_slice() != [caller_id] {
            return Err(Error::InvalidParameters);
        }
        let handle = desc.handle;

        // Claim under the slot lock so a concurrent relinquish loses.
        let (tx, mode) = {
            let mut r = self.shares().lookup(handle)?;
            if r.state != ShareState::Active {
                return Err(Error::InvalidState);
            }
            let g = r
                .grants
                .iter_mut()
                .find(|g| g.partition == caller.partition)
                .ok_or(Error::Denied)?;
            if g.relinquished {
                return Err(Error::InvalidState);
            }
            g.relinquished = true;
            let mode = g.mode;
            (r.transaction.clone(), mode)
        };
        let unclaim = || {
            if let Ok(mut r) = self.shares().lookup(handle) {
                if let Some(g) = r.grants.iter_mut().find(|g| g.partition == caller.partition) {
                    g.relinquished = false;
                }
            }
        };

        {
            let mut state = self.registry().lock(caller.partition);
            let backup = state.regions.clone();
            for range in ranges(&tx) {
                if state.regions.remove(&range).is_err() {
                    state.regions = backup;
                    drop(state);
                    unclaim();
                    return Err(Error::NoMemory);
                }
            }
            state.drop_handle(handle);
        }

        let mut done = 0;
        for range in ranges(&tx) {
            if self.translator().unmap(caller_id, range).is_err() {
                for prev in ranges(&tx).take(done) {
                    if self.translator().map(caller_id, prev, mode.access()).is_err() {
                        log::error!("memory: cannot restore mapping of {:#x}", prev.begin);
                    }
                }
                let mut state = self.registry().lock(caller.partition);
                for range in ranges(&tx) {
                    must(state.regions.insert(range, mode), "relinquish rollback");
                }
                state.add_handle(handle);
                drop(state);
                unclaim();
                return Err(Error::NoMemory);
            }
            done += 1;
        }

        let mut r = self.shares().lookup(handle)?;
        if r.grants.iter().all(|g| g.relinquished) {
            r.state = ShareState::RelinquishRequested;
        }
        log::debug!("memory: {:#x} relinquished by {:#x}", handle, caller_id);
        Ok(())
    }

    /// `FFA_MEM_RECLAIM`: the owner takes back pages every grantee has
    /// relinquished.
    pub fn mem_reclaim(&self, caller: VcpuRef, handle: u64, flags: u32) -> Result<()> {
        if flags != 0 {
            return Err(Error::InvalidParameters);
        }
        let (tx, kind, owner_mode, owner_id, receiver, moved) = {
            let mut r = self.shares().lookup(handle)?;
            if r.owner != caller.partition {
                return Err(Error::Denied);
            }
            match r.state {
                ShareState::RelinquishRequested => {}
                ShareState::Active => return Err(Error::Denied),
                _ => return Err(Error::InvalidState),
            }
            r.state = ShareState::Reclaimed;
            (
                r.transaction.clone(),
                r.kind,
                r.owner_mode,
                r.owner_id,
                r.grants.first().map(|g| g.partition),
                r.interrupts.clone(),
            )
        };
        let unclaim = || {
            if let Ok(mut r) = self.shares().lookup(handle) {
                r.state = ShareState::RelinquishRequested;
            }
        };
        let Some(shared_mode) = owner_mode_after(kind, owner_mode) else {
            return Err(Error::InvalidState);
        };

        {
            let mut state = self.registry().lock(caller.partition);
            let backup = state.regions.clone();
            for range in ranges(&tx) {
                if state.regions.set_mode(&range, owner_mode).is_err() {
                    state.regions = backup;
                    drop(state);
                    unclaim();
                    return Err(Error::NoMemory);
                }
            }
            state.drop_handle(handle);
        }

        if kind == TransferKind::Lend {
            let mut done = 0;
            for range in ranges(&tx) {
                if self
                    .translator()
                    .protect(owner_id, range, owner_mode.access())
                    .is_err()
                {
                    for prev in ranges(&tx).take(done) {
                        if self.translator().protect(owner_id, prev, Mode::empty()).is_err() {
                            log::error!("memory: cannot revoke {:#x} again", prev.begin);
                        }
                    }
                    let mut state = self.registry().lock(caller.partition);
                    for range in ranges(&tx) {
                        must(state.regions.set_mode(&range, shared_mode), "reclaim rollback");
                    }
                    state.add_handle(handle);
                    drop(state);
                    unclaim();
                    return Err(Error::NoMemory);
                }
                done += 1;
            }
        }

        if let Some(receiver) = receiver.filter(|_| !moved.is_empty()) {
            if let Some(v) = self.registry().lock(receiver).vcpu_mut(0) {
                for &id in moved.iter() {
                    v.interrupts.set_enabled(id, false);
                }
            }
            if let Some(v) = self.registry().lock(caller.partition).vcpu_mut(0) {
                for &id in moved.iter() {
                    v.interrupts.set_enabled(id, true);
                }
            }
            for &id in moved.iter() {
                self.move_interrupt(id, caller.partition);
            }
        }
        log::info!("memory: {:#x} reclaimed by {:#x}", handle, owner_id);
        Ok(())
    }

    /// Transaction under `handle` as `caller` may retrieve it: the handle
    /// must be active and `caller` must hold a live grant on it.
    fn granted_transaction(
        &self,
        caller: VcpuRef,
        handle: u64,
        owner_id: Option<PartitionId>,
    ) -> Result<MemTransaction> {
        let r = self.shares().lookup(handle)?;
        if r.state != ShareState::Active {
            return Err(Error::InvalidState);
        }
        if owner_id.is_some_and(|id| id != r.owner_id) {
            return Err(Error::InvalidParameters);
        }
        if !r
            .grants
            .iter()
            .any(|g| g.partition == caller.partition && !g.relinquished)
        {
            return Err(Error::Denied);
        }
        Ok(r.transaction.clone())
    }

    /// Copy `image[offset..]`, at most one mailbox page of it, into the
    /// caller's RX. Returns the number of bytes written.
    fn write_descriptor_fragment(&self, caller: VcpuRef, image: &[u8], offset: usize) -> Result<usize> {
        let len = (image.len() - offset).min(MAILBOX_SIZE);
        self.registry()
            .lock(caller.partition)
            .mailbox
            .write_rx(SPMC_ID, |rx| {
                copy_bounded(rx, &image[offset..offset + len]);
                Ok(len)
            })
    }

    /// `FFA_MEM_RETRIEVE_REQ`: a grantee asks for the full transaction
    /// descriptor of a handle. The response goes into its RX; one larger
    /// than RX is continued with `FFA_MEM_FRAG_RX`.
    pub fn mem_retrieve(&self, caller: VcpuRef) -> Result<FfaValue> {
        let caller_id = self.registry().partition(caller.partition).id();
        let request = {
            let state = self.registry().lock(caller.partition);
            if !state.mailbox.is_mapped() {
                return Err(Error::Denied);
            }
            MemTransaction::parse(state.mailbox.send_buf())?
        };
        if !request.receivers.iter().any(|r| r.id == caller_id) {
            return Err(Error::InvalidParameters);
        }

        let response = self.granted_transaction(caller, request.handle, Some(request.sender))?;
        let mut image = [0u8; FRAGMENT_BUFFER_SIZE];
        let total = response.encode(&mut image)?;
        let frag = self.write_descriptor_fragment(caller, &image[..total], 0)?;
        Ok(FfaValue {
            arg1: total as u64,
            arg2: frag as u64,
            ..FfaValue::new(FuncId::MemRetrieveResp)
        })
    }

    /// `FFA_MEM_FRAG_RX`: `x1`/`x2` handle, `x3` offset of the next
    /// fragment of a retrieved descriptor. Answered with `FFA_MEM_FRAG_TX`
    /// once the fragment is in RX.
    pub fn mem_frag_rx(&self, caller: VcpuRef, args: FfaValue) -> Result<FfaValue> {
        let handle = args.handle_from_arg1();
        let offset = args.arg3 as usize;
        let response = self.granted_transaction(caller, handle, None)?;
        let mut image = [0u8; FRAGMENT_BUFFER_SIZE];
        let total = response.encode(&mut image)?;
        if offset == 0 || offset >= total {
            return Err(Error::InvalidParameters);
        }
        let len = self.write_descriptor_fragment(caller, &image[..total], offset)?;
        Ok(FfaValue {
            arg1: handle & 0xFFFF_FFFF,
            arg2: handle >> 32,
            arg3: len as u64,
            ..FfaValue::new(FuncId::MemFragTx)
        })
    }

    /// Return retired slots (`Reclaimed`, `DonatedComplete`) to the free
    /// pool. Their handles may be issued again afterwards.
    pub fn collect_retired_handles(&self) -> usize {
        let freed = self.shares().collect_retired();
        if freed > 0 {
            log::debug!("memory: collected {} retired handles", freed);
        }
        freed
    }

    pub fn share_state(&self, handle: u64) -> Option<ShareState> {
        self.shares().state(handle)
    }

    /// Snapshot of the grants under `handle`.
    pub fn share_grants(&self, handle: u64) -> Option<Vec<Grant, MAX_RECEIVERS>> {
        self.shares().lookup(handle).ok().map(|r| r.grants.clone())
    }
}
