//! FF-A v1.1 Notification state management.
//!
//! Per-partition notification bitmaps with sender-receiver bind tracking.
//! Global notifications pend on the partition; per-vCPU notifications pend
//! on the target vCPU. Pending bits are split by sender class (secure
//! partitions vs. normal-world VMs) as `FFA_NOTIFICATION_GET` reports them.

use bitflags::bitflags;
use heapless::Vec;

use crate::arch::traits::{InterruptController, MemoryTranslator};
use crate::error::{Error, Result};
use crate::ffa::{is_secure_id, PartitionId};
use crate::platform::NOTIFICATION_PENDING_INTID;
use crate::registry::PartitionKind;
use crate::spm::Spm;
use crate::vcpu::VcpuRef;

pub const MAX_NOTIFICATIONS: usize = 64;

/// Most ids `FFA_NOTIFICATION_INFO_GET` reports per call.
pub const INFO_GET_MAX_IDS: usize = 20;

/// SPM framework notification: RX buffer full.
pub const FRAMEWORK_RX_FULL: u32 = 1 << 0;

bitflags! {
    /// `FFA_NOTIFICATION_GET` bitmap selectors.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct GetFlags: u32 {
        const FROM_SP = 1 << 0;
        const FROM_VM = 1 << 1;
        const FRAMEWORK_SPM = 1 << 2;
        const FRAMEWORK_HYP = 1 << 3;
    }
}

/// Flag bit marking a per-vCPU binding or set.
pub const FLAG_PER_VCPU: u32 = 1 << 0;

/// Pending notification bits, split by sender class.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PendingBitmaps {
    pub from_sp: u64,
    pub from_vm: u64,
}

impl PendingBitmaps {
    pub const fn new() -> Self {
        Self {
            from_sp: 0,
            from_vm: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.from_sp == 0 && self.from_vm == 0
    }

    pub fn all(&self) -> u64 {
        self.from_sp | self.from_vm
    }

    fn raise(&mut self, sender: PartitionId, bitmap: u64) {
        if is_secure_id(sender) {
            self.from_sp |= bitmap;
        } else {
            self.from_vm |= bitmap;
        }
    }

    /// Take the classes selected by `flags`, leaving the others pending.
    fn take(&mut self, flags: GetFlags) -> PendingBitmaps {
        let mut out = PendingBitmaps::new();
        if flags.contains(GetFlags::FROM_SP) {
            out.from_sp = core::mem::take(&mut self.from_sp);
        }
        if flags.contains(GetFlags::FROM_VM) {
            out.from_vm = core::mem::take(&mut self.from_vm);
        }
        out
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct Binding {
    sender: Option<PartitionId>,
    per_vcpu: bool,
}

/// Per-partition notification state.
#[derive(Clone, Debug)]
pub struct NotificationState {
    enabled: bool,
    bindings: [Binding; MAX_NOTIFICATIONS],
    global: PendingBitmaps,
    framework: u32,
    /// Pending state already reported through `INFO_GET`.
    info_reported: bool,
}

impl Default for NotificationState {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationState {
    pub const fn new() -> Self {
        Self {
            enabled: false,
            bindings: [Binding {
                sender: None,
                per_vcpu: false,
            }; MAX_NOTIFICATIONS],
            global: PendingBitmaps::new(),
            framework: 0,
            info_reported: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) -> Result<()> {
        if self.enabled {
            return Err(Error::Denied);
        }
        self.enabled = true;
        Ok(())
    }

    pub fn destroy(&mut self) -> Result<()> {
        if !self.enabled {
            return Err(Error::Denied);
        }
        if self.bindings.iter().any(|b| b.sender.is_some()) {
            return Err(Error::Denied);
        }
        *self = Self::new();
        Ok(())
    }

    fn bits(bitmap: u64) -> impl Iterator<Item = usize> {
        (0..MAX_NOTIFICATIONS).filter(move |i| bitmap & (1u64 << i) != 0)
    }

    pub fn bind(&mut self, sender: PartitionId, flags: u32, bitmap: u64) -> Result<()> {
        if bitmap == 0 {
            return Err(Error::InvalidParameters);
        }
        if !self.enabled {
            return Err(Error::Denied);
        }
        // Re-binding to the same sender is allowed; stealing a bit is not.
        if Self::bits(bitmap).any(|i| matches!(self.bindings[i].sender, Some(s) if s != sender)) {
            return Err(Error::Denied);
        }
        let per_vcpu = flags & FLAG_PER_VCPU != 0;
        for i in Self::bits(bitmap) {
            self.bindings[i] = Binding {
                sender: Some(sender),
                per_vcpu,
            };
        }
        Ok(())
    }

    /// `vcpu_pending` is the union of every vCPU's pending bits.
    pub fn unbind(&mut self, sender: PartitionId, bitmap: u64, vcpu_pending: u64) -> Result<()> {
        if bitmap == 0 {
            return Err(Error::InvalidParameters);
        }
        if !self.enabled {
            return Err(Error::Denied);
        }
        if Self::bits(bitmap).any(|i| self.bindings[i].sender != Some(sender)) {
            return Err(Error::Denied);
        }
        if (self.global.all() | vcpu_pending) & bitmap != 0 {
            return Err(Error::Denied);
        }
        for i in Self::bits(bitmap) {
            self.bindings[i] = Binding::default();
        }
        Ok(())
    }

    /// Validate that `sender` may raise `bitmap` with the given flavour.
    pub fn check_set(&self, sender: PartitionId, per_vcpu: bool, bitmap: u64) -> Result<()> {
        if bitmap == 0 {
            return Err(Error::InvalidParameters);
        }
        if !self.enabled {
            return Err(Error::Denied);
        }
        for i in Self::bits(bitmap) {
            let b = self.bindings[i];
            if b.sender != Some(sender) {
                return Err(Error::Denied);
            }
            if b.per_vcpu != per_vcpu {
                return Err(Error::InvalidParameters);
            }
        }
        Ok(())
    }

    pub fn raise_global(&mut self, sender: PartitionId, bitmap: u64) {
        self.global.raise(sender, bitmap);
        self.info_reported = false;
    }

    pub fn raise_framework(&mut self, bits: u32) {
        self.framework |= bits;
        self.info_reported = false;
    }

    pub fn framework_clear(&mut self, bits: u32) {
        self.framework &= !bits;
    }

    pub fn global_pending(&self) -> PendingBitmaps {
        self.global
    }

    pub fn has_pending(&self) -> bool {
        !self.global.is_empty() || self.framework != 0
    }

    pub fn bound_sender(&self, bit: usize) -> Option<PartitionId> {
        self.bindings.get(bit).and_then(|b| b.sender)
    }
}

/// Result of `FFA_NOTIFICATION_GET`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NotificationsGot {
    pub from_sp: u64,
    pub from_vm: u64,
    pub framework: u32,
}

/// Result of `FFA_NOTIFICATION_INFO_GET`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NotificationInfo {
    pub ids: Vec<PartitionId, INFO_GET_MAX_IDS>,
    /// More partitions have pending notifications than fit in one reply.
    pub more_pending: bool,
}

impl<T: MemoryTranslator, I: InterruptController> Spm<T, I> {
    /// `FFA_NOTIFICATION_BITMAP_CREATE` for a normal-world VM.
    pub fn notification_bitmap_create(&self, vm_id: PartitionId) -> Result<()> {
        let idx = self.registry().index_of(vm_id).ok_or(Error::InvalidParameters)?;
        if self.registry().partition(idx).kind() != PartitionKind::NormalVm {
            return Err(Error::InvalidParameters);
        }
        self.registry().lock(idx).notifications.enable()?;
        log::debug!("notifications: bitmap created for {:#x}", vm_id);
        Ok(())
    }

    pub fn notification_bitmap_destroy(&self, vm_id: PartitionId) -> Result<()> {
        let idx = self.registry().index_of(vm_id).ok_or(Error::InvalidParameters)?;
        if self.registry().partition(idx).kind() != PartitionKind::NormalVm {
            return Err(Error::InvalidParameters);
        }
        let mut state = self.registry().lock(idx);
        state.notifications.destroy()?;
        for vcpu in state.vcpus.iter_mut() {
            vcpu.notifications = PendingBitmaps::new();
        }
        Ok(())
    }

    /// `FFA_NOTIFICATION_BIND`, issued by the receiver `caller`.
    pub fn notification_bind(
        &self,
        caller: VcpuRef,
        sender: PartitionId,
        receiver: PartitionId,
        flags: u32,
        bitmap: u64,
    ) -> Result<()> {
        self.check_receiver_is_caller(caller, sender, receiver)?;
        self.registry()
            .lock(caller.partition)
            .notifications
            .bind(sender, flags, bitmap)
    }

    pub fn notification_unbind(
        &self,
        caller: VcpuRef,
        sender: PartitionId,
        receiver: PartitionId,
        bitmap: u64,
    ) -> Result<()> {
        self.check_receiver_is_caller(caller, sender, receiver)?;
        let mut state = self.registry().lock(caller.partition);
        let vcpu_pending = state
            .vcpus
            .iter()
            .fold(0, |acc, v| acc | v.notifications.all());
        state.notifications.unbind(sender, bitmap, vcpu_pending)
    }

    fn check_receiver_is_caller(
        &self,
        caller: VcpuRef,
        sender: PartitionId,
        receiver: PartitionId,
    ) -> Result<()> {
        let caller_id = self.registry().partition(caller.partition).id();
        if receiver != caller_id || sender == receiver {
            return Err(Error::InvalidParameters);
        }
        self.registry()
            .index_of(sender)
            .map(|_| ())
            .ok_or(Error::InvalidParameters)
    }

    /// `FFA_NOTIFICATION_SET` from `caller` to `receiver`. Bits [31:16] of
    /// `flags` select the target of a per-vCPU notification.
    pub fn notification_set(
        &self,
        caller: VcpuRef,
        receiver: PartitionId,
        flags: u32,
        bitmap: u64,
    ) -> Result<()> {
        let sender = self.registry().partition(caller.partition).id();
        let idx = self.registry().index_of(receiver).ok_or(Error::InvalidParameters)?;
        if idx == caller.partition {
            return Err(Error::InvalidParameters);
        }
        let per_vcpu = flags & FLAG_PER_VCPU != 0;
        let target_vcpu = if per_vcpu { (flags >> 16) as usize } else { 0 };

        let mut state = self.registry().lock(idx);
        state.notifications.check_set(sender, per_vcpu, bitmap)?;
        if target_vcpu >= state.vcpus.len() {
            return Err(Error::InvalidParameters);
        }
        if per_vcpu {
            state.vcpus[target_vcpu].notifications.raise(sender, bitmap);
            state.notifications.info_reported = false;
        } else {
            state.notifications.raise_global(sender, bitmap);
        }
        state.vcpus[target_vcpu]
            .interrupts
            .inject(NOTIFICATION_PENDING_INTID);
        log::debug!(
            "notifications: {:#x} -> {:#x} bits {:#x}{}",
            sender,
            receiver,
            bitmap,
            if per_vcpu { " (per-vCPU)" } else { "" }
        );
        Ok(())
    }

    /// `FFA_NOTIFICATION_GET`: return and clear the selected classes for
    /// the calling vCPU.
    pub fn notification_get(&self, caller: VcpuRef, flags: u32) -> Result<NotificationsGot> {
        let flags = GetFlags::from_bits(flags).ok_or(Error::InvalidParameters)?;
        let mut state = self.registry().lock(caller.partition);
        if !state.notifications.enabled {
            return Err(Error::Denied);
        }
        let global = state.notifications.global.take(flags);
        let framework = if flags.contains(GetFlags::FRAMEWORK_SPM) {
            core::mem::take(&mut state.notifications.framework)
        } else {
            0
        };
        let partition_pending = state.notifications.has_pending();
        let vcpu = state
            .vcpus
            .get_mut(caller.index)
            .ok_or(Error::InvalidParameters)?;
        let local = vcpu.notifications.take(flags);
        // The pending interrupt stays up while any class is left unread.
        if !partition_pending && vcpu.notifications.is_empty() {
            vcpu.interrupts.clear(NOTIFICATION_PENDING_INTID);
        }
        Ok(NotificationsGot {
            from_sp: global.from_sp | local.from_sp,
            from_vm: global.from_vm | local.from_vm,
            framework,
        })
    }

    /// `FFA_NOTIFICATION_INFO_GET`: partitions with pending notifications
    /// not yet reported.
    pub fn notification_info_get(&self) -> Result<NotificationInfo> {
        let mut info = NotificationInfo::default();
        for idx in 0..self.registry().len() {
            let mut state = self.registry().lock(idx);
            let pending = state.notifications.has_pending()
                || state.vcpus.iter().any(|v| !v.notifications.is_empty());
            if !pending || state.notifications.info_reported {
                continue;
            }
            if info.ids.push(self.registry().partition(idx).id()).is_err() {
                info.more_pending = true;
                break;
            }
            state.notifications.info_reported = true;
        }
        if info.ids.is_empty() {
            return Err(Error::NoData);
        }
        Ok(info)
    }
}
