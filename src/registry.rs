//! Partition and vCPU registry.
//!
//! Built once at boot from the partition manifests and never resized. Other
//! components refer to partitions by their registry index and to vCPUs by
//! [`VcpuRef`]; nothing holds a pointer into the table.
//!
//! Each partition has one lock covering its vCPUs, mailbox, region index,
//! handle list and notification state. When more than one partition lock
//! is needed they are taken in ascending index order, which is what
//! [`Registry::lock_pair`] and [`Registry::lock_set`] enforce.

use bitflags::bitflags;
use heapless::{String, Vec};
use thiserror::Error;

use crate::ffa::mailbox::Mailbox;
use crate::ffa::notifications::NotificationState;
use crate::ffa::region_index::{IndexError, Mode, PageRange, RegionIndex};
use crate::ffa::{is_secure_id, PartitionId, HYPERVISOR_ID, SPMC_ID};
use crate::manifest::PartitionManifest;
use crate::platform::{
    MAX_DEVICE_INTERRUPTS, MAX_DEVICE_REGIONS, MAX_PARTITIONS, MAX_RECEIVERS, MAX_SHARES,
    MAX_VCPUS_PER_PARTITION, NOTIFICATION_PENDING_INTID,
};
use crate::sync::{SpinLock, SpinLockGuard};
use crate::vcpu::{Vcpu, VcpuRef};

/// Security classification of a partition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PartitionKind {
    /// Normal-world virtual machine.
    #[default]
    NormalVm,
    /// Secure partition.
    Secure,
    Other,
}

bitflags! {
    /// FF-A partition properties, as reported by `FFA_PARTITION_INFO_GET`.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PartitionProperties: u32 {
        const DIRECT_REQ_RECV = 1 << 0;
        const DIRECT_REQ_SEND = 1 << 1;
        const INDIRECT_MSG = 1 << 2;
        const NOTIFICATION = 1 << 3;
        const AARCH64 = 1 << 8;
    }
}

/// A device MMIO region owned by a partition and the interrupts wired to it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceRegion {
    pub range: PageRange,
    pub interrupts: Vec<u32, MAX_DEVICE_INTERRUPTS>,
}

/// Mutable partition state. Guarded by the partition's lock.
pub struct PartitionState {
    pub vcpus: Vec<Vcpu, MAX_VCPUS_PER_PARTITION>,
    pub mailbox: Mailbox,
    pub regions: RegionIndex,
    /// Memory handles this partition owns or holds a grant under.
    pub handles: Vec<u64, MAX_SHARES>,
    pub notifications: NotificationState,
    pub device_regions: Vec<DeviceRegion, MAX_DEVICE_REGIONS>,
}

impl PartitionState {
    pub fn vcpu(&self, index: usize) -> Option<&Vcpu> {
        self.vcpus.get(index)
    }

    pub fn vcpu_mut(&mut self, index: usize) -> Option<&mut Vcpu> {
        self.vcpus.get_mut(index)
    }

    pub fn add_handle(&mut self, handle: u64) {
        if !self.handles.contains(&handle) {
            // One entry per live share slot, so this cannot overflow.
            let _ = self.handles.push(handle);
        }
    }

    pub fn drop_handle(&mut self, handle: u64) {
        self.handles.retain(|h| *h != handle);
    }
}

pub struct Partition {
    id: PartitionId,
    kind: PartitionKind,
    properties: PartitionProperties,
    uuid: [u32; 4],
    vcpu_count: u16,
    debug_name: String<16>,
    state: SpinLock<PartitionState>,
}

impl Partition {
    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn kind(&self) -> PartitionKind {
        self.kind
    }

    pub fn properties(&self) -> PartitionProperties {
        self.properties
    }

    pub fn uuid(&self) -> [u32; 4] {
        self.uuid
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn vcpu_count(&self) -> u16 {
        self.vcpu_count
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum RegistryError {
    #[error("more than {} partitions", MAX_PARTITIONS)]
    TooManyPartitions,
    #[error("partition id {0:#x} reserved or duplicated")]
    BadId(PartitionId),
    #[error("partition {0:#x}: id does not match its security state")]
    KindMismatch(PartitionId),
    #[error("partition {0:#x}: invalid vCPU count")]
    BadVcpuCount(PartitionId),
    #[error("partition {0:#x}: overlapping or excess memory regions")]
    BadMemory(PartitionId),
    #[error("partition {id:#x}: memory at {begin:#x} already belongs to {other:#x}")]
    OwnershipConflict {
        id: PartitionId,
        other: PartitionId,
        begin: u64,
    },
    #[error("interrupt {0} assigned twice or table full")]
    BadInterrupt(u32),
}

/// Fixed table of every partition.
#[derive(Default)]
pub struct Registry {
    partitions: Vec<Partition, MAX_PARTITIONS>,
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            partitions: Vec::new(),
        }
    }

    /// Build a registry from boot manifests.
    pub fn from_manifests(manifests: &[PartitionManifest]) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for m in manifests {
            registry.add(m)?;
        }
        Ok(registry)
    }

    /// Register one partition. Returns its index.
    pub fn add(&mut self, m: &PartitionManifest) -> Result<usize, RegistryError> {
        if self.partitions.is_full() {
            return Err(RegistryError::TooManyPartitions);
        }
        if m.id == HYPERVISOR_ID || m.id == SPMC_ID || self.index_of(m.id).is_some() {
            return Err(RegistryError::BadId(m.id));
        }
        let secure_ok = match m.kind {
            PartitionKind::Secure => is_secure_id(m.id),
            PartitionKind::NormalVm => !is_secure_id(m.id),
            PartitionKind::Other => true,
        };
        if !secure_ok {
            return Err(RegistryError::KindMismatch(m.id));
        }
        if m.vcpu_count == 0 || m.vcpu_count as usize > MAX_VCPUS_PER_PARTITION {
            return Err(RegistryError::BadVcpuCount(m.id));
        }

        let mut vcpus = Vec::new();
        for i in 0..m.vcpu_count {
            let mut vcpu = Vcpu::new(i);
            vcpu.interrupts.set_enabled(NOTIFICATION_PENDING_INTID, true);
            let _ = vcpus.push(vcpu);
        }

        let bad_memory = |_: IndexError| RegistryError::BadMemory(m.id);
        let mut regions = RegionIndex::new();
        for region in m.memory.iter() {
            if !region.range.is_page_aligned() || region.range.is_empty() {
                return Err(RegistryError::BadMemory(m.id));
            }
            regions.insert(region.range, region.mode).map_err(bad_memory)?;
        }
        let mut device_regions = Vec::new();
        for dev in m.devices.iter() {
            regions.insert(dev.range, Mode::R | Mode::W).map_err(bad_memory)?;
            let mut interrupts = Vec::new();
            for irq in dev.interrupts.iter() {
                let _ = interrupts.push(irq.id);
            }
            let _ = device_regions.push(DeviceRegion {
                range: dev.range,
                interrupts,
            });
        }

        // Every page has one owner at boot.
        for other in self.partitions.iter() {
            let taken = other.state.lock();
            if let Some(r) = regions.iter().find(|r| taken.regions.overlaps(&r.range)) {
                return Err(RegistryError::OwnershipConflict {
                    id: m.id,
                    other: other.id,
                    begin: r.range.begin,
                });
            }
        }

        let mut notifications = NotificationState::new();
        if m.kind == PartitionKind::Secure {
            let _ = notifications.enable();
        }

        let partition = Partition {
            id: m.id,
            kind: m.kind,
            properties: m.properties,
            uuid: m.uuid,
            vcpu_count: m.vcpu_count,
            debug_name: m.debug_name.clone(),
            state: SpinLock::new(PartitionState {
                vcpus,
                mailbox: Mailbox::new(),
                regions,
                handles: Vec::new(),
                notifications,
                device_regions,
            }),
        };
        let idx = self.partitions.len();
        self.partitions
            .push(partition)
            .map_err(|_| RegistryError::TooManyPartitions)?;
        log::info!(
            "registry: partition {:#x} '{}' at index {} ({} vCPUs, {:?})",
            m.id,
            m.debug_name,
            idx,
            m.vcpu_count,
            m.kind
        );
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn index_of(&self, id: PartitionId) -> Option<usize> {
        self.partitions.iter().position(|p| p.id == id)
    }

    /// # Panics
    /// If `idx` is not a registry index. Indices only come from this
    /// registry, so a bad one is a logic error.
    pub fn partition(&self, idx: usize) -> &Partition {
        &self.partitions[idx]
    }

    pub fn get(&self, idx: usize) -> Option<&Partition> {
        self.partitions.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }

    /// Resolve `(id, vcpu index)` to a [`VcpuRef`].
    pub fn vcpu_ref(&self, id: PartitionId, index: usize) -> Option<VcpuRef> {
        let idx = self.index_of(id)?;
        (index < self.partition(idx).vcpu_count() as usize).then_some(VcpuRef::new(idx, index))
    }

    pub fn lock(&self, idx: usize) -> SpinLockGuard<'_, PartitionState> {
        self.partitions[idx].state.lock()
    }

    /// Lock two distinct partitions in index order; the guards come back in
    /// argument order.
    pub fn lock_pair(
        &self,
        a: usize,
        b: usize,
    ) -> (SpinLockGuard<'_, PartitionState>, SpinLockGuard<'_, PartitionState>) {
        assert_ne!(a, b, "lock_pair on one partition");
        if a < b {
            let ga = self.lock(a);
            let gb = self.lock(b);
            (ga, gb)
        } else {
            let gb = self.lock(b);
            let ga = self.lock(a);
            (ga, gb)
        }
    }

    /// Lock every partition in `indices` (duplicates ignored), lowest index
    /// first.
    pub fn lock_set(&self, indices: &[usize]) -> LockedSet<'_> {
        let mut order: Vec<usize, { MAX_RECEIVERS + 1 }> = Vec::new();
        for &i in indices {
            if !order.contains(&i) {
                assert!(order.push(i).is_ok(), "lock_set: too many partitions");
            }
        }
        order.sort_unstable();
        let mut guards = Vec::new();
        for &i in order.iter() {
            let _ = guards.push((i, self.lock(i)));
        }
        LockedSet { guards }
    }
}

/// Several partition locks held together. Released on drop.
pub struct LockedSet<'a> {
    guards: Vec<(usize, SpinLockGuard<'a, PartitionState>), { MAX_RECEIVERS + 1 }>,
}

impl LockedSet<'_> {
    /// # Panics
    /// If `idx` was not part of the locked set.
    pub fn get(&mut self, idx: usize) -> &mut PartitionState {
        match self.guards.iter_mut().find(|(i, _)| *i == idx) {
            Some((_, g)) => &mut **g,
            None => panic!("partition {} not in locked set", idx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PartitionManifest;

    #[test]
    fn rejects_duplicate_and_reserved_ids() {
        let mut r = Registry::new();
        r.add(&PartitionManifest::new(1, PartitionKind::NormalVm, 1)).unwrap();
        assert_eq!(
            r.add(&PartitionManifest::new(1, PartitionKind::NormalVm, 1)),
            Err(RegistryError::BadId(1))
        );
        assert_eq!(
            r.add(&PartitionManifest::new(SPMC_ID, PartitionKind::Secure, 1)),
            Err(RegistryError::BadId(SPMC_ID))
        );
    }

    #[test]
    fn secure_bit_must_match_kind() {
        let mut r = Registry::new();
        assert_eq!(
            r.add(&PartitionManifest::new(0x8001, PartitionKind::NormalVm, 1)),
            Err(RegistryError::KindMismatch(0x8001))
        );
        assert_eq!(
            r.add(&PartitionManifest::new(2, PartitionKind::Secure, 1)),
            Err(RegistryError::KindMismatch(2))
        );
    }

    #[test]
    fn lock_set_accepts_any_order() {
        let r = Registry::from_manifests(&[
            PartitionManifest::new(1, PartitionKind::NormalVm, 1),
            PartitionManifest::new(2, PartitionKind::NormalVm, 1),
            PartitionManifest::new(0x8001, PartitionKind::Secure, 2),
        ])
        .unwrap();
        let mut set = r.lock_set(&[2, 0, 2]);
        assert_eq!(set.get(2).vcpus.len(), 2);
        assert_eq!(set.get(0).vcpus.len(), 1);
        drop(set);
        assert!(r.lock(1).vcpus.len() == 1);
        assert_eq!(r.vcpu_ref(0x8001, 1), Some(VcpuRef::new(2, 1)));
        assert_eq!(r.vcpu_ref(0x8001, 2), None);
    }

    #[test]
    fn memory_has_one_owner_at_boot() {
        let ram = PageRange::new(0x6000_0000, 0x6010_0000);
        let mut r = Registry::new();
        r.add(&PartitionManifest::new(0x8001, PartitionKind::Secure, 1).with_memory(ram, Mode::RWX))
            .unwrap();
        let tail = PageRange::new(0x600f_f000, 0x6010_1000);
        assert_eq!(
            r.add(&PartitionManifest::new(0x8002, PartitionKind::Secure, 1).with_memory(tail, Mode::R)),
            Err(RegistryError::OwnershipConflict {
                id: 0x8002,
                other: 0x8001,
                begin: 0x600f_f000,
            })
        );
        assert_eq!(r.len(), 1);
        // Adjacent is fine.
        let next = PageRange::new(0x6010_0000, 0x6020_0000);
        assert!(r
            .add(&PartitionManifest::new(0x8002, PartitionKind::Secure, 1).with_memory(next, Mode::R))
            .is_ok());
    }

    #[test]
    fn secure_partitions_start_with_notifications_enabled() {
        let r = Registry::from_manifests(&[
            PartitionManifest::new(1, PartitionKind::NormalVm, 1),
            PartitionManifest::new(0x8001, PartitionKind::Secure, 1),
        ])
        .unwrap();
        assert!(!r.lock(0).notifications.is_enabled());
        assert!(r.lock(1).notifications.is_enabled());
    }
}
