//! Physical interrupt routing and virtual interrupt calls.
//!
//! Interrupts named in a partition manifest are assigned to that partition
//! at boot. When one fires, the core that took the exit injects it into the
//! owning vCPU and, if something else is running, preempts so the scheduler
//! can run the owner. Ownership can move with a lent or donated device
//! region; the controller is reprogrammed through `reconfigure_interrupt`.

use heapless::Vec;

use crate::arch::traits::{InterruptController, InterruptDescriptor, MemoryTranslator};
use crate::error::{Error, Result};
use crate::manifest::InterruptManifest;
use crate::platform::{MAX_INTERRUPTS, NUM_VIRTUAL_INTERRUPT_IDS, SGI_VIRTUAL_INTERRUPT, SPURIOUS_INTID_MIN};
use crate::registry::PartitionKind;
use crate::spm::{CallOutcome, Spm};
use crate::sync::SpinLock;
use crate::vcpu::VcpuRef;

/// Returned by `HF_INTERRUPT_GET` when nothing is pending.
pub const HF_INVALID_INTID: u32 = 0xFFFF_FFFF;

/// One physical interrupt and the vCPU entitled to it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InterruptAssignment {
    pub desc: InterruptDescriptor,
    /// Registry index of the owning partition.
    pub owner: usize,
    pub vcpu: usize,
}

impl InterruptAssignment {
    pub fn from_manifest(irq: &InterruptManifest, owner: usize, kind: PartitionKind) -> Self {
        Self {
            desc: InterruptDescriptor {
                id: irq.id,
                priority: irq.priority,
                trigger: irq.trigger,
                secure: kind == PartitionKind::Secure,
                target_cpu: 0,
                enabled: true,
            },
            owner,
            vcpu: 0,
        }
    }
}

/// Interrupt id to owner lookup.
pub struct InterruptTable {
    entries: SpinLock<Vec<InterruptAssignment, MAX_INTERRUPTS>>,
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptTable {
    pub const fn new() -> Self {
        Self {
            entries: SpinLock::new(Vec::new()),
        }
    }

    pub fn assign(&self, assignment: InterruptAssignment) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|a| a.desc.id == assignment.desc.id) {
            return Err(Error::Denied);
        }
        entries.push(assignment).map_err(|_| Error::NoMemory)
    }

    pub fn lookup(&self, id: u32) -> Option<InterruptAssignment> {
        self.entries.lock().iter().find(|a| a.desc.id == id).copied()
    }

    /// Hand `id` to a new owner. Returns the updated descriptor so the
    /// caller can reprogram the controller once the table lock is dropped.
    pub fn reassign(&self, id: u32, owner: usize, vcpu: usize, secure: bool) -> Option<InterruptDescriptor> {
        let mut entries = self.entries.lock();
        let a = entries.iter_mut().find(|a| a.desc.id == id)?;
        a.owner = owner;
        a.vcpu = vcpu;
        a.desc.secure = secure;
        Some(a.desc)
    }

    pub fn owned_by(&self, owner: usize) -> usize {
        self.entries.lock().iter().filter(|a| a.owner == owner).count()
    }
}

impl<T: MemoryTranslator, I: InterruptController> Spm<T, I> {
    /// Move interrupt `id` to vCPU 0 of partition `owner` and reprogram the
    /// controller. Must be called with no partition lock held.
    pub(crate) fn move_interrupt(&self, id: u32, owner: usize) {
        let secure = self.registry().partition(owner).kind() == PartitionKind::Secure;
        match self.interrupts().reassign(id, owner, 0, secure) {
            Some(desc) => {
                self.interrupt_controller().reconfigure_interrupt(&desc);
                log::debug!(
                    "interrupts: {} now owned by {:#x}",
                    id,
                    self.registry().partition(owner).id()
                );
            }
            None => log::warn!("interrupts: {} follows a device region but is not assigned", id),
        }
    }

    /// Handle a physical interrupt exit on core `cpu`, where `current` is
    /// the vCPU that was running. Returns what the core should do next, or
    /// `None` to resume `current` unchanged.
    pub fn handle_interrupt_exit(&self, cpu: usize, current: Option<VcpuRef>) -> Option<CallOutcome> {
        let ic = self.interrupt_controller();
        let id = ic.pending_interrupt_id();
        if id >= SPURIOUS_INTID_MIN {
            return None;
        }
        let Some(assignment) = self.interrupts().lookup(id) else {
            log::warn!("interrupts: unassigned interrupt {} on cpu {}", id, cpu);
            ic.end_of_interrupt(id);
            return None;
        };
        let owner = VcpuRef::new(assignment.owner, assignment.vcpu);

        let delivered = {
            let mut state = self.registry().lock(owner.partition);
            state.vcpu_mut(owner.index).map(|vcpu| {
                vcpu.interrupts.inject(id);
                vcpu.cpu()
            })
        };
        ic.end_of_interrupt(id);
        let Some(owner_cpu) = delivered else {
            log::warn!("interrupts: {} is assigned to missing vcpu {:?}", id, owner);
            return None;
        };

        if let Some(remote) = owner_cpu.filter(|c| *c != cpu) {
            ic.send_sgi(SGI_VIRTUAL_INTERRUPT, remote, true);
            return None;
        }
        if current == Some(owner) {
            return None;
        }
        let preempted = current?;
        match self.preempt(preempted) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::debug!("interrupts: cannot preempt {:?}: {}", preempted, e);
                None
            }
        }
    }

    /// `HF_INTERRUPT_ENABLE`: enable or disable virtual interrupt `id` on the
    /// calling vCPU.
    pub fn interrupt_enable(&self, caller: VcpuRef, id: u32, enable: bool) -> Result<()> {
        if id >= NUM_VIRTUAL_INTERRUPT_IDS {
            return Err(Error::InvalidParameters);
        }
        let mut state = self.registry().lock(caller.partition);
        let vcpu = state.vcpu_mut(caller.index).ok_or(Error::InvalidParameters)?;
        vcpu.interrupts.set_enabled(id, enable);
        Ok(())
    }

    /// `HF_INTERRUPT_GET`: pop the lowest pending enabled id.
    pub fn interrupt_get(&self, caller: VcpuRef) -> u32 {
        self.registry()
            .lock(caller.partition)
            .vcpu_mut(caller.index)
            .and_then(|v| v.interrupts.next_pending())
            .unwrap_or(HF_INVALID_INTID)
    }

    /// `HF_INTERRUPT_DEACTIVATE`: the partition is done with `vint`. Only
    /// identity mapping between physical and virtual ids is supported.
    pub fn interrupt_deactivate(&self, caller: VcpuRef, pint: u32, vint: u32) -> Result<()> {
        if pint != vint {
            return Err(Error::InvalidParameters);
        }
        if let Some(a) = self.interrupts().lookup(pint) {
            if a.owner != caller.partition {
                return Err(Error::Denied);
            }
        }
        let mut state = self.registry().lock(caller.partition);
        let vcpu = state.vcpu_mut(caller.index).ok_or(Error::InvalidParameters)?;
        vcpu.interrupts.clear(vint);
        Ok(())
    }
}
