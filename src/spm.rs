//! The partition manager engine.
//!
//! [`Spm`] ties the registry, the memory-share table, the fragment table and
//! the interrupt-assignment table to the two hardware collaborators. The
//! operations themselves live next to the state they drive:
//!
//! - `ffa::direct`: direct messaging and run-state transitions
//! - `ffa::memory` and `ffa::fragments`: memory sharing
//! - `ffa::notifications`, `ffa::mailbox`: notifications, RX/TX, indirect messages
//! - `interrupts`: interrupt routing and the `HF_INTERRUPT_*` calls
//! - `ffa::dispatch`: the single entry point decoding an FF-A call
//!
//! Every operation takes `&self`; one instance serves all physical cores.

use crate::arch::traits::{InterruptController, MemoryTranslator};
use crate::error::{Error, Result};
use crate::ffa::fragments::FragmentTable;
use crate::ffa::memory::ShareTable;
use crate::ffa::region_index::Mode;
use crate::ffa::FfaValue;
use crate::interrupts::{InterruptAssignment, InterruptTable};
use crate::manifest::PartitionManifest;
use crate::registry::{Registry, RegistryError};
use crate::vcpu::{VcpuRef, VcpuState};

/// What the calling core does once an FF-A call has been handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallOutcome {
    /// Return `value` to the caller, which keeps running.
    Return(FfaValue),
    /// Suspend the caller and enter `vcpu` with `value` in its registers.
    Switch { vcpu: VcpuRef, value: FfaValue },
    /// Suspend the caller; nothing is runnable on its behalf.
    Idle,
}

impl CallOutcome {
    /// Value the next entered context receives, if any.
    pub fn value(&self) -> Option<FfaValue> {
        match self {
            CallOutcome::Return(v) | CallOutcome::Switch { value: v, .. } => Some(*v),
            CallOutcome::Idle => None,
        }
    }
}

pub struct Spm<T: MemoryTranslator, I: InterruptController> {
    registry: Registry,
    shares: ShareTable,
    fragments: FragmentTable,
    interrupts: InterruptTable,
    translator: T,
    ic: I,
}

impl<T: MemoryTranslator, I: InterruptController> Spm<T, I> {
    pub fn new(registry: Registry, translator: T, ic: I) -> Self {
        Self {
            registry,
            shares: ShareTable::new(),
            fragments: FragmentTable::new(),
            interrupts: InterruptTable::new(),
            translator,
            ic,
        }
    }

    /// Build the engine from the boot manifests: freeze the registry, map
    /// every partition's memory, and route the manifest interrupts.
    pub fn boot(manifests: &[PartitionManifest], translator: T, ic: I) -> core::result::Result<Self, RegistryError> {
        let registry = Registry::from_manifests(manifests)?;
        let spm = Self::new(registry, translator, ic);
        spm.ic.init(0);

        for (idx, m) in manifests.iter().enumerate() {
            for region in m.memory.iter() {
                if spm.translator.map(m.id, region.range, region.mode).is_err() {
                    log::error!("boot: cannot map memory of partition {:#x}", m.id);
                    return Err(RegistryError::BadMemory(m.id));
                }
            }
            for dev in m.devices.iter() {
                if spm.translator.map(m.id, dev.range, Mode::R | Mode::W).is_err() {
                    log::error!("boot: cannot map device region of partition {:#x}", m.id);
                    return Err(RegistryError::BadMemory(m.id));
                }
                for irq in dev.interrupts.iter() {
                    let assignment = InterruptAssignment::from_manifest(irq, idx, m.kind);
                    spm.interrupts
                        .assign(assignment)
                        .map_err(|_| RegistryError::BadInterrupt(irq.id))?;
                    spm.ic.configure_interrupt(&assignment.desc);
                    spm.ic.set_priority(irq.id, assignment.desc.target_cpu, irq.priority);
                    spm.ic.set_type(irq.id, irq.trigger);
                    spm.ic.enable(irq.id, assignment.desc.target_cpu);
                    if let Some(vcpu) = spm.registry.lock(idx).vcpu_mut(0) {
                        vcpu.interrupts.set_enabled(irq.id, true);
                    }
                }
            }
        }
        log::info!("spm: booted with {} partitions", spm.registry.len());
        Ok(spm)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn translator(&self) -> &T {
        &self.translator
    }

    pub fn interrupt_controller(&self) -> &I {
        &self.ic
    }

    pub fn interrupts(&self) -> &InterruptTable {
        &self.interrupts
    }

    pub(crate) fn shares(&self) -> &ShareTable {
        &self.shares
    }

    pub(crate) fn fragments(&self) -> &FragmentTable {
        &self.fragments
    }

    pub fn vcpu_state(&self, vcpu: VcpuRef) -> Option<VcpuState> {
        self.registry.get(vcpu.partition)?;
        let state = self.registry.lock(vcpu.partition);
        state.vcpu(vcpu.index).map(|v| v.state())
    }

    /// Value to load into the registers of `vcpu` when it is next entered.
    pub fn take_resume_value(&self, vcpu: VcpuRef) -> Option<FfaValue> {
        self.registry
            .lock(vcpu.partition)
            .vcpu_mut(vcpu.index)?
            .take_resume_value()
    }

    /// Start a vCPU at its entry point on physical core `cpu`.
    pub fn boot_vcpu(&self, vcpu: VcpuRef, cpu: usize) -> Result<()> {
        let mut state = self.registry.lock(vcpu.partition);
        let v = state.vcpu_mut(vcpu.index).ok_or(Error::InvalidParameters)?;
        v.transition_to(VcpuState::RunningNormal)?;
        v.set_cpu(Some(cpu));
        log::debug!(
            "spm: vcpu {}:{} started on cpu {}",
            self.registry.partition(vcpu.partition).id(),
            vcpu.index,
            cpu
        );
        Ok(())
    }
}
