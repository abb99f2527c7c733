//! Capability interfaces the engine consumes.
//!
//! The core never touches page tables or interrupt-controller registers
//! itself. It drives these traits, which keeps the state machines testable
//! on the host and lets a platform pick its backend at build time.

use crate::ffa::region_index::{Mode, PageRange};
use crate::ffa::PartitionId;

/// Interrupt trigger type.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TriggerType {
    #[default]
    Level,
    Edge,
}

/// Full description of one physical interrupt as routed to a partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InterruptDescriptor {
    pub id: u32,
    pub priority: u8,
    pub trigger: TriggerType,
    /// Group 0 / secure group 1 if true, non-secure group 1 otherwise.
    pub secure: bool,
    /// Core position the interrupt is routed to.
    pub target_cpu: usize,
    pub enabled: bool,
}

/// Interrupt controller driver contract (GICv3 on AArch64).
///
/// Methods take `&self`: the backend is shared by every core and serializes
/// register access internally.
pub trait InterruptController: Sync {
    /// Bring up the controller interface of core `cpu`.
    fn init(&self, cpu: usize);
    fn set_priority_mask(&self, mask: u8);
    fn priority_mask(&self) -> u8;
    fn set_priority(&self, id: u32, core_pos: usize, priority: u8);
    fn enable(&self, id: u32, core_pos: usize);
    fn disable(&self, id: u32, core_pos: usize);
    fn set_type(&self, id: u32, trigger: TriggerType);
    fn get_type(&self, id: u32) -> TriggerType;
    /// Acknowledge and return the highest-priority pending id.
    fn pending_interrupt_id(&self) -> u32;
    fn end_of_interrupt(&self, id: u32);
    /// Raise SGI `id` on core `core_pos`.
    fn send_sgi(&self, id: u32, core_pos: usize, to_this_security_state: bool);
    /// Program routing, priority, group and trigger from `desc`.
    fn configure_interrupt(&self, desc: &InterruptDescriptor);
    /// Reprogram an interrupt whose owner changed.
    fn reconfigure_interrupt(&self, desc: &InterruptDescriptor);
}

/// Failure reported by the address-translation backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranslationError {
    /// Page-table memory exhausted.
    OutOfMemory,
    /// Address outside what the stage-2 tables can describe.
    OutOfRange,
}

/// Stage-2 translation manager for partition address spaces.
pub trait MemoryTranslator: Sync {
    /// Install `range` with `mode` access in `partition`'s address space.
    fn map(&self, partition: PartitionId, range: PageRange, mode: Mode) -> Result<(), TranslationError>;
    /// Remove `range` from `partition`'s address space.
    fn unmap(&self, partition: PartitionId, range: PageRange) -> Result<(), TranslationError>;
    /// Change the access of an already-installed range. An empty access set
    /// keeps the translation but faults every access.
    fn protect(&self, partition: PartitionId, range: PageRange, mode: Mode) -> Result<(), TranslationError>;
}
