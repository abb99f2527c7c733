//! Platform/Board Constants
//!
//! Fixed capacities and board-specific addresses live here so they can be
//! changed in one place when targeting a different platform. Nothing in the
//! core allocates; every table below is sized from these values.

// ── UART (PL011) ─────────────────────────────────────────────────────
pub const UART_BASE: usize = 0x0900_0000;

// ── GICv3 (QEMU virt) ────────────────────────────────────────────────
pub const GICD_BASE: usize = 0x0800_0000;
pub const GICR_BASE: usize = 0x080A_0000;
/// Each redistributor is an RD frame followed by an SGI frame.
pub const GICR_STRIDE: usize = 0x2_0000;

// ── Translation granule ──────────────────────────────────────────────
pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;

/// RX/TX mailbox buffers are exactly one page each.
pub const MAILBOX_SIZE: usize = PAGE_SIZE as usize;

// ── Boot discovery limits ────────────────────────────────────────────
pub const MAX_CPUS: usize = 8;
pub const MAX_MEM_RANGES: usize = 8;

// ── Partitions ───────────────────────────────────────────────────────
pub const MAX_PARTITIONS: usize = 8;
pub const MAX_VCPUS_PER_PARTITION: usize = MAX_CPUS;
pub const MAX_MANIFEST_MEM_REGIONS: usize = 4;
pub const MAX_DEVICE_REGIONS: usize = 4;
pub const MAX_DEVICE_INTERRUPTS: usize = 4;

/// Region index entries per partition address space.
pub const MAX_REGIONS_PER_PARTITION: usize = 128;

// ── Memory sharing ───────────────────────────────────────────────────
pub const MAX_SHARES: usize = 32;
pub const MAX_RECEIVERS: usize = 4;
pub const MAX_CONSTITUENTS: usize = 320;
pub const MAX_FRAGMENT_SESSIONS: usize = 4;

/// Largest transaction descriptor the parser accepts: the 48-byte header,
/// one 16-byte access descriptor per receiver, the 16-byte composite header
/// and 16 bytes per constituent. Fragments are reassembled up to this size.
pub const FRAGMENT_BUFFER_SIZE: usize = 48 + MAX_RECEIVERS * 16 + 16 + MAX_CONSTITUENTS * 16;

// A descriptor with every constituent must need more than one TX page.
const _: () = assert!(FRAGMENT_BUFFER_SIZE > MAILBOX_SIZE);

// ── Interrupts ───────────────────────────────────────────────────────
pub const MAX_INTERRUPTS: usize = 64;

/// Interrupt ids covered by a vCPU's virtual interrupt bitmaps.
pub const NUM_VIRTUAL_INTERRUPT_IDS: u32 = 1024;

/// Virtual interrupt raised when a notification becomes pending.
pub const NOTIFICATION_PENDING_INTID: u32 = 5;

/// Ids from here up are special (spurious) values, not real interrupts.
pub const SPURIOUS_INTID_MIN: u32 = 1020;

/// SGI used to kick a remote core that must inject a virtual interrupt.
pub const SGI_VIRTUAL_INTERRUPT: u32 = 8;
