//! GICv3 backend for the interrupt-controller contract.
//!
//! The CPU interface is driven through the ICC_* system registers; the
//! distributor (SPIs) and the redistributors (SGIs/PPIs, one per core) are
//! MMIO. Secure partitions' interrupts go to Secure Group 1, everything
//! else to Non-secure Group 1.

use core::arch::asm;
use core::ptr::{read_volatile, write_volatile};

use crate::arch::traits::{InterruptController, InterruptDescriptor, TriggerType};
use crate::sync::SpinLock;

// Distributor
const GICD_CTLR: usize = 0x0000;
const GICD_IGROUPR: usize = 0x0080;
const GICD_ISENABLER: usize = 0x0100;
const GICD_ICENABLER: usize = 0x0180;
const GICD_IPRIORITYR: usize = 0x0400;
const GICD_ICFGR: usize = 0x0C00;
const GICD_IGRPMODR: usize = 0x0D00;
const GICD_IROUTER: usize = 0x6000;

const GICD_CTLR_ARE_S: u32 = 1 << 4;
const GICD_CTLR_ENABLE_G1S: u32 = 1 << 2;
const GICD_CTLR_ENABLE_G1NS: u32 = 1 << 1;

// Redistributor SGI frame, relative to the RD frame.
const GICR_SGI_OFFSET: usize = 0x1_0000;
const GICR_WAKER: usize = 0x0014;
const GICR_WAKER_PROCESSOR_SLEEP: u32 = 1 << 1;
const GICR_WAKER_CHILDREN_ASLEEP: u32 = 1 << 2;

/// First shared peripheral interrupt.
const SPI_BASE: u32 = 32;

pub struct GicV3 {
    gicd: usize,
    gicr: usize,
    gicr_stride: usize,
    /// Serializes read-modify-write cycles on shared distributor registers.
    lock: SpinLock<()>,
}

impl GicV3 {
    /// # Safety
    /// `gicd` and `gicr` must be the mapped distributor and first
    /// redistributor frames of a GICv3.
    pub const unsafe fn new(gicd: usize, gicr: usize, gicr_stride: usize) -> Self {
        Self {
            gicd,
            gicr,
            gicr_stride,
            lock: SpinLock::new(()),
        }
    }

    /// Registers of `id`'s bank: the distributor for SPIs, the target
    /// core's redistributor SGI frame otherwise.
    fn bank(&self, id: u32, core_pos: usize) -> usize {
        if id >= SPI_BASE {
            self.gicd
        } else {
            self.gicr + core_pos * self.gicr_stride + GICR_SGI_OFFSET
        }
    }

    fn read(addr: usize) -> u32 {
        unsafe { read_volatile(addr as *const u32) }
    }

    fn write(addr: usize, value: u32) {
        unsafe { write_volatile(addr as *mut u32, value) }
    }

    fn update(&self, addr: usize, clear: u32, set: u32) {
        let _guard = self.lock.lock();
        Self::write(addr, (Self::read(addr) & !clear) | set);
    }

    fn set_group(&self, id: u32, core_pos: usize, secure: bool) {
        let base = self.bank(id, core_pos);
        let reg = (id / 32) as usize * 4;
        let bit = 1 << (id % 32);
        if secure {
            self.update(base + GICD_IGROUPR + reg, bit, 0);
            self.update(base + GICD_IGRPMODR + reg, 0, bit);
        } else {
            self.update(base + GICD_IGROUPR + reg, 0, bit);
            self.update(base + GICD_IGRPMODR + reg, bit, 0);
        }
    }

    fn route(&self, id: u32, core_pos: usize) {
        if id < SPI_BASE {
            return;
        }
        let addr = self.gicd + GICD_IROUTER + id as usize * 8;
        // Aff0 only; the reference platform has a single cluster.
        unsafe { write_volatile(addr as *mut u64, core_pos as u64 & 0xff) };
    }
}

fn isb() {
    unsafe { asm!("isb", options(nostack, nomem)) };
}

impl InterruptController for GicV3 {
    fn init(&self, cpu: usize) {
        if cpu == 0 {
            self.update(
                self.gicd + GICD_CTLR,
                0,
                GICD_CTLR_ARE_S | GICD_CTLR_ENABLE_G1S | GICD_CTLR_ENABLE_G1NS,
            );
        }
        let rd = self.gicr + cpu * self.gicr_stride;
        Self::write(rd + GICR_WAKER, Self::read(rd + GICR_WAKER) & !GICR_WAKER_PROCESSOR_SLEEP);
        while Self::read(rd + GICR_WAKER) & GICR_WAKER_CHILDREN_ASLEEP != 0 {
            core::hint::spin_loop();
        }
        unsafe {
            asm!("msr ICC_SRE_EL1, {v}", v = in(reg) 0x7u64, options(nostack, nomem));
            asm!("msr ICC_IGRPEN1_EL1, {v}", v = in(reg) 1u64, options(nostack, nomem));
        }
        self.set_priority_mask(0xff);
        isb();
    }

    fn set_priority_mask(&self, mask: u8) {
        unsafe { asm!("msr ICC_PMR_EL1, {v}", v = in(reg) mask as u64, options(nostack, nomem)) };
    }

    fn priority_mask(&self) -> u8 {
        let pmr: u64;
        unsafe { asm!("mrs {v}, ICC_PMR_EL1", v = out(reg) pmr, options(nostack, nomem)) };
        pmr as u8
    }

    fn set_priority(&self, id: u32, core_pos: usize, priority: u8) {
        let addr = self.bank(id, core_pos) + GICD_IPRIORITYR + id as usize;
        unsafe { write_volatile(addr as *mut u8, priority) };
    }

    fn enable(&self, id: u32, core_pos: usize) {
        let addr = self.bank(id, core_pos) + GICD_ISENABLER + (id / 32) as usize * 4;
        Self::write(addr, 1 << (id % 32));
    }

    fn disable(&self, id: u32, core_pos: usize) {
        let addr = self.bank(id, core_pos) + GICD_ICENABLER + (id / 32) as usize * 4;
        Self::write(addr, 1 << (id % 32));
    }

    fn set_type(&self, id: u32, trigger: TriggerType) {
        // SGIs are always edge; PPIs are programmed on core 0's frame.
        if id < 16 {
            return;
        }
        let addr = self.bank(id, 0) + GICD_ICFGR + (id / 16) as usize * 4;
        let bit = 2 << ((id % 16) * 2);
        match trigger {
            TriggerType::Edge => self.update(addr, 0, bit),
            TriggerType::Level => self.update(addr, bit, 0),
        }
    }

    fn get_type(&self, id: u32) -> TriggerType {
        if id < 16 {
            return TriggerType::Edge;
        }
        let addr = self.bank(id, 0) + GICD_ICFGR + (id / 16) as usize * 4;
        if Self::read(addr) & (2 << ((id % 16) * 2)) != 0 {
            TriggerType::Edge
        } else {
            TriggerType::Level
        }
    }

    fn pending_interrupt_id(&self) -> u32 {
        let iar: u64;
        unsafe { asm!("mrs {v}, ICC_IAR1_EL1", v = out(reg) iar, options(nostack, nomem)) };
        (iar & 0xff_ffff) as u32
    }

    fn end_of_interrupt(&self, id: u32) {
        unsafe { asm!("msr ICC_EOIR1_EL1, {v}", v = in(reg) id as u64, options(nostack, nomem)) };
        isb();
    }

    fn send_sgi(&self, id: u32, core_pos: usize, to_this_security_state: bool) {
        let value = ((id as u64 & 0xf) << 24) | (1u64 << (core_pos & 0xf));
        unsafe {
            if to_this_security_state {
                asm!("msr ICC_SGI1R_EL1, {v}", v = in(reg) value, options(nostack, nomem));
            } else {
                asm!("msr ICC_ASGI1R_EL1, {v}", v = in(reg) value, options(nostack, nomem));
            }
        }
        isb();
    }

    fn configure_interrupt(&self, desc: &InterruptDescriptor) {
        self.disable(desc.id, desc.target_cpu);
        self.set_group(desc.id, desc.target_cpu, desc.secure);
        self.set_priority(desc.id, desc.target_cpu, desc.priority);
        self.set_type(desc.id, desc.trigger);
        self.route(desc.id, desc.target_cpu);
        if desc.enabled {
            self.enable(desc.id, desc.target_cpu);
        }
    }

    fn reconfigure_interrupt(&self, desc: &InterruptDescriptor) {
        self.configure_interrupt(desc);
    }
}
