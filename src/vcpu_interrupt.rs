//! Virtual Interrupt Management for partition vCPUs
//!
//! Each vCPU carries a pending and an enabled bitmap covering every
//! virtual interrupt id. The engine sets pending bits when a physical
//! interrupt or notification is routed to the vCPU; the partition pulls
//! them with `HF_INTERRUPT_GET` and the arch layer turns the lowest
//! deliverable id into a list-register write when it resumes the vCPU.

use crate::platform::NUM_VIRTUAL_INTERRUPT_IDS;

const WORDS: usize = (NUM_VIRTUAL_INTERRUPT_IDS as usize) / 64;

/// Virtual interrupt state for a vCPU
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VcpuInterrupts {
    pending: [u64; WORDS],
    enabled: [u64; WORDS],
    /// Number of ids that are both pending and enabled.
    deliverable: u32,
}

impl Default for VcpuInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl VcpuInterrupts {
    pub const fn new() -> Self {
        Self {
            pending: [0; WORDS],
            enabled: [0; WORDS],
            deliverable: 0,
        }
    }

    fn slot(intid: u32) -> Option<(usize, u64)> {
        if intid >= NUM_VIRTUAL_INTERRUPT_IDS {
            return None;
        }
        Some(((intid / 64) as usize, 1u64 << (intid % 64)))
    }

    fn is_deliverable(&self, word: usize, bit: u64) -> bool {
        self.pending[word] & self.enabled[word] & bit != 0
    }

    /// Enable or disable delivery of `intid`. Returns false for ids out of
    /// range.
    pub fn set_enabled(&mut self, intid: u32, enable: bool) -> bool {
        let Some((w, bit)) = Self::slot(intid) else {
            return false;
        };
        let was = self.is_deliverable(w, bit);
        if enable {
            self.enabled[w] |= bit;
        } else {
            self.enabled[w] &= !bit;
        }
        self.adjust(was, self.is_deliverable(w, bit));
        true
    }

    pub fn is_enabled(&self, intid: u32) -> bool {
        Self::slot(intid).is_some_and(|(w, bit)| self.enabled[w] & bit != 0)
    }

    pub fn is_pending(&self, intid: u32) -> bool {
        Self::slot(intid).is_some_and(|(w, bit)| self.pending[w] & bit != 0)
    }

    /// Mark `intid` pending. Returns true if it is now deliverable, i.e. the
    /// vCPU should be woken for it.
    pub fn inject(&mut self, intid: u32) -> bool {
        let Some((w, bit)) = Self::slot(intid) else {
            return false;
        };
        let was = self.is_deliverable(w, bit);
        self.pending[w] |= bit;
        let now = self.is_deliverable(w, bit);
        self.adjust(was, now);
        now
    }

    /// Clear the pending bit of `intid` without delivering it.
    pub fn clear(&mut self, intid: u32) {
        if let Some((w, bit)) = Self::slot(intid) {
            let was = self.is_deliverable(w, bit);
            self.pending[w] &= !bit;
            self.adjust(was, false);
        }
    }

    /// Pop the lowest pending and enabled id.
    pub fn next_pending(&mut self) -> Option<u32> {
        if self.deliverable == 0 {
            return None;
        }
        for w in 0..WORDS {
            let ready = self.pending[w] & self.enabled[w];
            if ready != 0 {
                let intid = (w as u32) * 64 + ready.trailing_zeros();
                self.clear(intid);
                return Some(intid);
            }
        }
        None
    }

    /// True if any enabled interrupt is pending.
    pub fn has_pending(&self) -> bool {
        self.deliverable != 0
    }

    pub fn deliverable_count(&self) -> u32 {
        self.deliverable
    }

    fn adjust(&mut self, was: bool, now: bool) {
        match (was, now) {
            (false, true) => self.deliverable += 1,
            (true, false) => self.deliverable -= 1,
            _ => {}
        }
    }
}
