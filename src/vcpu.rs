//! Virtual CPU (vCPU) run state
//!
//! A vCPU belongs to exactly one partition and is referred to from other
//! components by [`VcpuRef`] (registry index + vCPU index), never by pointer.
//! The run-state machine here is the one the dispatch engine drives; every
//! change goes through [`Vcpu::transition_to`].

use crate::error::{Error, Result};
use crate::ffa::notifications::PendingBitmaps;
use crate::ffa::{FfaValue, PartitionId};
use crate::vcpu_interrupt::VcpuInterrupts;

/// Stable reference to a vCPU: registry slot of its partition plus its
/// index within that partition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct VcpuRef {
    pub partition: usize,
    pub index: usize,
}

impl VcpuRef {
    pub const fn new(partition: usize, index: usize) -> Self {
        Self { partition, index }
    }
}

/// vCPU run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// Never started.
    Off,
    /// Blocked in `FFA_MSG_WAIT` for any message.
    Waiting,
    /// Running on its own behalf.
    RunningNormal,
    /// Running to service a direct request.
    RunningDirectReqRecv,
    /// Suspended on something outside its control (a callee, a yield).
    Blocked,
    /// Core taken away by an interrupt or the scheduler.
    Preempted,
    /// Faulted. Terminal.
    Aborted,
}

impl VcpuState {
    pub fn is_running(self) -> bool {
        matches!(self, VcpuState::RunningNormal | VcpuState::RunningDirectReqRecv)
    }
}

/// The partition that sent the direct request a vCPU is servicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectRequester {
    pub id: PartitionId,
    pub vcpu: VcpuRef,
    /// Request arrived through the SMC64 variant.
    pub is_64: bool,
}

/// Virtual CPU
pub struct Vcpu {
    index: u16,
    state: VcpuState,
    /// Physical core the vCPU is scheduled on.
    cpu: Option<usize>,
    requester: Option<DirectRequester>,
    /// vCPU this one is suspended behind (a direct request callee or an
    /// `FFA_RUN` target).
    awaiting: Option<VcpuRef>,
    /// vCPU that resumed this one through `FFA_RUN`.
    run_caller: Option<VcpuRef>,
    /// Value delivered in x0-x7 the next time the vCPU is entered.
    resume_value: Option<FfaValue>,
    pub interrupts: VcpuInterrupts,
    pub notifications: PendingBitmaps,
}

impl Vcpu {
    pub const fn new(index: u16) -> Self {
        Self {
            index,
            state: VcpuState::Off,
            cpu: None,
            requester: None,
            awaiting: None,
            run_caller: None,
            resume_value: None,
            interrupts: VcpuInterrupts::new(),
            notifications: PendingBitmaps::new(),
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    pub fn cpu(&self) -> Option<usize> {
        self.cpu
    }

    pub fn set_cpu(&mut self, cpu: Option<usize>) {
        self.cpu = cpu;
    }

    pub fn requester(&self) -> Option<DirectRequester> {
        self.requester
    }

    pub fn set_requester(&mut self, requester: Option<DirectRequester>) {
        self.requester = requester;
    }

    pub fn awaiting(&self) -> Option<VcpuRef> {
        self.awaiting
    }

    pub fn set_awaiting(&mut self, target: Option<VcpuRef>) {
        self.awaiting = target;
    }

    pub fn run_caller(&self) -> Option<VcpuRef> {
        self.run_caller
    }

    pub fn set_run_caller(&mut self, caller: Option<VcpuRef>) {
        self.run_caller = caller;
    }

    pub fn set_resume_value(&mut self, value: FfaValue) {
        self.resume_value = Some(value);
    }

    pub fn take_resume_value(&mut self) -> Option<FfaValue> {
        self.resume_value.take()
    }

    /// Anything that should wake the vCPU out of `FFA_MSG_WAIT`.
    pub fn has_wakeup(&self) -> bool {
        self.interrupts.has_pending() || !self.notifications.is_empty()
    }

    /// State a suspended vCPU returns to when resumed.
    pub fn resume_state(&self) -> VcpuState {
        if self.requester.is_some() {
            VcpuState::RunningDirectReqRecv
        } else {
            VcpuState::RunningNormal
        }
    }

    /// Transition to a new run state, validating the transition.
    pub fn transition_to(&mut self, new_state: VcpuState) -> Result<()> {
        use VcpuState::*;
        let valid = match (self.state, new_state) {
            (Off, RunningNormal) => true,
            (RunningNormal | RunningDirectReqRecv, Waiting | Blocked | Preempted | Aborted) => {
                true
            }
            (Waiting, RunningDirectReqRecv | RunningNormal) => true,
            (Blocked | Preempted, RunningNormal | RunningDirectReqRecv) => true,
            _ => false,
        };
        if valid {
            self.state = new_state;
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }
}
