//! Direct messaging and vCPU run-state transitions.
//!
//! Every transition here suspends one vCPU and possibly resumes another on
//! the same physical core. The vCPU that gets the core back is the one
//! suspended behind the caller: its direct-request sender if it is
//! servicing one, otherwise the vCPU that entered it with `FFA_RUN`.
//! There is no message queue. A request to a vCPU that is not waiting
//! fails at once and the sender keeps running. A request back up the
//! sender's own chain of requesters is refused outright.

use crate::arch::traits::{InterruptController, MemoryTranslator};
use crate::error::{Error, Result};
use crate::ffa::{pack_vcpu, unpack_endpoints, FfaValue, FuncId, PartitionId};
use crate::platform::MAX_PARTITIONS;
use crate::registry::PartitionProperties;
use crate::spm::{CallOutcome, Spm};
use crate::vcpu::{DirectRequester, Vcpu, VcpuRef, VcpuState};

/// The message as the other side sees it: flags cleared, and payload slots
/// truncated to 32 bits for the SMC32 variants.
fn direct_message(args: &FfaValue, is_64: bool) -> FfaValue {
    let mask = if is_64 { u64::MAX } else { 0xFFFF_FFFF };
    FfaValue {
        func: args.func,
        arg1: args.arg1 & 0xFFFF_FFFF,
        arg2: 0,
        arg3: args.arg3 & mask,
        arg4: args.arg4 & mask,
        arg5: args.arg5 & mask,
        arg6: args.arg6 & mask,
        arg7: args.arg7 & mask,
    }
}

fn vcpu_value(func: FuncId, id: PartitionId, index: usize) -> FfaValue {
    FfaValue {
        arg1: pack_vcpu(id, index as u16),
        ..FfaValue::new(func)
    }
}

/// Peer suspended behind `v`.
fn waker_of(v: &Vcpu) -> Option<VcpuRef> {
    v.requester().map(|r| r.vcpu).or(v.run_caller())
}

fn running(v: &Vcpu) -> Result<()> {
    if v.state().is_running() {
        Ok(())
    } else {
        Err(Error::Denied)
    }
}

impl<T: MemoryTranslator, I: InterruptController> Spm<T, I> {
    fn id_of(&self, idx: usize) -> PartitionId {
        self.registry().partition(idx).id()
    }

    /// Move `vcpu` to `next` and hand its core to the peer suspended behind
    /// it, which resumes with `wake_value`. `check` is evaluated under the
    /// lock before anything changes.
    fn suspend(
        &self,
        vcpu: VcpuRef,
        next: VcpuState,
        check: impl Fn(&Vcpu) -> Result<()>,
        update: impl FnOnce(&mut Vcpu),
        wake_value: FfaValue,
    ) -> Result<CallOutcome> {
        let waker = {
            let state = self.registry().lock(vcpu.partition);
            let v = state.vcpu(vcpu.index).ok_or(Error::InvalidParameters)?;
            check(v)?;
            waker_of(v)
        };

        let Some(w) = waker.filter(|w| w.partition != vcpu.partition) else {
            let mut state = self.registry().lock(vcpu.partition);
            let v = state.vcpu_mut(vcpu.index).ok_or(Error::InvalidParameters)?;
            check(v)?;
            v.transition_to(next)?;
            v.set_cpu(None);
            update(v);
            return Ok(CallOutcome::Idle);
        };

        let (mut state, mut peer) = self.registry().lock_pair(vcpu.partition, w.partition);
        let v = state.vcpu_mut(vcpu.index).ok_or(Error::InvalidParameters)?;
        check(v)?;
        let cpu = v.cpu();
        v.transition_to(next)?;
        v.set_cpu(None);
        update(v);

        let Some(p) = peer.vcpu_mut(w.index) else {
            return Ok(CallOutcome::Idle);
        };
        if p.state() != VcpuState::Blocked || p.awaiting() != Some(vcpu) {
            return Ok(CallOutcome::Idle);
        }
        p.transition_to(p.resume_state())?;
        p.set_awaiting(None);
        p.set_cpu(cpu);
        p.set_resume_value(wake_value);
        Ok(CallOutcome::Switch {
            vcpu: w,
            value: wake_value,
        })
    }

    /// Whether `target` is suspended somewhere up `caller`'s request chain.
    /// Locks one partition at a time.
    fn precedes_in_chain(&self, caller: VcpuRef, target: VcpuRef) -> bool {
        let mut at = caller;
        for _ in 0..MAX_PARTITIONS {
            let next = {
                let state = self.registry().lock(at.partition);
                state.vcpu(at.index).and_then(|v| v.requester()).map(|r| r.vcpu)
            };
            match next {
                Some(r) if r == target => return true,
                Some(r) => at = r,
                None => return false,
            }
        }
        false
    }

    /// `FFA_MSG_SEND_DIRECT_REQ_{32,64}`.
    pub fn direct_request(&self, caller: VcpuRef, args: FfaValue) -> Result<CallOutcome> {
        let is_64 = args.func_id()?.is_64bit();
        let (sender, receiver) = unpack_endpoints(args.arg1);
        let source = self.registry().partition(caller.partition);
        if sender != source.id() || args.arg2 != 0 {
            return Err(Error::InvalidParameters);
        }
        let target_idx = self
            .registry()
            .index_of(receiver)
            .ok_or(Error::InvalidParameters)?;
        if target_idx == caller.partition {
            return Err(Error::InvalidParameters);
        }
        let destination = self.registry().partition(target_idx);
        if !source.properties().contains(PartitionProperties::DIRECT_REQ_SEND)
            || !destination
                .properties()
                .contains(PartitionProperties::DIRECT_REQ_RECV)
        {
            return Err(Error::Denied);
        }
        let index = if destination.vcpu_count() == 1 {
            0
        } else {
            caller.index
        };
        if index >= destination.vcpu_count() as usize {
            return Err(Error::InvalidParameters);
        }
        let target = VcpuRef::new(target_idx, index);
        if self.precedes_in_chain(caller, target) {
            return Err(Error::Denied);
        }
        let value = direct_message(&args, is_64);

        let (mut src, mut dst) = self.registry().lock_pair(caller.partition, target_idx);
        let s = src.vcpu_mut(caller.index).ok_or(Error::InvalidParameters)?;
        running(s)?;
        let d = dst.vcpu_mut(index).ok_or(Error::InvalidParameters)?;
        match d.state() {
            VcpuState::Waiting => {}
            VcpuState::Aborted => return Err(Error::Aborted),
            _ => return Err(Error::Busy),
        }

        d.transition_to(VcpuState::RunningDirectReqRecv)?;
        d.set_requester(Some(DirectRequester {
            id: sender,
            vcpu: caller,
            is_64,
        }));
        d.set_cpu(s.cpu());
        d.set_resume_value(value);
        s.transition_to(VcpuState::Blocked)?;
        s.set_awaiting(Some(target));
        s.set_cpu(None);
        log::debug!(
            "direct: request {:#x}:{} -> {:#x}:{}",
            sender,
            caller.index,
            receiver,
            index
        );
        Ok(CallOutcome::Switch { vcpu: target, value })
    }

    /// `FFA_MSG_SEND_DIRECT_RESP_{32,64}`: answer the request being serviced.
    pub fn direct_response(&self, caller: VcpuRef, args: FfaValue) -> Result<CallOutcome> {
        let is_64 = args.func_id()?.is_64bit();
        let (source, destination) = unpack_endpoints(args.arg1);
        if source != self.id_of(caller.partition) || args.arg2 != 0 {
            return Err(Error::InvalidParameters);
        }
        let requester = {
            let state = self.registry().lock(caller.partition);
            let v = state.vcpu(caller.index).ok_or(Error::InvalidParameters)?;
            if v.state() != VcpuState::RunningDirectReqRecv {
                return Err(Error::Denied);
            }
            v.requester().ok_or(Error::Denied)?
        };
        if destination != requester.id || requester.is_64 != is_64 {
            return Err(Error::InvalidParameters);
        }
        let value = direct_message(&args, is_64);

        let (mut me, mut peer) = self
            .registry()
            .lock_pair(caller.partition, requester.vcpu.partition);
        let v = me.vcpu_mut(caller.index).ok_or(Error::InvalidParameters)?;
        if v.state() != VcpuState::RunningDirectReqRecv || v.requester() != Some(requester) {
            return Err(Error::Denied);
        }
        let cpu = v.cpu();
        v.transition_to(VcpuState::Waiting)?;
        v.set_requester(None);
        v.set_run_caller(None);
        v.set_cpu(None);
        log::debug!("direct: response {:#x} -> {:#x}", source, destination);

        let Some(r) = peer.vcpu_mut(requester.vcpu.index) else {
            return Ok(CallOutcome::Idle);
        };
        if r.state() != VcpuState::Blocked || r.awaiting() != Some(caller) {
            log::warn!("direct: requester {:#x} no longer waiting for the response", destination);
            return Ok(CallOutcome::Idle);
        }
        r.transition_to(r.resume_state())?;
        r.set_awaiting(None);
        r.set_cpu(cpu);
        r.set_resume_value(value);
        Ok(CallOutcome::Switch {
            vcpu: requester.vcpu,
            value,
        })
    }

    /// `FFA_MSG_WAIT`.
    pub fn msg_wait(&self, caller: VcpuRef) -> Result<CallOutcome> {
        let id = self.id_of(caller.partition);
        let check = |v: &Vcpu| match v.state() {
            VcpuState::RunningNormal if v.has_wakeup() => Err(Error::Interrupted),
            VcpuState::RunningNormal => Ok(()),
            _ => Err(Error::Denied),
        };
        match self.suspend(
            caller,
            VcpuState::Waiting,
            check,
            |v| v.set_run_caller(None),
            vcpu_value(FuncId::MsgWait, id, caller.index),
        ) {
            Err(Error::Interrupted) => Ok(CallOutcome::Return(vcpu_value(
                FuncId::Interrupt,
                id,
                caller.index,
            ))),
            other => other,
        }
    }

    /// `FFA_YIELD`.
    pub fn yield_(&self, caller: VcpuRef) -> Result<CallOutcome> {
        let id = self.id_of(caller.partition);
        self.suspend(
            caller,
            VcpuState::Blocked,
            running,
            |_| {},
            vcpu_value(FuncId::Yield, id, caller.index),
        )
    }

    /// `FFA_RUN`: give the caller's core to the vCPU named in `x1`.
    pub fn run(&self, caller: VcpuRef, args: FfaValue) -> Result<CallOutcome> {
        let target_id = ((args.arg1 >> 16) & 0xFFFF) as PartitionId;
        let index = (args.arg1 & 0xFFFF) as usize;
        let target_idx = self
            .registry()
            .index_of(target_id)
            .ok_or(Error::InvalidParameters)?;
        if target_idx == caller.partition
            || index >= self.registry().partition(target_idx).vcpu_count() as usize
        {
            return Err(Error::InvalidParameters);
        }
        let target = VcpuRef::new(target_idx, index);

        let (mut me, mut peer) = self.registry().lock_pair(caller.partition, target_idx);
        let c = me.vcpu_mut(caller.index).ok_or(Error::InvalidParameters)?;
        running(c)?;
        let t = peer.vcpu_mut(index).ok_or(Error::InvalidParameters)?;
        let value = match t.state() {
            VcpuState::Off => {
                t.transition_to(VcpuState::RunningNormal)?;
                args
            }
            VcpuState::Blocked | VcpuState::Preempted => {
                if t.awaiting().is_some() {
                    return Err(Error::Busy);
                }
                if matches!(t.requester(), Some(r) if r.vcpu != caller) {
                    return Err(Error::Denied);
                }
                t.transition_to(t.resume_state())?;
                FfaValue::success(0)
            }
            VcpuState::Waiting => {
                if !t.has_wakeup() {
                    return Ok(CallOutcome::Return(vcpu_value(FuncId::MsgWait, target_id, index)));
                }
                t.transition_to(VcpuState::RunningNormal)?;
                vcpu_value(FuncId::Interrupt, target_id, index)
            }
            VcpuState::RunningNormal | VcpuState::RunningDirectReqRecv => {
                return Err(Error::Busy)
            }
            VcpuState::Aborted => return Err(Error::Aborted),
        };
        t.set_run_caller(Some(caller));
        t.set_cpu(c.cpu());
        t.set_resume_value(value);
        c.transition_to(VcpuState::Blocked)?;
        c.set_awaiting(Some(target));
        c.set_cpu(None);
        Ok(CallOutcome::Switch { vcpu: target, value })
    }

    /// Take the core away from a running vCPU. Whoever is suspended behind
    /// it resumes with `FFA_INTERRUPT` naming the preempted vCPU.
    pub fn preempt(&self, vcpu: VcpuRef) -> Result<CallOutcome> {
        let id = self.id_of(vcpu.partition);
        self.suspend(
            vcpu,
            VcpuState::Preempted,
            |v| {
                if v.state().is_running() {
                    Ok(())
                } else {
                    Err(Error::InvalidState)
                }
            },
            |_| {},
            vcpu_value(FuncId::Interrupt, id, vcpu.index),
        )
    }

    /// The vCPU faulted. Its requester, if any, resumes with
    /// `FFA_ERROR(ABORTED)` instead of a response.
    pub fn abort_vcpu(&self, vcpu: VcpuRef) -> Result<CallOutcome> {
        log::error!(
            "direct: vcpu {:#x}:{} aborted",
            self.id_of(vcpu.partition),
            vcpu.index
        );
        self.suspend(
            vcpu,
            VcpuState::Aborted,
            |v| {
                if v.state().is_running() {
                    Ok(())
                } else {
                    Err(Error::InvalidState)
                }
            },
            |v| {
                v.set_requester(None);
                v.set_run_caller(None);
            },
            FfaValue::error(Error::Aborted),
        )
    }
}
