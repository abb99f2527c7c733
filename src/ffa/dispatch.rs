//! FF-A call decoding.
//!
//! [`Spm::handle_call`] is the single entry the trap handler uses for an
//! SMC/HVC from a partition. It decodes `x0`, pulls the operands out of
//! the remaining registers and forwards to the engine operation. Errors
//! never escape: they become an `FFA_ERROR` return to the caller.

use crate::arch::traits::{InterruptController, MemoryTranslator};
use crate::error::{Error, Result};
use crate::ffa::descriptors::PARTITION_INFO_SIZE;
use crate::ffa::memory::TransferKind;
use crate::ffa::{unpack_endpoints, FfaValue, FuncId, FFA_VERSION_1_1, SPMC_ID};
use crate::spm::{CallOutcome, Spm};
use crate::vcpu::VcpuRef;

/// `FFA_NOTIFICATION_INFO_GET`: `x2` bit 0 flags more pending partitions.
pub const INFO_GET_MORE_PENDING: u64 = 1 << 0;
const INFO_GET_LIST_COUNT_SHIFT: u32 = 7;
const IDS_PER_REGISTER: usize = 4;

fn success() -> CallOutcome {
    CallOutcome::Return(FfaValue::success(0))
}

fn bitmap(lo: u64, hi: u64) -> u64 {
    (lo & 0xFFFF_FFFF) | (hi << 32)
}

/// Whether `FFA_FEATURES` reports `func` as implemented.
fn is_implemented(func: FuncId) -> bool {
    !matches!(
        func,
        FuncId::Error
            | FuncId::Success32
            | FuncId::Success64
            | FuncId::Interrupt
            | FuncId::MemRetrieveResp
    )
}

impl<T: MemoryTranslator, I: InterruptController> Spm<T, I> {
    /// Handle one FF-A call from `current`.
    pub fn handle_call(&self, current: VcpuRef, args: FfaValue) -> CallOutcome {
        match self.dispatch(current, args) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::debug!("ffa: call {:#x} from {:?} failed: {}", args.func, current, e);
                CallOutcome::Return(FfaValue::error(e))
            }
        }
    }

    fn dispatch(&self, current: VcpuRef, args: FfaValue) -> Result<CallOutcome> {
        let func = args.func_id()?;
        let caller_id = self.registry().partition(current.partition).id();
        let ret = CallOutcome::Return;

        let outcome = match func {
            FuncId::Version => {
                if args.arg1 & (1 << 31) != 0 {
                    return Err(Error::NotSupported);
                }
                ret(FfaValue {
                    func: FFA_VERSION_1_1 as u64,
                    ..Default::default()
                })
            }
            FuncId::Features => {
                let queried = u32::try_from(args.arg1)
                    .ok()
                    .and_then(|f| FuncId::try_from(f).ok())
                    .filter(|f| is_implemented(*f));
                match queried {
                    Some(_) => success(),
                    None => return Err(Error::NotSupported),
                }
            }
            FuncId::IdGet => ret(FfaValue::success(caller_id as u64)),
            FuncId::SpmIdGet => ret(FfaValue::success(SPMC_ID as u64)),

            FuncId::RxTxMap32 | FuncId::RxTxMap64 => {
                self.rxtx_map(current, args.arg1, args.arg2, args.arg3 as u32)?;
                success()
            }
            FuncId::RxTxUnmap => {
                self.rxtx_unmap(current)?;
                success()
            }
            FuncId::RxRelease => {
                self.rx_release(current)?;
                success()
            }
            FuncId::PartitionInfoGet => {
                let uuid = [
                    args.arg1 as u32,
                    args.arg2 as u32,
                    args.arg3 as u32,
                    args.arg4 as u32,
                ];
                let count = self.partition_info_get(current, uuid, args.arg5 as u32)?;
                ret(FfaValue {
                    arg2: count as u64,
                    arg3: PARTITION_INFO_SIZE as u64,
                    ..FfaValue::new(FuncId::Success32)
                })
            }
            FuncId::MsgSend2 => {
                self.msg_send2(current)?;
                success()
            }

            FuncId::MsgSendDirectReq32 | FuncId::MsgSendDirectReq64 => {
                self.direct_request(current, args)?
            }
            FuncId::MsgSendDirectResp32 | FuncId::MsgSendDirectResp64 => {
                self.direct_response(current, args)?
            }
            FuncId::MsgWait => self.msg_wait(current)?,
            FuncId::Yield => self.yield_(current)?,
            FuncId::Run => self.run(current, args)?,

            FuncId::MemShare32
            | FuncId::MemShare64
            | FuncId::MemLend32
            | FuncId::MemLend64
            | FuncId::MemDonate32
            | FuncId::MemDonate64 => {
                let kind = TransferKind::from_func(func).ok_or(Error::NotSupported)?;
                // Buffers passed by address (x3/x4) are not supported.
                if args.arg3 != 0 || args.arg4 != 0 {
                    return Err(Error::InvalidParameters);
                }
                ret(self.mem_send(kind, current, args.arg1 as u32, args.arg2 as u32)?)
            }
            FuncId::MemRetrieveReq32 | FuncId::MemRetrieveReq64 => ret(self.mem_retrieve(current)?),
            FuncId::MemRelinquish => {
                self.mem_relinquish(current)?;
                success()
            }
            FuncId::MemReclaim => {
                self.mem_reclaim(current, args.handle_from_arg1(), args.arg3 as u32)?;
                success()
            }
            FuncId::MemFragTx => ret(self.mem_frag_tx(current, args)?),
            FuncId::MemFragRx => ret(self.mem_frag_rx(current, args)?),

            FuncId::NotificationBitmapCreate => {
                self.notification_bitmap_create(args.arg1 as u16)?;
                success()
            }
            FuncId::NotificationBitmapDestroy => {
                self.notification_bitmap_destroy(args.arg1 as u16)?;
                success()
            }
            FuncId::NotificationBind => {
                let (sender, receiver) = unpack_endpoints(args.arg1);
                self.notification_bind(
                    current,
                    sender,
                    receiver,
                    args.arg2 as u32,
                    bitmap(args.arg3, args.arg4),
                )?;
                success()
            }
            FuncId::NotificationUnbind => {
                let (sender, receiver) = unpack_endpoints(args.arg1);
                self.notification_unbind(current, sender, receiver, bitmap(args.arg3, args.arg4))?;
                success()
            }
            FuncId::NotificationSet => {
                let (sender, receiver) = unpack_endpoints(args.arg1);
                if sender != caller_id {
                    return Err(Error::InvalidParameters);
                }
                self.notification_set(current, receiver, args.arg2 as u32, bitmap(args.arg3, args.arg4))?;
                success()
            }
            FuncId::NotificationGet => {
                // x1: receiver id in [15:0], vCPU index in [31:16].
                let receiver = args.arg1 as u16;
                let index = ((args.arg1 >> 16) & 0xFFFF) as usize;
                if receiver != caller_id || index != current.index {
                    return Err(Error::InvalidParameters);
                }
                let got = self.notification_get(current, args.arg2 as u32)?;
                ret(FfaValue {
                    arg2: got.from_sp & 0xFFFF_FFFF,
                    arg3: got.from_sp >> 32,
                    arg4: got.from_vm & 0xFFFF_FFFF,
                    arg5: got.from_vm >> 32,
                    arg6: got.framework as u64,
                    ..FfaValue::new(FuncId::Success32)
                })
            }
            FuncId::NotificationInfoGet64 => {
                let info = self.notification_info_get()?;
                // One list per partition, each holding just the partition id.
                let mut value = FfaValue {
                    arg2: (info.ids.len() as u64) << INFO_GET_LIST_COUNT_SHIFT,
                    ..FfaValue::new(FuncId::Success64)
                };
                if info.more_pending {
                    value.arg2 |= INFO_GET_MORE_PENDING;
                }
                let regs = [
                    &mut value.arg3,
                    &mut value.arg4,
                    &mut value.arg5,
                    &mut value.arg6,
                    &mut value.arg7,
                ];
                for (reg, ids) in regs.into_iter().zip(info.ids.chunks(IDS_PER_REGISTER)) {
                    *reg = ids
                        .iter()
                        .enumerate()
                        .fold(0, |acc, (i, id)| acc | (*id as u64) << (16 * i));
                }
                ret(value)
            }

            FuncId::InterruptEnable => {
                self.interrupt_enable(current, args.arg1 as u32, args.arg2 != 0)?;
                success()
            }
            FuncId::InterruptGet => ret(FfaValue::success(self.interrupt_get(current) as u64)),
            FuncId::InterruptDeactivate => {
                self.interrupt_deactivate(current, args.arg1 as u32, args.arg2 as u32)?;
                success()
            }

            FuncId::Error
            | FuncId::Success32
            | FuncId::Success64
            | FuncId::Interrupt
            | FuncId::MemRetrieveResp => return Err(Error::NotSupported),
        };
        Ok(outcome)
    }
}
