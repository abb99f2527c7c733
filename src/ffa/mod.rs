//! FF-A (Firmware Framework for Arm) ABI layer.
//!
//! Function ids, endpoint id helpers and the register value type that every
//! call enters and leaves the engine with. Sub-modules implement the
//! individual protocol areas on top of [`crate::spm::Spm`].

pub mod descriptors;
pub mod direct;
pub mod dispatch;
pub mod fragments;
pub mod mailbox;
pub mod memory;
pub mod notifications;
pub mod region_index;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::Error;

/// FF-A endpoint id.
pub type PartitionId = u16;

// ── Version ──────────────────────────────────────────────────────────
pub const FFA_VERSION_1_1: u32 = 0x0001_0001;

// ── Well-known endpoint ids ──────────────────────────────────────────
/// Normal world hypervisor / scheduler.
pub const HYPERVISOR_ID: PartitionId = 0;
/// The partition manager itself when acting as SPMC.
pub const SPMC_ID: PartitionId = 0x8000;
/// Bit 15 marks a secure-world endpoint.
pub const SECURE_ID_BIT: PartitionId = 0x8000;

pub fn is_secure_id(id: PartitionId) -> bool {
    id & SECURE_ID_BIT != 0
}

/// FF-A function identifiers handled by the engine.
#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum FuncId {
    Error = 0x8400_0060,
    Success32 = 0x8400_0061,
    Success64 = 0xC400_0061,
    Interrupt = 0x8400_0062,
    Version = 0x8400_0063,
    Features = 0x8400_0064,
    RxRelease = 0x8400_0065,
    RxTxMap32 = 0x8400_0066,
    RxTxMap64 = 0xC400_0066,
    RxTxUnmap = 0x8400_0067,
    PartitionInfoGet = 0x8400_0068,
    IdGet = 0x8400_0069,
    MsgWait = 0x8400_006B,
    Yield = 0x8400_006C,
    Run = 0x8400_006D,
    MsgSendDirectReq32 = 0x8400_006F,
    MsgSendDirectReq64 = 0xC400_006F,
    MsgSendDirectResp32 = 0x8400_0070,
    MsgSendDirectResp64 = 0xC400_0070,
    MemDonate32 = 0x8400_0071,
    MemDonate64 = 0xC400_0071,
    MemLend32 = 0x8400_0072,
    MemLend64 = 0xC400_0072,
    MemShare32 = 0x8400_0073,
    MemShare64 = 0xC400_0073,
    MemRetrieveReq32 = 0x8400_0074,
    MemRetrieveReq64 = 0xC400_0074,
    MemRetrieveResp = 0x8400_0075,
    MemRelinquish = 0x8400_0076,
    MemReclaim = 0x8400_0077,
    MemFragRx = 0x8400_007A,
    MemFragTx = 0x8400_007B,
    NotificationBitmapCreate = 0x8400_007D,
    NotificationBitmapDestroy = 0x8400_007E,
    NotificationBind = 0x8400_007F,
    NotificationUnbind = 0x8400_0080,
    NotificationSet = 0x8400_0081,
    NotificationGet = 0x8400_0082,
    NotificationInfoGet64 = 0xC400_0083,
    SpmIdGet = 0x8400_0085,
    MsgSend2 = 0x8400_0086,
    // Vendor calls for virtual interrupt management.
    InterruptEnable = 0xff03,
    InterruptGet = 0xff04,
    InterruptDeactivate = 0xff08,
}

impl FuncId {
    /// SMC64 convention bit.
    pub fn is_64bit(self) -> bool {
        u32::from(self) & 0x4000_0000 != 0
    }
}

/// Register image of an FF-A call or return: `x0` (function id) plus
/// `x1..x7`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FfaValue {
    pub func: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
    pub arg6: u64,
    pub arg7: u64,
}

impl FfaValue {
    pub const fn new(func: FuncId) -> Self {
        Self {
            func: func as u32 as u64,
            arg1: 0,
            arg2: 0,
            arg3: 0,
            arg4: 0,
            arg5: 0,
            arg6: 0,
            arg7: 0,
        }
    }

    pub fn func_id(&self) -> Result<FuncId, Error> {
        u32::try_from(self.func)
            .ok()
            .and_then(|f| FuncId::try_from(f).ok())
            .ok_or(Error::UnknownFunction(self.func))
    }

    pub fn is(&self, func: FuncId) -> bool {
        self.func == u32::from(func) as u64
    }

    /// `FFA_SUCCESS_32` with `x2` set.
    pub fn success(arg2: u64) -> Self {
        Self {
            arg2,
            ..Self::new(FuncId::Success32)
        }
    }

    /// `FFA_ERROR` with the status code in `x2`.
    pub fn error(err: Error) -> Self {
        Self {
            arg2: i32::from(err.ffa_code()) as u32 as u64,
            ..Self::new(FuncId::Error)
        }
    }

    /// `FFA_SUCCESS_32` carrying a 64-bit memory handle in `x2`/`x3`.
    pub fn success_handle(handle: u64) -> Self {
        Self {
            arg2: handle & 0xFFFF_FFFF,
            arg3: handle >> 32,
            ..Self::new(FuncId::Success32)
        }
    }

    /// Status code of an `FFA_ERROR` value.
    pub fn error_code(&self) -> Option<crate::error::FfaError> {
        if !self.is(FuncId::Error) {
            return None;
        }
        crate::error::FfaError::try_from(self.arg2 as u32 as i32).ok()
    }

    /// Handle packed in `x1`/`x2` (reclaim, fragment calls).
    pub fn handle_from_arg1(&self) -> u64 {
        (self.arg1 & 0xFFFF_FFFF) | (self.arg2 << 32)
    }

    /// Handle packed in `x2`/`x3` (success returns).
    pub fn handle_from_arg2(&self) -> u64 {
        (self.arg2 & 0xFFFF_FFFF) | (self.arg3 << 32)
    }
}

/// Pack a sender/receiver pair the way direct messages carry it in `x1`.
pub fn pack_endpoints(sender: PartitionId, receiver: PartitionId) -> u64 {
    ((sender as u64) << 16) | receiver as u64
}

/// Inverse of [`pack_endpoints`]: returns `(sender, receiver)`.
pub fn unpack_endpoints(word: u64) -> (PartitionId, PartitionId) {
    (((word >> 16) & 0xFFFF) as PartitionId, (word & 0xFFFF) as PartitionId)
}

/// Pack a partition id and vCPU index (`FFA_RUN`, `FFA_YIELD`, `FFA_INTERRUPT`).
pub fn pack_vcpu(id: PartitionId, vcpu: u16) -> u64 {
    ((id as u64) << 16) | vcpu as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_function_is_rejected() {
        let v = FfaValue {
            func: 0x8400_00FF,
            ..Default::default()
        };
        assert_eq!(v.func_id(), Err(Error::UnknownFunction(0x8400_00FF)));
    }

    #[test]
    fn error_value_carries_wire_code() {
        let v = FfaValue::error(Error::Busy);
        assert!(v.is(FuncId::Error));
        assert_eq!(v.arg2, 0xFFFF_FFFC);
        assert_eq!(v.error_code(), Some(crate::error::FfaError::Busy));
    }

    #[test]
    fn endpoint_word_layout() {
        let w = pack_endpoints(0x8001, 0x0002);
        assert_eq!(w, 0x8001_0002);
        assert_eq!(unpack_endpoints(w), (0x8001, 0x0002));
        assert!(FuncId::MsgSendDirectReq64.is_64bit());
        assert!(!FuncId::MsgSendDirectReq32.is_64bit());
    }
}
