//! Command loop of a test secure partition.
//!
//! The partition parks in `FFA_MSG_WAIT` and handles each direct request as
//! a command: payload slot 0 (`x3`) selects the service, the remaining slots
//! carry its operands, and the direct response reports the outcome. Every
//! reply starts with [`SP_SUCCESS`] or [`SP_ERROR`] in `x3`; on error `x4`
//! holds the FF-A status code.
//!
//! Requests are SMC32, so 64-bit operands (bitmaps, handles) are split over
//! two slots, low half first.

use crate::delay;
use crate::error::FfaError;
use crate::ffa::descriptors::{
    DataAccess, InstructionAccess, MemTransaction, MsgHeader, Permissions, ReceiverDesc,
    RelinquishDesc, MSG_HEADER_SIZE,
};
use crate::ffa::{is_secure_id, pack_endpoints, unpack_endpoints, FfaValue, FuncId, PartitionId};
use crate::platform::{MAILBOX_SIZE, PAGE_SIZE};

pub const SP_SUCCESS: u64 = 0;
pub const SP_ERROR: u64 = 0xFFFF_FFFF;

/// `[ECHO, a, b, c, d]`: reply with the same payload.
pub const SP_ECHO_CMD: u64 = 0x6563_686f;
/// `[REQ_ECHO, target, a, b, c]`: echo `a, b, c` through `target`.
pub const SP_REQ_ECHO_CMD: u64 = 0x6563_6870;
/// `[REQ_ECHO_DENIED, companion]`: a request back to a secure requester
/// must be refused. From a VM the check runs one level down, in `companion`.
pub const SP_REQ_ECHO_DENIED_CMD: u64 = 0x6563_6864;
/// `[NOTIF_SET, receiver, flags, bitmap_lo, bitmap_hi]`
pub const SP_NOTIF_SET_CMD: u64 = 0x6e6f_7473;
/// `[NOTIF_GET, flags, vcpu]`: reply `[SUCCESS, sp_lo, sp_hi, vm_lo, vm_hi]`.
pub const SP_NOTIF_GET_CMD: u64 = 0x6e6f_7467;
/// `[NOTIF_BIND, sender, flags, bitmap_lo, bitmap_hi]`
pub const SP_NOTIF_BIND_CMD: u64 = 0x6e6f_7462;
/// `[NOTIF_UNBIND, sender, 0, bitmap_lo, bitmap_hi]`
pub const SP_NOTIF_UNBIND_CMD: u64 = 0x6e6f_7475;
/// `[CHECK_CPU_IDX, expected]`
pub const SP_CHECK_CPU_IDX_CMD: u64 = 0x7370_6369;
/// `[WAIT_BUSY_LOOP, iterations]`
pub const SP_WAIT_BUSY_LOOP_CMD: u64 = 0x7370_776c;
/// `[MEM_RETRIEVE_RELINQUISH, handle_lo, handle_hi, owner]`
pub const SP_MEM_RETRIEVE_RELINQUISH_CMD: u64 = 0x7370_6d72;
/// `[INDIR_MSG, receiver, payload]`: send `payload` with `FFA_MSG_SEND2`.
pub const SP_INDIR_MSG_CMD: u64 = 0x6d73_6769;
/// `[ECHO_INDIR_MSG]`: take the message in RX and send it back to its sender.
pub const SP_ECHO_INDIR_MSG_CMD: u64 = 0x6d73_6765;
/// `[CHECK_STATE_TRANSITIONS, companion]`: while servicing a request,
/// `FFA_MSG_WAIT` is refused before and after a round trip to `companion`.
pub const SP_CHECK_STATE_TRANSITIONS_CMD: u64 = 0x7370_7374;

/// The partition's view of the manager: the calls it can make and its own
/// mailbox.
pub trait Endpoint {
    fn id(&self) -> PartitionId;
    /// Physical core this vCPU is running on.
    fn cpu_index(&self) -> usize;
    /// Issue an FF-A call and return the value the partition is resumed with.
    fn call(&mut self, args: FfaValue) -> FfaValue;
    /// Copy `data` to the start of the TX buffer.
    fn write_tx(&mut self, data: &[u8]);
    /// Copy the start of the RX buffer into `out`.
    fn read_rx(&mut self, out: &mut [u8]);
    /// Addresses of the TX and RX pages this partition registers.
    fn mailbox(&self) -> (u64, u64);
}

fn reply(own: PartitionId, to: PartitionId, payload: [u64; 5]) -> FfaValue {
    FfaValue {
        arg1: pack_endpoints(own, to),
        arg3: payload[0],
        arg4: payload[1],
        arg5: payload[2],
        arg6: payload[3],
        arg7: payload[4],
        ..FfaValue::new(FuncId::MsgSendDirectResp32)
    }
}

fn success(own: PartitionId, to: PartitionId) -> FfaValue {
    reply(own, to, [SP_SUCCESS, 0, 0, 0, 0])
}

fn error(own: PartitionId, to: PartitionId, code: u64) -> FfaValue {
    reply(own, to, [SP_ERROR, code, 0, 0, 0])
}

fn split(lo: u64, hi: u64) -> u64 {
    (lo & 0xFFFF_FFFF) | (hi << 32)
}

fn status(code: FfaError) -> u64 {
    code as i32 as u32 as u64
}

/// Status of a manager reply: `Ok` for anything but `FFA_ERROR`.
fn checked(v: FfaValue) -> Result<FfaValue, u64> {
    if v.is(FuncId::Error) {
        Err(v.arg2)
    } else {
        Ok(v)
    }
}

fn outcome(own: PartitionId, to: PartitionId, result: Result<FfaValue, u64>) -> FfaValue {
    match result {
        Ok(_) => success(own, to),
        Err(code) => error(own, to, code),
    }
}

fn req_echo(ep: &mut impl Endpoint, requester: PartitionId, req: &FfaValue) -> FfaValue {
    let own = ep.id();
    let target = req.arg4 as PartitionId;
    let forward = FfaValue {
        arg1: pack_endpoints(own, target),
        arg3: SP_ECHO_CMD,
        arg4: req.arg5,
        arg5: req.arg6,
        arg6: req.arg7,
        ..FfaValue::new(FuncId::MsgSendDirectReq32)
    };
    let resp = ep.call(forward);
    if !resp.is(FuncId::MsgSendDirectResp32) {
        log::warn!("services: echo through {:#x} got {:#x}", target, resp.func);
        return error(own, requester, resp.arg2);
    }
    if (resp.arg4, resp.arg5, resp.arg6) != (req.arg5, req.arg6, req.arg7) {
        return error(own, requester, 0);
    }
    success(own, requester)
}

fn req_echo_denied(
    ep: &mut impl Endpoint,
    requester: PartitionId,
    req: &FfaValue,
) -> Result<FfaValue, u64> {
    let own = ep.id();
    if is_secure_id(requester) {
        let back = ep.call(FfaValue {
            arg1: pack_endpoints(own, requester),
            arg3: SP_ECHO_CMD,
            ..FfaValue::new(FuncId::MsgSendDirectReq32)
        });
        return match checked(back) {
            Err(code) if code == status(FfaError::Denied) => Ok(back),
            Err(code) => Err(code),
            Ok(_) => Err(0),
        };
    }

    let companion = req.arg4 as PartitionId;
    let resp = checked(ep.call(FfaValue {
        arg1: pack_endpoints(own, companion),
        arg3: SP_REQ_ECHO_DENIED_CMD,
        ..FfaValue::new(FuncId::MsgSendDirectReq32)
    }))?;
    if !resp.is(FuncId::MsgSendDirectResp32) || resp.arg3 != SP_SUCCESS {
        return Err(resp.arg4);
    }
    Ok(resp)
}

fn notif_get(ep: &mut impl Endpoint, requester: PartitionId, req: &FfaValue) -> FfaValue {
    let own = ep.id();
    let got = ep.call(FfaValue {
        arg1: own as u64 | (req.arg5 & 0xFFFF) << 16,
        arg2: req.arg4,
        ..FfaValue::new(FuncId::NotificationGet)
    });
    match checked(got) {
        Ok(v) => reply(own, requester, [SP_SUCCESS, v.arg2, v.arg3, v.arg4, v.arg5]),
        Err(code) => error(own, requester, code),
    }
}

fn retrieve_relinquish(ep: &mut impl Endpoint, req: &FfaValue) -> Result<FfaValue, u64> {
    let own = ep.id();
    let handle = split(req.arg4, req.arg5);
    let mut request = MemTransaction {
        sender: req.arg6 as PartitionId,
        handle,
        ..Default::default()
    };
    let _ = request.receivers.push(ReceiverDesc {
        id: own,
        permissions: Permissions {
            data: DataAccess::NotSpecified,
            instruction: InstructionAccess::NotSpecified,
        },
        flags: 0,
    });

    let mut buf = [0u8; MAILBOX_SIZE];
    let len = request.encode(&mut buf).map_err(|e| status(e.ffa_code()))?;
    ep.write_tx(&buf[..len]);
    let resp = checked(ep.call(FfaValue {
        arg1: len as u64,
        arg2: len as u64,
        ..FfaValue::new(FuncId::MemRetrieveReq32)
    }))?;
    if !resp.is(FuncId::MemRetrieveResp) {
        return Err(0);
    }
    checked(ep.call(FfaValue {
        arg1: own as u64,
        ..FfaValue::new(FuncId::RxRelease)
    }))?;

    let mut relinquish = RelinquishDesc {
        handle,
        flags: 0,
        endpoints: heapless::Vec::new(),
    };
    let _ = relinquish.endpoints.push(own);
    let len = relinquish.encode(&mut buf).map_err(|e| status(e.ffa_code()))?;
    ep.write_tx(&buf[..len]);
    checked(ep.call(FfaValue::new(FuncId::MemRelinquish)))
}

fn send_indirect(
    ep: &mut impl Endpoint,
    receiver: PartitionId,
    payload: &[u8],
) -> Result<FfaValue, u64> {
    let header = MsgHeader {
        flags: 0,
        offset: MSG_HEADER_SIZE as u32,
        sender: ep.id(),
        receiver,
        size: payload.len() as u32,
    };
    let mut buf = [0u8; MAILBOX_SIZE];
    let end = MSG_HEADER_SIZE + payload.len();
    if end > MAILBOX_SIZE {
        return Err(status(FfaError::InvalidParameters));
    }
    header.encode(&mut buf).map_err(|e| status(e.ffa_code()))?;
    buf[MSG_HEADER_SIZE..end].copy_from_slice(payload);
    ep.write_tx(&buf[..end]);
    checked(ep.call(FfaValue::new(FuncId::MsgSend2)))
}

fn echo_indirect(ep: &mut impl Endpoint) -> Result<FfaValue, u64> {
    let own = ep.id();
    let mut rx = [0u8; MAILBOX_SIZE];
    ep.read_rx(&mut rx);
    checked(ep.call(FfaValue {
        arg1: own as u64,
        ..FfaValue::new(FuncId::RxRelease)
    }))?;

    let header = MsgHeader::parse(&rx).map_err(|e| status(e.ffa_code()))?;
    let start = header.offset as usize;
    let payload = start
        .checked_add(header.size as usize)
        .and_then(|end| rx.get(start..end))
        .filter(|_| header.receiver == own)
        .ok_or(status(FfaError::InvalidParameters))?;
    log::debug!(
        "services: {:#x} echoing {} bytes to {:#x}",
        own,
        payload.len(),
        header.sender
    );
    let mut copy = [0u8; MAILBOX_SIZE];
    copy[..payload.len()].copy_from_slice(payload);
    send_indirect(ep, header.sender, &copy[..payload.len()])
}

/// `FFA_MSG_WAIT` must fail with `DENIED` while a request is being serviced.
fn wait_refused(ep: &mut impl Endpoint) -> Result<(), u64> {
    match checked(ep.call(FfaValue::new(FuncId::MsgWait))) {
        Err(code) if code == status(FfaError::Denied) => Ok(()),
        Err(code) => Err(code),
        Ok(_) => Err(0),
    }
}

fn check_state_transitions(ep: &mut impl Endpoint, req: &FfaValue) -> Result<FfaValue, u64> {
    let own = ep.id();
    wait_refused(ep)?;
    let companion = req.arg4 as PartitionId;
    let resp = checked(ep.call(FfaValue {
        arg1: pack_endpoints(own, companion),
        arg3: SP_ECHO_CMD,
        arg4: own as u64,
        ..FfaValue::new(FuncId::MsgSendDirectReq32)
    }))?;
    if !resp.is(FuncId::MsgSendDirectResp32) || resp.arg4 != own as u64 {
        return Err(0);
    }
    wait_refused(ep)?;
    Ok(resp)
}

/// Run the command carried by direct request `req` and build its response.
///
/// # Panics
/// On a command this partition does not know.
pub fn handle_direct_request(ep: &mut impl Endpoint, req: &FfaValue) -> FfaValue {
    let (requester, _) = unpack_endpoints(req.arg1);
    let own = ep.id();

    match req.arg3 {
        SP_ECHO_CMD => reply(own, requester, [req.arg3, req.arg4, req.arg5, req.arg6, req.arg7]),
        SP_REQ_ECHO_CMD => req_echo(ep, requester, req),
        SP_REQ_ECHO_DENIED_CMD => {
            let result = req_echo_denied(ep, requester, req);
            outcome(own, requester, result)
        }
        SP_NOTIF_SET_CMD => {
            let result = checked(ep.call(FfaValue {
                arg1: pack_endpoints(own, req.arg4 as PartitionId),
                arg2: req.arg5,
                arg3: req.arg6,
                arg4: req.arg7,
                ..FfaValue::new(FuncId::NotificationSet)
            }));
            outcome(own, requester, result)
        }
        SP_NOTIF_GET_CMD => notif_get(ep, requester, req),
        SP_NOTIF_BIND_CMD => {
            let result = checked(ep.call(FfaValue {
                arg1: pack_endpoints(req.arg4 as PartitionId, own),
                arg2: req.arg5,
                arg3: req.arg6,
                arg4: req.arg7,
                ..FfaValue::new(FuncId::NotificationBind)
            }));
            outcome(own, requester, result)
        }
        SP_NOTIF_UNBIND_CMD => {
            let result = checked(ep.call(FfaValue {
                arg1: pack_endpoints(req.arg4 as PartitionId, own),
                arg3: req.arg6,
                arg4: req.arg7,
                ..FfaValue::new(FuncId::NotificationUnbind)
            }));
            outcome(own, requester, result)
        }
        SP_CHECK_CPU_IDX_CMD => {
            if ep.cpu_index() as u64 == req.arg4 {
                success(own, requester)
            } else {
                error(own, requester, ep.cpu_index() as u64)
            }
        }
        SP_WAIT_BUSY_LOOP_CMD => {
            delay::wait_loop(req.arg4);
            success(own, requester)
        }
        SP_MEM_RETRIEVE_RELINQUISH_CMD => {
            let result = retrieve_relinquish(ep, req);
            outcome(own, requester, result)
        }
        SP_INDIR_MSG_CMD => {
            let payload = (req.arg5 as u32).to_le_bytes();
            let result = send_indirect(ep, req.arg4 as PartitionId, &payload);
            outcome(own, requester, result)
        }
        SP_ECHO_INDIR_MSG_CMD => {
            let result = echo_indirect(ep);
            outcome(own, requester, result)
        }
        SP_CHECK_STATE_TRANSITIONS_CMD => {
            let result = check_state_transitions(ep, req);
            outcome(own, requester, result)
        }
        other => panic!("services: {:#x} is not a valid command from {:#x}", other, requester),
    }
}

/// Handle `req`, send the response, and return the next message the
/// partition is resumed with.
pub fn serve_one(ep: &mut impl Endpoint, req: FfaValue) -> FfaValue {
    let resp = handle_direct_request(ep, &req);
    ep.call(resp)
}

/// Register the partition's TX/RX pages with `FFA_RXTX_MAP`.
pub fn set_up_mailbox(ep: &mut impl Endpoint) -> Result<(), u64> {
    let (tx, rx) = ep.mailbox();
    checked(ep.call(FfaValue {
        arg1: tx,
        arg2: rx,
        arg3: MAILBOX_SIZE as u64 / PAGE_SIZE,
        ..FfaValue::new(FuncId::RxTxMap64)
    }))
    .map(|_| ())
}

/// The partition's main loop: wait for a request, answer it, repeat.
/// The boot vCPU maps the mailbox first.
///
/// # Panics
/// When the mailbox cannot be mapped, or when resumed with anything other
/// than a direct request.
pub fn message_loop(ep: &mut impl Endpoint, boot_vcpu: bool) -> ! {
    if boot_vcpu {
        if let Err(code) = set_up_mailbox(ep) {
            panic!("services: {:#x} failed to map its mailbox: {:#x}", ep.id(), code);
        }
    }
    let mut msg = ep.call(FfaValue::new(FuncId::MsgWait));
    loop {
        if !msg.is(FuncId::MsgSendDirectReq32) {
            panic!("services: {:#x} is not a valid function", msg.func);
        }
        msg = serve_one(ep, msg);
    }
}
