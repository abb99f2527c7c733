//! Multi-fragment memory transaction descriptors (`FFA_MEM_FRAG_TX`).
//!
//! A descriptor larger than the TX buffer arrives as a first fragment in the
//! `FFA_MEM_{SHARE,LEND,DONATE}` call and the rest through `FFA_MEM_FRAG_TX`.
//! Fragments carry a sequence number starting at 1 after the opening call;
//! anything out of order, empty, or past the declared total aborts the whole
//! session and frees its handle.

use heapless::Vec;

use crate::arch::traits::{InterruptController, MemoryTranslator};
use crate::error::{Error, FragmentError, Result};
use crate::ffa::descriptors::MemTransaction;
use crate::ffa::memory::TransferKind;
use crate::ffa::{FfaValue, FuncId, PartitionId};
use crate::platform::{FRAGMENT_BUFFER_SIZE, MAILBOX_SIZE, MAX_FRAGMENT_SESSIONS};
use crate::spm::Spm;
use crate::sync::SpinLock;
use crate::vcpu::VcpuRef;

struct FragmentSession {
    handle: u64,
    owner: usize,
    kind: TransferKind,
    total: usize,
    received: usize,
    next_seq: u32,
    buf: [u8; FRAGMENT_BUFFER_SIZE],
}

pub struct FragmentTable {
    sessions: SpinLock<Vec<FragmentSession, MAX_FRAGMENT_SESSIONS>>,
}

impl Default for FragmentTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentTable {
    pub const fn new() -> Self {
        Self {
            sessions: SpinLock::new(Vec::new()),
        }
    }

    pub(crate) fn open(
        &self,
        handle: u64,
        owner: usize,
        kind: TransferKind,
        total: usize,
        first: &[u8],
    ) -> Result<()> {
        if total > FRAGMENT_BUFFER_SIZE || first.len() > total {
            return Err(Error::NoMemory);
        }
        let mut session = FragmentSession {
            handle,
            owner,
            kind,
            total,
            received: first.len(),
            next_seq: 1,
            buf: [0; FRAGMENT_BUFFER_SIZE],
        };
        session.buf[..first.len()].copy_from_slice(first);
        self.sessions
            .lock()
            .push(session)
            .map_err(|_| Error::NoMemory)
    }

    /// Number of transfers still waiting for fragments.
    pub fn pending(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// `FFA_MEM_FRAG_RX` asking the sender for the data from `offset` on.
fn frag_rx(handle: u64, offset: usize) -> FfaValue {
    FfaValue {
        arg1: handle & 0xFFFF_FFFF,
        arg2: handle >> 32,
        arg3: offset as u64,
        ..FfaValue::new(FuncId::MemFragRx)
    }
}

impl<T: MemoryTranslator, I: InterruptController> Spm<T, I> {
    /// `FFA_MEM_FRAG_TX`: `x1`/`x2` handle, `x3` fragment length,
    /// `x4[31:16]` sender id, `x5` sequence number.
    pub fn mem_frag_tx(&self, caller: VcpuRef, args: FfaValue) -> Result<FfaValue> {
        let handle = args.handle_from_arg1();
        let len = args.arg3 as u32;
        let sender = ((args.arg4 >> 16) & 0xFFFF) as PartitionId;
        let seq = args.arg5 as u32;
        let caller_id = self.registry().partition(caller.partition).id();

        // Copy TX before taking the fragment lock; the two are never nested.
        let bad_len = len == 0 || len as usize > MAILBOX_SIZE;
        let mut chunk = [0u8; MAILBOX_SIZE];
        if !bad_len {
            let state = self.registry().lock(caller.partition);
            if !state.mailbox.is_mapped() {
                return Err(Error::Denied);
            }
            chunk[..len as usize].copy_from_slice(&state.mailbox.send_buf()[..len as usize]);
        }

        let session = {
            let mut sessions = self.fragments().sessions.lock();
            let pos = sessions
                .iter()
                .position(|s| s.handle == handle)
                .ok_or(FragmentError::UnknownSession)?;
            let s = &mut sessions[pos];
            if s.owner != caller.partition || sender != caller_id {
                return Err(FragmentError::WrongSender.into());
            }

            let failure = if seq != s.next_seq {
                Some(FragmentError::OutOfOrder {
                    expected: s.next_seq,
                    got: seq,
                })
            } else if bad_len {
                Some(FragmentError::BadLength(len))
            } else if s.received + len as usize > s.total {
                Some(FragmentError::Overrun)
            } else {
                None
            };
            if let Some(e) = failure {
                sessions.swap_remove(pos);
                drop(sessions);
                self.shares().release(handle);
                log::warn!("fragments: {:#x} aborted: {}", handle, e);
                return Err(e.into());
            }

            let end = s.received + len as usize;
            s.buf[s.received..end].copy_from_slice(&chunk[..len as usize]);
            s.received = end;
            s.next_seq += 1;
            if s.received < s.total {
                return Ok(frag_rx(handle, s.received));
            }
            sessions.swap_remove(pos)
        };

        let result = MemTransaction::parse(&session.buf[..session.total])
            .and_then(|tx| self.commit_transfer(session.kind, caller, handle, &tx));
        match result {
            Ok(()) => Ok(FfaValue::success_handle(handle)),
            Err(e) => {
                self.shares().release(handle);
                Err(e)
            }
        }
    }

    /// Multi-fragment transfers still accumulating.
    pub fn pending_fragment_sessions(&self) -> usize {
        self.fragments().pending()
    }
}
