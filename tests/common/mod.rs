//! Shared fixtures: recording fakes for the two hardware collaborators and
//! a small standard partition layout.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use spm::arch::traits::{
    InterruptController, InterruptDescriptor, MemoryTranslator, TranslationError, TriggerType,
};
use spm::ffa::descriptors::{
    Constituent, DataAccess, InstructionAccess, MemAttributes, MemTransaction, Permissions,
    ReceiverDesc, RelinquishDesc,
};
use spm::ffa::region_index::{Mode, PageRange};
use spm::ffa::{pack_endpoints, FfaValue, FuncId, PartitionId};
use spm::manifest::PartitionManifest;
use spm::platform::PAGE_SIZE;
use spm::registry::PartitionKind;
use spm::vcpu::VcpuRef;
use spm::{CallOutcome, Spm};

// ── Fake translator ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranslatorCall {
    Map(PartitionId, PageRange, Mode),
    Unmap(PartitionId, PageRange),
    Protect(PartitionId, PageRange, Mode),
}

/// Page-granular model of every partition's stage-2 tables.
#[derive(Default)]
pub struct FakeTranslator {
    pages: Mutex<BTreeMap<(PartitionId, u64), Mode>>,
    calls: Mutex<Vec<TranslatorCall>>,
    /// Calls left before the next one fails.
    fail_in: Mutex<Option<usize>>,
}

impl FakeTranslator {
    /// Access `partition` currently has to the page at `addr`.
    pub fn mapping(&self, partition: PartitionId, addr: u64) -> Option<Mode> {
        self.pages
            .lock()
            .unwrap()
            .get(&(partition, addr / PAGE_SIZE))
            .copied()
    }

    pub fn calls(&self) -> Vec<TranslatorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Let `n` calls succeed, then fail the next one.
    pub fn fail_after(&self, n: usize) {
        *self.fail_in.lock().unwrap() = Some(n);
    }

    fn should_fail(&self) -> bool {
        let mut fail_in = self.fail_in.lock().unwrap();
        match *fail_in {
            Some(0) => {
                *fail_in = None;
                true
            }
            Some(n) => {
                *fail_in = Some(n - 1);
                false
            }
            None => false,
        }
    }

    fn pages_of(range: PageRange) -> impl Iterator<Item = u64> {
        (range.begin / PAGE_SIZE)..(range.end / PAGE_SIZE)
    }
}

impl MemoryTranslator for FakeTranslator {
    fn map(&self, partition: PartitionId, range: PageRange, mode: Mode) -> Result<(), TranslationError> {
        if self.should_fail() {
            return Err(TranslationError::OutOfMemory);
        }
        self.calls.lock().unwrap().push(TranslatorCall::Map(partition, range, mode));
        let mut pages = self.pages.lock().unwrap();
        for page in Self::pages_of(range) {
            pages.insert((partition, page), mode);
        }
        Ok(())
    }

    fn unmap(&self, partition: PartitionId, range: PageRange) -> Result<(), TranslationError> {
        if self.should_fail() {
            return Err(TranslationError::OutOfMemory);
        }
        self.calls.lock().unwrap().push(TranslatorCall::Unmap(partition, range));
        let mut pages = self.pages.lock().unwrap();
        for page in Self::pages_of(range) {
            pages.remove(&(partition, page));
        }
        Ok(())
    }

    fn protect(&self, partition: PartitionId, range: PageRange, mode: Mode) -> Result<(), TranslationError> {
        if self.should_fail() {
            return Err(TranslationError::OutOfMemory);
        }
        self.calls
            .lock()
            .unwrap()
            .push(TranslatorCall::Protect(partition, range, mode));
        let mut pages = self.pages.lock().unwrap();
        for page in Self::pages_of(range) {
            pages.insert((partition, page), mode);
        }
        Ok(())
    }
}

// ── Fake interrupt controller ───────────────────────────────────────

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GicEvent {
    Init(usize),
    Configure(InterruptDescriptor),
    Reconfigure(InterruptDescriptor),
    Priority(u32, u8),
    Type(u32, TriggerType),
    Enable(u32, usize),
    Disable(u32, usize),
    Eoi(u32),
    Sgi { id: u32, core: usize, same_world: bool },
}

pub struct FakeGic {
    events: Mutex<Vec<GicEvent>>,
    pending: Mutex<VecDeque<u32>>,
    pmr: Mutex<u8>,
}

impl Default for FakeGic {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            pmr: Mutex::new(0xff),
        }
    }
}

impl FakeGic {
    /// Queue `id` as the next interrupt the CPU interface acknowledges.
    pub fn raise(&self, id: u32) {
        self.pending.lock().unwrap().push_back(id);
    }

    pub fn events(&self) -> Vec<GicEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    fn record(&self, e: GicEvent) {
        self.events.lock().unwrap().push(e);
    }
}

impl InterruptController for FakeGic {
    fn init(&self, cpu: usize) {
        self.record(GicEvent::Init(cpu));
    }

    fn set_priority_mask(&self, mask: u8) {
        *self.pmr.lock().unwrap() = mask;
    }

    fn priority_mask(&self) -> u8 {
        *self.pmr.lock().unwrap()
    }

    fn set_priority(&self, id: u32, _core_pos: usize, priority: u8) {
        self.record(GicEvent::Priority(id, priority));
    }

    fn enable(&self, id: u32, core_pos: usize) {
        self.record(GicEvent::Enable(id, core_pos));
    }

    fn disable(&self, id: u32, core_pos: usize) {
        self.record(GicEvent::Disable(id, core_pos));
    }

    fn set_type(&self, id: u32, trigger: TriggerType) {
        self.record(GicEvent::Type(id, trigger));
    }

    fn get_type(&self, _id: u32) -> TriggerType {
        TriggerType::Level
    }

    fn pending_interrupt_id(&self) -> u32 {
        self.pending.lock().unwrap().pop_front().unwrap_or(1023)
    }

    fn end_of_interrupt(&self, id: u32) {
        self.record(GicEvent::Eoi(id));
    }

    fn send_sgi(&self, id: u32, core_pos: usize, to_this_security_state: bool) {
        self.record(GicEvent::Sgi {
            id,
            core: core_pos,
            same_world: to_this_security_state,
        });
    }

    fn configure_interrupt(&self, desc: &InterruptDescriptor) {
        self.record(GicEvent::Configure(*desc));
    }

    fn reconfigure_interrupt(&self, desc: &InterruptDescriptor) {
        self.record(GicEvent::Reconfigure(*desc));
    }
}

// ── Standard layout ─────────────────────────────────────────────────

pub type TestSpm = Spm<FakeTranslator, FakeGic>;

pub const VM1: PartitionId = 0x0001;
pub const SP1: PartitionId = 0x8001;
pub const SP2: PartitionId = 0x8002;

/// 1 MiB of RAM per partition.
pub const RAM_PAGES: u64 = 256;
pub const VM1_RAM: u64 = 0x4000_0000;
pub const SP1_RAM: u64 = 0x6000_0000;
pub const SP2_RAM: u64 = 0x6100_0000;

/// Mailbox pages sit at the top of each partition's RAM.
pub const TX_OFFSET: u64 = (RAM_PAGES - 2) * PAGE_SIZE;
pub const RX_OFFSET: u64 = (RAM_PAGES - 1) * PAGE_SIZE;

pub fn ram(base: u64) -> PageRange {
    PageRange::from_pages(base, RAM_PAGES).unwrap()
}

pub fn ram_of(id: PartitionId) -> u64 {
    match id {
        VM1 => VM1_RAM,
        SP1 => SP1_RAM,
        SP2 => SP2_RAM,
        _ => panic!("no RAM for {:#x}", id),
    }
}

/// One VM with 2 vCPUs, SP1 with 2 vCPUs, SP2 with 1.
pub fn manifests() -> Vec<PartitionManifest> {
    vec![
        PartitionManifest::new(VM1, PartitionKind::NormalVm, 2)
            .with_name("vm1")
            .with_memory(ram(VM1_RAM), Mode::RWX),
        PartitionManifest::new(SP1, PartitionKind::Secure, 2)
            .with_name("sp1")
            .with_memory(ram(SP1_RAM), Mode::RWX),
        PartitionManifest::new(SP2, PartitionKind::Secure, 1)
            .with_name("sp2")
            .with_memory(ram(SP2_RAM), Mode::R | Mode::W),
    ]
}

pub fn boot_with(manifests: &[PartitionManifest]) -> TestSpm {
    Spm::boot(manifests, FakeTranslator::default(), FakeGic::default()).expect("boot")
}

pub fn boot() -> TestSpm {
    boot_with(&manifests())
}

pub fn vcpu(spm: &TestSpm, id: PartitionId, index: usize) -> VcpuRef {
    spm.registry().vcpu_ref(id, index).expect("vcpu exists")
}

/// Start vCPU `index` of `id` on core `cpu` and park it in `MSG_WAIT`.
pub fn park(spm: &TestSpm, id: PartitionId, index: usize, cpu: usize) -> VcpuRef {
    let v = vcpu(spm, id, index);
    spm.boot_vcpu(v, cpu).unwrap();
    assert_eq!(spm.msg_wait(v).unwrap(), CallOutcome::Idle);
    v
}

/// Start vCPU `index` of `id` on core `cpu`, running.
pub fn start(spm: &TestSpm, id: PartitionId, index: usize, cpu: usize) -> VcpuRef {
    let v = vcpu(spm, id, index);
    spm.boot_vcpu(v, cpu).unwrap();
    v
}

pub fn map_mailbox(spm: &TestSpm, id: PartitionId) {
    let v = vcpu(spm, id, 0);
    let base = ram_of(id);
    spm.rxtx_map(v, base + TX_OFFSET, base + RX_OFFSET, 1).unwrap();
}

pub fn write_tx(spm: &TestSpm, id: PartitionId, bytes: &[u8]) {
    let idx = spm.registry().index_of(id).unwrap();
    let mut state = spm.registry().lock(idx);
    state.mailbox.send_buf_mut()[..bytes.len()].copy_from_slice(bytes);
}

pub fn read_rx(spm: &TestSpm, id: PartitionId, len: usize) -> Vec<u8> {
    let idx = spm.registry().index_of(id).unwrap();
    let state = spm.registry().lock(idx);
    state.mailbox.recv_buf()[..len].to_vec()
}

pub fn mode_in_index(spm: &TestSpm, id: PartitionId, range: PageRange) -> Option<Mode> {
    let idx = spm.registry().index_of(id).unwrap();
    spm.registry().lock(idx).regions.mode_of(&range)
}

// ── Descriptors ─────────────────────────────────────────────────────

pub fn pages(base: u64, first: u64, count: u64) -> PageRange {
    PageRange::from_pages(base + first * PAGE_SIZE, count).unwrap()
}

pub const RO: Permissions = Permissions {
    data: DataAccess::ReadOnly,
    instruction: InstructionAccess::NotExecutable,
};
pub const RW: Permissions = Permissions {
    data: DataAccess::ReadWrite,
    instruction: InstructionAccess::NotExecutable,
};
pub const RWX: Permissions = Permissions {
    data: DataAccess::ReadWrite,
    instruction: InstructionAccess::Executable,
};
pub const NONE: Permissions = Permissions {
    data: DataAccess::NotSpecified,
    instruction: InstructionAccess::NotSpecified,
};

pub fn transaction(
    sender: PartitionId,
    receivers: &[(PartitionId, Permissions)],
    ranges: &[PageRange],
) -> MemTransaction {
    let mut tx = MemTransaction {
        sender,
        attributes: MemAttributes::NORMAL_WB_INNER,
        ..Default::default()
    };
    for &(id, permissions) in receivers {
        tx.receivers
            .push(ReceiverDesc {
                id,
                permissions,
                flags: 0,
            })
            .unwrap();
    }
    for r in ranges {
        tx.constituents
            .push(Constituent {
                address: r.begin,
                page_count: r.page_count() as u32,
            })
            .unwrap();
    }
    tx.total_page_count = ranges.iter().map(|r| r.page_count() as u32).sum();
    tx
}

pub fn encode(tx: &MemTransaction) -> Vec<u8> {
    let mut buf = vec![0u8; tx.encoded_len()];
    let len = tx.encode(&mut buf).unwrap();
    buf.truncate(len);
    buf
}

pub fn send_call(func: FuncId, total: usize, frag: usize) -> FfaValue {
    FfaValue {
        arg1: total as u64,
        arg2: frag as u64,
        ..FfaValue::new(func)
    }
}

/// Write `tx` to the owner's TX and issue the send. Returns the handle.
pub fn send(spm: &TestSpm, owner: VcpuRef, func: FuncId, tx: &MemTransaction) -> Result<u64, FfaValue> {
    let bytes = encode(tx);
    write_tx(spm, tx.sender, &bytes);
    match spm.handle_call(owner, send_call(func, bytes.len(), bytes.len())) {
        CallOutcome::Return(v) if v.is(FuncId::Success32) => Ok(v.handle_from_arg2()),
        CallOutcome::Return(v) => Err(v),
        other => panic!("unexpected outcome {:?}", other),
    }
}

pub fn relinquish(spm: &TestSpm, who: VcpuRef, id: PartitionId, handle: u64) -> FfaValue {
    let mut desc = RelinquishDesc {
        handle,
        flags: 0,
        endpoints: heapless::Vec::new(),
    };
    desc.endpoints.push(id).unwrap();
    let mut buf = [0u8; 64];
    let len = desc.encode(&mut buf).unwrap();
    write_tx(spm, id, &buf[..len]);
    spm.handle_call(who, FfaValue::new(FuncId::MemRelinquish))
        .value()
        .unwrap()
}

pub fn reclaim(spm: &TestSpm, owner: VcpuRef, handle: u64) -> FfaValue {
    spm.handle_call(
        owner,
        FfaValue {
            arg1: handle & 0xFFFF_FFFF,
            arg2: handle >> 32,
            ..FfaValue::new(FuncId::MemReclaim)
        },
    )
    .value()
    .unwrap()
}

pub fn direct_req(sender: PartitionId, receiver: PartitionId, payload: [u64; 5]) -> FfaValue {
    FfaValue {
        arg1: pack_endpoints(sender, receiver),
        arg3: payload[0],
        arg4: payload[1],
        arg5: payload[2],
        arg6: payload[3],
        arg7: payload[4],
        ..FfaValue::new(FuncId::MsgSendDirectReq64)
    }
}

pub fn direct_resp(sender: PartitionId, receiver: PartitionId, payload: [u64; 5]) -> FfaValue {
    FfaValue {
        func: u32::from(FuncId::MsgSendDirectResp64) as u64,
        ..direct_req(sender, receiver, payload)
    }
}
