//! Notifications: bitmaps, bindings, set/get between partitions and the
//! pending interrupt that announces them.

mod common;

use common::*;
use spm::ffa::notifications::{GetFlags, FLAG_PER_VCPU, FRAMEWORK_RX_FULL};
use spm::ffa::{pack_endpoints, pack_vcpu, FfaValue, FuncId, PartitionId};
use spm::platform::NOTIFICATION_PENDING_INTID;
use spm::vcpu::VcpuRef;
use spm::{CallOutcome, FfaError};

fn call(spm: &TestSpm, caller: VcpuRef, value: FfaValue) -> FfaValue {
    match spm.handle_call(caller, value) {
        CallOutcome::Return(v) => v,
        other => panic!("unexpected outcome {:?}", other),
    }
}

fn bind(sender: PartitionId, receiver: PartitionId, flags: u32, bitmap: u64) -> FfaValue {
    FfaValue {
        arg1: pack_endpoints(sender, receiver),
        arg2: flags as u64,
        arg3: bitmap & 0xFFFF_FFFF,
        arg4: bitmap >> 32,
        ..FfaValue::new(FuncId::NotificationBind)
    }
}

fn unbind(sender: PartitionId, receiver: PartitionId, bitmap: u64) -> FfaValue {
    bind(sender, receiver, 0, bitmap).with_func(FuncId::NotificationUnbind)
}

fn set(sender: PartitionId, receiver: PartitionId, flags: u32, bitmap: u64) -> FfaValue {
    bind(sender, receiver, flags, bitmap).with_func(FuncId::NotificationSet)
}

/// `NOTIFICATION_GET` for `caller`'s own partition and vCPU.
fn get(spm: &TestSpm, caller: VcpuRef, flags: GetFlags) -> FfaValue {
    let id = spm.registry().partition(caller.partition).id();
    FfaValue {
        arg1: id as u64 | (caller.index as u64) << 16,
        arg2: flags.bits() as u64,
        ..FfaValue::new(FuncId::NotificationGet)
    }
}

trait WithFunc {
    fn with_func(self, func: FuncId) -> Self;
}

impl WithFunc for FfaValue {
    fn with_func(self, func: FuncId) -> Self {
        FfaValue {
            func: u32::from(func) as u64,
            ..self
        }
    }
}

fn from_sp(v: &FfaValue) -> u64 {
    v.arg2 | (v.arg3 << 32)
}

fn from_vm(v: &FfaValue) -> u64 {
    v.arg4 | (v.arg5 << 32)
}

fn npi_pending(spm: &TestSpm, v: VcpuRef) -> bool {
    spm.registry()
        .lock(v.partition)
        .vcpu(v.index)
        .unwrap()
        .interrupts
        .is_pending(NOTIFICATION_PENDING_INTID)
}

fn ok(v: FfaValue) {
    assert!(v.is(FuncId::Success32), "{:?}", v);
}

#[test]
fn secure_partitions_exchange_global_notifications() {
    let spm = boot();
    let sp1 = start(&spm, SP1, 0, 0);
    let sp2 = start(&spm, SP2, 0, 1);

    ok(call(&spm, sp1, bind(SP2, SP1, 0, 0b101)));
    ok(call(&spm, sp2, set(SP2, SP1, 0, 0b001)));
    assert!(npi_pending(&spm, sp1));

    let got = call(&spm, sp1, get(&spm, sp1, GetFlags::FROM_SP | GetFlags::FROM_VM));
    assert!(got.is(FuncId::Success32));
    assert_eq!(from_sp(&got), 0b001);
    assert_eq!(from_vm(&got), 0);
    assert!(!npi_pending(&spm, sp1));

    let again = call(&spm, sp1, get(&spm, sp1, GetFlags::FROM_SP));
    assert_eq!(from_sp(&again), 0);
}

#[test]
fn setting_twice_reports_once() {
    let spm = boot();
    let sp1 = start(&spm, SP1, 0, 0);
    let sp2 = start(&spm, SP2, 0, 1);
    ok(call(&spm, sp1, bind(SP2, SP1, 0, 1 << 40)));

    ok(call(&spm, sp2, set(SP2, SP1, 0, 1 << 40)));
    ok(call(&spm, sp2, set(SP2, SP1, 0, 1 << 40)));
    let got = call(&spm, sp1, get(&spm, sp1, GetFlags::FROM_SP));
    assert_eq!(from_sp(&got), 1 << 40);
    assert_eq!(got.arg3, 1 << 8);
    assert_eq!(from_sp(&call(&spm, sp1, get(&spm, sp1, GetFlags::FROM_SP))), 0);
}

#[test]
fn get_only_takes_the_selected_classes() {
    let spm = boot();
    let sp1 = start(&spm, SP1, 0, 0);
    let sp2 = start(&spm, SP2, 0, 1);
    let vm = start(&spm, VM1, 0, 2);
    ok(call(&spm, sp1, bind(SP2, SP1, 0, 0b01)));
    ok(call(&spm, sp1, bind(VM1, SP1, 0, 0b10)));
    ok(call(&spm, sp2, set(SP2, SP1, 0, 0b01)));
    ok(call(&spm, vm, set(VM1, SP1, 0, 0b10)));

    let got = call(&spm, sp1, get(&spm, sp1, GetFlags::FROM_VM));
    assert_eq!((from_sp(&got), from_vm(&got)), (0, 0b10));
    // The SP class is still unread.
    assert!(npi_pending(&spm, sp1));
    let got = call(&spm, sp1, get(&spm, sp1, GetFlags::FROM_SP));
    assert_eq!((from_sp(&got), from_vm(&got)), (0b01, 0));
    assert!(!npi_pending(&spm, sp1));
}

#[test]
fn pending_interrupt_waits_for_framework_notifications() {
    let spm = boot();
    let sp1 = start(&spm, SP1, 0, 0);
    let sp2 = start(&spm, SP2, 0, 1);
    ok(call(&spm, sp1, bind(SP2, SP1, 0, 0b1)));
    ok(call(&spm, sp2, set(SP2, SP1, 0, 0b1)));
    {
        let mut state = spm.registry().lock(sp1.partition);
        state.notifications.raise_framework(FRAMEWORK_RX_FULL);
    }

    call(&spm, sp1, get(&spm, sp1, GetFlags::FROM_SP));
    assert!(npi_pending(&spm, sp1));
    let got = call(&spm, sp1, get(&spm, sp1, GetFlags::FRAMEWORK_SPM));
    assert_eq!(got.arg6, FRAMEWORK_RX_FULL as u64);
    assert!(!npi_pending(&spm, sp1));
}

#[test]
fn bindings_are_exclusive_per_bit() {
    let spm = boot();
    let sp1 = start(&spm, SP1, 0, 0);

    ok(call(&spm, sp1, bind(SP2, SP1, 0, 0b11)));
    assert_eq!(call(&spm, sp1, bind(VM1, SP1, 0, 0b10)).error_code(), Some(FfaError::Denied));
    // Same sender again is fine.
    ok(call(&spm, sp1, bind(SP2, SP1, 0, 0b01)));
    ok(call(&spm, sp1, bind(VM1, SP1, 0, 0b100)));

    let reg = spm.registry().lock(sp1.partition);
    assert_eq!(reg.notifications.bound_sender(1), Some(SP2));
    assert_eq!(reg.notifications.bound_sender(2), Some(VM1));
}

#[test]
fn bind_and_set_validation() {
    let spm = boot();
    let sp1 = start(&spm, SP1, 0, 0);
    let sp2 = start(&spm, SP2, 0, 1);

    let invalid = [
        // Receiver must be the caller.
        (sp1, bind(SP1, SP2, 0, 1)),
        // No self bindings.
        (sp1, bind(SP1, SP1, 0, 1)),
        // Unknown sender.
        (sp1, bind(0x8077, SP1, 0, 1)),
        // Empty bitmap.
        (sp1, bind(SP2, SP1, 0, 0)),
        // Sender field is not the caller.
        (sp2, set(VM1, SP1, 0, 1)),
        // Setting on itself.
        (sp1, set(SP1, SP1, 0, 1)),
    ];
    for (caller, value) in invalid {
        assert_eq!(
            call(&spm, caller, value).error_code(),
            Some(FfaError::InvalidParameters),
            "{:?}",
            value
        );
    }

    // Nobody bound bit 0 to SP2.
    assert_eq!(call(&spm, sp2, set(SP2, SP1, 0, 1)).error_code(), Some(FfaError::Denied));

    ok(call(&spm, sp1, bind(SP2, SP1, FLAG_PER_VCPU, 1)));
    assert_eq!(
        call(&spm, sp2, set(SP2, SP1, 0, 1)).error_code(),
        Some(FfaError::InvalidParameters)
    );
    // vCPU 5 does not exist.
    assert_eq!(
        call(&spm, sp2, set(SP2, SP1, FLAG_PER_VCPU | (5 << 16), 1)).error_code(),
        Some(FfaError::InvalidParameters)
    );
    assert!(!npi_pending(&spm, sp1));
}

#[test]
fn unbind_refuses_pending_bits() {
    let spm = boot();
    let sp1 = start(&spm, SP1, 0, 0);
    let sp2 = start(&spm, SP2, 0, 1);
    ok(call(&spm, sp1, bind(SP2, SP1, 0, 0b1)));
    ok(call(&spm, sp2, set(SP2, SP1, 0, 0b1)));

    assert_eq!(call(&spm, sp1, unbind(SP2, SP1, 0b1)).error_code(), Some(FfaError::Denied));
    call(&spm, sp1, get(&spm, sp1, GetFlags::FROM_SP));
    ok(call(&spm, sp1, unbind(SP2, SP1, 0b1)));
    // Unbinding a bit that is not bound to this sender.
    assert_eq!(call(&spm, sp1, unbind(SP2, SP1, 0b1)).error_code(), Some(FfaError::Denied));
}

#[test]
fn vm_bitmaps_are_created_and_destroyed_explicitly() {
    let spm = boot();
    let vm = start(&spm, VM1, 0, 0);
    let sp1 = start(&spm, SP1, 0, 1);
    let create = FfaValue {
        arg1: VM1 as u64,
        ..FfaValue::new(FuncId::NotificationBitmapCreate)
    };
    let destroy = create.with_func(FuncId::NotificationBitmapDestroy);

    assert_eq!(call(&spm, vm, bind(SP1, VM1, 0, 0b1000)).error_code(), Some(FfaError::Denied));
    assert_eq!(call(&spm, vm, get(&spm, vm, GetFlags::FROM_SP)).error_code(), Some(FfaError::Denied));

    ok(call(&spm, vm, create));
    assert_eq!(call(&spm, vm, create).error_code(), Some(FfaError::Denied));

    ok(call(&spm, vm, bind(SP1, VM1, 0, 0b1000)));
    ok(call(&spm, sp1, set(SP1, VM1, 0, 0b1000)));
    assert_eq!(from_sp(&call(&spm, vm, get(&spm, vm, GetFlags::FROM_SP))), 0b1000);

    assert_eq!(call(&spm, vm, destroy).error_code(), Some(FfaError::Denied));
    ok(call(&spm, vm, unbind(SP1, VM1, 0b1000)));
    ok(call(&spm, vm, destroy));
    assert_eq!(call(&spm, vm, destroy).error_code(), Some(FfaError::Denied));

    // Secure partitions have theirs from boot.
    assert_eq!(spm.notification_bitmap_create(SP1), Err(spm::Error::InvalidParameters));
    assert_eq!(spm.notification_bitmap_create(0x0042), Err(spm::Error::InvalidParameters));
}

#[test]
fn pending_notification_wakes_a_waiting_vcpu() {
    let spm = boot();
    let vm = start(&spm, VM1, 0, 0);
    let sp1 = park(&spm, SP1, 0, 1);
    let sp2 = start(&spm, SP2, 0, 1);
    {
        let mut state = spm.registry().lock(sp1.partition);
        state.notifications.bind(SP2, 0, 0b1).unwrap();
    }

    // Nothing pending: RUN bounces straight back.
    let v = call(&spm, vm, FfaValue {
        arg1: pack_vcpu(SP1, 0),
        ..FfaValue::new(FuncId::Run)
    });
    assert!(v.is(FuncId::MsgWait));

    ok(call(&spm, sp2, set(SP2, SP1, 0, 0b1)));
    let outcome = spm.handle_call(vm, FfaValue {
        arg1: pack_vcpu(SP1, 0),
        ..FfaValue::new(FuncId::Run)
    });
    let CallOutcome::Switch { vcpu, value } = outcome else {
        panic!("{:?}", outcome);
    };
    assert_eq!(vcpu, sp1);
    assert!(value.is(FuncId::Interrupt));
}

#[test]
fn per_vcpu_notifications_land_on_the_named_vcpu() {
    let spm = boot();
    let sp1_0 = start(&spm, SP1, 0, 0);
    let sp1_1 = start(&spm, SP1, 1, 1);
    let sp2 = start(&spm, SP2, 0, 2);
    ok(call(&spm, sp1_0, bind(SP2, SP1, FLAG_PER_VCPU, 0b100)));

    ok(call(&spm, sp2, set(SP2, SP1, FLAG_PER_VCPU | (1 << 16), 0b100)));
    assert!(npi_pending(&spm, sp1_1));
    assert!(!npi_pending(&spm, sp1_0));

    assert_eq!(from_sp(&call(&spm, sp1_0, get(&spm, sp1_0, GetFlags::FROM_SP))), 0);
    assert_eq!(from_sp(&call(&spm, sp1_1, get(&spm, sp1_1, GetFlags::FROM_SP))), 0b100);
    assert!(!npi_pending(&spm, sp1_1));
}

#[test]
fn info_get_reports_each_partition_once() {
    let spm = boot();
    let sp1 = start(&spm, SP1, 0, 0);
    let sp2 = start(&spm, SP2, 0, 1);
    let vm = start(&spm, VM1, 0, 2);
    let info_get = FfaValue::new(FuncId::NotificationInfoGet64);

    assert_eq!(call(&spm, vm, info_get).error_code(), Some(FfaError::NoData));

    ok(call(&spm, sp1, bind(SP2, SP1, 0, 0b1)));
    ok(call(&spm, sp2, bind(SP1, SP2, 0, 0b1)));
    ok(call(&spm, sp2, set(SP2, SP1, 0, 0b1)));
    ok(call(&spm, sp1, set(SP1, SP2, 0, 0b1)));

    let v = call(&spm, vm, info_get);
    assert!(v.is(FuncId::Success64));
    assert_eq!(v.arg2, 2 << 7);
    assert_eq!(v.arg3, SP1 as u64 | (SP2 as u64) << 16);
    assert_eq!(call(&spm, vm, info_get).error_code(), Some(FfaError::NoData));

    // A new set makes the receiver reportable again.
    ok(call(&spm, sp2, set(SP2, SP1, 0, 0b1)));
    let info = spm.notification_info_get().unwrap();
    assert_eq!(info.ids.as_slice(), &[SP1]);
    assert!(!info.more_pending);
}

#[test]
fn unknown_get_flags_are_rejected() {
    let spm = boot();
    let sp1 = start(&spm, SP1, 0, 0);
    let v = call(&spm, sp1, FfaValue {
        arg2: 1 << 10,
        ..get(&spm, sp1, GetFlags::empty())
    });
    assert_eq!(v.error_code(), Some(FfaError::InvalidParameters));
}

#[test]
fn get_names_the_calling_partition_and_vcpu() {
    let spm = boot();
    let sp1 = start(&spm, SP1, 1, 0);
    let own = get(&spm, sp1, GetFlags::FROM_SP);
    assert!(call(&spm, sp1, own).is(FuncId::Success32));

    let other_partition = FfaValue {
        arg1: SP2 as u64 | 1 << 16,
        ..own
    };
    let other_vcpu = FfaValue {
        arg1: SP1 as u64,
        ..own
    };
    for v in [other_partition, other_vcpu] {
        assert_eq!(call(&spm, sp1, v).error_code(), Some(FfaError::InvalidParameters));
    }
}
