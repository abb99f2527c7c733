//! Calls racing on different cores. Every state transition is claimed under
//! one lock, so exactly one racer wins and the others see a clean error.

mod common;

use std::collections::HashSet;
use std::thread;

use common::*;
use spm::ffa::descriptors::RelinquishDesc;
use spm::ffa::memory::ShareState;
use spm::ffa::region_index::Mode;
use spm::ffa::FuncId;
use spm::vcpu::VcpuState;
use spm::{CallOutcome, Error, FfaError};

const ROUNDS: usize = 50;

#[test]
fn concurrent_reclaims_have_one_winner() {
    for _ in 0..ROUNDS {
        let spm = boot();
        let owner = start(&spm, SP1, 0, 0);
        let borrower = start(&spm, SP2, 0, 1);
        map_mailbox(&spm, SP1);
        map_mailbox(&spm, SP2);
        let handle = send(
            &spm,
            owner,
            FuncId::MemLend32,
            &transaction(SP1, &[(SP2, RW)], &[pages(SP1_RAM, 0, 4)]),
        )
        .unwrap();
        assert!(relinquish(&spm, borrower, SP2, handle).is(FuncId::Success32));

        let shared = &spm;
        let results: Vec<_> = thread::scope(|s| {
            let racers: Vec<_> = (0..2)
                .map(|_| s.spawn(move || shared.mem_reclaim(owner, handle, 0)))
                .collect();
            racers.into_iter().map(|r| r.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(Error::InvalidState)));
        assert_eq!(spm.share_state(handle), Some(ShareState::Reclaimed));
        assert_eq!(mode_in_index(&spm, SP1, pages(SP1_RAM, 0, 4)), Some(Mode::RWX));
    }
}

#[test]
fn concurrent_relinquishes_have_one_winner() {
    for _ in 0..ROUNDS {
        let spm = boot();
        let owner = start(&spm, SP1, 0, 0);
        let borrower = start(&spm, SP2, 0, 1);
        map_mailbox(&spm, SP1);
        map_mailbox(&spm, SP2);
        let handle = send(
            &spm,
            owner,
            FuncId::MemLend32,
            &transaction(SP1, &[(SP2, RW)], &[pages(SP1_RAM, 8, 2)]),
        )
        .unwrap();

        let mut desc = RelinquishDesc {
            handle,
            flags: 0,
            endpoints: heapless::Vec::new(),
        };
        desc.endpoints.push(SP2).unwrap();
        let mut buf = [0u8; 64];
        let len = desc.encode(&mut buf).unwrap();
        write_tx(&spm, SP2, &buf[..len]);

        let shared = &spm;
        let results: Vec<_> = thread::scope(|s| {
            let racers: Vec<_> = (0..2)
                .map(|_| s.spawn(move || shared.mem_relinquish(borrower)))
                .collect();
            racers.into_iter().map(|r| r.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(Error::InvalidState)));
        assert_eq!(spm.share_state(handle), Some(ShareState::RelinquishRequested));
        assert_eq!(mode_in_index(&spm, SP2, pages(SP1_RAM, 8, 2)), None);
        assert_eq!(spm.translator().mapping(SP2, SP1_RAM + 8 * 4096), None);
    }
}

#[test]
fn same_pages_lent_twice_at_once() {
    for _ in 0..ROUNDS {
        let spm = boot();
        let owner = start(&spm, SP1, 0, 0);
        map_mailbox(&spm, SP1);
        let bytes = encode(&transaction(SP1, &[(SP2, RW)], &[pages(SP1_RAM, 0, 16)]));
        write_tx(&spm, SP1, &bytes);
        let len = bytes.len();

        let shared = &spm;
        let results: Vec<_> = thread::scope(|s| {
            let racers: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(move || {
                        shared
                            .handle_call(owner, send_call(FuncId::MemLend32, len, len))
                            .value()
                            .unwrap()
                    })
                })
                .collect();
            racers.into_iter().map(|r| r.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|v| v.is(FuncId::Success32)).count(), 1);
        assert!(results.iter().any(|v| v.error_code() == Some(FfaError::Denied)));
        assert_eq!(
            mode_in_index(&spm, SP2, pages(SP1_RAM, 0, 16)),
            Some(Mode::R | Mode::W | Mode::UNOWNED)
        );
    }
}

#[test]
fn two_requests_for_one_vcpu() {
    for _ in 0..ROUNDS {
        let spm = boot();
        let a = start(&spm, VM1, 0, 0);
        let b = start(&spm, VM1, 1, 1);
        let target = park(&spm, SP2, 0, 2);

        let shared = &spm;
        let outcomes: Vec<_> = thread::scope(|s| {
            let racers: Vec<_> = [a, b]
                .into_iter()
                .map(|v| s.spawn(move || (v, shared.handle_call(v, direct_req(VM1, SP2, [1, 0, 0, 0, 0])))))
                .collect();
            racers.into_iter().map(|r| r.join().unwrap()).collect()
        });

        let winners: Vec<_> = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, CallOutcome::Switch { vcpu, .. } if *vcpu == target))
            .collect();
        assert_eq!(winners.len(), 1);
        let loser = outcomes
            .iter()
            .find(|(_, o)| !matches!(o, CallOutcome::Switch { .. }))
            .unwrap();
        assert_eq!(loser.1.value().unwrap().error_code(), Some(FfaError::Busy));
        assert_eq!(spm.vcpu_state(winners[0].0), Some(VcpuState::Blocked));
        assert_eq!(spm.vcpu_state(loser.0), Some(VcpuState::RunningNormal));
        assert_eq!(spm.vcpu_state(target), Some(VcpuState::RunningDirectReqRecv));
    }
}

#[test]
fn independent_transfers_all_succeed() {
    let spm = boot();
    let vm = start(&spm, VM1, 0, 0);
    let sp = start(&spm, SP1, 0, 1);
    map_mailbox(&spm, VM1);
    map_mailbox(&spm, SP1);
    map_mailbox(&spm, SP2);

    let shared = &spm;
    let handles: Vec<u64> = thread::scope(|s| {
        let lenders: Vec<_> = [(vm, VM1, VM1_RAM), (sp, SP1, SP1_RAM)]
            .into_iter()
            .map(|(v, id, base)| {
                s.spawn(move || {
                    (0..8)
                        .map(|i| {
                            let tx = transaction(id, &[(SP2, RW)], &[pages(base, i * 2, 2)]);
                            send(shared, v, FuncId::MemLend32, &tx).unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        lenders.into_iter().flat_map(|l| l.join().unwrap()).collect()
    });

    assert_eq!(handles.len(), 16);
    assert_eq!(handles.iter().collect::<HashSet<_>>().len(), 16);
    for h in handles.iter() {
        assert_eq!(spm.share_state(*h), Some(ShareState::Active));
    }
    for base in [VM1_RAM, SP1_RAM] {
        for i in 0..8 {
            assert_eq!(
                mode_in_index(&spm, SP2, pages(base, i * 2, 2)),
                Some(Mode::R | Mode::W | Mode::UNOWNED)
            );
        }
    }
}
