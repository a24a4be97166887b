//! Integration tests for the verbs backend.
//!
//! Two ranks share one process and the local verbs device. On machines
//! without InfiniBand hardware the backend fails to come up, the mapper
//! leaves the peer unassigned and the tests return early.

use coltran::bootstrap::{Bootstrap, LocalBootstrap};
use coltran::{
    BackendSlot, CommInfo, CoreError, HostAdapter, Mapper, MapperConfig, PutArgs, Rank,
    RegisterMode,
};
use coltran_rdma::{IbBackendFactory, IbConfig};
use std::sync::Arc;

fn build(rank: Rank, boot: LocalBootstrap) -> Mapper {
    let comm = CommInfo::new(rank, 2, 0x1b, Arc::new(boot));
    Mapper::builder(comm, Arc::new(HostAdapter::device_emulating()))
        .config(MapperConfig {
            register_mode: RegisterMode::Lazy,
            ..MapperConfig::default()
        })
        .backend_factory(Arc::new(IbBackendFactory::new(IbConfig::from_env())))
        .build()
        .unwrap()
}

/// Both ranks must agree before touching the peer, or one would spin forever.
fn all_connected(boot: &LocalBootstrap, mapper: &Mapper, peer: Rank) -> bool {
    let mine = matches!(mapper.backend_slot(peer), BackendSlot::Assigned(_)) as u8;
    boot.all_gather(&[mine])
        .unwrap()
        .iter()
        .all(|v| v.first() == Some(&1))
}

#[test]
fn test_bring_up_is_collective() {
    let threads: Vec<_> = LocalBootstrap::group(2)
        .into_iter()
        .map(|boot| {
            std::thread::spawn(move || {
                let rank = boot.rank();
                let mapper = build(rank, boot);
                // Never reaches itself over verbs.
                assert_eq!(mapper.backend_slot(rank), BackendSlot::Unset);
                let err = mapper.check_notify(rank).err().unwrap();
                assert!(matches!(err, CoreError::TransportUnavailable { .. }));
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn test_put_with_notify_over_verbs() {
    const LEN: usize = 1 << 16;
    let threads: Vec<_> = LocalBootstrap::group(2)
        .into_iter()
        .map(|boot| {
            std::thread::spawn(move || {
                let rank = boot.rank();
                let mapper = build(rank, boot.clone());
                let peer = 1 - rank;
                if !all_connected(&boot, &mapper, peer) {
                    tracing::warn!(rank, "no verbs device, skipping");
                    return None;
                }

                if rank == 0 {
                    let src: Vec<u8> = (0..LEN).map(|i| (i % 253) as u8).collect();
                    let local = mapper
                        .resolve_for_transfer(src.as_ptr() as u64, LEN)
                        .unwrap();
                    let mut recv = mapper.receive_control(peer).unwrap();
                    recv.wait().unwrap();
                    let remote = recv.remote_buffer().unwrap();
                    let args = PutArgs::to_remote(src.as_ptr() as u64, local.handle, remote, 0, LEN, peer)
                        .with_notify();
                    let mut put = unsafe { mapper.put(args, true).unwrap().unwrap() };
                    put.wait().unwrap();
                    None
                } else {
                    let mut dst = vec![0u8; LEN];
                    let addr = dst.as_mut_ptr() as u64;
                    let local = mapper.resolve_for_transfer(addr, LEN).unwrap();
                    let mut sent = mapper.send_control(addr, local.handle, peer).unwrap();
                    sent.wait().unwrap();
                    mapper.wait_notify(peer).unwrap();
                    Some(dst)
                }
            })
        })
        .collect();

    let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    if let Some(dst) = &results[1] {
        let expected: Vec<u8> = (0..LEN).map(|i| (i % 253) as u8).collect();
        assert_eq!(*dst, expected);
    }
}
