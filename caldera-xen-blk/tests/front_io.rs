//! End-to-end I/O through the full stack: pool, ring, event channel and
//! the emulated backend domain.

mod common;

use std::sync::Arc;
use std::thread;

use caldera_storage::{BlockDevice, BlockError};
use caldera_xen_blk::{attach, BlockFront, PoolConfig};
use caldera_xen::mock::HostHal;

use common::{env, seed_device, start_backend, BackendConfig, DeviceSeed, TestEnv};

const SECTOR: usize = 512;

fn attached(
    pool: PoolConfig,
    seed: &DeviceSeed<'_>,
    backend: BackendConfig,
) -> (TestEnv, Arc<BlockFront<HostHal>>, common::DiskBackend) {
    let env = env(pool);
    seed_device(&env.store, seed);
    let front = match attach(&env.ctx, &env.backends, &env.registry, seed.id) {
        Ok(f) => f,
        Err(e) => panic!("attach failed: {e}"),
    };
    let disk_len = seed.sectors as usize * seed.sector_size.unwrap_or(512) as usize;
    let backend = start_backend(&env, seed.id, disk_len, backend);
    (env, front, backend)
}

fn pattern(len: usize, tag: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8) ^ tag).collect()
}

#[test]
fn single_sector_round_trip_is_byte_exact() {
    let (_env, front, backend) = attached(
        PoolConfig {
            slots: 4,
            pages_per_slot: 1,
        },
        &DeviceSeed::default(),
        BackendConfig::default(),
    );

    let data = pattern(SECTOR, 0xa5);
    assert_eq!(front.write(&data, 3), Ok(SECTOR));

    // The bytes landed at the right disk offset...
    assert_eq!(backend.disk_bytes(3 * SECTOR, SECTOR), data);

    // ...and read back exactly.
    let mut readback = vec![0u8; SECTOR];
    assert_eq!(front.read(&mut readback, 3), Ok(SECTOR));
    assert_eq!(readback, data);
}

#[test]
fn multi_page_and_partial_page_round_trips() {
    let (_env, front, _backend) = attached(
        PoolConfig {
            slots: 4,
            pages_per_slot: 4,
        },
        &DeviceSeed {
            sectors: 4096,
            ..DeviceSeed::default()
        },
        BackendConfig::default(),
    );

    // One full page, a partial second page, and three pages plus a tail.
    for (tag, len, blkno) in [
        (0x11u8, 4096usize, 0u64),
        (0x22, 6000, 16),
        (0x33, 3 * 4096 + 512, 64),
    ] {
        let data = pattern(len, tag);
        assert_eq!(front.write(&data, blkno), Ok(len), "write len {len}");
        let mut readback = vec![0u8; len];
        assert_eq!(front.read(&mut readback, blkno), Ok(len), "read len {len}");
        assert_eq!(readback, data, "round trip len {len}");
    }
}

#[test]
fn oversized_requests_are_rejected_not_queued() {
    let (_env, front, _backend) = attached(
        PoolConfig {
            slots: 2,
            pages_per_slot: 2,
        },
        &DeviceSeed::default(),
        BackendConfig::default(),
    );

    let data = vec![0u8; 3 * 4096];
    assert_eq!(front.write(&data, 0), Err(BlockError::InvalidArgument));
}

#[test]
fn block_numbers_convert_to_backend_sectors() {
    // 4 KiB logical blocks over 512-byte backend sectors.
    let (_env, front, backend) = attached(
        PoolConfig {
            slots: 2,
            pages_per_slot: 1,
        },
        &DeviceSeed {
            phys_sector_size: Some(4096),
            ..DeviceSeed::default()
        },
        BackendConfig::default(),
    );

    assert_eq!(front.geometry().block_size, 4096);

    let data = pattern(4096, 0x5a);
    assert_eq!(front.write(&data, 2), Ok(4096));
    // Block 2 of 4 KiB = sector 16 = byte offset 8192.
    assert_eq!(backend.disk_bytes(8192, 4096), data);
}

#[test]
fn out_of_order_completions_wake_the_right_callers() {
    let (_env, front, _backend) = attached(
        PoolConfig {
            slots: 4,
            pages_per_slot: 1,
        },
        &DeviceSeed::default(),
        // Hold both requests, then complete them in reverse order.
        BackendConfig {
            hold: 2,
            reverse: true,
            ..BackendConfig::default()
        },
    );

    let writer = {
        let front = front.clone();
        thread::spawn(move || {
            let data = pattern(SECTOR, 0x77);
            front.write(&data, 5)
        })
    };
    let bad_reader = {
        let front = front.clone();
        thread::spawn(move || {
            let mut buf = vec![0u8; SECTOR];
            // Beyond the backend disk: must fail with the backend status.
            front.read(&mut buf, 1 << 20)
        })
    };

    let write_result = match writer.join() {
        Ok(r) => r,
        Err(_) => panic!("writer panicked"),
    };
    let read_result = match bad_reader.join() {
        Ok(r) => r,
        Err(_) => panic!("reader panicked"),
    };

    assert_eq!(write_result, Ok(SECTOR));
    assert_eq!(read_result, Err(BlockError::Io(-1)));

    // The successful write really reached its block.
    let mut readback = vec![0u8; SECTOR];
    assert_eq!(front.read(&mut readback, 5), Ok(SECTOR));
    assert_eq!(readback, pattern(SECTOR, 0x77));
}

// The concrete scenario from the design notes: 512-byte sectors, ring and
// pool capacity 32, 64 concurrent writers of distinct patterns to distinct
// blocks. Twice as many callers as slots forces pool backpressure; all
// writes must complete and verify with no deadlock.
#[test]
fn sixty_four_concurrent_writes_with_thirty_two_slots() {
    const WRITERS: usize = 64;

    let (_env, front, _backend) = attached(
        PoolConfig {
            slots: 32,
            pages_per_slot: 1,
        },
        &DeviceSeed::default(),
        BackendConfig::default(),
    );

    let mut handles = Vec::new();
    for i in 0..WRITERS {
        let front = front.clone();
        handles.push(thread::spawn(move || {
            let data = pattern(SECTOR, i as u8);
            front.write(&data, i as u64)
        }));
    }
    for handle in handles {
        match handle.join() {
            Ok(result) => assert_eq!(result, Ok(SECTOR)),
            Err(_) => panic!("writer panicked"),
        }
    }

    for i in 0..WRITERS {
        let mut readback = vec![0u8; SECTOR];
        assert_eq!(front.read(&mut readback, i as u64), Ok(SECTOR));
        assert_eq!(readback, pattern(SECTOR, i as u8), "block {i}");
    }
}

// More slots than ring entries plus a batching backend: submitters must
// also block on ring space and recover when completions drain it.
#[test]
fn ring_backpressure_resolves_without_deadlock() {
    const WRITERS: usize = 48;

    let (_env, front, _backend) = attached(
        PoolConfig {
            slots: 48,
            pages_per_slot: 1,
        },
        &DeviceSeed::default(),
        BackendConfig {
            hold: 16,
            ..BackendConfig::default()
        },
    );

    let mut handles = Vec::new();
    for i in 0..WRITERS {
        let front = front.clone();
        handles.push(thread::spawn(move || {
            let data = pattern(SECTOR, i as u8);
            front.write(&data, i as u64)
        }));
    }
    for handle in handles {
        match handle.join() {
            Ok(result) => assert_eq!(result, Ok(SECTOR)),
            Err(_) => panic!("writer panicked"),
        }
    }
}
